//! Operational endpoints for container orchestration
//!
//! `/health`, `/ready`, `/live`, `/metrics` and an index at `/`.

use crate::connector::Connector;
use crate::observability::metrics::metrics;
use crate::transport::mqtt::ConnectionState;
use serde::Serialize;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: &'static str,
    timestamp: String,
    broker: String,
    connection: ConnectionReport,
    uptime_seconds: u64,
}

#[derive(Debug, Serialize)]
struct ConnectionReport {
    state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    connected_for_seconds: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: String,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: String,
}

#[derive(Debug, Serialize)]
struct ApiDocumentationResponse {
    endpoints: BTreeMap<&'static str, &'static str>,
}

/// All operational routes
pub fn health_routes(
    connector: Arc<Connector>,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    let with_connector = warp::any().map(move || Arc::clone(&connector));

    let health = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_connector.clone())
        .and_then(health_handler);

    let ready = warp::path("ready")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_connector)
        .and_then(ready_handler);

    let live = warp::path("live")
        .and(warp::path::end())
        .and(warp::get())
        .and_then(live_handler);

    let metrics_route = warp::path("metrics")
        .and(warp::path::end())
        .and(warp::get())
        .and_then(metrics_handler);

    let root = warp::path::end().and(warp::get()).and_then(root_handler);

    health
        .or(ready)
        .unify()
        .or(live)
        .unify()
        .or(metrics_route)
        .unify()
        .or(root)
        .unify()
}

fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn connection_report(connector: &Connector) -> ConnectionReport {
    let state = connector.state();
    let detail = match &state {
        ConnectionState::Disconnected(reason) | ConnectionState::PermanentlyDisconnected(reason) => {
            Some(reason.clone())
        }
        ConnectionState::Reconnecting(attempt) => Some(format!("attempt {attempt}")),
        _ => None,
    };

    ConnectionReport {
        state: state.label(),
        detail,
        connected_for_seconds: connector.uptime().map(|uptime| uptime.as_secs()),
    }
}

async fn health_handler(connector: Arc<Connector>) -> Result<Response, Infallible> {
    let connection = connection_report(&connector);
    // A bridge that has not been asked to connect yet is still healthy
    let healthy = matches!(connection.state, "connected" | "idle");

    let status = HealthStatus {
        status: if healthy { "healthy" } else { "degraded" },
        timestamp: timestamp(),
        broker: connector.broker_url(),
        connection,
        uptime_seconds: metrics().get_metrics().uptime_seconds,
    };

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok(warp::reply::with_status(warp::reply::json(&status), code).into_response())
}

async fn ready_handler(connector: Arc<Connector>) -> Result<Response, Infallible> {
    let ready = connector.is_connected();
    let response = ReadinessResponse {
        ready,
        timestamp: timestamp(),
    };
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok(warp::reply::with_status(warp::reply::json(&response), code).into_response())
}

async fn live_handler() -> Result<Response, Infallible> {
    let response = LivenessResponse {
        alive: true,
        timestamp: timestamp(),
    };
    Ok(warp::reply::json(&response).into_response())
}

async fn metrics_handler() -> Result<Response, Infallible> {
    Ok(warp::reply::json(&metrics().get_metrics()).into_response())
}

async fn root_handler() -> Result<Response, Infallible> {
    let endpoints = BTreeMap::from([
        ("/mqtt", "POST {topic, payload} to publish at QoS 0"),
        ("/health", "Overall health and broker connection state"),
        ("/ready", "Readiness probe: 200 once the broker session is up"),
        ("/live", "Liveness probe"),
        ("/metrics", "Request and publish counters"),
    ]);
    Ok(warp::reply::json(&ApiDocumentationResponse { endpoints }).into_response())
}
