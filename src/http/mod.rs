//! HTTP front door
//!
//! One warp listener serves the publish endpoint and the operational
//! routes. Every request shares the same [`Connector`].

pub mod health;
pub mod publish;

use crate::config::HttpSection;
use crate::connector::Connector;
use crate::error::BridgeResult;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use warp::{Filter, Rejection, Reply};

pub use health::health_routes;
pub use publish::{publish_route, INVALID_BODY_TEXT, PUBLISHED_TEXT, TOO_LARGE_TEXT};

/// Every route the bridge answers
pub fn routes(
    connector: Arc<Connector>,
    settings: &HttpSection,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    publish_route(Arc::clone(&connector), settings.surface_publish_errors)
        .or(health_routes(connector))
        .unify()
        .with(warp::trace::request())
}

/// Bind the listener and serve until `shutdown` resolves.
///
/// Bind failures are returned instead of panicking.
pub async fn serve<F>(
    connector: Arc<Connector>,
    settings: &HttpSection,
    shutdown: F,
) -> BridgeResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    let (bound, server) = warp::serve(routes(connector, settings))
        .try_bind_with_graceful_shutdown(addr, shutdown)?;

    info!(address = %bound, "Server is running");
    server.await;
    info!("HTTP server stopped");
    Ok(())
}
