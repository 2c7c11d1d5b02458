//! `POST /mqtt`: relay one JSON body onto the broker

use crate::connector::{Connector, PublishOutcome, PublishRequest};
use crate::error::{sanitize_error_message, BridgeError, BridgeResult};
use crate::observability::metrics::metrics;
use bytes::{Buf, Bytes, BytesMut};
use futures::{Stream, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{debug, warn, Instrument};
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

/// Confirmation text for an accepted publish
pub const PUBLISHED_TEXT: &str = "MQTT message published\n";

/// Response text for a body that is not a publish request
pub const INVALID_BODY_TEXT: &str = "invalid json body\n";

/// Response text for a body over [`MAX_BODY_BYTES`]
pub const TOO_LARGE_TEXT: &str = "request body too large\n";

/// Bodies above this size are refused before decoding
pub const MAX_BODY_BYTES: u64 = 192 * 1024;

/// Build the `POST /mqtt` filter.
///
/// The body is read as a stream, so chunked uploads work as well as ones
/// carrying `Content-Length`.
pub fn publish_route(
    connector: Arc<Connector>,
    surface_publish_errors: bool,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    warp::path("mqtt")
        .and(warp::path::end())
        .and(warp::post())
        .and(
            warp::body::stream()
                .then(|stream| async move { collect_body(stream, MAX_BODY_BYTES).await }),
        )
        .and(warp::any().map(move || Arc::clone(&connector)))
        .and(warp::any().map(move || surface_publish_errors))
        .and_then(handle_publish)
}

/// Read a body stream, giving up once it grows past `limit` bytes
pub async fn collect_body<S, B>(stream: S, limit: u64) -> BridgeResult<Bytes>
where
    S: Stream<Item = Result<B, warp::Error>>,
    B: Buf,
{
    futures::pin_mut!(stream);
    let mut body = BytesMut::new();

    while let Some(chunk) = stream.next().await {
        let mut chunk = chunk?;
        if (body.len() + chunk.remaining()) as u64 > limit {
            return Err(BridgeError::PayloadTooLarge { limit });
        }
        while chunk.has_remaining() {
            let bytes = chunk.chunk();
            let read = bytes.len();
            body.extend_from_slice(bytes);
            chunk.advance(read);
        }
    }

    Ok(body.freeze())
}

/// Decode a request body into a [`PublishRequest`].
///
/// Only a JSON object is accepted; arrays and scalars are invalid even when
/// their elements would line up with the fields.
pub fn decode_request(body: &[u8]) -> BridgeResult<PublishRequest> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| BridgeError::invalid_request(e.to_string()))?;
    if !value.is_object() {
        return Err(BridgeError::invalid_request("body is not a JSON object"));
    }
    serde_json::from_value(value).map_err(|e| BridgeError::invalid_request(e.to_string()))
}

async fn handle_publish(
    body: BridgeResult<Bytes>,
    connector: Arc<Connector>,
    surface_publish_errors: bool,
) -> Result<Response, Infallible> {
    metrics().http_request_received();

    let body = match body {
        Ok(body) => body,
        Err(BridgeError::PayloadTooLarge { limit }) => {
            metrics().http_invalid_body();
            debug!(limit = limit, "Rejecting oversized publish request");
            return Ok(text_response(TOO_LARGE_TEXT, StatusCode::PAYLOAD_TOO_LARGE));
        }
        Err(e) => {
            metrics().http_invalid_body();
            debug!(error = %e, "Failed to read publish request body");
            return Ok(text_response(INVALID_BODY_TEXT, StatusCode::BAD_REQUEST));
        }
    };

    let request = match decode_request(&body) {
        Ok(request) => request,
        Err(e) => {
            metrics().http_invalid_body();
            debug!(error = %e, bytes = body.len(), "Rejecting publish request");
            return Ok(text_response(INVALID_BODY_TEXT, StatusCode::BAD_REQUEST));
        }
    };

    let span = crate::http_span!(route = "/mqtt", topic = %request.topic);
    let outcome = connector.publish(&request).instrument(span).await;

    Ok(match outcome {
        PublishOutcome::Published => text_response(PUBLISHED_TEXT, StatusCode::OK),
        PublishOutcome::Failed(reason) if surface_publish_errors => {
            let message = sanitize_error_message(&reason);
            warn!(topic = %request.topic, "Answering 502 for failed publish");
            text_response(format!("{message}\n"), StatusCode::BAD_GATEWAY)
        }
        // Failure already logged and counted by the connector
        PublishOutcome::Failed(_) => text_response(PUBLISHED_TEXT, StatusCode::OK),
    })
}

fn text_response(body: impl Into<String>, status: StatusCode) -> Response {
    warp::reply::with_status(body.into(), status).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::MockTransport;
    use crate::transport::mqtt::ReconnectConfig;

    fn connector_with(transport: &MockTransport) -> Arc<Connector> {
        Connector::new(
            Arc::new(transport.clone()),
            ReconnectConfig {
                max_attempts: None,
                backoff_pattern: Vec::new(),
                sustained_delay: 10,
            },
        )
    }

    #[test]
    fn test_decode_request() {
        let request = decode_request(br#"{"topic":"a/b","payload":"on"}"#).unwrap();
        assert_eq!(request.topic, "a/b");
        assert_eq!(request.payload, "on");

        assert!(matches!(
            decode_request(b"not json"),
            Err(BridgeError::InvalidRequest { .. })
        ));
        assert!(decode_request(br#"{"payload":"on"}"#).is_err());
        assert!(decode_request(b"").is_err());
        assert!(decode_request(br#"["a/b","on"]"#).is_err());
        assert!(decode_request(b"\"a/b\"").is_err());
    }

    #[tokio::test]
    async fn test_collect_body_joins_chunks() {
        let chunks: Vec<Result<Bytes, warp::Error>> = vec![
            Ok(Bytes::from_static(b"{\"topic\":")),
            Ok(Bytes::from_static(b"\"a\",\"payload\":\"b\"}")),
        ];

        let body = collect_body(futures::stream::iter(chunks), 1024).await.unwrap();

        assert_eq!(&body[..], br#"{"topic":"a","payload":"b"}"#);
    }

    #[tokio::test]
    async fn test_collect_body_enforces_limit() {
        let chunks: Vec<Result<Bytes, warp::Error>> = vec![
            Ok(Bytes::from(vec![b'x'; 8])),
            Ok(Bytes::from(vec![b'x'; 8])),
        ];

        let result = collect_body(futures::stream::iter(chunks), 10).await;

        assert!(matches!(
            result,
            Err(BridgeError::PayloadTooLarge { limit: 10 })
        ));
    }

    #[tokio::test]
    async fn test_oversized_body_is_refused() {
        let transport = MockTransport::new();
        let route = publish_route(connector_with(&transport), false);
        let payload = "x".repeat(MAX_BODY_BYTES as usize);

        let response = warp::test::request()
            .method("POST")
            .path("/mqtt")
            .body(format!(r#"{{"topic":"t","payload":"{payload}"}}"#))
            .reply(&route)
            .await;

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(response.body(), TOO_LARGE_TEXT);
        assert_eq!(transport.connect_calls(), 0);
    }

    #[tokio::test]
    async fn test_array_body_is_rejected() {
        let transport = MockTransport::new();
        let route = publish_route(connector_with(&transport), false);

        let response = warp::test::request()
            .method("POST")
            .path("/mqtt")
            .body(r#"["sensors/temp","21.5"]"#)
            .reply(&route)
            .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.body(), INVALID_BODY_TEXT);
        assert!(transport.published().is_empty());
    }

    #[tokio::test]
    async fn test_publish_returns_confirmation() {
        let transport = MockTransport::new();
        let route = publish_route(connector_with(&transport), false);

        let response = warp::test::request()
            .method("POST")
            .path("/mqtt")
            .body(r#"{"topic":"sensors/temp","payload":"21.5"}"#)
            .reply(&route)
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), PUBLISHED_TEXT);
        assert_eq!(transport.published().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_body_is_rejected_without_connecting() {
        let transport = MockTransport::new();
        let route = publish_route(connector_with(&transport), false);

        let response = warp::test::request()
            .method("POST")
            .path("/mqtt")
            .body("{\"topic\":")
            .reply(&route)
            .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.body(), INVALID_BODY_TEXT);
        assert_eq!(transport.connect_calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_publish_still_answers_ok_by_default() {
        let transport = MockTransport::new().with_publish_failure();
        let route = publish_route(connector_with(&transport), false);

        let response = warp::test::request()
            .method("POST")
            .path("/mqtt")
            .body(r#"{"topic":"t","payload":"p"}"#)
            .reply(&route)
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), PUBLISHED_TEXT);
    }

    #[tokio::test]
    async fn test_failed_publish_surfaces_502_when_enabled() {
        let transport = MockTransport::new().with_publish_failure();
        let route = publish_route(connector_with(&transport), true);

        let response = warp::test::request()
            .method("POST")
            .path("/mqtt")
            .body(r#"{"topic":"t","payload":"p"}"#)
            .reply(&route)
            .await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = String::from_utf8_lossy(response.body());
        assert!(body.contains("Mock publish failure"), "got: {body}");
    }

    #[tokio::test]
    async fn test_get_is_not_routed() {
        let transport = MockTransport::new();
        let route = publish_route(connector_with(&transport), false);

        let result = warp::test::request()
            .method("GET")
            .path("/mqtt")
            .filter(&route)
            .await;

        assert!(result.is_err());
    }
}
