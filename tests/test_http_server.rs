//! Listener tests: bind a real port, speak raw HTTP over TCP, shut down.

use mqtt_http_bridge::config::HttpSection;
use mqtt_http_bridge::connector::Connector;
use mqtt_http_bridge::http;
use mqtt_http_bridge::testing::MockTransport;
use mqtt_http_bridge::transport::mqtt::ReconnectConfig;
use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::timeout;

fn free_port() -> u16 {
    StdTcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

async fn raw_request(port: u16, request: &str) -> String {
    let mut stream = None;
    for _ in 0..50 {
        match TcpStream::connect(("127.0.0.1", port)).await {
            Ok(connected) => {
                stream = Some(connected);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    let mut stream = stream.expect("server never started listening");

    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).to_string()
}

#[tokio::test]
async fn test_serve_publishes_and_stops_on_shutdown() {
    let transport = MockTransport::new();
    let connector = Connector::new(Arc::new(transport.clone()), ReconnectConfig::default());
    let settings = HttpSection {
        port: free_port(),
        ..HttpSection::default()
    };

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn({
        let connector = Arc::clone(&connector);
        let settings = settings.clone();
        async move {
            http::serve(connector, &settings, async {
                let _ = stop_rx.await;
            })
            .await
        }
    });

    let body = r#"{"topic":"sensors/temp","payload":"21.5"}"#;
    let request = format!(
        "POST /mqtt HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let response = raw_request(settings.port, &request).await;

    assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
    assert!(response.ends_with(http::PUBLISHED_TEXT), "got: {response}");
    assert_eq!(transport.published()[0].topic, "sensors/temp");

    stop_tx.send(()).unwrap();
    let result = timeout(Duration::from_secs(5), server)
        .await
        .expect("server did not stop")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_chunked_body_is_published() {
    let transport = MockTransport::new();
    let connector = Connector::new(Arc::new(transport.clone()), ReconnectConfig::default());
    let settings = HttpSection {
        port: free_port(),
        ..HttpSection::default()
    };

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn({
        let settings = settings.clone();
        async move {
            http::serve(connector, &settings, async {
                let _ = stop_rx.await;
            })
            .await
        }
    });

    let first = r#"{"topic":"sensors/temp","#;
    let second = r#""payload":"21.5"}"#;
    let request = format!(
        "POST /mqtt HTTP/1.1\r\nHost: localhost\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n{:x}\r\n{}\r\n{:x}\r\n{}\r\n0\r\n\r\n",
        first.len(),
        first,
        second.len(),
        second
    );
    let response = raw_request(settings.port, &request).await;

    assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
    assert!(response.ends_with(http::PUBLISHED_TEXT), "got: {response}");
    let published = transport.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].topic, "sensors/temp");
    assert_eq!(&published[0].payload[..], b"21.5");

    stop_tx.send(()).unwrap();
    timeout(Duration::from_secs(5), server)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_serve_reports_bind_failure() {
    let occupied = StdTcpListener::bind("0.0.0.0:0").unwrap();
    let settings = HttpSection {
        port: occupied.local_addr().unwrap().port(),
        ..HttpSection::default()
    };
    let connector = Connector::new(Arc::new(MockTransport::new()), ReconnectConfig::default());

    let result = http::serve(connector, &settings, std::future::pending()).await;

    assert!(result.is_err());
}
