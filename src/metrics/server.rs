use axum::{Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::metrics::Metrics;

const CONTENT_TYPE: &str = "text/plain; version=0.0.4";

type ServerError = Box<dyn std::error::Error + Send + Sync>;

pub fn metrics_router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

/// Serves `/metrics` on all interfaces until the process exits.
pub async fn start_metrics_server(metrics: Arc<Metrics>, port: u16) -> Result<(), ServerError> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;
    serve_metrics(listener, metrics).await
}

pub async fn serve_metrics(listener: TcpListener, metrics: Arc<Metrics>) -> Result<(), ServerError> {
    info!(addr = %listener.local_addr()?, "Starting metrics server");
    axum::serve(listener, metrics_router(metrics)).await?;
    Ok(())
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    let mut buffer = Vec::new();

    match TextEncoder::new().encode(&metrics.registry.gather(), &mut buffer) {
        Ok(()) => (StatusCode::OK, [("content-type", CONTENT_TYPE)], buffer),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", CONTENT_TYPE)],
                Vec::new(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_metrics_endpoint_serves_registry() {
        let metrics = Metrics::new().unwrap();
        metrics.reconnects_total.inc();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_metrics(listener, metrics));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("request_consumer_reconnects_total 1"));
    }
}
