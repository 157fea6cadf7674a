//! Optional plaintext listener exposing gateway metrics and health.
//!
//! Serves `/metrics` in Prometheus text format and `/health` as JSON. Each
//! connection is parsed with the same scanner-backed machinery the gateway
//! uses and answered with a single response; no keep-alive.

use crate::config::BufferSizes;
use crate::error::ProxyError;
use crate::metrics::{self, metrics};
use crate::request::{ConnectionBuffers, parse_request};
use log::{debug, info, warn};
use serde_json::json;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

pub struct MonitorServer {
    addr: SocketAddr,
}

impl MonitorServer {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    pub async fn run(self) -> Result<(), ProxyError> {
        let listener = TcpListener::bind(&self.addr).await?;
        info!("Monitor listening on http://{}", listener.local_addr()?);
        let started = Instant::now();

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            tokio::spawn(async move {
                if let Err(err) = handle_scrape(stream, started).await {
                    warn!("monitor request from {} failed: {}", remote_addr, err);
                }
            });
        }
    }
}

async fn handle_scrape(stream: TcpStream, started: Instant) -> Result<(), ProxyError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut bufs = ConnectionBuffers::new(&BufferSizes::default());

    let req = parse_request(&mut reader, &mut bufs, None).await?;
    debug!("monitor scrape: {} {}", req.method, req.path);

    let (status, content_type, body) = match (req.method.as_str(), req.path.as_str()) {
        ("GET", "/metrics") => match metrics::encode() {
            Ok(payload) => ("200 OK", "text/plain; version=0.0.4; charset=utf-8", payload),
            Err(err) => {
                warn!("failed to encode metrics: {}", err);
                (
                    "500 Internal Server Error",
                    "text/plain; charset=utf-8",
                    "metrics unavailable".to_string(),
                )
            }
        },
        ("GET", "/health") => {
            let payload = json!({
                "status": "ok",
                "uptime_secs": started.elapsed().as_secs(),
                "connections_accepted": metrics().connections_accepted.get(),
                "requests_forwarded": metrics().requests_forwarded.get(),
                "parse_failures": metrics().parse_failures.get(),
                "backend_failures": metrics().backend_failures.get(),
            });
            ("200 OK", "application/json", payload.to_string())
        }
        _ => (
            "404 Not Found",
            "text/plain; charset=utf-8",
            "monitor endpoint not found".to_string(),
        ),
    };

    write_response(&mut write_half, status, content_type, body.as_bytes()).await?;
    Ok(())
}

async fn write_response<W>(
    writer: &mut W,
    status: &str,
    content_type: &str,
    body: &[u8],
) -> std::io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    writer.write_all(b"HTTP/1.1 ").await?;
    writer.write_all(status.as_bytes()).await?;
    writer.write_all(b"\r\nContent-Type: ").await?;
    writer.write_all(content_type.as_bytes()).await?;
    writer
        .write_all(format!("\r\nContent-Length: {}\r\nConnection: close\r\n\r\n", body.len()).as_bytes())
        .await?;
    writer.write_all(body).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn scrape(path: &str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let started = Instant::now();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            handle_scrape(stream, started).await.unwrap();
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(format!("GET {} HTTP/1.1\r\nHost: monitor\r\n\r\n", path).as_bytes())
            .await
            .unwrap();

        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        server.await.unwrap();
        response
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_prometheus_text() {
        let response = scrape("/metrics").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("tollgate_connections_accepted_total"));
    }

    #[tokio::test]
    async fn health_endpoint_serves_json() {
        let response = scrape("/health").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("\"status\":\"ok\""));
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let response = scrape("/nope").await;
        assert!(response.starts_with("HTTP/1.1 404 Not Found"));
    }
}
