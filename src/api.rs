//! Health & Status API endpoints
//!
//! - GET /health - Simple health check
//! - GET /metrics - Prometheus metrics
//! - GET /status - Record counts per status, scan cursor, uptime
//! - GET /failed - Transfers that need manual intervention

use eyre::Result;
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

use crate::db::TransferStore;
use crate::types::{Status, StatusCounts};

static START_TIME: OnceLock<Instant> = OnceLock::new();

const FAILED_LIMIT: i64 = 100;

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
    uptime_seconds: u64,
    source_chain_id: u64,
    scan_cursor: Option<u64>,
    transfers: StatusCounts,
}

#[derive(Serialize)]
struct FailedTransfer {
    nonce: String,
    source_chain_id: u64,
    block_number: u64,
    from: String,
    to: String,
    amount: String,
    attempts: u32,
    last_error: Option<String>,
    destination_tx_hash: Option<String>,
}

struct Response {
    status: &'static str,
    content_type: &'static str,
    body: Vec<u8>,
}

impl Response {
    fn ok(content_type: &'static str, body: Vec<u8>) -> Self {
        Self {
            status: "200 OK",
            content_type,
            body,
        }
    }

    fn json<T: Serialize>(value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self::ok("application/json", body),
            Err(e) => Self::error(e.to_string()),
        }
    }

    fn error(message: String) -> Self {
        Self {
            status: "500 Internal Server Error",
            content_type: "text/plain",
            body: message.into_bytes(),
        }
    }

    fn not_found() -> Self {
        Self {
            status: "404 Not Found",
            content_type: "text/plain",
            body: Vec::new(),
        }
    }

    fn head(&self) -> String {
        format!(
            "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            self.status,
            self.content_type,
            self.body.len()
        )
    }
}

/// Start the API server (metrics and status endpoints)
pub async fn start_api_server(
    addr: SocketAddr,
    store: Arc<dyn TransferStore>,
    chain_id: u64,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "API server started");
    START_TIME.get_or_init(Instant::now);

    loop {
        let (mut socket, _) = listener.accept().await?;
        let store = store.clone();

        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            if socket.readable().await.is_ok() {
                let _ = socket.try_read(&mut buf);
            }

            let request = String::from_utf8_lossy(&buf);
            let response = route(&request, store.as_ref(), chain_id).await;
            let _ = socket.write_all(response.head().as_bytes()).await;
            let _ = socket.write_all(&response.body).await;
        });
    }
}

async fn route(request: &str, store: &dyn TransferStore, chain_id: u64) -> Response {
    let path = request
        .lines()
        .next()
        .and_then(|line| line.strip_prefix("GET "))
        .and_then(|rest| rest.split_whitespace().next())
        .unwrap_or_default();

    match path {
        "/health" => Response::ok("text/plain", b"OK".to_vec()),
        "/metrics" => {
            let mut buffer = Vec::new();
            match TextEncoder::new().encode(&prometheus::gather(), &mut buffer) {
                Ok(()) => Response::ok("text/plain; charset=utf-8", buffer),
                Err(e) => Response::error(e.to_string()),
            }
        }
        "/status" => match build_status_response(store, chain_id).await {
            Ok(status) => Response::json(&status),
            Err(e) => Response::error(e.to_string()),
        },
        "/failed" => match build_failed_response(store).await {
            Ok(failed) => Response::json(&failed),
            Err(e) => Response::error(e.to_string()),
        },
        _ => Response::not_found(),
    }
}

async fn build_status_response(store: &dyn TransferStore, chain_id: u64) -> Result<StatusResponse> {
    Ok(StatusResponse {
        status: "ok",
        uptime_seconds: START_TIME
            .get()
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0),
        source_chain_id: chain_id,
        scan_cursor: store.load_cursor(chain_id).await?,
        transfers: store.count_by_status().await?,
    })
}

async fn build_failed_response(store: &dyn TransferStore) -> Result<Vec<FailedTransfer>> {
    let failed = store.list_by_status(Status::Failed, FAILED_LIMIT).await?;
    Ok(failed
        .into_iter()
        .map(|r| FailedTransfer {
            nonce: r.event.nonce.to_string(),
            source_chain_id: r.event.source_chain_id,
            block_number: r.event.block_number,
            from: r.event.from.to_string(),
            to: r.event.to.to_string(),
            amount: r.event.amount.to_string(),
            attempts: r.attempt_count,
            last_error: r.last_error,
            destination_tx_hash: r.destination_tx_hash.map(|h| h.to_string()),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::types::{sample_event, TransferRecord};

    fn body(response: &Response) -> serde_json::Value {
        serde_json::from_slice(&response.body).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let store = MemoryStore::new();
        let response = route("GET /health HTTP/1.1\r\n\r\n", &store, 5).await;
        assert_eq!(response.status, "200 OK");
        assert_eq!(response.body, b"OK");
    }

    #[tokio::test]
    async fn test_status_reports_counts_and_cursor() {
        let store = MemoryStore::new();
        store
            .upsert(&TransferRecord::pending(sample_event(1, 100, 0)))
            .await
            .unwrap();
        store
            .upsert(&TransferRecord::pending(sample_event(2, 101, 0)).confirmed())
            .await
            .unwrap();
        store.save_cursor(5, 99).await.unwrap();

        let response = route("GET /status HTTP/1.1\r\n\r\n", &store, 5).await;
        assert_eq!(response.status, "200 OK");
        let json = body(&response);
        assert_eq!(json["scan_cursor"], 99);
        assert_eq!(json["transfers"]["pending"], 1);
        assert_eq!(json["transfers"]["confirmed"], 1);
    }

    #[tokio::test]
    async fn test_failed_lists_failed_transfers() {
        let store = MemoryStore::new();
        store
            .upsert(&TransferRecord::pending(sample_event(3, 100, 0)).failed("SubmissionRevert: bad signature"))
            .await
            .unwrap();

        let response = route("GET /failed HTTP/1.1\r\n\r\n", &store, 5).await;
        let json = body(&response);
        assert_eq!(json[0]["nonce"], "3");
        assert_eq!(json[0]["last_error"], "SubmissionRevert: bad signature");
    }

    #[tokio::test]
    async fn test_unknown_path() {
        let store = MemoryStore::new();
        let response = route("GET /nope HTTP/1.1\r\n\r\n", &store, 5).await;
        assert_eq!(response.status, "404 Not Found");
        let response = route("POST /health HTTP/1.1\r\n\r\n", &store, 5).await;
        assert_eq!(response.status, "404 Not Found");
    }
}
