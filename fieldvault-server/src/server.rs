//! TCP server exposing the rotation orchestrator to operators
//!
//! One request per line, newline-delimited JSON both ways. The transport is
//! deliberately thin: authentication and transport security belong to the
//! calling service boundary, and rotation of large tables is a long-running
//! operation, so no timeout is imposed here.

use anyhow::Result;
use fieldvault_core::{Orchestrator, RotationRequest};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

/// FieldVault rotation server.
pub struct KmsServer {
    orchestrator: Arc<Orchestrator>,
}

impl KmsServer {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Accept operator connections until the process is stopped.
    pub async fn serve(self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("rotation server listening on {}", addr);

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    info!("operator connection from {}", peer);
                    let orchestrator = self.orchestrator.clone();

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(orchestrator, stream).await {
                            warn!("connection {} error: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    error!("failed to accept connection: {}", e);
                }
            }
        }
    }
}

async fn handle_connection(orchestrator: Arc<Orchestrator>, stream: TcpStream) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let reply = dispatch(&orchestrator, &line).await;
        writer.write_all(reply.as_bytes()).await?;
        writer.write_all(b"\n").await?;
    }

    info!("operator disconnected");
    Ok(())
}

/// Parse and run one request, mapping errors to a status-tagged body.
pub async fn dispatch(orchestrator: &Orchestrator, line: &str) -> String {
    let request: RotationRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => return error_body(400, &format!("invalid request: {}", e)),
    };

    match orchestrator.handle(request).await {
        Ok(response) => serde_json::to_string(&response)
            .unwrap_or_else(|e| error_body(500, &format!("response encoding failed: {}", e))),
        Err(e) => error_body(e.status_code(), &e.to_string()),
    }
}

fn error_body(status: u16, message: &str) -> String {
    serde_json::json!({ "status": status, "error": message }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldvault_core::{
        KeyProvider, MemoryRecordStore, MemoryStateStore, RotationSettings, SecretSource,
        TableRotationConfig,
    };

    fn test_orchestrator() -> Orchestrator {
        let provider = Arc::new(KeyProvider::new(SecretSource::fixed([
            (1, "server-secret-1"),
            (2, "server-secret-2"),
        ])));
        let records = Arc::new(MemoryRecordStore::new());
        records.insert_row("orders", "id-1", [("phone".to_string(), None)]);

        Orchestrator::new(
            provider,
            records,
            Arc::new(MemoryStateStore::new()),
            vec![TableRotationConfig {
                table: "orders".to_string(),
                primary_key: "id".to_string(),
                encrypted_columns: vec!["phone".to_string()],
            }],
            RotationSettings {
                default_batch_size: 50,
                batch_delay_ms: 0,
                failure_threshold: None,
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_status_request() {
        let orchestrator = test_orchestrator();
        let reply = dispatch(&orchestrator, r#"{ "action": "status" }"#).await;

        let body: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(body["activeVersion"], 2);
        assert!(body["pendingRotations"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_rejects_malformed_json() {
        let orchestrator = test_orchestrator();
        let reply = dispatch(&orchestrator, "{ not json").await;

        let body: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(body["status"], 400);
    }

    #[tokio::test]
    async fn test_dispatch_maps_bad_request_to_400() {
        let orchestrator = test_orchestrator();
        let reply = dispatch(
            &orchestrator,
            r#"{ "action": "prepare", "newVersion": 1 }"#,
        )
        .await;

        let body: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(body["status"], 400);
        assert!(body["error"].as_str().unwrap().contains("version 1"));
    }
}
