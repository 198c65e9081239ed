//! Health check HTTP endpoint
//!
//! A minimal liveness/readiness probe per stage process, consumed by an
//! external supervisor, never by other pipeline stages. Reports bus,
//! registry and store connectivity plus per-stage counters as JSON.

use crate::config::HealthSettings;
use crate::error::StageStatus;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Health status for the whole process
#[derive(Debug, Clone, Default)]
pub struct HealthState {
    pub bus_connected: bool,
    pub registry_connected: bool,
    pub store_connected: bool,
    /// Per-stage health, keyed by stage name
    pub stages: HashMap<String, StageHealth>,
    pub started_at: Option<std::time::Instant>,
}

/// Health status for a single stage
#[derive(Debug, Clone)]
pub struct StageHealth {
    pub status: StageStatus,
    pub messages_processed: u64,
    pub errors_count: u64,
    pub last_error: Option<String>,
}

impl StageHealth {
    pub fn starting() -> Self {
        Self {
            status: StageStatus::Starting,
            messages_processed: 0,
            errors_count: 0,
            last_error: None,
        }
    }
}

impl HealthState {
    /// All dependencies reachable and no stage failed
    pub fn is_healthy(&self) -> bool {
        self.bus_connected
            && self.registry_connected
            && self.store_connected
            && self.stages.values().all(|h| {
                matches!(h.status, StageStatus::Running | StageStatus::Starting)
            })
    }

    /// At least one stage is consuming
    pub fn is_ready(&self) -> bool {
        self.bus_connected
            && self
                .stages
                .values()
                .any(|h| h.status == StageStatus::Running)
    }
}

/// Shared health state
pub type SharedHealthState = Arc<RwLock<HealthState>>;

/// Start the health check HTTP server
pub async fn start_health_server(
    config: HealthSettings,
    state: SharedHealthState,
) -> std::io::Result<()> {
    if !config.enabled {
        debug!("Health check endpoint disabled");
        return Ok(());
    }

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port)
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    let listener = TcpListener::bind(addr).await?;
    info!(
        "Health check endpoint listening on http://{}{}",
        addr, config.path
    );

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let state = state.clone();
        let path = config.path.clone();

        tokio::spawn(async move {
            let mut buf = [0u8; 1024];

            match socket.read(&mut buf).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buf[..n]);
                    let Some(first_line) = request.lines().next() else {
                        return;
                    };
                    let parts: Vec<&str> = first_line.split_whitespace().collect();
                    if parts.len() < 2 {
                        return;
                    }
                    let (method, req_path) = (parts[0], parts[1]);
                    debug!("Health check request: {} {} from {}", method, req_path, peer);

                    let response = if method == "GET" && req_path == path {
                        build_health_response(&state).await
                    } else if method == "GET" && req_path == "/ready" {
                        build_ready_response(&state).await
                    } else if method == "GET" && req_path == "/live" {
                        build_live_response()
                    } else {
                        build_404_response()
                    };

                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        warn!("Failed to send health response: {}", e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Health check socket error: {}", e);
                }
            }
        });
    }
}

async fn build_health_response(state: &SharedHealthState) -> String {
    let state = state.read().await;
    let is_healthy = state.is_healthy();
    let status_code = if is_healthy { 200 } else { 503 };

    let body = serde_json::json!({
        "status": if is_healthy { "healthy" } else { "unhealthy" },
        "bus": if state.bus_connected { "connected" } else { "unreachable" },
        "registry": if state.registry_connected { "connected" } else { "unreachable" },
        "store": if state.store_connected { "connected" } else { "unreachable" },
        "stages": state.stages.iter().map(|(name, h)| {
            serde_json::json!({
                "name": name,
                "status": h.status.to_string(),
                "messages_processed": h.messages_processed,
                "errors_count": h.errors_count,
                "last_error": h.last_error,
            })
        }).collect::<Vec<_>>(),
        "uptime_secs": state.started_at.map(|t| t.elapsed().as_secs()),
    });

    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n{}",
        status_code,
        if is_healthy { "OK" } else { "Service Unavailable" },
        serde_json::to_string_pretty(&body).unwrap_or_default()
    )
}

async fn build_ready_response(state: &SharedHealthState) -> String {
    let state = state.read().await;
    let is_ready = state.is_ready();
    let status_code = if is_ready { 200 } else { 503 };

    let body = serde_json::json!({ "ready": is_ready });
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n{}",
        status_code,
        if is_ready { "OK" } else { "Service Unavailable" },
        serde_json::to_string(&body).unwrap_or_default()
    )
}

fn build_live_response() -> String {
    let body = serde_json::json!({ "alive": true });
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n{}",
        serde_json::to_string(&body).unwrap_or_default()
    )
}

fn build_404_response() -> String {
    "HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\nNot Found"
        .to_string()
}
