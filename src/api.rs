use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use credit_ledger::CreditLedger;
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Liveness endpoint for process supervisors.
#[derive(Debug, Clone)]
pub struct ApiServer {
    bind_address: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub ledger_reachable: bool,
    pub time: i64,
}

impl ApiServer {
    pub fn new(bind_address: String) -> Self {
        Self { bind_address }
    }

    pub async fn start(&self, ledger: Arc<CreditLedger>) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address)
            .await
            .with_context(|| format!("Failed to bind to {}", self.bind_address))?;

        info!("Health endpoint listening on {}", self.bind_address);

        axum::serve(listener, router(ledger))
            .await
            .with_context(|| "API server error")?;

        Ok(())
    }
}

pub fn router(ledger: Arc<CreditLedger>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .with_state(ledger)
}

async fn handle_health(
    State(ledger): State<Arc<CreditLedger>>,
) -> (StatusCode, Json<HealthResponse>) {
    let reachable = ledger.is_reachable().await;
    let (code, status) = if reachable {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not running")
    };

    (
        code,
        Json(HealthResponse {
            status,
            ledger_reachable: reachable,
            time: chrono::Utc::now().timestamp(),
        }),
    )
}
