use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use metrics_exporter_prometheus::PrometheusHandle;
use riptide_core::manager::ManagerStats;
use riptide_core::SessionManager;
use serde::{Deserialize, Serialize};

use crate::codec::JsonCodec;
use crate::config::GateConfig;
use crate::security::CsrfPolicy;

#[derive(Clone)]
pub struct GateState {
    pub manager: SessionManager,
    pub codec: Arc<JsonCodec>,
    pub csrf: Arc<dyn CsrfPolicy>,
    pub config: Arc<GateConfig>,
    pub metrics: PrometheusHandle,
}

pub async fn health_check() -> &'static str {
    "ok"
}

pub async fn stats(State(state): State<GateState>) -> Json<ManagerStats> {
    Json(state.manager.stats())
}

pub async fn metrics_handler(State(state): State<GateState>) -> String {
    state.metrics.render()
}

#[derive(Debug, Deserialize)]
pub struct MintQuery {
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MintResponse {
    pub token: String,
}

/// Hands out a handshake token. Sits behind real authentication in a
/// deployment; open here so the demo client can bootstrap itself.
pub async fn mint_csrf(
    State(state): State<GateState>,
    Query(query): Query<MintQuery>,
) -> Json<MintResponse> {
    let user = query.user_id.as_deref().unwrap_or("anonymous");
    Json(MintResponse { token: state.csrf.mint(user) })
}
