//! Admin HTTP API
//!
//! Manual passes and stats for operators and dashboards. Responses carry the
//! same JSON as the CLI.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::LifecycleError;
use crate::lifecycle::{LifecycleDomain, LifecycleStats, ReconciliationSummary, Reconciler, RunOptions};

pub type SharedState = Arc<Reconciler>;

/// Create the admin router
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/lifecycle/contracts/stats", get(contract_stats))
        .route("/api/lifecycle/subscriptions/stats", get(subscription_stats))
        .route("/api/lifecycle/contracts/run", post(run_contracts))
        .route("/api/lifecycle/subscriptions/run", post(run_subscriptions))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
pub struct LifecycleQuery {
    pub tenant: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Fatal pass or stats failure
pub struct ApiError(LifecycleError);

impl From<LifecycleError> for ApiError {
    fn from(e: LifecycleError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!(error = %self.0, "Admin request failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    "OK"
}

/// GET /api/lifecycle/contracts/stats
pub async fn contract_stats(
    State(reconciler): State<SharedState>,
    Query(query): Query<LifecycleQuery>,
) -> Result<Json<LifecycleStats>, ApiError> {
    Ok(Json(reconciler.contract_stats(query.tenant.as_deref()).await?))
}

/// GET /api/lifecycle/subscriptions/stats
pub async fn subscription_stats(
    State(reconciler): State<SharedState>,
    Query(query): Query<LifecycleQuery>,
) -> Result<Json<LifecycleStats>, ApiError> {
    Ok(Json(reconciler.subscription_stats(query.tenant.as_deref()).await?))
}

/// POST /api/lifecycle/contracts/run
pub async fn run_contracts(
    State(reconciler): State<SharedState>,
    Query(query): Query<LifecycleQuery>,
) -> Result<Json<ReconciliationSummary>, ApiError> {
    info!(tenant = ?query.tenant, dry_run = query.dry_run, "Contract pass requested over HTTP");
    let summary = reconciler
        .run(
            LifecycleDomain::Contracts,
            RunOptions {
                tenant: query.tenant,
                dry_run: query.dry_run,
            },
        )
        .await?;
    Ok(Json(summary))
}

/// POST /api/lifecycle/subscriptions/run
pub async fn run_subscriptions(
    State(reconciler): State<SharedState>,
    Query(query): Query<LifecycleQuery>,
) -> Result<Json<ReconciliationSummary>, ApiError> {
    info!(dry_run = query.dry_run, "Subscription pass requested over HTTP");
    let summary = reconciler
        .run(
            LifecycleDomain::Subscriptions,
            RunOptions {
                tenant: None,
                dry_run: query.dry_run,
            },
        )
        .await?;
    Ok(Json(summary))
}
