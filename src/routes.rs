//! HTTP routes over the integrity facade and the indexer.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::Value;
use tracing::error;

use crate::error::LedgerError;
use crate::indexer::SyncOutcome;
use crate::model::{ChainFault, Record};
use crate::AppState;

type ApiError = (StatusCode, String);

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/records", post(secure_record).get(list_records))
        .route("/records/:index", get(get_record))
        .route("/verify/:digest", get(verify_record))
        .route("/validate", get(validate_chain))
        .route("/sync", post(synchronize))
        .route("/health", get(health))
        .route("/version", get(version))
        .with_state(state)
}

#[derive(Serialize)]
pub struct SecuredResp {
    pub digest: String,
}

/// POST /records
pub async fn secure_record(
    State(state): State<AppState>,
    Json(record): Json<Value>,
) -> Result<Json<SecuredResp>, ApiError> {
    match state.integrity.secure(&record) {
        Ok(digest) => Ok(Json(SecuredResp { digest })),
        Err(LedgerError::Encoding(msg)) => Err((StatusCode::BAD_REQUEST, msg)),
        Err(e) => {
            error!(error = %e, "failed to secure record");
            Err((StatusCode::INTERNAL_SERVER_ERROR, "persist failed".into()))
        }
    }
}

/// GET /records
pub async fn list_records(State(state): State<AppState>) -> Json<Vec<Record>> {
    Json(state.integrity.history())
}

/// GET /records/:index
pub async fn get_record(
    State(state): State<AppState>,
    Path(index): Path<u64>,
) -> Result<Json<Record>, ApiError> {
    state
        .integrity
        .get(index)
        .map(Json)
        .map_err(|_| (StatusCode::NOT_FOUND, "not found".into()))
}

#[derive(Serialize)]
pub struct VerifyResp {
    pub digest: String,
    pub exists: bool,
}

/// GET /verify/:digest
pub async fn verify_record(
    State(state): State<AppState>,
    Path(digest): Path<String>,
) -> Json<VerifyResp> {
    let exists = state.integrity.verify_exists(&digest);
    Json(VerifyResp { digest, exists })
}

/// GET /validate: re-hash every block and check linkage.
#[derive(Serialize)]
pub struct ValidateResp {
    pub ok: bool,
    pub errors: Vec<ChainFault>,
}

pub async fn validate_chain(State(state): State<AppState>) -> Json<ValidateResp> {
    let errors = state.integrity.audit();
    Json(ValidateResp {
        ok: errors.is_empty(),
        errors,
    })
}

/// POST /sync: run one indexer cycle; 502 when it aborted.
pub async fn synchronize(State(state): State<AppState>) -> (StatusCode, Json<SyncOutcome>) {
    let outcome = state.indexer.synchronize().await;
    let status = if outcome.aborted {
        StatusCode::BAD_GATEWAY
    } else {
        StatusCode::OK
    };
    (status, Json(outcome))
}

/// GET /health
#[derive(Serialize)]
pub struct Health {
    pub status: &'static str,
}
pub async fn health() -> Json<Health> {
    Json(Health { status: "ok" })
}

/// GET /version
#[derive(Serialize)]
pub struct Version {
    pub version: &'static str,
    pub git_sha: Option<&'static str>,
}
pub async fn version() -> Json<Version> {
    Json(Version {
        version: env!("CARGO_PKG_VERSION"),
        git_sha: option_env!("GIT_SHA"),
    })
}
