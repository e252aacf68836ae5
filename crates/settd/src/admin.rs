//! Admin HTTP API.
//!
//! Out-of-band record management for operators:
//!
//! - `POST /v1/admin/invalidate` — block a credential, with a reason
//! - `POST /v1/admin/unpublish` — withdraw a credential from public resolution
//! - `POST /v1/admin/delete` — tombstone a credential
//! - `GET /v1/admin/record/{key_hash}` — inspect a record (no payload bytes)
//! - `GET /health` — node id, clock, peer high-water marks
//!
//! Authentication is handled out-of-band (bind the listener to a trusted
//! interface or front it with an authenticating proxy).

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use sett_db::{Db, DbError};
use sett_types::KeyHash;
use tracing::info;

/// Shared state for admin handlers.
#[derive(Clone)]
struct AdminState {
    db: Arc<Db>,
}

/// Build the admin router over the local engine.
pub fn router(db: Arc<Db>) -> Router {
    let state = AdminState { db };
    Router::new()
        .route("/health", get(health))
        .route("/v1/admin/invalidate", post(invalidate))
        .route("/v1/admin/unpublish", post(unpublish))
        .route("/v1/admin/delete", post(delete))
        .route("/v1/admin/record/{key_hash}", get(inspect))
        .with_state(state)
}

/// Admin-facing error wrapper mapping engine errors to HTTP statuses.
struct AdminError(DbError);

impl From<DbError> for AdminError {
    fn from(err: DbError) -> Self {
        Self(err)
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            DbError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            DbError::NotFound => StatusCode::NOT_FOUND,
            DbError::AlreadyExists => StatusCode::CONFLICT,
            DbError::Invalidated { .. } | DbError::Expired => StatusCode::GONE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

fn parse_key_hash(hex: &str) -> Result<KeyHash, AdminError> {
    KeyHash::from_hex(hex).map_err(|_| AdminError(DbError::InvalidRequest("malformed key hash")))
}

#[derive(Deserialize)]
struct InvalidateRequest {
    key_hash: String,
    reason: String,
}

async fn invalidate(
    State(state): State<AdminState>,
    axum::Json(req): axum::Json<InvalidateRequest>,
) -> Result<StatusCode, AdminError> {
    let key_hash = parse_key_hash(&req.key_hash)?;
    state.db.invalidate(key_hash, &req.reason)?;
    info!(%key_hash, reason = %req.reason, "record invalidated by admin");
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct KeyHashRequest {
    key_hash: String,
}

async fn unpublish(
    State(state): State<AdminState>,
    axum::Json(req): axum::Json<KeyHashRequest>,
) -> Result<StatusCode, AdminError> {
    let key_hash = parse_key_hash(&req.key_hash)?;
    state.db.unpublish(key_hash)?;
    info!(%key_hash, "record unpublished by admin");
    Ok(StatusCode::OK)
}

async fn delete(
    State(state): State<AdminState>,
    axum::Json(req): axum::Json<KeyHashRequest>,
) -> Result<StatusCode, AdminError> {
    let key_hash = parse_key_hash(&req.key_hash)?;
    state.db.delete(key_hash)?;
    info!(%key_hash, "record deleted by admin");
    Ok(StatusCode::OK)
}

/// Record metadata visible to operators. Payload ciphertext is never
/// exposed here; `macaroon_head` identifies the grant for telemetry
/// cross-referencing.
#[derive(Serialize)]
struct RecordView {
    state: String,
    public: bool,
    created_at_unix: i64,
    expires_at_unix: i64,
    invalidated_at_unix: i64,
    invalidation_reason: String,
    satellite_address: String,
    macaroon_head: String,
}

async fn inspect(
    State(state): State<AdminState>,
    Path(key_hash): Path<String>,
) -> Result<axum::Json<RecordView>, AdminError> {
    let key_hash = parse_key_hash(&key_hash)?;
    // Raw row: admins need to see invalidated, unpublished, and
    // tombstoned records that the resolver hides behind errors.
    let record = state.db.inspect(key_hash)?.ok_or(DbError::NotFound)?;
    Ok(axum::Json(RecordView {
        state: record.state.to_string(),
        public: record.public,
        created_at_unix: record.created_at_unix,
        expires_at_unix: record.expires_at_unix,
        invalidated_at_unix: record.invalidated_at_unix,
        invalidation_reason: record.invalidation_reason.clone(),
        satellite_address: record.satellite_address.clone(),
        macaroon_head: hex(&record.macaroon_head),
    }))
}

#[derive(Serialize)]
struct HealthView {
    node_id: String,
    clock: u64,
    put_collisions: u64,
    highwater: Vec<PeerHighWater>,
}

#[derive(Serialize)]
struct PeerHighWater {
    node_id: String,
    clock: u64,
}

async fn health(State(state): State<AdminState>) -> Result<axum::Json<HealthView>, AdminError> {
    let highwater = state
        .db
        .highwaters()?
        .into_iter()
        .map(|(node_id, clock)| PeerHighWater {
            node_id: node_id.to_string(),
            clock,
        })
        .collect();
    Ok(axum::Json(HealthView {
        node_id: state.db.node_id().to_string(),
        clock: state.db.clock_value(),
        put_collisions: state.db.put_collisions(),
        highwater,
    }))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
