//! HTTP API.
//!
//! GET    /api/sessions              - List sessions
//! DELETE /api/sessions/:name        - Destroy a session
//! PUT    /api/sessions/:name/rename - Rename a session
//! GET    /health                    - Liveness and connection count

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::server::AppState;
use crate::session::registry::now_millis;
use crate::session::{PtySpawner, RegistryError, Session, SessionRegistry};

/// Registry failure rendered as `{success: false, error}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<RegistryError> for ApiError {
    fn from(error: RegistryError) -> Self {
        let status = match &error {
            RegistryError::InvalidName(_) => StatusCode::BAD_REQUEST,
            RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::Conflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "success": false, "error": self.message })),
        )
            .into_response()
    }
}

/// Body of a rename request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameRequest {
    #[serde(default)]
    pub new_name: Option<String>,
}

/// Result of a rename.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameResponse {
    pub success: bool,
    pub name: String,
    pub display_name: String,
}

/// Health report.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    /// Unix epoch milliseconds.
    pub timestamp: u64,
    pub uptime_secs: u64,
    pub connections: usize,
}

/// `GET /api/sessions`
pub async fn list_sessions<R: SessionRegistry, S: PtySpawner>(
    State(state): State<Arc<AppState<R, S>>>,
) -> Result<Json<Vec<Session>>, ApiError> {
    let sessions = state.registry.list().await?;
    Ok(Json(sessions))
}

/// `DELETE /api/sessions/:name`
pub async fn delete_session<R: SessionRegistry, S: PtySpawner>(
    State(state): State<Arc<AppState<R, S>>>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.registry.destroy(&name).await.map_err(|e| {
        warn!(session = %name, error = %e, "Delete failed");
        ApiError::from(e)
    })?;

    info!(session = %name, "Session deleted via API");
    Ok(Json(json!({ "success": true })))
}

/// `PUT /api/sessions/:name/rename`
pub async fn rename_session<R: SessionRegistry, S: PtySpawner>(
    State(state): State<Arc<AppState<R, S>>>,
    Path(name): Path<String>,
    Json(body): Json<RenameRequest>,
) -> Result<Json<RenameResponse>, ApiError> {
    let new_name = body.new_name.as_deref().map(str::trim).unwrap_or_default();
    if new_name.is_empty() {
        return Err(ApiError::bad_request("newName is required"));
    }

    let session = state.registry.rename(&name, new_name).await.map_err(|e| {
        warn!(from = %name, to = %new_name, error = %e, "Rename failed");
        ApiError::from(e)
    })?;

    info!(from = %name, to = %session.name, "Session renamed via API");
    Ok(Json(RenameResponse {
        success: true,
        name: session.name,
        display_name: session.display_name,
    }))
}

/// `GET /health`
pub async fn health<R: SessionRegistry, S: PtySpawner>(
    State(state): State<Arc<AppState<R, S>>>,
) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        timestamp: now_millis(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        connections: state.connections.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::NameError;
    use std::time::Duration;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (RegistryError::InvalidName(NameError::Empty), StatusCode::BAD_REQUEST),
            (RegistryError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (RegistryError::Conflict("x".into()), StatusCode::CONFLICT),
            (
                RegistryError::Timeout(Duration::from_secs(2)),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                RegistryError::DestroyFailed("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (error, status) in cases {
            assert_eq!(ApiError::from(error).status(), status);
        }
    }

    #[test]
    fn test_rename_request_accepts_missing_field() {
        let body: RenameRequest = serde_json::from_str("{}").unwrap();
        assert!(body.new_name.is_none());

        let body: RenameRequest = serde_json::from_str(r#"{"newName":"x"}"#).unwrap();
        assert_eq!(body.new_name.as_deref(), Some("x"));
    }
}
