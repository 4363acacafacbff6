//! HTTP settings surface: per-user SMTP/IMAP/mailbox-role configuration.
//! Saving the IMAP config re-derives the role mapping from the remote
//! listing; once all three pieces are present a sync is kicked off.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::json;
use tracing::{info, warn};

use mailbridge_core::{ImapConfig, MailboxRoles, SmtpConfig};
use mailbridge_mail::{discover_roles, list_remote_folders};

use crate::AppState;
use crate::auth::{cookie_value, verify_token};

pub enum ApiError {
    Unauthorized,
    NotFound(&'static str),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            ApiError::NotFound(what) => (StatusCode::NOT_FOUND, what.to_string()),
            ApiError::Internal(err) => {
                warn!(error = %err, "settings request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

pub fn router() -> axum::Router<Arc<AppState>> {
    axum::Router::new()
        .route("/", get(get_settings))
        .route("/imap", post(post_imap))
        .route("/smtp", post(post_smtp))
        .route("/mailboxes", get(get_mailboxes).post(post_mailboxes))
}

fn authorized_user(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    let cookies = headers
        .get(header::COOKIE)
        .and_then(|value| value.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;
    let token = cookie_value(cookies, "accessToken").ok_or(ApiError::Unauthorized)?;
    let claims = verify_token(token, &state.jwt_secret).map_err(|_| ApiError::Unauthorized)?;
    Ok(claims.id)
}

async fn get_settings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = authorized_user(&state, &headers)?;
    if !state.store.user_exists(&user_id).await? {
        return Err(ApiError::NotFound("User not found"));
    }
    let config = state
        .store
        .get_user_config(&user_id)
        .await?
        .ok_or(ApiError::NotFound("User not found"))?
        .masked();
    Ok(Json(json!({
        "success": true,
        "smtp": config.smtp,
        "imap": config.imap,
        "mailboxes": config.mailboxes,
    })))
}

async fn post_smtp(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(config): Json<SmtpConfig>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = authorized_user(&state, &headers)?;
    state.store.upsert_smtp_config(&user_id, &config).await?;
    maybe_start_sync(&state, &user_id).await;
    let mut echoed = config;
    echoed.password = String::new();
    Ok(Json(json!({ "success": true, "smtp": echoed })))
}

async fn post_imap(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(config): Json<ImapConfig>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = authorized_user(&state, &headers)?;
    state.store.upsert_imap_config(&user_id, &config).await?;

    let listing_config = config.clone();
    match tokio::task::spawn_blocking(move || discover_roles(&listing_config)).await {
        Ok(Ok(roles)) => {
            state.store.upsert_mailbox_roles(&user_id, &roles).await?;
            info!(user = %user_id, "derived mailbox roles from remote listing");
        }
        Ok(Err(err)) => {
            warn!(user = %user_id, error = %err, "mailbox role discovery failed");
        }
        Err(err) => {
            warn!(user = %user_id, error = %err, "mailbox role discovery task failed");
        }
    }

    maybe_start_sync(&state, &user_id).await;
    let mut echoed = config;
    echoed.password = String::new();
    Ok(Json(json!({ "success": true, "imap": echoed })))
}

async fn post_mailboxes(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(roles): Json<MailboxRoles>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = authorized_user(&state, &headers)?;
    state.store.upsert_mailbox_roles(&user_id, &roles).await?;
    maybe_start_sync(&state, &user_id).await;
    Ok(Json(json!({ "success": true, "mailboxes": roles })))
}

/// Connection test: lists the remote folder paths with the stored IMAP
/// credentials.
async fn get_mailboxes(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = authorized_user(&state, &headers)?;
    let config = state
        .store
        .get_imap_config(&user_id)
        .await?
        .ok_or(ApiError::NotFound("IMAP configuration not found"))?;
    let folders = tokio::task::spawn_blocking(move || list_remote_folders(&config))
        .await
        .map_err(|err| ApiError::Internal(err.into()))??;
    Ok(Json(json!({ "success": true, "mailboxes": folders })))
}

async fn maybe_start_sync(state: &Arc<AppState>, user_id: &str) {
    let config = match state.store.get_user_config(user_id).await {
        Ok(Some(config)) if config.is_complete() => config,
        Ok(_) => return,
        Err(err) => {
            warn!(user = %user_id, error = %err, "failed to check config completeness");
            return;
        }
    };
    let (Some(smtp), Some(imap)) = (config.smtp, config.imap) else {
        return;
    };
    let handle = state.registry.get_or_create(user_id, smtp, imap).await;
    let user_id = user_id.to_string();
    tokio::spawn(async move {
        if let Err(err) = handle.start_sync().await {
            warn!(user = %user_id, error = %err, "background sync failed");
        }
    });
}
