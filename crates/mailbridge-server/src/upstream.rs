//! Outbound link to the coordination service. The relay announces its
//! capabilities, then applies user lifecycle events as they arrive. The
//! upstream event set is open-ended, so dispatch stays string keyed.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::AppState;

const CONNECT_ATTEMPTS: u32 = 50;
const CONNECT_DELAY: Duration = Duration::from_secs(3);

type Upstream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Runs until the link drops; the caller treats a return as fatal.
pub async fn run(state: Arc<AppState>, url: &str) -> Result<()> {
    let ws = connect_with_retry(url).await?;
    let (mut sink, mut stream) = ws.split();

    for (id, name) in [("send_email", "Send Email"), ("receive_email", "Receive Email")] {
        let announce = json!({ "type": "create", "data": { "id": id, "name": name } });
        sink.send(Message::Text(announce.to_string().into())).await?;
    }
    info!(url = %url, "announced capabilities to upstream");

    while let Some(message) = stream.next().await {
        match message? {
            Message::Text(text) => dispatch(&state, text.as_str()).await,
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_) => {}
            Message::Close(_) => break,
        }
    }
    Err(anyhow!("upstream connection closed"))
}

async fn connect_with_retry(url: &str) -> Result<Upstream> {
    for attempt in 1..=CONNECT_ATTEMPTS {
        info!(attempt, total = CONNECT_ATTEMPTS, "connecting to upstream");
        match connect_async(url).await {
            Ok((ws, _)) => {
                info!(url = %url, "connected to upstream");
                return Ok(ws);
            }
            Err(err) => {
                warn!(error = %err, "upstream connection attempt failed");
                tokio::time::sleep(CONNECT_DELAY).await;
            }
        }
    }
    Err(anyhow!(
        "failed to reach upstream after {} attempts",
        CONNECT_ATTEMPTS
    ))
}

async fn dispatch(state: &Arc<AppState>, text: &str) {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            warn!(error = %err, "dropping malformed upstream message");
            return;
        }
    };
    let kind = value["type"].as_str().unwrap_or("");
    match kind {
        "message" => {
            debug!(data = %value["data"], "upstream message");
        }
        "core_user_registered" => {
            let Some(id) = user_id_of(&value) else {
                warn!("core_user_registered without a user id");
                return;
            };
            match state.store.create_user(&id).await {
                Ok(()) => info!(user = %id, "registered user"),
                Err(err) => warn!(user = %id, error = %err, "failed to register user"),
            }
        }
        "core_users" => {
            let users = value["users"]
                .as_array()
                .or_else(|| value["data"]["users"].as_array())
                .cloned()
                .unwrap_or_default();
            for user in &users {
                if let Some(id) = user["id"].as_str() {
                    if let Err(err) = state.store.create_user(id).await {
                        warn!(user = %id, error = %err, "failed to register user");
                    }
                }
            }
            info!(count = users.len(), "applied upstream user roster");
        }
        "core_user_deleted" => {
            let Some(id) = user_id_of(&value) else {
                warn!("core_user_deleted without a user id");
                return;
            };
            match state.store.delete_user_data(&id).await {
                Ok(()) => info!(user = %id, "purged user data"),
                Err(err) => warn!(user = %id, error = %err, "failed to purge user data"),
            }
        }
        "core_user_login" => {
            let Some(id) = user_id_of(&value) else {
                warn!("core_user_login without a user id");
                return;
            };
            start_sync_if_configured(state, &id).await;
        }
        other => {
            warn!(kind = %other, "unknown upstream message type");
        }
    }
}

fn user_id_of(value: &serde_json::Value) -> Option<String> {
    value
        .pointer("/data/id")
        .or_else(|| value.pointer("/id"))
        .and_then(|id| id.as_str())
        .map(str::to_string)
}

async fn start_sync_if_configured(state: &Arc<AppState>, user_id: &str) {
    let config = match state.store.get_user_config(user_id).await {
        Ok(Some(config)) if config.is_complete() => config,
        Ok(_) => {
            debug!(user = %user_id, "login before mail configuration, nothing to sync");
            return;
        }
        Err(err) => {
            warn!(user = %user_id, error = %err, "failed to load config on login");
            return;
        }
    };
    let (Some(smtp), Some(imap)) = (config.smtp, config.imap) else {
        return;
    };
    let handle = state.registry.get_or_create(user_id, smtp, imap).await;
    let user_id = user_id.to_string();
    tokio::spawn(async move {
        match handle.start_sync().await {
            Ok(()) => info!(user = %user_id, "login sync complete"),
            Err(err) => warn!(user = %user_id, error = %err, "login sync failed"),
        }
    });
}
