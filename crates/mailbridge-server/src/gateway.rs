//! WebSocket gateway: one connection per browser tab, JSON envelopes in
//! both directions. A token may ride on any inbound message; the user id
//! it names sticks to the connection.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use mailbridge_core::{ImapConfig, MailboxRoles, SmtpConfig, SqliteMailStore, StoredMail, UserConfig};
use mailbridge_mail::{
    OutgoingAttachment, OutgoingCalendarEvent, OutgoingMail, SessionEvent, SessionHandle,
};

use crate::AppState;
use crate::auth::verify_token;

const OUTBOUND_QUEUE: usize = 64;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientCommand {
    UserAuth(AuthData),
    SendEmail(ComposeData),
    ReplyEmail(ComposeData),
    LoadMails(LoadMailsData),
    Delete(MailRef),
    MarkAsRead(MailRef),
    MarkAsUnread(MailRef),
}

#[derive(Debug, Deserialize)]
pub struct AuthData {
    #[serde(rename = "accessToken")]
    pub access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ComposeData {
    pub to: String,
    #[serde(default)]
    pub cc: Option<String>,
    #[serde(default)]
    pub bcc: Option<String>,
    pub subject: String,
    #[serde(rename = "text", default)]
    pub body_html: String,
    #[serde(rename = "inReplyTo", default)]
    pub in_reply_to: Option<String>,
    #[serde(default)]
    pub attachments: Vec<AttachmentData>,
    #[serde(default)]
    pub ical: Option<IcalData>,
}

#[derive(Debug, Deserialize)]
pub struct IcalData {
    pub method: String,
    pub filename: String,
    pub content: String,
}

/// Attachments arrive as the browser's serialized byte buffer shape.
#[derive(Debug, Deserialize)]
pub struct AttachmentData {
    pub title: String,
    pub data: ByteBuffer,
}

#[derive(Debug, Deserialize)]
pub struct ByteBuffer {
    pub data: Vec<u8>,
}

#[derive(Debug, Deserialize)]
pub struct LoadMailsData {
    #[serde(default)]
    pub page: i64,
    #[serde(rename = "mailboxId", default)]
    pub mailbox_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MailRef {
    pub id: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Message(Toast),
    MailboxesVariables(MailboxVariables),
    LoadMails(Vec<StoredMail>),
    MissingMailConfig(serde_json::Value),
    DeleteSuccess { id: String },
}

#[derive(Debug, Serialize)]
pub struct Toast {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub title: String,
    pub message: String,
}

impl Toast {
    fn success(title: &str, message: String) -> ServerEvent {
        ServerEvent::Message(Toast {
            kind: "success",
            title: title.to_string(),
            message,
        })
    }

    fn info(title: &str, message: String) -> ServerEvent {
        ServerEvent::Message(Toast {
            kind: "info",
            title: title.to_string(),
            message,
        })
    }

    fn error(title: &str, message: String) -> ServerEvent {
        ServerEvent::Message(Toast {
            kind: "error",
            title: title.to_string(),
            message,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct MailboxVariables {
    #[serde(rename = "INBOX")]
    pub inbox: String,
    #[serde(rename = "SENT")]
    pub sent: String,
    #[serde(rename = "DRAFTS")]
    pub drafts: String,
    #[serde(rename = "TRASH")]
    pub trash: String,
    #[serde(rename = "SPAM")]
    pub spam: String,
}

impl From<&MailboxRoles> for MailboxVariables {
    fn from(roles: &MailboxRoles) -> Self {
        MailboxVariables {
            inbox: roles.inbox.clone(),
            sent: roles.sent.clone(),
            drafts: roles.drafts.clone(),
            trash: roles.trash.clone(),
            spam: roles.spam.clone(),
        }
    }
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();
    let (out, mut out_rx) = mpsc::channel::<ServerEvent>(OUTBOUND_QUEUE);
    let writer = tokio::spawn(async move {
        while let Some(event) = out_rx.recv().await {
            let Ok(text) = serde_json::to_string(&event) else {
                continue;
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut conn = Connection {
        state,
        out,
        user_id: None,
        session_attached: false,
    };
    while let Some(Ok(message)) = stream.next().await {
        if let Message::Text(text) = message {
            conn.handle_text(&text).await;
        }
    }
    writer.abort();
}

struct Connection {
    state: Arc<AppState>,
    out: mpsc::Sender<ServerEvent>,
    user_id: Option<String>,
    session_attached: bool,
}

impl Connection {
    async fn handle_text(&mut self, text: &str) {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "dropping malformed client message");
                return;
            }
        };
        if let Some(token) = value
            .pointer("/auth/accessToken")
            .and_then(|token| token.as_str())
        {
            if !self.adopt_token(token).await {
                return;
            }
        }
        let command: ClientCommand = match serde_json::from_value(value) {
            Ok(command) => command,
            Err(err) => {
                warn!(error = %err, "ignoring unrecognized client message");
                return;
            }
        };
        self.dispatch(command).await;
    }

    async fn dispatch(&mut self, command: ClientCommand) {
        match command {
            ClientCommand::UserAuth(auth) => {
                if let Some(token) = auth.access_token.as_deref() {
                    if !self.adopt_token(token).await {
                        return;
                    }
                }
                self.handle_user_auth().await;
            }
            ClientCommand::SendEmail(compose) => self.handle_send(compose, false).await,
            ClientCommand::ReplyEmail(compose) => self.handle_send(compose, true).await,
            ClientCommand::LoadMails(data) => self.handle_load_mails(data).await,
            ClientCommand::Delete(mail) => self.handle_delete(mail).await,
            ClientCommand::MarkAsRead(mail) => self.handle_flag(mail, true).await,
            ClientCommand::MarkAsUnread(mail) => self.handle_flag(mail, false).await,
        }
    }

    async fn adopt_token(&mut self, token: &str) -> bool {
        match verify_token(token, &self.state.jwt_secret) {
            Ok(claims) => {
                self.user_id = Some(claims.id);
                true
            }
            Err(err) => {
                warn!(error = %err, "rejected client token");
                self.send(Toast::error(
                    "Unauthorized",
                    "Invalid access token".to_string(),
                ))
                .await;
                false
            }
        }
    }

    fn authenticated(&self) -> Option<String> {
        self.user_id.clone()
    }

    async fn handle_user_auth(&mut self) {
        let Some(user_id) = self.authenticated() else {
            self.send(Toast::error(
                "Unauthorized",
                "Authentication required".to_string(),
            ))
            .await;
            return;
        };
        let config = match self.state.store.get_user_config(&user_id).await {
            Ok(Some(config)) if config.is_complete() => config,
            Ok(_) => {
                self.send(ServerEvent::MissingMailConfig(serde_json::json!({})))
                    .await;
                return;
            }
            Err(err) => {
                warn!(user = %user_id, error = %err, "failed to load user config");
                return;
            }
        };
        // is_complete() holds here.
        let (Some(smtp), Some(imap), Some(roles)) =
            (config.smtp, config.imap, config.mailboxes)
        else {
            return;
        };

        if let Some(handle) = self.state.registry.get(&user_id) {
            self.attach_session(&handle, &user_id);
            self.push_mailbox_state(&user_id, &roles).await;
            return;
        }

        self.send(Toast::info(
            "Synchronizing",
            "Mailbox synchronization started".to_string(),
        ))
        .await;
        let handle = self
            .state
            .registry
            .get_or_create(&user_id, smtp, imap)
            .await;
        self.attach_session(&handle, &user_id);
        match handle.start_sync().await {
            Ok(()) => {
                self.send(Toast::success(
                    "Synchronized",
                    "Mailbox synchronization complete".to_string(),
                ))
                .await;
                self.push_mailbox_state(&user_id, &roles).await;
            }
            Err(err) => {
                self.send(Toast::error("Synchronization failed", err.to_string()))
                    .await;
            }
        }
    }

    /// Forwards new-mail arrivals to this connection as a fresh first page.
    fn attach_session(&mut self, handle: &SessionHandle, user_id: &str) {
        if self.session_attached {
            return;
        }
        self.session_attached = true;
        let mut events = handle.subscribe();
        let out = self.out.clone();
        let store = self.state.store.clone();
        let user_id = user_id.to_string();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::NewMail { folder }) => {
                        debug!(user = %user_id, folder = %folder, "pushing refreshed mail page");
                        if push_page(&store, &user_id, 0, None, &out).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    async fn push_mailbox_state(&self, user_id: &str, roles: &MailboxRoles) {
        self.send(ServerEvent::MailboxesVariables(roles.into())).await;
        if let Err(err) = push_page(&self.state.store, user_id, 0, None, &self.out).await {
            warn!(user = %user_id, error = %err, "failed to push mail page");
        }
    }

    async fn handle_send(&mut self, compose: ComposeData, is_reply: bool) {
        let Some(user_id) = self.authenticated() else {
            self.send(Toast::error(
                "Unauthorized",
                "Authentication required".to_string(),
            ))
            .await;
            return;
        };
        let config = match self.state.store.get_user_config(&user_id).await {
            Ok(Some(config)) => config,
            Ok(None) => {
                self.send(ServerEvent::MissingMailConfig(serde_json::json!({})))
                    .await;
                return;
            }
            Err(err) => {
                warn!(user = %user_id, error = %err, "failed to load user config");
                return;
            }
        };
        // Sending only needs the two transports; role mapping may still be
        // mid-setup.
        let Some((smtp, imap)) = sending_configs(config) else {
            self.send(ServerEvent::MissingMailConfig(serde_json::json!({})))
                .await;
            return;
        };
        let handle = self
            .state
            .registry
            .get_or_create(&user_id, smtp, imap)
            .await;

        let mail = OutgoingMail {
            to: compose.to,
            cc: compose.cc.filter(|cc| !cc.is_empty()),
            bcc: compose.bcc.filter(|bcc| !bcc.is_empty()),
            subject: compose.subject,
            body_html: compose.body_html,
            in_reply_to: compose.in_reply_to,
            attachments: compose
                .attachments
                .into_iter()
                .map(|attachment| OutgoingAttachment {
                    filename: attachment.title,
                    data: attachment.data.data,
                })
                .collect(),
            ical: compose.ical.map(|ical| OutgoingCalendarEvent {
                method: ical.method,
                filename: ical.filename,
                content: ical.content,
            }),
        };

        let (notify, mut notify_rx) = mpsc::channel::<SessionEvent>(1);
        let out = self.out.clone();
        tokio::spawn(async move {
            while let Some(event) = notify_rx.recv().await {
                let toast = match event {
                    SessionEvent::SendCompleted { to } => Toast::success(
                        "Email sent",
                        format!("Email successfully sent to {}", to),
                    ),
                    SessionEvent::SendFailed { reason } => {
                        Toast::error("Error sending email", reason)
                    }
                    _ => continue,
                };
                if out.send(toast).await.is_err() {
                    break;
                }
            }
        });
        if let Err(err) = handle.send_mail(mail, is_reply, notify).await {
            self.send(Toast::error("Error sending email", err.to_string()))
                .await;
        }
    }

    async fn handle_load_mails(&self, data: LoadMailsData) {
        let Some(user_id) = self.authenticated() else {
            return;
        };
        if let Err(err) = push_page(
            &self.state.store,
            &user_id,
            data.page.max(0),
            data.mailbox_id.as_deref(),
            &self.out,
        )
        .await
        {
            warn!(user = %user_id, error = %err, "failed to load mail page");
        }
    }

    async fn handle_delete(&self, mail: MailRef) {
        let Some(user_id) = self.authenticated() else {
            return;
        };
        match self.state.store.delete_mail(&user_id, &mail.id).await {
            Ok(_) => {
                self.send(ServerEvent::DeleteSuccess { id: mail.id }).await;
            }
            Err(err) => {
                warn!(user = %user_id, error = %err, "failed to delete mail");
                self.send(Toast::error("Error deleting email", err.to_string()))
                    .await;
            }
        }
    }

    async fn handle_flag(&self, mail: MailRef, add: bool) {
        let Some(user_id) = self.authenticated() else {
            return;
        };
        let Some(handle) = self.state.registry.get(&user_id) else {
            self.send(Toast::error(
                "No active mailbox session",
                "Reconnect and try again".to_string(),
            ))
            .await;
            return;
        };
        if let Err(err) = handle.set_flag(&mail.id, "\\Seen", add).await {
            warn!(user = %user_id, mail = %mail.id, error = %err, "flag update failed");
            self.send(Toast::error("Error updating email", err.to_string()))
                .await;
        }
    }

    async fn send(&self, event: ServerEvent) {
        let _ = self.out.send(event).await;
    }
}

fn sending_configs(config: UserConfig) -> Option<(SmtpConfig, ImapConfig)> {
    match (config.smtp, config.imap) {
        (Some(smtp), Some(imap)) => Some((smtp, imap)),
        _ => None,
    }
}

async fn push_page(
    store: &SqliteMailStore,
    user_id: &str,
    page: i64,
    mailbox_id: Option<&str>,
    out: &mpsc::Sender<ServerEvent>,
) -> anyhow::Result<()> {
    let mails = store.list_mails(user_id, page, mailbox_id).await?;
    out.send(ServerEvent::LoadMails(mails))
        .await
        .map_err(|_| anyhow::anyhow!("client connection closed"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_parse_from_tagged_envelopes() {
        let auth: ClientCommand = serde_json::from_str(
            r#"{"type":"user_auth","data":{"accessToken":"tok","refreshToken":"r"}}"#,
        )
        .unwrap();
        assert!(matches!(
            auth,
            ClientCommand::UserAuth(AuthData {
                access_token: Some(_)
            })
        ));

        let load: ClientCommand =
            serde_json::from_str(r#"{"type":"load_mails","data":{"page":2,"mailboxId":"SU5CT1g"}}"#)
                .unwrap();
        match load {
            ClientCommand::LoadMails(data) => {
                assert_eq!(data.page, 2);
                assert_eq!(data.mailbox_id.as_deref(), Some("SU5CT1g"));
            }
            other => panic!("unexpected command: {:?}", other),
        }

        let read: ClientCommand =
            serde_json::from_str(r#"{"type":"mark_as_read","data":{"id":"<m1@x>"}}"#).unwrap();
        assert!(matches!(read, ClientCommand::MarkAsRead(MailRef { .. })));
    }

    #[test]
    fn send_email_carries_browser_attachment_shape() {
        let command: ClientCommand = serde_json::from_str(
            r#"{
                "type": "send_email",
                "data": {
                    "to": "b@x.com",
                    "subject": "hi",
                    "text": "<p>hello</p>",
                    "attachments": [{"title": "a.txt", "data": {"type": "Buffer", "data": [104, 105]}}]
                }
            }"#,
        )
        .unwrap();
        match command {
            ClientCommand::SendEmail(compose) => {
                assert_eq!(compose.body_html, "<p>hello</p>");
                assert_eq!(compose.attachments[0].title, "a.txt");
                assert_eq!(compose.attachments[0].data.data, vec![104, 105]);
                assert!(compose.cc.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn send_email_accepts_a_calendar_event() {
        let command: ClientCommand = serde_json::from_str(
            r#"{
                "type": "send_email",
                "data": {
                    "to": "b@x.com",
                    "subject": "meeting",
                    "text": "<p>see invite</p>",
                    "ical": {"method": "REQUEST", "filename": "invite.ics", "content": "BEGIN:VCALENDAR"}
                }
            }"#,
        )
        .unwrap();
        match command {
            ClientCommand::SendEmail(compose) => {
                let ical = compose.ical.unwrap();
                assert_eq!(ical.method, "REQUEST");
                assert_eq!(ical.filename, "invite.ics");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn sending_needs_transports_but_not_roles() {
        let smtp = SmtpConfig {
            host: "smtp.example.com".to_string(),
            port: 587,
            username: "u@example.com".to_string(),
            password: "pw".to_string(),
            secure: true,
        };
        let imap = ImapConfig {
            host: "imap.example.com".to_string(),
            port: 993,
            username: "u@example.com".to_string(),
            password: "pw".to_string(),
            secure: true,
        };
        let mid_setup = UserConfig {
            smtp: Some(smtp.clone()),
            imap: Some(imap),
            mailboxes: None,
        };
        assert!(sending_configs(mid_setup).is_some());

        let no_imap = UserConfig {
            smtp: Some(smtp),
            imap: None,
            mailboxes: None,
        };
        assert!(sending_configs(no_imap).is_none());
    }

    #[test]
    fn unknown_command_type_is_an_error() {
        let result: Result<ClientCommand, _> =
            serde_json::from_str(r#"{"type":"format_disk","data":{}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn outbound_events_serialize_with_wire_names() {
        let toast = Toast::success("Email sent", "Email successfully sent to b@x.com".to_string());
        let json = serde_json::to_value(&toast).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["data"]["type"], "success");
        assert_eq!(json["data"]["title"], "Email sent");

        let roles = MailboxRoles {
            inbox: "INBOX".to_string(),
            sent: "Sent".to_string(),
            drafts: "Drafts".to_string(),
            trash: "Trash".to_string(),
            spam: "Junk".to_string(),
        };
        let variables = ServerEvent::MailboxesVariables((&roles).into());
        let json = serde_json::to_value(&variables).unwrap();
        assert_eq!(json["type"], "mailboxes_variables");
        assert_eq!(json["data"]["INBOX"], "INBOX");
        assert_eq!(json["data"]["SPAM"], "Junk");

        let deleted = ServerEvent::DeleteSuccess {
            id: "<m1@x>".to_string(),
        };
        let json = serde_json::to_value(&deleted).unwrap();
        assert_eq!(json["type"], "delete_success");
        assert_eq!(json["data"]["id"], "<m1@x>");
    }
}
