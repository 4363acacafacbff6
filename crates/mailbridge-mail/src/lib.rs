//! Per-user mailbox session: one long-lived IMAP connection, async SMTP
//! sending and the live-watch loop feeding the ingestion pipeline.

mod ingest;

pub use ingest::{FetchedMessage, IngestOutcome, ingest, mail_id_for, normalize_recipients};

use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use imap::types::{Flag, UnsolicitedResponse};
use imap::{ClientBuilder, ConnectionMode};
use imap_proto::NameAttribute;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Tokio1Executor,
    message::{Attachment, Mailbox, Message, MultiPart, SinglePart, header::ContentType},
    transport::smtp::{
        authentication::Credentials,
        client::{Tls, TlsParameters},
    },
};
use mailparse::{MailAddr, addrparse};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use mailbridge_core::{ImapConfig, MailboxRoles, SmtpConfig, SqliteMailStore};

const SESSION_CMD_QUEUE_CAPACITY: usize = 256;
const SESSION_EVENT_CAPACITY: usize = 256;
const WORKER_POLL: Duration = Duration::from_secs(1);
// Also the worst-case queueing delay for a command arriving mid-IDLE.
const IDLE_CYCLE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct OutgoingAttachment {
    pub filename: String,
    pub data: Vec<u8>,
}

/// Calendar invitation riding along with a send, delivered as a
/// `text/calendar` part carrying the iCalendar method.
#[derive(Debug, Clone)]
pub struct OutgoingCalendarEvent {
    pub method: String,
    pub filename: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct OutgoingMail {
    pub to: String,
    pub cc: Option<String>,
    pub bcc: Option<String>,
    pub subject: String,
    pub body_html: String,
    pub in_reply_to: Option<String>,
    pub attachments: Vec<OutgoingAttachment>,
    pub ical: Option<OutgoingCalendarEvent>,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    SyncStarted,
    SyncCompleted,
    SyncFailed { reason: String },
    NewMail { folder: String },
    SendCompleted { to: String },
    SendFailed { reason: String },
}

enum SessionCommand {
    StartSync {
        done: oneshot::Sender<Result<()>>,
    },
    SetFlag {
        mail_id: String,
        flag: String,
        add: bool,
        done: oneshot::Sender<Result<()>>,
    },
    SendMail {
        mail: OutgoingMail,
        is_reply: bool,
        notify: mpsc::Sender<SessionEvent>,
    },
}

enum WorkerCommand {
    StartSync {
        done: oneshot::Sender<Result<()>>,
    },
    SetFlag {
        mail_id: String,
        flag: String,
        add: bool,
        done: oneshot::Sender<Result<()>>,
    },
}

/// Cloneable handle to one user's mailbox session. All clones feed the
/// same command queue, so the registry can hand the same session to every
/// connection of that user.
#[derive(Clone)]
pub struct SessionHandle {
    user_id: String,
    tx: mpsc::Sender<SessionCommand>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionHandle {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn same_session(&self, other: &SessionHandle) -> bool {
        self.tx.same_channel(&other.tx)
    }

    /// Full sync pass; resolves once the pass has finished or failed.
    pub async fn start_sync(&self) -> Result<()> {
        let (done, done_rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::StartSync { done })
            .await
            .map_err(|_| anyhow!("mailbox session closed"))?;
        done_rx
            .await
            .map_err(|_| anyhow!("mailbox session dropped the sync"))?
    }

    /// Remote flag write first, then the stored set; errors out without
    /// touching the store when the remote command fails.
    pub async fn set_flag(&self, mail_id: &str, flag: &str, add: bool) -> Result<()> {
        let (done, done_rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::SetFlag {
                mail_id: mail_id.to_string(),
                flag: flag.to_string(),
                add,
                done,
            })
            .await
            .map_err(|_| anyhow!("mailbox session closed"))?;
        done_rx
            .await
            .map_err(|_| anyhow!("mailbox session dropped the flag update"))?
    }

    /// Fire-and-forget send; completion lands on `notify` as either
    /// `SendCompleted` or `SendFailed`.
    pub async fn send_mail(
        &self,
        mail: OutgoingMail,
        is_reply: bool,
        notify: mpsc::Sender<SessionEvent>,
    ) -> Result<()> {
        self.tx
            .send(SessionCommand::SendMail {
                mail,
                is_reply,
                notify,
            })
            .await
            .map_err(|_| anyhow!("mailbox session closed"))
    }
}

pub struct MailboxSession;

impl MailboxSession {
    /// Spawns the session: an async dispatcher for commands and SMTP work,
    /// plus a dedicated worker thread owning the IMAP connection. Nothing
    /// connects until the first sync command arrives.
    pub fn start(
        user_id: &str,
        smtp: SmtpConfig,
        imap: ImapConfig,
        store: SqliteMailStore,
    ) -> SessionHandle {
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<SessionCommand>(SESSION_CMD_QUEUE_CAPACITY);
        let (event_tx, _) = broadcast::channel::<SessionEvent>(SESSION_EVENT_CAPACITY);
        let (work_tx, work_rx) = std_mpsc::channel::<WorkerCommand>();

        let worker = SessionWorker {
            user_id: user_id.to_string(),
            config: imap,
            store,
            runtime: Handle::current(),
            events: event_tx.clone(),
            session: None,
            selected: None,
            watch: None,
        };
        let thread_name = format!("imap-{}", user_id);
        if let Err(err) = thread::Builder::new()
            .name(thread_name)
            .spawn(move || worker.run(work_rx))
        {
            warn!(user = %user_id, error = %err, "failed to spawn imap worker");
        }

        let dispatcher_user = user_id.to_string();
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    SessionCommand::StartSync { done } => {
                        forward_to_worker(&work_tx, WorkerCommand::StartSync { done });
                    }
                    SessionCommand::SetFlag {
                        mail_id,
                        flag,
                        add,
                        done,
                    } => {
                        forward_to_worker(
                            &work_tx,
                            WorkerCommand::SetFlag {
                                mail_id,
                                flag,
                                add,
                                done,
                            },
                        );
                    }
                    SessionCommand::SendMail {
                        mail,
                        is_reply,
                        notify,
                    } => {
                        let smtp = smtp.clone();
                        tokio::spawn(async move {
                            match send_outgoing(&smtp, &mail, is_reply).await {
                                Ok(()) => {
                                    let _ = notify
                                        .send(SessionEvent::SendCompleted {
                                            to: mail.to.clone(),
                                        })
                                        .await;
                                }
                                Err(err) => {
                                    let _ = notify
                                        .send(SessionEvent::SendFailed {
                                            reason: err.to_string(),
                                        })
                                        .await;
                                }
                            }
                        });
                    }
                }
            }
            debug!(user = %dispatcher_user, "session dispatcher stopped");
        });

        SessionHandle {
            user_id: user_id.to_string(),
            tx: cmd_tx,
            events: event_tx,
        }
    }
}

fn forward_to_worker(tx: &std_mpsc::Sender<WorkerCommand>, cmd: WorkerCommand) {
    if let Err(std_mpsc::SendError(cmd)) = tx.send(cmd) {
        let reason = anyhow!("imap worker is gone");
        match cmd {
            WorkerCommand::StartSync { done } => {
                let _ = done.send(Err(reason));
            }
            WorkerCommand::SetFlag { done, .. } => {
                let _ = done.send(Err(reason));
            }
        }
    }
}

struct SessionWorker {
    user_id: String,
    config: ImapConfig,
    store: SqliteMailStore,
    runtime: Handle,
    events: broadcast::Sender<SessionEvent>,
    session: Option<imap::Session<imap::Connection>>,
    selected: Option<String>,
    watch: Option<String>,
}

impl SessionWorker {
    fn run(mut self, rx: std_mpsc::Receiver<WorkerCommand>) {
        loop {
            match rx.recv_timeout(WORKER_POLL) {
                Ok(cmd) => self.handle(cmd),
                Err(std_mpsc::RecvTimeoutError::Timeout) => self.watch_cycle(),
                Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        if let Some(mut session) = self.session.take() {
            let _ = session.logout();
        }
        debug!(user = %self.user_id, "imap worker stopped");
    }

    fn handle(&mut self, cmd: WorkerCommand) {
        match cmd {
            WorkerCommand::StartSync { done } => {
                let result = self.full_sync();
                match &result {
                    Ok(()) => {
                        let _ = self.events.send(SessionEvent::SyncCompleted);
                    }
                    Err(err) => {
                        let _ = self.events.send(SessionEvent::SyncFailed {
                            reason: err.to_string(),
                        });
                    }
                }
                let _ = done.send(result);
            }
            WorkerCommand::SetFlag {
                mail_id,
                flag,
                add,
                done,
            } => {
                let _ = done.send(self.set_flag(&mail_id, &flag, add));
            }
        }
    }

    fn ensure_session(&mut self) -> Result<&mut imap::Session<imap::Connection>> {
        if self.session.is_none() {
            let session = imap_connect(&self.config)?;
            self.session = Some(session);
            self.selected = None;
        }
        self.session
            .as_mut()
            .ok_or_else(|| anyhow!("imap session unavailable"))
    }

    /// One full pass: supported folders in listing order, inbox last, then
    /// the live watch takes over. A missing config piece is a quiet no-op;
    /// a connect failure is reported to the caller.
    fn full_sync(&mut self) -> Result<()> {
        let config = self
            .runtime
            .block_on(self.store.get_user_config(&self.user_id))?
            .ok_or_else(|| anyhow!("unknown user {}", self.user_id))?;
        if !config.is_complete() {
            debug!(user = %self.user_id, "mail config incomplete, skipping sync");
            return Ok(());
        }
        let Some(roles) = config.mailboxes else {
            return Ok(());
        };

        let _ = self.events.send(SessionEvent::SyncStarted);
        let listed: Vec<String> = {
            let session = self.ensure_session()?;
            session
                .list(None, Some("*"))?
                .iter()
                .map(|name| name.name().to_string())
                .collect()
        };
        // Later folders may reference threads and mailboxes created by
        // earlier ones; the inbox goes last for that reason.
        for path in plan_folder_order(&listed, &roles) {
            if let Err(err) = self.sync_folder(&path, false) {
                warn!(user = %self.user_id, folder = %path, error = %err, "folder sync failed, skipping");
            }
        }
        self.watch = Some(roles.inbox).filter(|path| !path.is_empty());
        Ok(())
    }

    /// SELECT is the exclusive-access step; a folder that cannot be
    /// selected is abandoned for this pass instead of failing the sync.
    fn sync_folder(&mut self, path: &str, notify_new: bool) -> Result<()> {
        let select_result = {
            let session = self.ensure_session()?;
            session.select(path)
        };
        let exists = match select_result {
            Ok(mailbox) => {
                self.selected = Some(path.to_string());
                mailbox.exists
            }
            Err(err) => {
                warn!(user = %self.user_id, folder = %path, error = %err, "folder unavailable, skipping");
                self.selected = None;
                return Ok(());
            }
        };
        if exists == 0 {
            return Ok(());
        }

        let fetches = {
            let session = self.ensure_session()?;
            session.fetch("1:*", "(UID ENVELOPE FLAGS BODY.PEEK[])")?
        };

        let mut ingested = 0usize;
        for fetch in fetches.iter() {
            let Some(uid) = fetch.uid else { continue };
            let Some(source) = fetch.body() else { continue };
            let message_id = fetch
                .envelope()
                .and_then(|envelope| envelope.message_id.as_ref())
                .map(|id| String::from_utf8_lossy(id).trim().to_string())
                .filter(|id| !id.is_empty());
            let flags = fetch
                .flags()
                .iter()
                .map(flag_name)
                .filter(|name| !name.is_empty())
                .collect();
            let message = FetchedMessage {
                uid,
                message_id,
                thread_id: None,
                flags,
                source,
            };
            match self
                .runtime
                .block_on(ingest(&self.store, &self.user_id, path, message))
            {
                Ok(IngestOutcome::Ingested) => {
                    ingested += 1;
                    if notify_new {
                        let _ = self.events.send(SessionEvent::NewMail {
                            folder: path.to_string(),
                        });
                    }
                }
                Ok(IngestOutcome::Skipped) => {}
                Err(err) => {
                    warn!(user = %self.user_id, folder = %path, error = %err, "message ingestion failed");
                }
            }
        }
        debug!(user = %self.user_id, folder = %path, ingested, "folder sync finished");
        Ok(())
    }

    fn set_flag(&mut self, mail_id: &str, flag: &str, add: bool) -> Result<()> {
        let (folder, uid) = self
            .runtime
            .block_on(self.store.get_mail_remote_ref(&self.user_id, mail_id))?
            .ok_or_else(|| anyhow!("no remote reference for mail {}", mail_id))?;
        let query = format!("{}FLAGS.SILENT ({})", if add { "+" } else { "-" }, flag);
        let needs_select = self.selected.as_deref() != Some(folder.as_str());
        let runtime = self.runtime.clone();
        let store = self.store.clone();
        let user_id = self.user_id.clone();
        {
            let session = self.ensure_session()?;
            runtime.block_on(flag_write_through(
                &store,
                &user_id,
                mail_id,
                flag,
                add,
                || {
                    if needs_select {
                        session.select(&folder)?;
                    }
                    session.uid_store(uid.to_string(), &query)?;
                    Ok(())
                },
            ))?;
        }
        self.selected = Some(folder);
        Ok(())
    }

    fn watch_cycle(&mut self) {
        let Some(folder) = self.watch.clone() else {
            return;
        };
        match self.idle_wait(&folder) {
            Ok(true) => {
                if let Err(err) = self.sync_folder(&folder, true) {
                    warn!(user = %self.user_id, folder = %folder, error = %err, "incremental sync failed");
                }
            }
            Ok(false) => {}
            Err(err) => {
                warn!(user = %self.user_id, error = %err, "idle watch failed, dropping connection");
                self.session = None;
                self.selected = None;
            }
        }
    }

    fn idle_wait(&mut self, folder: &str) -> Result<bool> {
        if self.selected.as_deref() != Some(folder) {
            {
                let session = self.ensure_session()?;
                session.select(folder)?;
            }
            self.selected = Some(folder.to_string());
        }
        let session = self.ensure_session()?;
        let mut changed = false;
        session
            .idle()
            .timeout(IDLE_CYCLE)
            .keepalive(false)
            .wait_while(|response| match response {
                UnsolicitedResponse::Exists(_) | UnsolicitedResponse::Recent(_) => {
                    changed = true;
                    false
                }
                _ => true,
            })?;
        Ok(changed)
    }
}

/// Remote is the source of truth for flags: the stored set only changes
/// once the remote command succeeded. A failing remote step leaves the
/// store untouched.
pub async fn flag_write_through(
    store: &SqliteMailStore,
    user_id: &str,
    mail_id: &str,
    flag: &str,
    add: bool,
    remote: impl FnOnce() -> Result<()>,
) -> Result<Vec<String>> {
    remote()?;
    store.update_flag(user_id, mail_id, flag, add).await
}

/// Sync order for one full pass: every listed folder that is neither the
/// literal "INBOX" nor the configured inbox path and is one of the
/// supported role paths, in listing order, then the inbox path last.
pub fn plan_folder_order(listed: &[String], roles: &MailboxRoles) -> Vec<String> {
    let supported = [&roles.sent, &roles.drafts, &roles.trash, &roles.spam];
    let mut order: Vec<String> = listed
        .iter()
        .filter(|path| {
            path.as_str() != "INBOX"
                && path.as_str() != roles.inbox
                && supported
                    .iter()
                    .any(|role| !role.is_empty() && role.as_str() == path.as_str())
        })
        .cloned()
        .collect();
    if !roles.inbox.is_empty() {
        order.push(roles.inbox.clone());
    }
    order
}

fn imap_connect(config: &ImapConfig) -> Result<imap::Session<imap::Connection>> {
    debug!(host = %config.host, port = config.port, "imap connect");
    let mode = if config.secure {
        ConnectionMode::AutoTls
    } else {
        ConnectionMode::Plaintext
    };
    let client = ClientBuilder::new(config.host.as_str(), config.port)
        .tls_kind(imap::TlsKind::Native)
        .mode(mode)
        .connect()?;
    let session = client
        .login(&config.username, &config.password)
        .map_err(|e| e.0)?;
    debug!(host = %config.host, "imap login ok");
    Ok(session)
}

/// Lists remote folder paths with the stored IMAP config; used by the
/// settings surface as a config test.
pub fn list_remote_folders(config: &ImapConfig) -> Result<Vec<String>> {
    let mut session = imap_connect(config)?;
    let list = session.list(None, Some("*"))?;
    let folders = list.iter().map(|name| name.name().to_string()).collect();
    let _ = session.logout();
    Ok(folders)
}

/// Derives the role mapping from the remote listing: special-use
/// attributes pick sent/drafts/trash/spam, and the first folder carrying
/// none of those becomes the inbox. Unmatched roles stay "".
pub fn discover_roles(config: &ImapConfig) -> Result<MailboxRoles> {
    let mut session = imap_connect(config)?;
    let list = session.list(None, Some("*"))?;
    let mut roles = MailboxRoles::default();
    for name in list.iter() {
        fold_role(&mut roles, name.name(), name.attributes());
    }
    let _ = session.logout();
    Ok(roles)
}

fn fold_role(roles: &mut MailboxRoles, path: &str, attributes: &[NameAttribute]) {
    let mut special = false;
    for attribute in attributes {
        match attribute {
            NameAttribute::Sent => {
                special = true;
                if roles.sent.is_empty() {
                    roles.sent = path.to_string();
                }
            }
            NameAttribute::Drafts => {
                special = true;
                if roles.drafts.is_empty() {
                    roles.drafts = path.to_string();
                }
            }
            NameAttribute::Trash => {
                special = true;
                if roles.trash.is_empty() {
                    roles.trash = path.to_string();
                }
            }
            NameAttribute::Junk => {
                special = true;
                if roles.spam.is_empty() {
                    roles.spam = path.to_string();
                }
            }
            _ => {}
        }
    }
    if !special && roles.inbox.is_empty() {
        roles.inbox = path.to_string();
    }
}

fn flag_name(flag: &Flag) -> String {
    match flag {
        Flag::Seen => "\\Seen".to_string(),
        Flag::Answered => "\\Answered".to_string(),
        Flag::Flagged => "\\Flagged".to_string(),
        Flag::Deleted => "\\Deleted".to_string(),
        Flag::Draft => "\\Draft".to_string(),
        Flag::Recent => "\\Recent".to_string(),
        Flag::MayCreate => "\\*".to_string(),
        Flag::Custom(name) => name.to_string(),
        _ => String::new(),
    }
}

fn build_outgoing(smtp: &SmtpConfig, mail: &OutgoingMail, is_reply: bool) -> Result<Message> {
    // The sender is always the configured account, never client-supplied.
    let from_addr: Mailbox = smtp
        .username
        .parse()
        .map_err(|_| anyhow!("smtp username is not a mail address"))?;
    let to_addrs = parse_mailbox_list(&mail.to)?;
    if to_addrs.is_empty() {
        return Err(anyhow!("no recipients"));
    }

    let mut builder = Message::builder()
        .from(from_addr)
        .subject(mail.subject.clone());
    for addr in to_addrs.clone() {
        builder = builder.to(addr);
    }
    for addr in parse_mailbox_list(mail.cc.as_deref().unwrap_or(""))? {
        builder = builder.cc(addr);
    }
    for addr in parse_mailbox_list(mail.bcc.as_deref().unwrap_or(""))? {
        builder = builder.bcc(addr);
    }
    if is_reply {
        if let Some(original) = &mail.in_reply_to {
            builder = builder
                .in_reply_to(original.clone())
                .references(original.clone());
        }
        if let Some(first) = to_addrs.first() {
            builder = builder.reply_to(first.clone());
        }
    }

    if mail.attachments.is_empty() && mail.ical.is_none() {
        return Ok(builder.singlepart(SinglePart::html(mail.body_html.clone()))?);
    }
    let mut multipart = MultiPart::mixed().build();
    multipart = multipart.singlepart(SinglePart::html(mail.body_html.clone()));
    for attachment in &mail.attachments {
        let mime = ContentType::parse("application/octet-stream")
            .map_err(|err| anyhow!("content type: {}", err))?;
        multipart = multipart.singlepart(
            Attachment::new(attachment.filename.clone()).body(attachment.data.clone(), mime),
        );
    }
    if let Some(ical) = &mail.ical {
        let mime = ContentType::parse(&format!("text/calendar; method={}", ical.method))
            .map_err(|err| anyhow!("calendar content type: {}", err))?;
        multipart = multipart.singlepart(
            Attachment::new(ical.filename.clone()).body(ical.content.clone().into_bytes(), mime),
        );
    }
    Ok(builder.multipart(multipart)?)
}

async fn send_outgoing(smtp: &SmtpConfig, mail: &OutgoingMail, is_reply: bool) -> Result<()> {
    let email = build_outgoing(smtp, mail, is_reply)?;
    let creds = Credentials::new(smtp.username.clone(), smtp.password.clone());
    let builder = if !smtp.secure {
        AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp.host)
            .port(smtp.port)
            .tls(Tls::None)
    } else {
        let tls_parameters = TlsParameters::builder(smtp.host.clone()).build()?;
        if smtp.port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp.host)
                .port(smtp.port)
                .tls(Tls::Wrapper(tls_parameters))
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp.host)
                .port(smtp.port)
                .tls(Tls::Required(tls_parameters))
        }
    };
    let mailer = builder.credentials(creds).build();

    mailer
        .send(email)
        .await
        .map_err(|e| anyhow!(e.to_string()))?;
    Ok(())
}

fn parse_mailbox_list(input: &str) -> Result<Vec<Mailbox>> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let parsed = addrparse(trimmed)?;
    let mut out = Vec::new();
    for addr in parsed.iter() {
        match addr {
            MailAddr::Single(info) => {
                if let Ok(parsed) = info.addr.parse() {
                    out.push(Mailbox::new(info.display_name.clone(), parsed));
                }
            }
            MailAddr::Group(group) => {
                for info in &group.addrs {
                    if let Ok(parsed) = info.addr.parse() {
                        out.push(Mailbox::new(info.display_name.clone(), parsed));
                    }
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roles() -> MailboxRoles {
        MailboxRoles {
            inbox: "INBOX".to_string(),
            sent: "Sent".to_string(),
            drafts: String::new(),
            trash: "Trash".to_string(),
            spam: String::new(),
        }
    }

    #[test]
    fn folder_order_is_supported_then_inbox_last() {
        let listed = vec![
            "INBOX".to_string(),
            "Sent".to_string(),
            "Archive".to_string(),
            "Trash".to_string(),
        ];
        let order = plan_folder_order(&listed, &roles());
        assert_eq!(order, vec!["Sent", "Trash", "INBOX"]);
    }

    #[test]
    fn folder_order_skips_inbox_when_role_absent() {
        let mut roles = roles();
        roles.inbox = String::new();
        let listed = vec!["INBOX".to_string(), "Sent".to_string()];
        let order = plan_folder_order(&listed, &roles);
        assert_eq!(order, vec!["Sent"]);
    }

    #[test]
    fn empty_role_path_never_matches_a_folder() {
        // "" means role absent, not a folder literally named "".
        let mut roles = roles();
        roles.sent = String::new();
        let listed = vec!["".to_string(), "Trash".to_string(), "INBOX".to_string()];
        let order = plan_folder_order(&listed, &roles);
        assert_eq!(order, vec!["Trash", "INBOX"]);
    }

    #[test]
    fn roles_fold_from_special_use_attributes() {
        let mut roles = MailboxRoles::default();
        fold_role(&mut roles, "INBOX", &[]);
        fold_role(&mut roles, "Gesendet", &[NameAttribute::Sent]);
        fold_role(&mut roles, "Papierkorb", &[NameAttribute::Trash]);
        fold_role(&mut roles, "Werbung", &[NameAttribute::Junk]);
        fold_role(&mut roles, "Andere", &[]);

        assert_eq!(roles.inbox, "INBOX");
        assert_eq!(roles.sent, "Gesendet");
        assert_eq!(roles.trash, "Papierkorb");
        assert_eq!(roles.spam, "Werbung");
        assert_eq!(roles.drafts, "");
    }

    #[test]
    fn first_plain_folder_wins_the_inbox_role() {
        let mut roles = MailboxRoles::default();
        fold_role(&mut roles, "Drafts", &[NameAttribute::Drafts]);
        fold_role(&mut roles, "Mail", &[]);
        fold_role(&mut roles, "Later", &[]);
        assert_eq!(roles.inbox, "Mail");
    }

    #[test]
    fn flag_names_round_trip_common_flags() {
        assert_eq!(flag_name(&Flag::Seen), "\\Seen");
        assert_eq!(flag_name(&Flag::Draft), "\\Draft");
        assert_eq!(flag_name(&Flag::Custom("$Important".into())), "$Important");
    }

    #[test]
    fn calendar_event_rides_as_text_calendar_part() {
        let smtp = SmtpConfig {
            host: "smtp.example.com".to_string(),
            port: 587,
            username: "me@example.com".to_string(),
            password: "pw".to_string(),
            secure: true,
        };
        let mail = OutgoingMail {
            to: "b@x.com".to_string(),
            cc: None,
            bcc: None,
            subject: "meeting".to_string(),
            body_html: "<p>see invite</p>".to_string(),
            in_reply_to: None,
            attachments: Vec::new(),
            ical: Some(OutgoingCalendarEvent {
                method: "REQUEST".to_string(),
                filename: "invite.ics".to_string(),
                content: "BEGIN:VCALENDAR\r\nEND:VCALENDAR\r\n".to_string(),
            }),
        };

        let message = build_outgoing(&smtp, &mail, false).unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("multipart/mixed"));
        assert!(raw.contains("text/calendar; method=REQUEST"));
        assert!(raw.contains("invite.ics"));
    }

    #[tokio::test]
    async fn failed_remote_flag_command_leaves_store_untouched() {
        use mailbridge_core::NewMail;

        let store = SqliteMailStore::connect_in_memory().await.unwrap();
        store.init().await.unwrap();
        store
            .insert_mail(&NewMail {
                mail_id: "m1".to_string(),
                user_id: "u1".to_string(),
                imap_uid: Some(3),
                from: "a@x.com".to_string(),
                to: vec!["b@x.com".to_string()],
                cc: Vec::new(),
                bcc: Vec::new(),
                subject: "hi".to_string(),
                body: String::new(),
                date_ts: 100,
                flags: Vec::new(),
                mailbox_id: "bx".to_string(),
                thread_id: "m1".to_string(),
            })
            .await
            .unwrap();

        let result = flag_write_through(&store, "u1", "m1", "\\Seen", true, || {
            Err(anyhow!("STORE rejected"))
        })
        .await;
        assert!(result.is_err());
        let flags = store.get_mail_flags("u1", "m1").await.unwrap().unwrap();
        assert!(flags.is_empty());

        let flags = flag_write_through(&store, "u1", "m1", "\\Seen", true, || Ok(()))
            .await
            .unwrap();
        assert_eq!(flags, vec!["\\Seen".to_string()]);
    }

    #[test]
    fn watch_cycle_keeps_command_latency_bounded() {
        // Commands queue behind at most one idle cycle.
        assert!(IDLE_CYCLE <= Duration::from_secs(5));
    }

    #[test]
    fn mailbox_list_accepts_groups_and_singles() {
        let single = parse_mailbox_list("a@x.com").unwrap();
        let grouped = parse_mailbox_list("team: a@x.com;").unwrap();
        assert_eq!(single.len(), 1);
        assert_eq!(grouped.len(), 1);
        assert_eq!(single[0].email, grouped[0].email);
    }

    #[tokio::test]
    async fn handle_clones_share_one_session() {
        let store = SqliteMailStore::connect_in_memory().await.unwrap();
        let smtp = SmtpConfig {
            host: "smtp.example.com".to_string(),
            port: 587,
            username: "me@example.com".to_string(),
            password: "pw".to_string(),
            secure: true,
        };
        let imap = ImapConfig {
            host: "imap.example.com".to_string(),
            port: 993,
            username: "me@example.com".to_string(),
            password: "pw".to_string(),
            secure: true,
        };
        let handle = MailboxSession::start("u1", smtp, imap, store);
        let clone = handle.clone();
        assert!(handle.same_session(&clone));
    }
}
