//! Exactly-once ingestion: fetched message in, stored mail out.

use anyhow::Result;
use mailparse::{MailAddr, MailHeaderMap, ParsedMail, addrparse, dateparse};

use mailbridge_core::{NewMail, SqliteMailStore, mailbox_id_from_path};

pub const DEFAULT_SUBJECT: &str = "No subject";
pub const UNKNOWN_SENDER: &str = "unknown";

/// One message as fetched from the remote folder, before any parsing.
pub struct FetchedMessage<'a> {
    pub uid: u32,
    pub message_id: Option<String>,
    pub thread_id: Option<String>,
    pub flags: Vec<String>,
    pub source: &'a [u8],
}

#[derive(Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    Ingested,
    Skipped,
}

/// Stable per-user mail id: the server's Message-ID when present, else the
/// folder-qualified UID. Per-folder UIDs alone are not unique per account.
pub fn mail_id_for(folder_path: &str, uid: u32, message_id: Option<&str>) -> String {
    match message_id {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => format!("{}/{}", folder_path, uid),
    }
}

/// Idempotent: the existence check runs before any parsing work, and a
/// racing duplicate insert is swallowed by the store.
pub async fn ingest(
    store: &SqliteMailStore,
    user_id: &str,
    folder_path: &str,
    message: FetchedMessage<'_>,
) -> Result<IngestOutcome> {
    let mail_id = mail_id_for(folder_path, message.uid, message.message_id.as_deref());
    if store.mail_exists(user_id, &mail_id).await? {
        return Ok(IngestOutcome::Skipped);
    }

    let parsed = mailparse::parse_mail(message.source)?;
    let from = normalize_recipients(parsed.headers.get_first_value("From").as_deref())
        .into_iter()
        .next()
        .unwrap_or_else(|| UNKNOWN_SENDER.to_string());
    let to = normalize_recipients(parsed.headers.get_first_value("To").as_deref());
    let cc = normalize_recipients(parsed.headers.get_first_value("Cc").as_deref());
    let bcc = normalize_recipients(parsed.headers.get_first_value("Bcc").as_deref());
    let subject = parsed
        .headers
        .get_first_value("Subject")
        .filter(|subject| !subject.is_empty())
        .unwrap_or_else(|| DEFAULT_SUBJECT.to_string());
    let date_ts = parsed
        .headers
        .get_first_value("Date")
        .and_then(|date| dateparse(&date).ok())
        .unwrap_or(0);
    let body = body_content(&parsed)?;

    let mailbox_id = mailbox_id_from_path(folder_path);
    store.ensure_mailbox(user_id, &mailbox_id, folder_path).await?;
    let thread_id = message.thread_id.clone().unwrap_or_else(|| mail_id.clone());
    store.ensure_thread(user_id, &thread_id).await?;

    let inserted = store
        .insert_mail(&NewMail {
            mail_id,
            user_id: user_id.to_string(),
            imap_uid: Some(message.uid),
            from,
            to,
            cc,
            bcc,
            subject,
            body,
            date_ts,
            flags: message.flags,
            mailbox_id,
            thread_id,
        })
        .await?;
    Ok(if inserted {
        IngestOutcome::Ingested
    } else {
        IngestOutcome::Skipped
    })
}

/// A recipient header may hold a single address group or a list of groups;
/// both shapes flatten to plain address strings and entries without a
/// resolvable address are dropped.
pub fn normalize_recipients(raw: Option<&str>) -> Vec<String> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    let Ok(parsed) = addrparse(raw) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for addr in parsed.iter() {
        match addr {
            MailAddr::Single(info) => {
                if !info.addr.is_empty() {
                    out.push(info.addr.clone());
                }
            }
            MailAddr::Group(group) => {
                for info in &group.addrs {
                    if !info.addr.is_empty() {
                        out.push(info.addr.clone());
                    }
                }
            }
        }
    }
    out
}

/// Body preference: HTML part, else the plain text rendered as HTML, else
/// empty.
fn body_content(parsed: &ParsedMail) -> Result<String> {
    if let Some(html) = find_part(parsed, "text/html")? {
        return Ok(html);
    }
    if let Some(text) = find_part(parsed, "text/plain")? {
        return Ok(text_as_html(&text));
    }
    Ok(String::new())
}

fn find_part(parsed: &ParsedMail, mimetype: &str) -> Result<Option<String>> {
    if parsed.ctype.mimetype.eq_ignore_ascii_case(mimetype) {
        return Ok(Some(parsed.get_body()?));
    }
    for part in &parsed.subparts {
        if let Some(body) = find_part(part, mimetype)? {
            return Ok(Some(body));
        }
    }
    Ok(None)
}

fn text_as_html(text: &str) -> String {
    html_escape::encode_text(text).replace('\n', "<br>")
}
