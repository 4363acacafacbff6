//! Durable message store: per-user mail, mailbox metadata and credentials.

use std::str::FromStr;

use anyhow::Result;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL;
use serde::{Deserialize, Serialize};
use sqlx::{SqlitePool, sqlite::SqliteConnectOptions, sqlite::SqlitePoolOptions};

pub const PAGE_SIZE: i64 = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub secure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub secure: bool,
}

/// Logical mailbox roles mapped to the provider's folder paths. An empty
/// string means the role is absent, never a folder literally named "".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MailboxRoles {
    pub inbox: String,
    pub sent: String,
    pub drafts: String,
    pub trash: String,
    pub spam: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserConfig {
    pub smtp: Option<SmtpConfig>,
    pub imap: Option<ImapConfig>,
    pub mailboxes: Option<MailboxRoles>,
}

impl UserConfig {
    pub fn is_complete(&self) -> bool {
        self.smtp.is_some() && self.imap.is_some() && self.mailboxes.is_some()
    }

    /// Copy with both passwords blanked, for echoing back to clients.
    pub fn masked(&self) -> UserConfig {
        let mut out = self.clone();
        if let Some(smtp) = out.smtp.as_mut() {
            smtp.password = String::new();
        }
        if let Some(imap) = out.imap.as_mut() {
            imap.password = String::new();
        }
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMail {
    #[serde(rename = "id")]
    pub mail_id: String,
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    #[serde(rename = "text")]
    pub body: String,
    #[serde(rename = "date")]
    pub date_ts: i64,
    pub flags: Vec<String>,
    #[serde(rename = "mailboxId")]
    pub mailbox_id: String,
    #[serde(rename = "threadId")]
    pub thread_id: String,
}

#[derive(Debug, Clone)]
pub struct NewMail {
    pub mail_id: String,
    pub user_id: String,
    pub imap_uid: Option<u32>,
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub body: String,
    pub date_ts: i64,
    pub flags: Vec<String>,
    pub mailbox_id: String,
    pub thread_id: String,
}

/// Stable mailbox id for a folder path. URL-safe unpadded base64 keeps the
/// id deterministic across syncs and collision-free across distinct paths.
pub fn mailbox_id_from_path(path: &str) -> String {
    BASE64_URL.encode(path.as_bytes())
}

fn to_json(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

fn from_json(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

#[derive(Clone)]
pub struct SqliteMailStore {
    pool: SqlitePool,
}

impl SqliteMailStore {
    pub async fn connect(path: &str) -> Result<Self> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{}", path)
        };
        let options = SqliteConnectOptions::new()
            .filename(url.trim_start_matches("sqlite:"))
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// In-memory store for tests. A single connection keeps every query on
    /// the same SQLite database.
    pub async fn connect_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub async fn init(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn create_user(&self, user_id: &str) -> Result<()> {
        sqlx::query("INSERT INTO users (id) VALUES (?) ON CONFLICT(id) DO NOTHING")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn user_exists(&self, user_id: &str) -> Result<bool> {
        let row = sqlx::query_as::<_, (String,)>("SELECT id FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Removes every row belonging to the user, configs and mail included.
    pub async fn delete_user_data(&self, user_id: &str) -> Result<()> {
        for table in [
            "mails",
            "mailboxes",
            "threads",
            "smtp_configs",
            "imap_configs",
            "mailbox_roles",
        ] {
            let query = format!("DELETE FROM {} WHERE user_id = ?", table);
            sqlx::query(&query).bind(user_id).execute(&self.pool).await?;
        }
        sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn upsert_smtp_config(&self, user_id: &str, config: &SmtpConfig) -> Result<()> {
        sqlx::query(
            "INSERT INTO smtp_configs (user_id, host, port, username, password, secure)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET host = excluded.host, port = excluded.port,
                 username = excluded.username, password = excluded.password, secure = excluded.secure",
        )
        .bind(user_id)
        .bind(&config.host)
        .bind(config.port as i64)
        .bind(&config.username)
        .bind(&config.password)
        .bind(if config.secure { 1 } else { 0 })
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_imap_config(&self, user_id: &str, config: &ImapConfig) -> Result<()> {
        sqlx::query(
            "INSERT INTO imap_configs (user_id, host, port, username, password, secure)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET host = excluded.host, port = excluded.port,
                 username = excluded.username, password = excluded.password, secure = excluded.secure",
        )
        .bind(user_id)
        .bind(&config.host)
        .bind(config.port as i64)
        .bind(&config.username)
        .bind(&config.password)
        .bind(if config.secure { 1 } else { 0 })
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_mailbox_roles(&self, user_id: &str, roles: &MailboxRoles) -> Result<()> {
        sqlx::query(
            "INSERT INTO mailbox_roles (user_id, inbox, sent, drafts, trash, spam)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET inbox = excluded.inbox, sent = excluded.sent,
                 drafts = excluded.drafts, trash = excluded.trash, spam = excluded.spam",
        )
        .bind(user_id)
        .bind(&roles.inbox)
        .bind(&roles.sent)
        .bind(&roles.drafts)
        .bind(&roles.trash)
        .bind(&roles.spam)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_smtp_config(&self, user_id: &str) -> Result<Option<SmtpConfig>> {
        let row = sqlx::query_as::<_, (String, i64, String, String, i64)>(
            "SELECT host, port, username, password, secure FROM smtp_configs WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(host, port, username, password, secure)| SmtpConfig {
            host,
            port: port as u16,
            username,
            password,
            secure: secure != 0,
        }))
    }

    pub async fn get_imap_config(&self, user_id: &str) -> Result<Option<ImapConfig>> {
        let row = sqlx::query_as::<_, (String, i64, String, String, i64)>(
            "SELECT host, port, username, password, secure FROM imap_configs WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(host, port, username, password, secure)| ImapConfig {
            host,
            port: port as u16,
            username,
            password,
            secure: secure != 0,
        }))
    }

    pub async fn get_mailbox_roles(&self, user_id: &str) -> Result<Option<MailboxRoles>> {
        let row = sqlx::query_as::<_, (String, String, String, String, String)>(
            "SELECT inbox, sent, drafts, trash, spam FROM mailbox_roles WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(inbox, sent, drafts, trash, spam)| MailboxRoles {
            inbox,
            sent,
            drafts,
            trash,
            spam,
        }))
    }

    pub async fn get_user_config(&self, user_id: &str) -> Result<Option<UserConfig>> {
        if !self.user_exists(user_id).await? {
            return Ok(None);
        }
        Ok(Some(UserConfig {
            smtp: self.get_smtp_config(user_id).await?,
            imap: self.get_imap_config(user_id).await?,
            mailboxes: self.get_mailbox_roles(user_id).await?,
        }))
    }

    pub async fn ensure_mailbox(&self, user_id: &str, id: &str, path: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO mailboxes (id, user_id, path, name) VALUES (?, ?, ?, ?)
             ON CONFLICT(id, user_id) DO NOTHING",
        )
        .bind(id)
        .bind(user_id)
        .bind(path)
        .bind(path)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn ensure_thread(&self, user_id: &str, id: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO threads (id, user_id) VALUES (?, ?)
             ON CONFLICT(id, user_id) DO NOTHING",
        )
        .bind(id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mail_exists(&self, user_id: &str, mail_id: &str) -> Result<bool> {
        let row = sqlx::query_as::<_, (String,)>(
            "SELECT mail_id FROM mails WHERE mail_id = ? AND user_id = ?",
        )
        .bind(mail_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Inserts a mail record. Returns false when the row already exists;
    /// a losing racer on (mail_id, user_id) is not an error.
    pub async fn insert_mail(&self, mail: &NewMail) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO mails (mail_id, user_id, imap_uid, from_addr, to_addrs, cc_addrs,
                 bcc_addrs, subject, body, date_ts, flags, mailbox_id, thread_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&mail.mail_id)
        .bind(&mail.user_id)
        .bind(mail.imap_uid.map(|v| v as i64))
        .bind(&mail.from)
        .bind(to_json(&mail.to))
        .bind(to_json(&mail.cc))
        .bind(to_json(&mail.bcc))
        .bind(&mail.subject)
        .bind(&mail.body)
        .bind(mail.date_ts)
        .bind(to_json(&mail.flags))
        .bind(&mail.mailbox_id)
        .bind(&mail.thread_id)
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(true),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get_mail_flags(&self, user_id: &str, mail_id: &str) -> Result<Option<Vec<String>>> {
        let row = sqlx::query_as::<_, (String,)>(
            "SELECT flags FROM mails WHERE mail_id = ? AND user_id = ?",
        )
        .bind(mail_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(flags,)| from_json(&flags)))
    }

    /// Read-modify-write of the stored flag set within one transaction.
    /// An absent row reads as the empty set; the write-back is then a no-op.
    pub async fn update_flag(
        &self,
        user_id: &str,
        mail_id: &str,
        flag: &str,
        add: bool,
    ) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, (String,)>(
            "SELECT flags FROM mails WHERE mail_id = ? AND user_id = ?",
        )
        .bind(mail_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;
        let mut flags = row.map(|(raw,)| from_json(&raw)).unwrap_or_default();
        if add {
            if !flags.iter().any(|f| f == flag) {
                flags.push(flag.to_string());
            }
        } else {
            flags.retain(|f| f != flag);
        }
        sqlx::query("UPDATE mails SET flags = ? WHERE mail_id = ? AND user_id = ?")
            .bind(to_json(&flags))
            .bind(mail_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(flags)
    }

    /// Folder path and UID a stored mail was fetched from, for remote
    /// flag commands.
    pub async fn get_mail_remote_ref(
        &self,
        user_id: &str,
        mail_id: &str,
    ) -> Result<Option<(String, u32)>> {
        let row = sqlx::query_as::<_, (String, Option<i64>)>(
            "SELECT b.path, m.imap_uid FROM mails m
             JOIN mailboxes b ON b.id = m.mailbox_id AND b.user_id = m.user_id
             WHERE m.mail_id = ? AND m.user_id = ?",
        )
        .bind(mail_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|(path, uid)| uid.map(|uid| (path, uid as u32))))
    }

    pub async fn list_mails(
        &self,
        user_id: &str,
        page: i64,
        mailbox_id: Option<&str>,
    ) -> Result<Vec<StoredMail>> {
        let mut query = String::from(
            "SELECT mail_id, from_addr, to_addrs, cc_addrs, bcc_addrs, subject, body,
                 date_ts, flags, mailbox_id, thread_id
             FROM mails WHERE user_id = ?",
        );
        if mailbox_id.is_some() {
            query.push_str(" AND mailbox_id = ?");
        }
        query.push_str(" ORDER BY date_ts DESC, mail_id DESC LIMIT ? OFFSET ?");

        let mut q = sqlx::query_as::<
            _,
            (
                String,
                String,
                String,
                String,
                String,
                String,
                String,
                i64,
                String,
                String,
                String,
            ),
        >(&query)
        .bind(user_id);
        if let Some(mailbox_id) = mailbox_id {
            q = q.bind(mailbox_id);
        }
        let rows = q
            .bind(PAGE_SIZE)
            .bind(page.max(0).saturating_mul(PAGE_SIZE))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(
                |(
                    mail_id,
                    from,
                    to,
                    cc,
                    bcc,
                    subject,
                    body,
                    date_ts,
                    flags,
                    mailbox_id,
                    thread_id,
                )| StoredMail {
                    mail_id,
                    from,
                    to: from_json(&to),
                    cc: from_json(&cc),
                    bcc: from_json(&bcc),
                    subject,
                    body,
                    date_ts,
                    flags: from_json(&flags),
                    mailbox_id,
                    thread_id,
                },
            )
            .collect())
    }

    /// Local-only removal; the remote copy is untouched and may be
    /// re-ingested by a later sync.
    pub async fn delete_mail(&self, user_id: &str, mail_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM mails WHERE mail_id = ? AND user_id = ?")
            .bind(mail_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> SqliteMailStore {
        let store = SqliteMailStore::connect_in_memory().await.unwrap();
        store.init().await.unwrap();
        store
    }

    fn sample_mail(mail_id: &str, user_id: &str, date_ts: i64) -> NewMail {
        NewMail {
            mail_id: mail_id.to_string(),
            user_id: user_id.to_string(),
            imap_uid: Some(7),
            from: "sender@example.com".to_string(),
            to: vec!["rcpt@example.com".to_string()],
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: "hello".to_string(),
            body: "<p>hi</p>".to_string(),
            date_ts,
            flags: Vec::new(),
            mailbox_id: mailbox_id_from_path("INBOX"),
            thread_id: mail_id.to_string(),
        }
    }

    #[test]
    fn mailbox_ids_are_stable_and_distinct() {
        assert_eq!(mailbox_id_from_path("INBOX"), mailbox_id_from_path("INBOX"));
        assert_ne!(mailbox_id_from_path("INBOX"), mailbox_id_from_path("Sent"));
        assert_ne!(
            mailbox_id_from_path("a/b"),
            mailbox_id_from_path("a"),
        );
    }

    #[tokio::test]
    async fn duplicate_insert_is_swallowed() {
        let store = test_store().await;
        let mail = sample_mail("m1", "u1", 100);
        assert!(store.insert_mail(&mail).await.unwrap());
        assert!(!store.insert_mail(&mail).await.unwrap());

        let page = store.list_mails("u1", 0, None).await.unwrap();
        assert_eq!(page.len(), 1);
    }

    #[tokio::test]
    async fn same_mail_id_is_distinct_per_user() {
        let store = test_store().await;
        assert!(store.insert_mail(&sample_mail("m1", "u1", 100)).await.unwrap());
        assert!(store.insert_mail(&sample_mail("m1", "u2", 100)).await.unwrap());
    }

    #[tokio::test]
    async fn flag_add_remove_round_trip() {
        let store = test_store().await;
        store.insert_mail(&sample_mail("m1", "u1", 100)).await.unwrap();

        let flags = store.update_flag("u1", "m1", "\\Seen", true).await.unwrap();
        assert_eq!(flags, vec!["\\Seen".to_string()]);
        let flags = store.update_flag("u1", "m1", "\\Seen", false).await.unwrap();
        assert!(flags.is_empty());
    }

    #[tokio::test]
    async fn flag_add_twice_keeps_set_semantics() {
        let store = test_store().await;
        store.insert_mail(&sample_mail("m1", "u1", 100)).await.unwrap();

        store.update_flag("u1", "m1", "\\Seen", true).await.unwrap();
        let flags = store.update_flag("u1", "m1", "\\Seen", true).await.unwrap();
        assert_eq!(flags, vec!["\\Seen".to_string()]);
    }

    #[tokio::test]
    async fn flag_update_on_absent_mail_reads_empty_set() {
        let store = test_store().await;
        let flags = store.update_flag("u1", "ghost", "\\Seen", true).await.unwrap();
        assert_eq!(flags, vec!["\\Seen".to_string()]);
        assert_eq!(store.get_mail_flags("u1", "ghost").await.unwrap(), None);
    }

    #[tokio::test]
    async fn pagination_is_newest_first_in_pages_of_twenty() {
        let store = test_store().await;
        for i in 0..45i64 {
            store
                .insert_mail(&sample_mail(&format!("m{:02}", i), "u1", 1000 - i))
                .await
                .unwrap();
        }

        let first = store.list_mails("u1", 0, None).await.unwrap();
        assert_eq!(first.len(), 20);
        assert_eq!(first[0].mail_id, "m00");
        assert_eq!(first[19].mail_id, "m19");

        let second = store.list_mails("u1", 1, None).await.unwrap();
        assert_eq!(second.len(), 20);
        assert_eq!(second[0].mail_id, "m20");
        assert_eq!(second[19].mail_id, "m39");

        let beyond = store.list_mails("u1", 3, None).await.unwrap();
        assert!(beyond.is_empty());
    }

    #[tokio::test]
    async fn extreme_page_numbers_read_as_end_of_list() {
        // Page numbers come straight from the client and may be anything.
        let store = test_store().await;
        store.insert_mail(&sample_mail("m1", "u1", 100)).await.unwrap();

        let huge = store.list_mails("u1", i64::MAX, None).await.unwrap();
        assert!(huge.is_empty());
        let negative = store.list_mails("u1", -7, None).await.unwrap();
        assert_eq!(negative.len(), 1);
    }

    #[tokio::test]
    async fn pagination_filters_by_mailbox() {
        let store = test_store().await;
        let mut inbox = sample_mail("m1", "u1", 100);
        store.insert_mail(&inbox).await.unwrap();
        inbox.mail_id = "m2".to_string();
        inbox.mailbox_id = mailbox_id_from_path("Sent");
        store.insert_mail(&inbox).await.unwrap();

        let sent_id = mailbox_id_from_path("Sent");
        let page = store.list_mails("u1", 0, Some(&sent_id)).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].mail_id, "m2");
    }

    #[tokio::test]
    async fn delete_is_local_only_and_reports_hits() {
        let store = test_store().await;
        store.insert_mail(&sample_mail("m1", "u1", 100)).await.unwrap();

        assert!(store.delete_mail("u1", "m1").await.unwrap());
        assert!(!store.delete_mail("u1", "m1").await.unwrap());
    }

    #[tokio::test]
    async fn config_upsert_overwrites_in_place() {
        let store = test_store().await;
        store.create_user("u1").await.unwrap();
        let mut smtp = SmtpConfig {
            host: "mail.example.com".to_string(),
            port: 587,
            username: "me".to_string(),
            password: "secret".to_string(),
            secure: true,
        };
        store.upsert_smtp_config("u1", &smtp).await.unwrap();
        smtp.port = 465;
        store.upsert_smtp_config("u1", &smtp).await.unwrap();

        let stored = store.get_smtp_config("u1").await.unwrap().unwrap();
        assert_eq!(stored.port, 465);
        assert_eq!(stored.password, "secret");
    }

    #[tokio::test]
    async fn masked_config_never_exposes_passwords() {
        let store = test_store().await;
        store.create_user("u1").await.unwrap();
        store
            .upsert_smtp_config(
                "u1",
                &SmtpConfig {
                    host: "mail.example.com".to_string(),
                    port: 587,
                    username: "me".to_string(),
                    password: "secret".to_string(),
                    secure: true,
                },
            )
            .await
            .unwrap();

        let config = store.get_user_config("u1").await.unwrap().unwrap().masked();
        assert_eq!(config.smtp.unwrap().password, "");
    }

    #[tokio::test]
    async fn delete_user_data_purges_everything() {
        let store = test_store().await;
        store.create_user("u1").await.unwrap();
        store.insert_mail(&sample_mail("m1", "u1", 100)).await.unwrap();
        store.ensure_mailbox("u1", &mailbox_id_from_path("INBOX"), "INBOX").await.unwrap();
        store.ensure_thread("u1", "m1").await.unwrap();

        store.delete_user_data("u1").await.unwrap();
        assert!(!store.user_exists("u1").await.unwrap());
        assert!(store.list_mails("u1", 0, None).await.unwrap().is_empty());
    }
}
