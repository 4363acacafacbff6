//! One live mailbox session per user, created on demand and kept for the
//! life of the process.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use mailbridge_core::{ImapConfig, SmtpConfig, SqliteMailStore};
use mailbridge_mail::{MailboxSession, SessionHandle};

pub struct SessionRegistry {
    store: SqliteMailStore,
    sessions: DashMap<String, SessionHandle>,
    // Serializes creation per user without blocking other users.
    creating: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionRegistry {
    pub fn new(store: SqliteMailStore) -> Self {
        SessionRegistry {
            store,
            sessions: DashMap::new(),
            creating: DashMap::new(),
        }
    }

    pub fn get(&self, user_id: &str) -> Option<SessionHandle> {
        self.sessions.get(user_id).map(|entry| entry.clone())
    }

    /// Idempotent: concurrent callers for the same user all receive the
    /// same handle.
    pub async fn get_or_create(
        &self,
        user_id: &str,
        smtp: SmtpConfig,
        imap: ImapConfig,
    ) -> SessionHandle {
        if let Some(handle) = self.get(user_id) {
            return handle;
        }
        let lock = self
            .creating
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;
        if let Some(handle) = self.get(user_id) {
            return handle;
        }
        let handle = MailboxSession::start(user_id, smtp, imap, self.store.clone());
        self.sessions.insert(user_id.to_string(), handle.clone());
        handle
    }
}
