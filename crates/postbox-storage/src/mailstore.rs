//! Mailbox persistence
//!
//! [`MailboxStore`] hands out [`Mailbox`] handles per account. The in-memory
//! implementation keeps folders and messages in process and enforces quota,
//! maintenance mode and shared-delivery admission.

use crate::models::{
    Account, DeliveryContext, DeliveryOptions, Folder, ParsedMessage, StoredMessage, INBOX,
};
use async_trait::async_trait;
use chrono::Utc;
use postbox_common::config::StorageConfig;
use postbox_common::types::{AccountId, MailboxId, MessageId};
use postbox_common::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

/// Source of mailbox handles
#[async_trait]
pub trait MailboxStore: Send + Sync {
    /// Mailbox owned by `account`
    async fn mailbox_for_account(&self, account: &Account) -> Result<Arc<dyn Mailbox>>;
}

/// One account's mailbox
#[async_trait]
pub trait Mailbox: Send + Sync {
    fn id(&self) -> MailboxId;

    fn account_id(&self) -> AccountId;

    fn attachments_indexing_enabled(&self) -> bool;

    /// Request admission for a multi-recipient delivery.
    ///
    /// Refused with [`Error::MailboxUnavailable`] while the mailbox is in
    /// maintenance.
    fn begin_shared_delivery(&self) -> Result<()>;

    /// Release an admission granted by `begin_shared_delivery`
    fn end_shared_delivery(&self);

    /// Incoming copy of a message this account sent itself. Such a copy is
    /// accepted without being stored.
    fn is_copy_of_sent(&self, message: &ParsedMessage) -> bool;

    /// Folder at `path`, or [`Error::NoSuchFolder`]
    async fn folder_by_path(&self, path: &str) -> Result<Folder>;

    async fn create_folder(&self, path: &str) -> Result<Folder>;

    /// Deposit a message. Without a folder in `options` it lands in the inbox.
    async fn add_message(
        &self,
        message: &ParsedMessage,
        options: &DeliveryOptions,
        context: &DeliveryContext,
    ) -> Result<StoredMessage>;

    async fn message(&self, id: MessageId) -> Result<Option<StoredMessage>>;
}

#[derive(Default)]
struct MailboxState {
    folders: Vec<Folder>,
    messages: Vec<StoredMessage>,
    used_bytes: u64,
    shared_deliveries: usize,
    sent_message_ids: HashSet<String>,
}

/// In-memory mailbox
pub struct MemoryMailbox {
    id: MailboxId,
    account_id: AccountId,
    attachment_indexing: bool,
    quota_bytes: Option<u64>,
    maintenance: AtomicBool,
    state: Mutex<MailboxState>,
}

fn normalize_path(path: &str) -> String {
    path.trim_matches('/').to_string()
}

fn normalize_message_id(id: &str) -> String {
    id.trim().trim_start_matches('<').trim_end_matches('>').to_string()
}

impl MemoryMailbox {
    pub fn new(account: &Account) -> Self {
        let id = Uuid::new_v4();
        let inbox = Folder {
            id: Uuid::new_v4(),
            mailbox_id: id,
            path: INBOX.to_string(),
        };

        Self {
            id,
            account_id: account.id,
            attachment_indexing: account.attachment_indexing,
            quota_bytes: account.quota_bytes.and_then(|q| u64::try_from(q).ok()),
            maintenance: AtomicBool::new(false),
            state: Mutex::new(MailboxState {
                folders: vec![inbox],
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, MailboxState>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal("Mailbox state lock poisoned".to_string()))
    }

    /// Put the mailbox in or out of maintenance mode
    pub fn set_maintenance(&self, on: bool) {
        self.maintenance.store(on, Ordering::SeqCst);
    }

    /// All stored messages, oldest first
    pub fn messages(&self) -> Vec<StoredMessage> {
        self.state()
            .map(|s| s.messages.clone())
            .unwrap_or_default()
    }

    pub fn message_count(&self) -> usize {
        self.state().map(|s| s.messages.len()).unwrap_or(0)
    }

    /// Remember a Message-ID this account sent
    pub fn record_sent(&self, message_id: &str) {
        if let Ok(mut state) = self.state() {
            state.sent_message_ids.insert(normalize_message_id(message_id));
        }
    }

    /// Outstanding shared-delivery admissions
    pub fn shared_deliveries(&self) -> usize {
        self.state().map(|s| s.shared_deliveries).unwrap_or(0)
    }
}

#[async_trait]
impl Mailbox for MemoryMailbox {
    fn id(&self) -> MailboxId {
        self.id
    }

    fn account_id(&self) -> AccountId {
        self.account_id
    }

    fn attachments_indexing_enabled(&self) -> bool {
        self.attachment_indexing
    }

    fn begin_shared_delivery(&self) -> Result<()> {
        if self.maintenance.load(Ordering::SeqCst) {
            return Err(Error::MailboxUnavailable(format!(
                "mailbox {} is in maintenance",
                self.id
            )));
        }
        self.state()?.shared_deliveries += 1;
        Ok(())
    }

    fn end_shared_delivery(&self) {
        if let Ok(mut state) = self.state() {
            state.shared_deliveries = state.shared_deliveries.saturating_sub(1);
        }
    }

    fn is_copy_of_sent(&self, message: &ParsedMessage) -> bool {
        let Some(id) = message.message_id.as_deref() else {
            return false;
        };
        self.state()
            .map(|s| s.sent_message_ids.contains(&normalize_message_id(id)))
            .unwrap_or(false)
    }

    async fn folder_by_path(&self, path: &str) -> Result<Folder> {
        let wanted = normalize_path(path);
        self.state()?
            .folders
            .iter()
            .find(|f| f.path.eq_ignore_ascii_case(&wanted))
            .cloned()
            .ok_or_else(|| Error::NoSuchFolder(path.to_string()))
    }

    async fn create_folder(&self, path: &str) -> Result<Folder> {
        let wanted = normalize_path(path);
        if wanted.is_empty() {
            return Err(Error::Validation("Empty folder path".to_string()));
        }

        let mut state = self.state()?;
        if let Some(existing) = state
            .folders
            .iter()
            .find(|f| f.path.eq_ignore_ascii_case(&wanted))
        {
            return Ok(existing.clone());
        }

        let folder = Folder {
            id: Uuid::new_v4(),
            mailbox_id: self.id,
            path: wanted,
        };
        state.folders.push(folder.clone());
        debug!(mailbox = %self.id, path = %folder.path, "Created folder");
        Ok(folder)
    }

    async fn add_message(
        &self,
        message: &ParsedMessage,
        options: &DeliveryOptions,
        context: &DeliveryContext,
    ) -> Result<StoredMessage> {
        let mut state = self.state()?;
        let size = message.size() as u64;
        if let Some(quota) = self.quota_bytes {
            if state.used_bytes + size > quota {
                return Err(Error::QuotaExceeded(format!(
                    "mailbox {} would use {} of {} bytes",
                    self.id,
                    state.used_bytes + size,
                    quota
                )));
            }
        }

        let folder_id = match options.folder_id {
            Some(id) => {
                if !state.folders.iter().any(|f| f.id == id) {
                    return Err(Error::NoSuchFolder(id.to_string()));
                }
                id
            }
            None => state
                .folders
                .iter()
                .find(|f| f.path == INBOX)
                .map(|f| f.id)
                .ok_or_else(|| Error::NoSuchFolder(INBOX.to_string()))?,
        };

        let stored = StoredMessage {
            id: Uuid::now_v7(),
            mailbox_id: self.id,
            folder_id,
            flags: options.flags,
            tags: options.tags.clone(),
            size: message.size(),
            message_id_header: message.message_id.clone(),
            subject: message.subject.clone(),
            digest: context.blob_digest.clone().or_else(|| message.digest.clone()),
            raw: message.raw.clone(),
            received_at: Utc::now(),
        };

        state.used_bytes += size;
        state.messages.push(stored.clone());
        Ok(stored)
    }

    async fn message(&self, id: MessageId) -> Result<Option<StoredMessage>> {
        Ok(self.state()?.messages.iter().find(|m| m.id == id).cloned())
    }
}

/// In-memory mailbox store, one mailbox per account created on first use
#[derive(Default)]
pub struct MemoryMailboxStore {
    mailboxes: Mutex<HashMap<AccountId, Arc<MemoryMailbox>>>,
}

impl MemoryMailboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Concrete mailbox for an account, created if missing
    pub fn mailbox(&self, account: &Account) -> Result<Arc<MemoryMailbox>> {
        let mut mailboxes = self
            .mailboxes
            .lock()
            .map_err(|_| Error::Internal("Mailbox table lock poisoned".to_string()))?;
        let mailbox = mailboxes
            .entry(account.id)
            .or_insert_with(|| Arc::new(MemoryMailbox::new(account)));
        Ok(Arc::clone(mailbox))
    }
}

#[async_trait]
impl MailboxStore for MemoryMailboxStore {
    async fn mailbox_for_account(&self, account: &Account) -> Result<Arc<dyn Mailbox>> {
        let mailbox: Arc<dyn Mailbox> = self.mailbox(account)?;
        Ok(mailbox)
    }
}

/// Create a mailbox store from configuration
pub fn create_mailbox_store(config: &StorageConfig) -> Result<Arc<dyn MailboxStore>> {
    match config.mailbox_backend.as_str() {
        "memory" => {
            warn!("Mailboxes are kept in memory; delivered mail is lost on restart");
            Ok(Arc::new(MemoryMailboxStore::new()))
        }
        other => Err(Error::Config(format!(
            "Unsupported mailbox backend: {}",
            other
        ))),
    }
}
