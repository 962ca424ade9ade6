//! Storage models

use chrono::{DateTime, Utc};
use postbox_common::types::{AccountId, FolderId, MailboxId, MessageFlags, MessageId};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::path::PathBuf;
use uuid::Uuid;

/// Account lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Locked,
    Lockout,
    Maintenance,
    Pending,
    Closed,
    /// A status value this service does not recognize
    Unknown,
}

impl AccountStatus {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => AccountStatus::Active,
            "locked" => AccountStatus::Locked,
            "lockout" => AccountStatus::Lockout,
            "maintenance" => AccountStatus::Maintenance,
            "pending" => AccountStatus::Pending,
            "closed" => AccountStatus::Closed,
            _ => AccountStatus::Unknown,
        }
    }
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AccountStatus::Active => "active",
            AccountStatus::Locked => "locked",
            AccountStatus::Lockout => "lockout",
            AccountStatus::Maintenance => "maintenance",
            AccountStatus::Pending => "pending",
            AccountStatus::Closed => "closed",
            AccountStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Account as seen by the delivery service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    /// Primary address, e.g. `user@example.com`
    pub name: String,
    pub status: AccountStatus,
    /// Node hosting the mailbox; `None` means no node claims it
    pub home_server: Option<String>,
    pub local_delivery_disabled: bool,
    pub forwarding_address: Option<String>,
    pub dedupe_enabled: bool,
    pub attachment_indexing: bool,
    pub filters_enabled: bool,
    pub quota_bytes: Option<i64>,
}

impl Account {
    /// Active account with defaults, homed on `server`
    pub fn new(name: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            status: AccountStatus::Active,
            home_server: Some(server.into()),
            local_delivery_disabled: false,
            forwarding_address: None,
            dedupe_enabled: true,
            attachment_indexing: true,
            filters_enabled: true,
            quota_bytes: None,
        }
    }

    /// Whether this node serves the account's mailbox
    pub fn is_local(&self, node_name: &str) -> bool {
        self.home_server
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case(node_name))
    }
}

/// Row of the `accounts` table
#[derive(Debug, Clone, FromRow)]
pub struct AccountRow {
    pub id: Uuid,
    pub address: String,
    pub status: String,
    pub home_server: Option<String>,
    pub local_delivery_disabled: bool,
    pub forwarding_address: Option<String>,
    pub dedupe_enabled: bool,
    pub attachment_indexing: bool,
    pub filters_enabled: bool,
    pub quota_bytes: Option<i64>,
}

impl From<AccountRow> for Account {
    fn from(row: AccountRow) -> Self {
        Self {
            id: row.id,
            name: row.address,
            status: AccountStatus::parse(&row.status),
            home_server: row.home_server,
            local_delivery_disabled: row.local_delivery_disabled,
            forwarding_address: row.forwarding_address,
            dedupe_enabled: row.dedupe_enabled,
            attachment_indexing: row.attachment_indexing,
            filters_enabled: row.filters_enabled,
            quota_bytes: row.quota_bytes,
        }
    }
}

/// A staged incoming message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub id: Uuid,
    /// Hex SHA-256 of the content
    pub digest: String,
    pub size: u64,
    /// Path relative to the store root
    pub path: PathBuf,
}

/// A message parsed once per delivery and shared between recipients
#[derive(Debug, Clone, Default)]
pub struct ParsedMessage {
    pub raw: Vec<u8>,
    pub digest: Option<String>,
    pub message_id: Option<String>,
    pub resent_message_id: Option<String>,
    pub subject: Option<String>,
    pub from: Option<String>,
    /// Whether attachments were extracted for indexing
    pub index_attachments: bool,
    pub attachment_count: usize,
}

impl ParsedMessage {
    pub fn size(&self) -> usize {
        self.raw.len()
    }

    /// Identifier used to detect redelivery. `Resent-Message-ID` wins.
    pub fn dedupe_id(&self) -> Option<&str> {
        self.resent_message_id
            .as_deref()
            .or(self.message_id.as_deref())
    }
}

/// Per-recipient deposit options
#[derive(Debug, Clone, Default)]
pub struct DeliveryOptions {
    pub folder_id: Option<FolderId>,
    pub flags: MessageFlags,
    pub tags: Vec<String>,
    pub recipient: String,
}

/// Context shared by all deposits of one delivery
#[derive(Debug, Clone, Default)]
pub struct DeliveryContext {
    /// More than one local mailbox receives the message
    pub shared: bool,
    pub mailbox_ids: Vec<MailboxId>,
    pub blob_digest: Option<String>,
}

/// Message deposited in a mailbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: MessageId,
    pub mailbox_id: MailboxId,
    pub folder_id: FolderId,
    pub flags: MessageFlags,
    pub tags: Vec<String>,
    pub size: usize,
    pub message_id_header: Option<String>,
    pub subject: Option<String>,
    pub digest: Option<String>,
    #[serde(skip)]
    pub raw: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

/// Mail folder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    pub id: FolderId,
    pub mailbox_id: MailboxId,
    pub path: String,
}

/// Name of the default folder
pub const INBOX: &str = "Inbox";
