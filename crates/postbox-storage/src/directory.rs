//! Account directory

use crate::models::{Account, AccountRow};
use async_trait::async_trait;
use postbox_common::config::{DatabaseConfig, LmtpConfig};
use postbox_common::{Error, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use tracing::info;

/// Account lookup by address
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    /// Find the account owning `address`, compared case-insensitively
    async fn lookup(&self, address: &str) -> Result<Option<Account>>;
}

/// In-memory account directory
#[derive(Default)]
pub struct MemoryDirectory {
    accounts: RwLock<HashMap<String, Account>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an account, keyed by its name
    pub fn insert(&self, account: Account) {
        let key = account.name.to_ascii_lowercase();
        if let Ok(mut accounts) = self.accounts.write() {
            accounts.insert(key, account);
        }
    }

    /// Register an additional address for an existing account
    pub fn insert_alias(&self, alias: &str, account: Account) {
        if let Ok(mut accounts) = self.accounts.write() {
            accounts.insert(alias.to_ascii_lowercase(), account);
        }
    }

    pub fn remove(&self, address: &str) -> Option<Account> {
        self.accounts
            .write()
            .ok()
            .and_then(|mut a| a.remove(&address.to_ascii_lowercase()))
    }
}

#[async_trait]
impl AccountDirectory for MemoryDirectory {
    async fn lookup(&self, address: &str) -> Result<Option<Account>> {
        let accounts = self
            .accounts
            .read()
            .map_err(|_| Error::Internal("Account directory lock poisoned".to_string()))?;
        Ok(accounts.get(&address.to_ascii_lowercase()).cloned())
    }
}

/// Account directory backed by the `accounts` table
pub struct DbAccountDirectory {
    pool: PgPool,
}

impl DbAccountDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool and bring the schema up to date. The pool is capped at
    /// the LMTP connection limit and waits for a connection no longer than
    /// the mailbox lock timeout.
    pub async fn connect(database: &DatabaseConfig, lmtp: &LmtpConfig) -> Result<Self> {
        if database.url.is_empty() {
            return Err(Error::Config("Database URL required".to_string()));
        }

        let options = pool_options(database, lmtp);
        info!(
            max_connections = options.get_max_connections(),
            "Connecting to account database"
        );

        let pool = options
            .connect(&database.url)
            .await
            .map_err(|e| Error::Database(format!("Failed to connect: {}", e)))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| Error::Database(format!("Migration failed: {}", e)))?;

        Ok(Self::new(pool))
    }
}

fn pool_options(database: &DatabaseConfig, lmtp: &LmtpConfig) -> PgPoolOptions {
    let max_connections = database
        .max_connections
        .min(u32::try_from(lmtp.max_connections).unwrap_or(u32::MAX))
        .max(1);
    PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(database.min_connections.min(max_connections))
        .acquire_timeout(Duration::from_secs(lmtp.mailbox_lock_timeout_secs.max(1)))
}

#[async_trait]
impl AccountDirectory for DbAccountDirectory {
    async fn lookup(&self, address: &str) -> Result<Option<Account>> {
        let row = sqlx::query_as::<_, AccountRow>(
            r#"
            SELECT id, address, status, home_server, local_delivery_disabled,
                   forwarding_address, dedupe_enabled, attachment_indexing,
                   filters_enabled, quota_bytes
            FROM accounts
            WHERE LOWER(address) = LOWER($1)
            "#,
        )
        .bind(address)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(row.map(Account::from))
    }
}
