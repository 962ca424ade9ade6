//! Per-mailbox delivery locks

use postbox_common::types::MailboxId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Lock table keyed by mailbox id.
///
/// Entries are created on first use and never removed.
#[derive(Debug, Default)]
pub struct MailboxLocks {
    locks: Mutex<HashMap<MailboxId, Arc<AsyncMutex<()>>>>,
}

impl MailboxLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, mailbox: MailboxId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(mailbox).or_default())
    }

    /// Acquire the lock for `mailbox`, or `None` if `timeout` elapses first
    pub async fn lock(&self, mailbox: MailboxId, timeout: Duration) -> Option<OwnedMutexGuard<()>> {
        let handle = self.handle(mailbox);
        tokio::time::timeout(timeout, handle.lock_owned()).await.ok()
    }

    /// Number of mailboxes with a lock entry
    pub fn len(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_same_mailbox_serialized() {
        let locks = MailboxLocks::new();
        let mbox = Uuid::new_v4();

        let guard = locks.lock(mbox, Duration::from_secs(1)).await;
        assert!(guard.is_some());
        assert!(locks.lock(mbox, Duration::from_millis(20)).await.is_none());

        drop(guard);
        assert!(locks.lock(mbox, Duration::from_millis(20)).await.is_some());
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test]
    async fn test_other_mailbox_not_blocked() {
        let locks = MailboxLocks::new();
        let _held = locks.lock(Uuid::new_v4(), Duration::from_secs(1)).await;
        assert!(locks
            .lock(Uuid::new_v4(), Duration::from_millis(20))
            .await
            .is_some());
        assert_eq!(locks.len(), 2);
    }
}
