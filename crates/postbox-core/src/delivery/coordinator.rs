//! Delivery coordinator
//!
//! Answers RCPT status checks and turns a completed DATA transaction into
//! one reply per recipient. Local recipients are resolved first, then each
//! one is delivered under its mailbox lock; recipients homed on other nodes
//! are handed off one session per node. Failures stay with the recipient
//! they happened to.

use crate::delivery::callbacks::{CallbackError, CallbackRegistry, DeliveryEvent};
use crate::delivery::dedupe::DedupeCache;
use crate::delivery::filter::{EnvelopeInfo, FilterEngine, InboxFilter};
use crate::delivery::locks::MailboxLocks;
use crate::delivery::message::parse_message;
use crate::delivery::remote::{LmtpClient, RemoteDelivery};
use crate::lmtp::address::Address;
use crate::lmtp::envelope::Envelope;
use crate::lmtp::reply::Reply;
use crate::metrics::Metrics;
use futures::future::join_all;
use futures::FutureExt;
use postbox_common::types::MessageFlags;
use postbox_common::{halt, Config, Error, LiveConfig};
use postbox_storage::models::{
    Account, AccountStatus, Blob, DeliveryContext, DeliveryOptions, ParsedMessage, StoredMessage,
    INBOX,
};
use postbox_storage::{AccountDirectory, BlobStore, Mailbox, MailboxStore};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The message could not be staged; the connection must be dropped
    /// without replies
    #[error("failed to stage incoming message: {0}")]
    Unrecoverable(#[source] Error),
}

/// Per-recipient outcome of the resolution pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryAction {
    /// Local delivery disabled; accepted and dropped
    Discard,
    /// Try again later
    Defer,
    Deliver,
}

/// Shared-delivery admission, released exactly once on drop
struct SharedTicket {
    mailbox: Arc<dyn Mailbox>,
}

impl Drop for SharedTicket {
    fn drop(&mut self) {
        self.mailbox.end_shared_delivery();
    }
}

struct RecipientDetail {
    index: usize,
    account: Account,
    mailbox: Arc<dyn Mailbox>,
    message: Arc<ParsedMessage>,
    action: DeliveryAction,
    ticket: Option<SharedTicket>,
}

/// Sender and recipient of one local delivery
struct Delivery<'a> {
    sender: &'a str,
    recipient: &'a Address,
    email: String,
}

/// Coordinates delivery for every listener of this process
pub struct DeliveryCoordinator {
    config: LiveConfig<Config>,
    blobs: Arc<dyn BlobStore>,
    directory: Arc<dyn AccountDirectory>,
    mailboxes: Arc<dyn MailboxStore>,
    filter: Arc<dyn FilterEngine>,
    remote: Arc<dyn RemoteDelivery>,
    dedupe: DedupeCache,
    locks: MailboxLocks,
    callbacks: CallbackRegistry,
    metrics: Metrics,
}

impl DeliveryCoordinator {
    pub fn new(
        config: LiveConfig<Config>,
        blobs: Arc<dyn BlobStore>,
        directory: Arc<dyn AccountDirectory>,
        mailboxes: Arc<dyn MailboxStore>,
        metrics: Metrics,
    ) -> Self {
        let current = config.get();
        Self {
            dedupe: DedupeCache::new(current.dedupe),
            remote: Arc::new(LmtpClient::from_config(&current)),
            filter: Arc::new(InboxFilter),
            config,
            blobs,
            directory,
            mailboxes,
            locks: MailboxLocks::new(),
            callbacks: CallbackRegistry::new(),
            metrics,
        }
    }

    pub fn with_filter(mut self, filter: Arc<dyn FilterEngine>) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteDelivery>) -> Self {
        self.remote = remote;
        self
    }

    pub fn config(&self) -> &LiveConfig<Config> {
        &self.config
    }

    pub fn callbacks(&self) -> &CallbackRegistry {
        &self.callbacks
    }

    pub fn dedupe(&self) -> &DedupeCache {
        &self.dedupe
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Decide whether `address` can receive mail here and record its
    /// routing on the address
    pub async fn status(&self, address: &mut Address) -> Reply {
        let email = address.email_address();
        let node_name = self.config.get().server.node_name;

        let account = match self.directory.lookup(&email).await {
            Ok(Some(account)) => account,
            Ok(None) => {
                info!(address = %email, "Rejecting address: no account");
                return Reply::NO_SUCH_USER;
            }
            Err(e) if e.is_receivers_fault() => {
                warn!(address = %email, error = %e, "Try again for address: lookup failed");
                return Reply::MAILBOX_DISABLED;
            }
            Err(e) => {
                warn!(address = %email, error = %e, "Rejecting address: lookup failed");
                return Reply::NO_SUCH_USER;
            }
        };

        if account.status == AccountStatus::Maintenance {
            info!(address = %email, "Try again for address: account in maintenance");
            return Reply::MAILBOX_DISABLED;
        }

        if account.is_local(&node_name) {
            address.set_local();
        } else {
            match account.home_server.as_deref() {
                Some(server) => address.set_remote(server),
                None => {
                    warn!(address = %email, "Try again for address: mailbox is not on this server");
                    return Reply::MAILBOX_NOT_ON_THIS_SERVER;
                }
            }
        }

        match account.status {
            AccountStatus::Active | AccountStatus::Locked | AccountStatus::Lockout => {
                Reply::RECIPIENT_OK
            }
            status => {
                info!(address = %email, status = %status, "Rejecting address: account status");
                Reply::NO_SUCH_USER
            }
        }
    }

    /// Deliver `body` to every recipient of `envelope`.
    ///
    /// Returns replies in recipient order and records each on its
    /// [`Address`]. Only a staging failure is an error.
    pub async fn deliver(
        &self,
        envelope: &mut Envelope,
        body: Vec<u8>,
    ) -> Result<Vec<Reply>, DeliveryError> {
        let config = self.config.get();
        let blob = self
            .blobs
            .store_incoming(&body)
            .await
            .map_err(DeliveryError::Unrecoverable)?;

        self.metrics.messages_received.inc();
        self.metrics.bytes_received.inc_by(body.len() as u64);

        let indices: Vec<usize> = (0..envelope.recipients().len()).collect();
        if config.lmtp.validate_messages && has_long_line(&body, config.lmtp.max_line_length) {
            info!(
                sender = %envelope.sender_email(),
                max_line_length = config.lmtp.max_line_length,
                "Rejecting message with overlong line"
            );
            envelope.set_delivery_statuses(&indices, Reply::LINE_TOO_LONG);
        } else {
            self.dedupe.reconfigure(config.dedupe);
            let local = envelope.local_recipients();
            if !local.is_empty() {
                self.deliver_locally(envelope, &local, &body, &blob, &config)
                    .await;
            }
            self.deliver_remotely(envelope, &body).await;
        }

        if let Err(e) = self.blobs.delete(&blob).await {
            warn!(blob = %blob.id, error = %e, "Failed to delete incoming blob");
        }

        Ok(envelope.delivery_statuses())
    }

    async fn resolve(&self, email: &str) -> postbox_common::Result<Option<(Account, Arc<dyn Mailbox>)>> {
        let Some(account) = self.directory.lookup(email).await? else {
            return Ok(None);
        };
        let mailbox = self.mailboxes.mailbox_for_account(&account).await?;
        Ok(Some((account, mailbox)))
    }

    async fn deliver_locally(
        &self,
        envelope: &mut Envelope,
        local: &[usize],
        body: &[u8],
        blob: &Blob,
        config: &Config,
    ) {
        let shared = local.len() > 1;
        let mut details: Vec<RecipientDetail> = Vec::with_capacity(local.len());
        let mut target_ids = Vec::with_capacity(local.len());
        let mut with_attachments: Option<Arc<ParsedMessage>> = None;
        let mut without_attachments: Option<Arc<ParsedMessage>> = None;

        for &i in local {
            let email = envelope.recipients()[i].email_address();
            let (account, mailbox) = match self.resolve(&email).await {
                Ok(Some(found)) => found,
                Ok(None) => {
                    warn!(recipient = %email, "No account or mailbox for recipient");
                    envelope.set_delivery_statuses(&[i], Reply::PERMANENT_FAILURE);
                    continue;
                }
                Err(e) if e.is_receivers_fault() => {
                    info!(recipient = %email, error = %e, "Recoverable error resolving mailbox");
                    envelope.set_delivery_statuses(&[i], Reply::TEMPORARY_FAILURE);
                    continue;
                }
                Err(e) => {
                    warn!(recipient = %email, error = %e, "Error resolving mailbox");
                    envelope.set_delivery_statuses(&[i], Reply::PERMANENT_FAILURE);
                    continue;
                }
            };

            let index = mailbox.attachments_indexing_enabled();
            let slot = if index {
                &mut with_attachments
            } else {
                &mut without_attachments
            };
            let message = Arc::clone(slot.get_or_insert_with(|| {
                debug!(attachment_indexing = index, "Parsing message");
                Arc::new(parse_message(body, index, Some(&blob.digest)))
            }));

            if account.local_delivery_disabled {
                debug!(recipient = %email, "Local delivery disabled");
                details.push(RecipientDetail {
                    index: i,
                    account,
                    mailbox,
                    message,
                    action: DeliveryAction::Discard,
                    ticket: None,
                });
                continue;
            }

            // A single recipient is delivered even while admission is refused
            let mut action = DeliveryAction::Deliver;
            let mut ticket = None;
            if shared {
                match mailbox.begin_shared_delivery() {
                    Ok(()) => {
                        ticket = Some(SharedTicket {
                            mailbox: Arc::clone(&mailbox),
                        })
                    }
                    Err(e) => {
                        debug!(recipient = %email, error = %e, "Shared delivery refused");
                        action = DeliveryAction::Defer;
                    }
                }
            }
            if action == DeliveryAction::Deliver {
                target_ids.push(mailbox.id());
            }
            details.push(RecipientDetail {
                index: i,
                account,
                mailbox,
                message,
                action,
                ticket,
            });
        }

        let sender = envelope.sender_email();
        let message_id = with_attachments
            .as_ref()
            .or(without_attachments.as_ref())
            .and_then(|m| m.message_id.clone())
            .unwrap_or_default();
        info!(
            size = body.len(),
            recipients = local.len(),
            sender = %sender,
            message_id = %message_id,
            "Delivering message"
        );

        let context = DeliveryContext {
            shared,
            mailbox_ids: target_ids,
            blob_digest: Some(blob.digest.clone()),
        };

        for mut detail in details {
            let recipient = &envelope.recipients()[detail.index];
            let delivery = Delivery {
                sender: &sender,
                recipient,
                email: recipient.email_address(),
            };
            let reply = self
                .deliver_to_recipient(&detail, &delivery, &context, config)
                .await;
            detail.ticket.take();
            envelope.set_delivery_statuses(&[detail.index], reply);
        }
    }

    async fn deliver_to_recipient(
        &self,
        detail: &RecipientDetail,
        delivery: &Delivery<'_>,
        context: &DeliveryContext,
        config: &Config,
    ) -> Reply {
        let event = DeliveryEvent {
            account: &detail.account,
            mailbox: detail.mailbox.as_ref(),
            sender: delivery.sender,
            recipient: &delivery.email,
        };

        match detail.action {
            DeliveryAction::Discard => {
                info!(
                    sender = %delivery.sender,
                    recipient = %delivery.email,
                    "Accepted and discarded message: local delivery is disabled"
                );
                if detail.account.forwarding_address.is_some() {
                    for callback in self.callbacks.callbacks() {
                        debug!(callback = callback.name(), "Executing forward callback");
                        let result =
                            guarded(callback.forward_without_delivery(&event, &detail.message))
                                .await;
                        handle_callback_result(callback.name(), result);
                    }
                }
                self.metrics.recipient("discarded");
                Reply::DELIVERY_OK
            }
            DeliveryAction::Defer => {
                info!(
                    sender = %delivery.sender,
                    recipient = %delivery.email,
                    "Try again for message: mailbox skipped"
                );
                self.metrics.recipient("deferred");
                Reply::TEMPORARY_FAILURE
            }
            DeliveryAction::Deliver => {
                let timeout = Duration::from_secs(config.lmtp.mailbox_lock_timeout_secs);
                let Some(guard) = self.locks.lock(detail.mailbox.id(), timeout).await else {
                    info!(
                        sender = %delivery.sender,
                        recipient = %delivery.email,
                        "Try again for message: another delivery in progress"
                    );
                    self.rollback_dedupe(detail);
                    self.metrics.recipient("deferred");
                    return Reply::TEMPORARY_FAILURE;
                };

                let added = match self.deposit(detail, delivery, context).await {
                    Ok(added) => added,
                    Err(e) => {
                        drop(guard);
                        self.rollback_dedupe(detail);
                        self.metrics.recipient("failed");
                        return failure_reply(&e, delivery, config);
                    }
                };
                if !added.is_empty() {
                    self.record_dedupe(detail);
                }
                drop(guard);

                for callback in self.callbacks.callbacks() {
                    for message in added.iter().filter(|m| m.mailbox_id == detail.mailbox.id()) {
                        debug!(callback = callback.name(), message = %message.id, "Executing callback");
                        let result = guarded(callback.after_delivery(&event, message)).await;
                        handle_callback_result(callback.name(), result);
                    }
                }
                if !added.is_empty() {
                    self.metrics.recipient("delivered");
                }
                Reply::DELIVERY_OK
            }
        }
    }

    /// Deposit under the mailbox lock. An empty result means nothing was
    /// stored (duplicate or discarded by rules).
    async fn deposit(
        &self,
        detail: &RecipientDetail,
        delivery: &Delivery<'_>,
        context: &DeliveryContext,
    ) -> postbox_common::Result<Vec<StoredMessage>> {
        let mailbox = detail.mailbox.as_ref();
        let message = detail.message.as_ref();

        if self.is_duplicate(detail) {
            info!(
                message_id = message.dedupe_id().unwrap_or_default(),
                recipient = %delivery.email,
                "Not delivering message with duplicate Message-ID"
            );
            self.metrics.recipient("duplicate");
            return Ok(Vec::new());
        }

        if mailbox.is_copy_of_sent(message) {
            info!(
                message_id = message.message_id.as_deref().unwrap_or_default(),
                recipient = %delivery.email,
                "Not delivering message: copy of a message sent by the recipient"
            );
            self.metrics.recipient("duplicate");
            return Ok(Vec::new());
        }

        let recipient = delivery.recipient;
        if recipient.skip_filters() {
            let folder_id = match recipient.folder() {
                Some(path) => Some(match mailbox.folder_by_path(path).await {
                    Ok(folder) => folder.id,
                    Err(Error::NoSuchFolder(_)) => mailbox.create_folder(path).await?.id,
                    Err(e) => return Err(e),
                }),
                None => None,
            };
            let options = DeliveryOptions {
                folder_id,
                flags: recipient.flags().map(MessageFlags::parse).unwrap_or_default(),
                tags: recipient.tags().to_vec(),
                recipient: delivery.email.clone(),
            };
            let stored = mailbox.add_message(message, &options, context).await?;
            return Ok(vec![stored]);
        }

        if detail.account.filters_enabled {
            let envelope = EnvelopeInfo {
                sender: delivery.sender.to_string(),
                recipient: delivery.email.clone(),
            };
            return self
                .filter
                .apply_rules(mailbox, message, &envelope, context, INBOX)
                .await;
        }

        let options = DeliveryOptions {
            folder_id: None,
            flags: MessageFlags::default(),
            tags: Vec::new(),
            recipient: delivery.email.clone(),
        };
        Ok(vec![mailbox.add_message(message, &options, context).await?])
    }

    fn is_duplicate(&self, detail: &RecipientDetail) -> bool {
        if !detail.account.dedupe_enabled {
            return false;
        }
        match detail.message.dedupe_id() {
            Some(id) if !id.is_empty() => self.dedupe.contains(id, detail.mailbox.id()),
            _ => false,
        }
    }

    fn record_dedupe(&self, detail: &RecipientDetail) {
        if !detail.account.dedupe_enabled {
            return;
        }
        if let Some(id) = detail.message.dedupe_id().filter(|id| !id.is_empty()) {
            self.dedupe.record(id, detail.mailbox.id());
        }
    }

    fn rollback_dedupe(&self, detail: &RecipientDetail) {
        if let Some(id) = detail.message.dedupe_id().filter(|id| !id.is_empty()) {
            self.dedupe.remove(id, detail.mailbox.id());
        }
    }

    async fn deliver_remotely(&self, envelope: &mut Envelope, body: &[u8]) {
        let groups = envelope.remote_recipients_by_server();
        if groups.is_empty() {
            return;
        }

        let sender = envelope.sender_email();
        let attempts = groups.iter().map(|(server, indices)| {
            let recipients: Vec<String> = indices
                .iter()
                .map(|&i| envelope.recipients()[i].email_address())
                .collect();
            let sender = &sender;
            async move { self.remote.deliver(server, sender, &recipients, body).await }
        });
        let outcomes = join_all(attempts).await;

        for ((server, indices), outcome) in groups.iter().zip(outcomes) {
            let reply = match outcome {
                Ok(()) => {
                    self.metrics.remote_deliveries.with_label_values(&["ok"]).inc();
                    Reply::DELIVERY_OK
                }
                Err(e) => {
                    warn!(server = %server, error = %e, "Unsuccessful remote mail delivery");
                    self.metrics
                        .remote_deliveries
                        .with_label_values(&["failed"])
                        .inc();
                    Reply::TEMPORARY_FAILURE
                }
            };
            envelope.set_delivery_statuses(indices, reply);
        }
    }
}

fn failure_reply(e: &Error, delivery: &Delivery<'_>, config: &Config) -> Reply {
    match e {
        Error::MessageRefused(_) => {
            info!(sender = %delivery.sender, recipient = %delivery.email, "Rejecting message: filter rule");
            Reply::PERMANENT_MESSAGE_REFUSED
        }
        Error::QuotaExceeded(_) => {
            info!(sender = %delivery.sender, recipient = %delivery.email, "Rejecting message: over quota");
            if config.lmtp.permanent_failure_when_over_quota {
                Reply::PERMANENT_FAILURE_OVER_QUOTA
            } else {
                Reply::TEMPORARY_FAILURE_OVER_QUOTA
            }
        }
        e if e.is_receivers_fault() => {
            info!(sender = %delivery.sender, recipient = %delivery.email, error = %e, "Try again for message");
            Reply::TEMPORARY_FAILURE
        }
        e => {
            info!(sender = %delivery.sender, recipient = %delivery.email, error = %e, "Rejecting message");
            Reply::PERMANENT_FAILURE
        }
    }
}

/// Run a callback, turning a panic into an ordinary failure
async fn guarded<F>(callback: F) -> Result<(), CallbackError>
where
    F: Future<Output = Result<(), CallbackError>>,
{
    AssertUnwindSafe(callback)
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(CallbackError::Failed(panic_message(panic.as_ref()))))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", msg)
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("panicked: {}", msg)
    } else {
        "panicked".to_string()
    }
}

fn handle_callback_result(name: &str, result: Result<(), CallbackError>) {
    match result {
        Ok(()) => {}
        Err(CallbackError::Fatal(msg)) => {
            error!(callback = name, error = %msg, "Delivery callback failed fatally");
            halt("LMTP callback failed");
        }
        Err(e) => warn!(callback = name, error = %e, "Delivery callback failed"),
    }
}

fn has_long_line(body: &[u8], max: usize) -> bool {
    body.split(|&b| b == b'\n').any(|line| {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        line.len() > max
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::callbacks::DeliveryCallback;
    use crate::delivery::remote::RemoteError;
    use async_trait::async_trait;
    use postbox_storage::{LocalBlobStore, MemoryDirectory, MemoryMailboxStore};
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const NODE: &str = "mbs1";

    /// Directory that fails lookups for addresses starting with "broken"
    struct FlakyDirectory {
        inner: MemoryDirectory,
    }

    #[async_trait]
    impl AccountDirectory for FlakyDirectory {
        async fn lookup(&self, address: &str) -> postbox_common::Result<Option<Account>> {
            if address.starts_with("broken") {
                return Err(Error::Database("connection reset".to_string()));
            }
            self.inner.lookup(address).await
        }
    }

    #[derive(Default)]
    struct RecordingRemote {
        calls: Mutex<Vec<(String, Vec<String>)>>,
    }

    #[async_trait]
    impl RemoteDelivery for RecordingRemote {
        async fn deliver(
            &self,
            server: &str,
            _sender: &str,
            recipients: &[String],
            _body: &[u8],
        ) -> Result<(), RemoteError> {
            self.calls
                .lock()
                .unwrap()
                .push((server.to_string(), recipients.to_vec()));
            if server == "down" {
                return Err(RemoteError::ConnectTimeout(server.to_string()));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingCallback {
        delivered: Mutex<Vec<String>>,
        forwarded: Mutex<Vec<String>>,
        fail: bool,
        panic: bool,
    }

    #[async_trait]
    impl DeliveryCallback for CountingCallback {
        fn name(&self) -> &str {
            "counting"
        }

        async fn after_delivery(
            &self,
            event: &DeliveryEvent<'_>,
            _message: &StoredMessage,
        ) -> Result<(), CallbackError> {
            self.delivered.lock().unwrap().push(event.recipient.to_string());
            if self.panic {
                panic!("callback exploded");
            }
            if self.fail {
                return Err(CallbackError::Failed("boom".to_string()));
            }
            Ok(())
        }

        async fn forward_without_delivery(
            &self,
            event: &DeliveryEvent<'_>,
            _message: &ParsedMessage,
        ) -> Result<(), CallbackError> {
            self.forwarded.lock().unwrap().push(event.recipient.to_string());
            Ok(())
        }
    }

    struct Harness {
        coordinator: DeliveryCoordinator,
        directory: Arc<FlakyDirectory>,
        store: Arc<MemoryMailboxStore>,
        remote: Arc<RecordingRemote>,
        blob_root: PathBuf,
        _dir: TempDir,
    }

    impl Harness {
        fn new(config: Config) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let blob_root = dir.path().to_path_buf();
            let blobs: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::from_path(&blob_root).unwrap());
            let directory = Arc::new(FlakyDirectory {
                inner: MemoryDirectory::new(),
            });
            let store = Arc::new(MemoryMailboxStore::new());
            let remote = Arc::new(RecordingRemote::default());

            let mut config = config;
            config.server.node_name = NODE.to_string();
            let coordinator = DeliveryCoordinator::new(
                LiveConfig::new(config),
                blobs,
                directory.clone(),
                store.clone(),
                Metrics::new().unwrap(),
            )
            .with_remote(remote.clone());

            Self {
                coordinator,
                directory,
                store,
                remote,
                blob_root,
                _dir: dir,
            }
        }

        fn add_account(&self, account: Account) -> Account {
            self.directory.inner.insert(account.clone());
            account
        }

        fn local(&self, name: &str) -> Account {
            self.add_account(Account::new(name, NODE))
        }

        fn stored_count(&self, account: &Account) -> usize {
            self.store.mailbox(account).unwrap().message_count()
        }

        /// Status-check `rcpts` and build an envelope with every address
        /// that checked out, whatever its status
        async fn envelope(&self, rcpts: &[&str]) -> Envelope {
            let mut env = Envelope::new();
            env.set_sender(Address::from_email("sender@example.com", None), None, None);
            for rcpt in rcpts {
                let mut addr = Address::from_email(rcpt, None);
                let _ = self.coordinator.status(&mut addr).await;
                if !addr.on_local_server() && addr.remote_server().is_none() {
                    addr.set_local();
                }
                env.add_recipient(addr).unwrap();
            }
            env
        }

        fn incoming_is_empty(&self) -> bool {
            std::fs::read_dir(self.blob_root.join("incoming"))
                .map(|mut d| d.next().is_none())
                .unwrap_or(true)
        }
    }

    const MESSAGE: &[u8] = b"Message-ID: <m1@example.com>\r\nSubject: hi\r\n\r\nhello\r\n";

    #[tokio::test]
    async fn test_status_taxonomy() {
        let h = Harness::new(Config::default());
        h.local("active@example.com");
        let mut account = Account::new("maint@example.com", NODE);
        account.status = AccountStatus::Maintenance;
        h.add_account(account);
        let mut account = Account::new("closed@example.com", NODE);
        account.status = AccountStatus::Closed;
        h.add_account(account);
        let mut account = Account::new("pending@example.com", NODE);
        account.status = AccountStatus::Pending;
        h.add_account(account);
        let mut account = Account::new("locked@example.com", NODE);
        account.status = AccountStatus::Lockout;
        h.add_account(account);
        let mut account = Account::new("nowhere@example.com", NODE);
        account.home_server = None;
        h.add_account(account);
        h.add_account(Account::new("away@example.com", "mbs2"));

        let check = |email: &'static str| {
            let coordinator = &h.coordinator;
            async move {
                let mut addr = Address::from_email(email, None);
                let reply = coordinator.status(&mut addr).await;
                (reply, addr)
            }
        };

        let (reply, addr) = check("active@example.com").await;
        assert_eq!(reply, Reply::RECIPIENT_OK);
        assert!(addr.on_local_server());

        assert_eq!(check("ACTIVE@example.com").await.0, Reply::RECIPIENT_OK);
        assert_eq!(check("missing@example.com").await.0, Reply::NO_SUCH_USER);
        assert_eq!(check("maint@example.com").await.0, Reply::MAILBOX_DISABLED);
        assert_eq!(check("closed@example.com").await.0, Reply::NO_SUCH_USER);
        assert_eq!(check("pending@example.com").await.0, Reply::NO_SUCH_USER);
        assert_eq!(check("locked@example.com").await.0, Reply::RECIPIENT_OK);
        assert_eq!(
            check("nowhere@example.com").await.0,
            Reply::MAILBOX_NOT_ON_THIS_SERVER
        );
        assert_eq!(check("broken@example.com").await.0, Reply::MAILBOX_DISABLED);

        let (reply, addr) = check("away@example.com").await;
        assert_eq!(reply, Reply::RECIPIENT_OK);
        assert!(!addr.on_local_server());
        assert_eq!(addr.remote_server(), Some("mbs2"));
    }

    #[tokio::test]
    async fn test_deliver_stores_exact_body_and_cleans_blob() {
        let h = Harness::new(Config::default());
        let bob = h.local("bob@example.com");
        let mut env = h.envelope(&["bob@example.com"]).await;

        let replies = h
            .coordinator
            .deliver(&mut env, b"Subject: hi\r\n\r\nhello\r\n".to_vec())
            .await
            .unwrap();

        assert_eq!(replies, vec![Reply::DELIVERY_OK]);
        assert_eq!(env.recipients()[0].delivery_status(), Some(Reply::DELIVERY_OK));
        let stored = h.store.mailbox(&bob).unwrap().messages();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].raw, b"Subject: hi\r\n\r\nhello\r\n");
        assert!(stored[0].flags.unread);
        assert!(h.incoming_is_empty());
    }

    #[tokio::test]
    async fn test_dedupe_same_mailbox_and_different_mailboxes() {
        let h = Harness::new(Config::default());
        let bob = h.local("bob@example.com");
        let carol = h.local("carol@example.com");

        let mut env = h.envelope(&["bob@example.com"]).await;
        let first = h.coordinator.deliver(&mut env, MESSAGE.to_vec()).await.unwrap();
        let mut env = h.envelope(&["bob@example.com"]).await;
        let second = h.coordinator.deliver(&mut env, MESSAGE.to_vec()).await.unwrap();

        assert_eq!(first, vec![Reply::DELIVERY_OK]);
        assert_eq!(second, vec![Reply::DELIVERY_OK]);
        assert_eq!(h.stored_count(&bob), 1);

        let mut env = h.envelope(&["carol@example.com"]).await;
        h.coordinator.deliver(&mut env, MESSAGE.to_vec()).await.unwrap();
        assert_eq!(h.stored_count(&carol), 1);
    }

    #[tokio::test]
    async fn test_dedupe_disabled_per_account() {
        let h = Harness::new(Config::default());
        let mut account = Account::new("dave@example.com", NODE);
        account.dedupe_enabled = false;
        let dave = h.add_account(account);

        for _ in 0..2 {
            let mut env = h.envelope(&["dave@example.com"]).await;
            h.coordinator.deliver(&mut env, MESSAGE.to_vec()).await.unwrap();
        }
        assert_eq!(h.stored_count(&dave), 2);
    }

    #[tokio::test]
    async fn test_partial_failure_isolation() {
        let h = Harness::new(Config::default());
        let a = h.local("a@example.com");
        let c = h.local("c@example.com");
        let mut env = h
            .envelope(&["a@example.com", "broken@example.com", "c@example.com"])
            .await;

        let replies = h.coordinator.deliver(&mut env, MESSAGE.to_vec()).await.unwrap();

        assert_eq!(
            replies,
            vec![Reply::DELIVERY_OK, Reply::TEMPORARY_FAILURE, Reply::DELIVERY_OK]
        );
        assert_eq!(h.stored_count(&a), 1);
        assert_eq!(h.stored_count(&c), 1);
    }

    #[tokio::test]
    async fn test_unknown_local_recipient_is_permanent_failure() {
        let h = Harness::new(Config::default());
        h.local("a@example.com");
        let mut env = h.envelope(&["a@example.com", "gone@example.com"]).await;
        let replies = h.coordinator.deliver(&mut env, MESSAGE.to_vec()).await.unwrap();
        assert_eq!(replies, vec![Reply::DELIVERY_OK, Reply::PERMANENT_FAILURE]);
    }

    #[tokio::test]
    async fn test_shared_delivery_deferred_in_maintenance() {
        let h = Harness::new(Config::default());
        let a = h.local("a@example.com");
        let b = h.local("b@example.com");
        h.store.mailbox(&b).unwrap().set_maintenance(true);

        let mut env = h.envelope(&["a@example.com", "b@example.com"]).await;
        let replies = h.coordinator.deliver(&mut env, MESSAGE.to_vec()).await.unwrap();

        assert_eq!(replies, vec![Reply::DELIVERY_OK, Reply::TEMPORARY_FAILURE]);
        assert_eq!(h.stored_count(&b), 0);
        assert_eq!(h.store.mailbox(&a).unwrap().shared_deliveries(), 0);

        // Alone, the same mailbox is delivered despite maintenance
        let mut env = h.envelope(&["b@example.com"]).await;
        let replies = h.coordinator.deliver(&mut env, MESSAGE.to_vec()).await.unwrap();
        assert_eq!(replies, vec![Reply::DELIVERY_OK]);
        assert_eq!(h.stored_count(&b), 1);
    }

    #[tokio::test]
    async fn test_discard_with_forwarding_fires_forward_callback_only() {
        let h = Harness::new(Config::default());
        let mut account = Account::new("fwd@example.com", NODE);
        account.local_delivery_disabled = true;
        account.forwarding_address = Some("elsewhere@example.net".to_string());
        let fwd = h.add_account(account);
        let callback = Arc::new(CountingCallback::default());
        h.coordinator.callbacks().register(callback.clone());

        let mut env = h.envelope(&["fwd@example.com"]).await;
        let replies = h.coordinator.deliver(&mut env, MESSAGE.to_vec()).await.unwrap();

        assert_eq!(replies, vec![Reply::DELIVERY_OK]);
        assert_eq!(h.stored_count(&fwd), 0);
        assert_eq!(*callback.forwarded.lock().unwrap(), vec!["fwd@example.com"]);
        assert!(callback.delivered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failing_callback_does_not_change_reply() {
        let h = Harness::new(Config::default());
        h.local("a@example.com");
        h.local("b@example.com");
        let callback = Arc::new(CountingCallback {
            fail: true,
            ..Default::default()
        });
        h.coordinator.callbacks().register(callback.clone());

        let mut env = h.envelope(&["a@example.com", "b@example.com"]).await;
        let replies = h.coordinator.deliver(&mut env, MESSAGE.to_vec()).await.unwrap();

        assert_eq!(replies, vec![Reply::DELIVERY_OK, Reply::DELIVERY_OK]);
        assert_eq!(
            *callback.delivered.lock().unwrap(),
            vec!["a@example.com", "b@example.com"]
        );
    }

    #[tokio::test]
    async fn test_panicking_callback_does_not_change_reply() {
        let h = Harness::new(Config::default());
        let a = h.local("a@example.com");
        let b = h.local("b@example.com");
        let callback = Arc::new(CountingCallback {
            panic: true,
            ..Default::default()
        });
        h.coordinator.callbacks().register(callback.clone());

        let mut env = h.envelope(&["a@example.com", "b@example.com"]).await;
        let replies = h.coordinator.deliver(&mut env, MESSAGE.to_vec()).await.unwrap();

        assert_eq!(replies, vec![Reply::DELIVERY_OK, Reply::DELIVERY_OK]);
        assert_eq!(callback.delivered.lock().unwrap().len(), 2);
        assert_eq!(h.stored_count(&a), 1);
        assert_eq!(h.stored_count(&b), 1);
    }

    #[tokio::test]
    async fn test_copy_of_sent_message_is_accepted_but_not_stored() {
        let h = Harness::new(Config::default());
        let bob = h.local("bob@example.com");
        let carol = h.local("carol@example.com");
        h.store.mailbox(&bob).unwrap().record_sent("<m1@example.com>");

        let mut env = h.envelope(&["bob@example.com", "carol@example.com"]).await;
        let replies = h.coordinator.deliver(&mut env, MESSAGE.to_vec()).await.unwrap();

        assert_eq!(replies, vec![Reply::DELIVERY_OK, Reply::DELIVERY_OK]);
        assert_eq!(h.stored_count(&bob), 0);
        assert_eq!(h.stored_count(&carol), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_duplicates_store_one_copy() {
        let h = Harness::new(Config::default());
        let bob = h.local("bob@example.com");

        let mut first = h.envelope(&["bob@example.com"]).await;
        let mut second = h.envelope(&["bob@example.com"]).await;
        let mut third = h.envelope(&["bob@example.com"]).await;
        let (r1, r2, r3) = tokio::join!(
            h.coordinator.deliver(&mut first, MESSAGE.to_vec()),
            h.coordinator.deliver(&mut second, MESSAGE.to_vec()),
            h.coordinator.deliver(&mut third, MESSAGE.to_vec()),
        );

        for replies in [r1, r2, r3] {
            assert_eq!(replies.unwrap(), vec![Reply::DELIVERY_OK]);
        }
        assert_eq!(h.stored_count(&bob), 1);
        assert!(h.incoming_is_empty());
    }

    #[tokio::test]
    async fn test_quota_mapping() {
        for (permanent, expected) in [
            (false, Reply::TEMPORARY_FAILURE_OVER_QUOTA),
            (true, Reply::PERMANENT_FAILURE_OVER_QUOTA),
        ] {
            let mut config = Config::default();
            config.lmtp.permanent_failure_when_over_quota = permanent;
            let h = Harness::new(config);
            let mut account = Account::new("small@example.com", NODE);
            account.quota_bytes = Some(10);
            h.add_account(account);

            let mut env = h.envelope(&["small@example.com"]).await;
            let replies = h.coordinator.deliver(&mut env, MESSAGE.to_vec()).await.unwrap();
            assert_eq!(replies, vec![expected]);

            // The failed attempt must not be remembered as delivered
            assert!(h.coordinator.dedupe().is_empty());
        }
    }

    #[tokio::test]
    async fn test_skip_filters_creates_folder_with_flags_and_tags() {
        let h = Harness::new(Config::default());
        let bob = h.local("bob@example.com");
        let mut env = h.envelope(&["bob@example.com"]).await;
        env.recipients_mut()[0].set_filter_override(
            Some("Archive/2024".to_string()),
            Some("f".to_string()),
            vec!["imported".to_string()],
        );

        let replies = h.coordinator.deliver(&mut env, MESSAGE.to_vec()).await.unwrap();
        assert_eq!(replies, vec![Reply::DELIVERY_OK]);

        let mailbox = h.store.mailbox(&bob).unwrap();
        let folder = mailbox.folder_by_path("Archive/2024").await.unwrap();
        let stored = mailbox.messages();
        assert_eq!(stored[0].folder_id, folder.id);
        assert!(stored[0].flags.flagged);
        assert!(!stored[0].flags.unread);
        assert_eq!(stored[0].tags, vec!["imported"]);
    }

    #[tokio::test]
    async fn test_remote_groups_fail_independently() {
        let h = Harness::new(Config::default());
        h.local("local@example.com");
        h.add_account(Account::new("r1@example.com", "mbs2"));
        h.add_account(Account::new("r2@example.com", "down"));
        h.add_account(Account::new("r3@example.com", "mbs2"));

        let mut env = h
            .envelope(&[
                "r1@example.com",
                "local@example.com",
                "r2@example.com",
                "r3@example.com",
            ])
            .await;
        let replies = h.coordinator.deliver(&mut env, MESSAGE.to_vec()).await.unwrap();

        assert_eq!(
            replies,
            vec![
                Reply::DELIVERY_OK,
                Reply::DELIVERY_OK,
                Reply::TEMPORARY_FAILURE,
                Reply::DELIVERY_OK,
            ]
        );
        let calls = h.remote.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[0],
            (
                "mbs2".to_string(),
                vec!["r1@example.com".to_string(), "r3@example.com".to_string()]
            )
        );
    }

    #[tokio::test]
    async fn test_line_too_long_when_validating() {
        let mut config = Config::default();
        config.lmtp.validate_messages = true;
        config.lmtp.max_line_length = 20;
        let h = Harness::new(config);
        let bob = h.local("bob@example.com");

        let mut env = h.envelope(&["bob@example.com"]).await;
        let body = format!("Subject: x\r\n\r\n{}\r\n", "y".repeat(50));
        let replies = h.coordinator.deliver(&mut env, body.into_bytes()).await.unwrap();

        assert_eq!(replies, vec![Reply::LINE_TOO_LONG]);
        assert_eq!(h.stored_count(&bob), 0);
        assert!(h.incoming_is_empty());
    }

    #[tokio::test]
    async fn test_lock_timeout_is_temporary_failure() {
        let mut config = Config::default();
        config.lmtp.mailbox_lock_timeout_secs = 0;
        let h = Harness::new(config);
        let bob = h.local("bob@example.com");
        let mailbox = h.store.mailbox(&bob).unwrap();

        let _held = h
            .coordinator
            .locks
            .lock(mailbox.id(), Duration::from_secs(1))
            .await
            .unwrap();
        let mut env = h.envelope(&["bob@example.com"]).await;
        let replies = h.coordinator.deliver(&mut env, MESSAGE.to_vec()).await.unwrap();
        assert_eq!(replies, vec![Reply::TEMPORARY_FAILURE]);
        assert_eq!(h.stored_count(&bob), 0);
    }

    #[test]
    fn test_has_long_line() {
        assert!(!has_long_line(b"abc\r\ndef\r\n", 3));
        assert!(has_long_line(b"abc\r\ndefg\r\n", 3));
    }
}
