//! Incoming message filtering

use async_trait::async_trait;
use postbox_common::types::MessageFlags;
use postbox_common::Result;
use postbox_storage::models::{DeliveryContext, DeliveryOptions, ParsedMessage, StoredMessage};
use postbox_storage::Mailbox;
use tracing::debug;

/// Envelope facts a filter may match on
#[derive(Debug, Clone, Default)]
pub struct EnvelopeInfo {
    pub sender: String,
    pub recipient: String,
}

/// Rule evaluation for incoming mail
#[async_trait]
pub trait FilterEngine: Send + Sync {
    /// Deposit `message` according to the mailbox's rules.
    ///
    /// Returns the messages added; an empty list means the rules discarded
    /// it. A refusal is reported as [`postbox_common::Error::MessageRefused`].
    async fn apply_rules(
        &self,
        mailbox: &dyn Mailbox,
        message: &ParsedMessage,
        envelope: &EnvelopeInfo,
        context: &DeliveryContext,
        default_folder: &str,
    ) -> Result<Vec<StoredMessage>>;
}

/// Filter without rules: everything lands unread in the default folder
#[derive(Debug, Default)]
pub struct InboxFilter;

#[async_trait]
impl FilterEngine for InboxFilter {
    async fn apply_rules(
        &self,
        mailbox: &dyn Mailbox,
        message: &ParsedMessage,
        envelope: &EnvelopeInfo,
        context: &DeliveryContext,
        default_folder: &str,
    ) -> Result<Vec<StoredMessage>> {
        let folder = mailbox.folder_by_path(default_folder).await?;
        let options = DeliveryOptions {
            folder_id: Some(folder.id),
            flags: MessageFlags::default(),
            tags: Vec::new(),
            recipient: envelope.recipient.clone(),
        };
        let stored = mailbox.add_message(message, &options, context).await?;
        debug!(
            mailbox = %mailbox.id(),
            message = %stored.id,
            folder = %folder.path,
            "Filed message"
        );
        Ok(vec![stored])
    }
}
