//! Message delivery
//!
//! The coordinator and its collaborators: duplicate suppression, mailbox
//! locking, post-delivery callbacks, filtering and hand-off to other nodes.

pub mod callbacks;
pub mod coordinator;
pub mod dedupe;
pub mod filter;
pub mod locks;
pub mod message;
pub mod remote;

pub use callbacks::{CallbackError, CallbackRegistry, DeliveryCallback, DeliveryEvent, WebhookCallback};
pub use coordinator::{DeliveryAction, DeliveryCoordinator, DeliveryError};
pub use dedupe::{DedupeCache, LruMap, TimeoutMap};
pub use filter::{EnvelopeInfo, FilterEngine, InboxFilter};
pub use locks::MailboxLocks;
pub use message::parse_message;
pub use remote::{LmtpClient, RemoteDelivery, RemoteError};
