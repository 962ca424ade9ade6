//! Postbox Core - LMTP server and mail delivery
//!
//! This crate provides the LMTP protocol engine with its blocking and
//! event-driven listeners, and the delivery coordinator that deposits
//! accepted messages into local mailboxes or hands them to other nodes.

pub mod delivery;
pub mod lmtp;
pub mod metrics;

pub use delivery::{
    CallbackRegistry, DeliveryCallback, DeliveryCoordinator, DeliveryError, WebhookCallback,
};
pub use lmtp::{Address, BlockingLmtpServer, Envelope, LmtpServer, Reply, Session};
pub use metrics::Metrics;
