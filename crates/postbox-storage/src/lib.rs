//! Postbox Storage - Collaborators of the delivery service
//!
//! Blob staging, account lookup and mailbox persistence, each behind a
//! trait with a reference implementation.

pub mod directory;
pub mod file;
pub mod mailstore;
pub mod models;

pub use directory::{AccountDirectory, DbAccountDirectory, MemoryDirectory};
pub use file::{create_blob_store, BlobBuilder, BlobStore, LocalBlobStore};
pub use mailstore::{
    create_mailbox_store, Mailbox, MailboxStore, MemoryMailbox, MemoryMailboxStore,
};
pub use models::*;
