//! Postbox Common - Shared types and utilities
//!
//! This crate provides configuration, the error taxonomy and identifiers
//! shared across all Postbox components.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::{halt, LiveConfig};
