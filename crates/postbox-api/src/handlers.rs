//! API request handlers

pub mod deliver;
pub mod health;
