//! CRM Sync Common Types and Utilities
//!
//! Shared types, configuration, and error handling for the real-time entity store.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod types;

pub use config::SyncConfig;
pub use error::{Error, Result};
