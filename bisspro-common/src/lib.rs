//! # BissPro Common Library
//!
//! Shared code for the BissPro key manager crates:
//! - Error type and result alias
//! - Configuration file resolution and TOML persistence
//! - Atomic file writes
//! - Tracing initialisation
//! - Timestamp helpers

pub mod config;
pub mod error;
pub mod fs;
pub mod logging;
pub mod time;

pub use error::{Error, Result};
