//! bisspro-core library interface
//!
//! BISS key store reconciliation: record codec, identity matcher, merge
//! engine, backups, decoder restart policy and the async key manager that
//! ties them together for a front end.

pub mod backup;
pub mod codec;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod manager;
pub mod matcher;
pub mod models;
pub mod reconcile;
pub mod restart;
pub mod store;

pub use crate::config::BissConfig;
pub use crate::error::{Error, Result};
pub use crate::manager::KeyManager;
pub use crate::store::KeyStore;
