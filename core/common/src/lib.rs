//! Common utilities and types shared across recsync modules.
//!
//! This module provides the error type and the small domain types
//! (mutation ids, endpoints, record references) used by the queue,
//! the remote API adapters and the sync engine.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{Endpoint, LocalId, MutationMethod, RecordRef};
