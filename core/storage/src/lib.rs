//! Durable key-value storage for recsync.
//!
//! This module provides a trait-based interface for the local persistent
//! store that holds client state across process restarts (most importantly
//! the offline mutation queue), plus a registry for choosing a store from
//! configuration.
//!
//! # Design Principles
//! - Durability: a completed `put` is recoverable after an abrupt restart
//! - Async operations: all I/O operations are async
//! - Opaque values: stores never interpret what they hold

pub mod store;
pub mod registry;
pub mod memory;
pub mod local;

pub use store::{KeyValueStore, StoreLock, load_json, save_json, validate_key};
pub use registry::{StoreRegistry, StoreFactory, create_default_registry};
pub use memory::MemoryStore;
pub use local::LocalStore;
