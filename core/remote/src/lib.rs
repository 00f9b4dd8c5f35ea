//! Remote record API abstraction for recsync.
//!
//! The desktop server exposes one endpoint family per resource type
//! (candidates, employers, jobs, passports, visas). This module provides
//! the trait the sync engine talks to, an HTTP implementation, and an
//! in-memory implementation for tests and local development.
//!
//! # Failure classes
//! Callers must be able to tell "the request never got an answer" from
//! "the server answered no". Every implementation maps the first to
//! `Error::Network`/`Error::Timeout` and the second to `Error::Rejected`.

pub mod api;
pub mod http;
pub mod memory;

pub use api::{Ack, Envelope, RecordApi};
pub use http::HttpRecordApi;
pub use memory::{Fault, MemoryRecordApi, RecordedCall};
