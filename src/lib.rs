//! Offline-first chat sync engine: a SQLite cache kept in step with a
//! remote document store through live snapshots, plus a durable outbox for
//! messages written while offline.

pub mod app;
pub mod config;
pub mod core;
pub mod remote;
pub mod sync;

pub use app::{ChatSession, SendOutcome};
pub use config::Config;
pub use crate::core::store::CacheHandle;
