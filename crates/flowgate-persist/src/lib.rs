//! # flowgate persistence
//!
//! SQLite-backed `QueueBackend` so accepted trigger jobs survive restarts.

pub mod sqlite;

pub use sqlite::{SqliteConfig, SqliteQueue};
