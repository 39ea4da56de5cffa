//! Durable mapping of all engine entities.
//!
//! SQLite behind a single mutex-guarded connection per store handle. Handles
//! are per-session: clone the `ForensicStore` (cheap Arc clone) rather than
//! sharing row objects across sessions.

pub mod audit;
pub mod db;

pub use audit::AuditLogger;
pub use db::{ForensicStore, TransactionFilter};
