//! Collaborative document history server: durable per-project revision
//! logs, optimistic commits, squash/archive, sessions and a maintenance gate.

pub mod access;
pub mod admission;
pub mod api;
pub mod commit;
pub mod compaction;
pub mod config;
pub mod error;
pub mod history;
pub mod session;
