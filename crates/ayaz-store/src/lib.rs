//! Persistence layer for ayaz
//!
//! Keeps the task outputs of the most recent crew kickoff in SQLite so a run
//! can be replayed from any task and inspected afterwards.

pub mod kickoff;

pub use kickoff::{KickoffStore, StoredTaskOutput};
