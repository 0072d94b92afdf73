//! Event journal: the persistence substrate for the workflow engine's
//! event-sourced aggregates.
//!
//! `journal` defines the store-agnostic contract; `memory` and `postgres`
//! ship reference implementations. Nothing here knows the shape of a flow or
//! a workflow event — those live in `glyph_workflow_engine`.

pub mod journal;
pub mod memory;
pub mod postgres;

pub use journal::{Journal, JournalError, NewEvent, Snapshot, StoredEvent};
pub use memory::InMemoryJournal;
pub use postgres::{AutoSnapshotJournal, PgJournal};
