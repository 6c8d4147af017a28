//! Locally owned notes and their reconciliation status.
//!
//! Notes are the unit of user data. Every write marks a note `Pending`; only
//! a reconciliation acknowledgment for the exact revision that was submitted
//! moves it to `Synced`.

mod store;
mod types;

pub use store::NoteStore;
pub use types::{Note, NoteId, NotePayload, SyncState};
