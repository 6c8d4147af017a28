//! Change reconciliation against the remote note store.
//!
//! Pending notes are discovered through the store's sync-state index and
//! submitted one request per note. Retries happen by re-triggering a pass
//! (timer, connectivity restored, manual action or a worker message), never
//! by a backoff schedule, so every step of a pass is safe to repeat.

mod connectivity;
mod reconciler;

pub use connectivity::Connectivity;
pub use reconciler::{Reconciler, RemoteEndpoint, SyncOutcome, SyncReport};
