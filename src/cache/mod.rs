//! Request cache for offline support.
//!
//! This module intercepts resource requests and answers them under one of
//! three policies:
//! - Cache-first for static assets
//! - Network-first for API data and document navigations
//! - Stale-while-revalidate for everything else on the application origin
//!
//! Cached responses live in named collections grouped into versioned
//! generations, managed by [`Lifecycle`].

mod layer;
mod lifecycle;
mod router;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use lifecycle::{Generation, Lifecycle};
pub use router::{RouteRules, Router};
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CacheResult, Fetcher, Request, Response};
