//! reqwest transports for resource fetching and note submission.

mod fetcher;
mod remote;

pub use fetcher::HttpFetcher;
pub use remote::HttpRemote;
