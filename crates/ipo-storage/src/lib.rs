//! Outbound HTTP, raw page archive and the IPO/GMP record store.

pub mod archive;
pub mod fetch;
pub mod store;

pub use archive::{ArchivedPage, PageArchive};
pub use fetch::{
    BackoffPolicy, FetchError, FetchRequest, FetchedResponse, Fetcher, HttpClientConfig,
    HttpFetcher, RateLimiter,
};
pub use store::{IpoStore, MemoryIpoStore, PgIpoStore};

pub const CRATE_NAME: &str = "ipo-storage";
