//! Extraction of IPO detail pages, listing pages and GMP tables.

use async_trait::async_trait;
use ipo_core::{run_sequential, BatchOutcome, CancelSignal, GmpSnapshot, Ipo, ItemOutcome, ListingMetadata};
use ipo_storage::FetchError;
use thiserror::Error;
use tracing::warn;

pub mod cleanup;
pub mod embedded;
pub mod gmp;
pub mod ipo_detail;
pub mod listing;
pub mod strategy;

pub use cleanup::{clean_free_text, ABOUT_MAX_LEN, DESCRIPTION_MAX_LEN};
pub use embedded::{extract_embedded_json, Scalar};
pub use gmp::{parse_gmp_page, GmpExtractor};
pub use ipo_detail::{IpoDetailExtractor, IpoPageParser};
pub use listing::parse_listing_page;
pub use strategy::{LabeledRowStrategy, Matched, SelectorStrategy, Strategy, StrategyChain, TextPatternStrategy};

pub const CRATE_NAME: &str = "ipo-adapters";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unparseable page: {0}")]
    Parse(String),
    #[error("no embedded payload found")]
    MissingPayload,
    #[error("embedded json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid selector {selector:?}: {reason}")]
    InvalidSelector { selector: String, reason: String },
}

/// A hard extraction failure that still carries the best record we could build.
#[derive(Debug, Error)]
#[error("extraction failed for {}: {error}", .partial.name)]
pub struct ExtractFailure {
    pub partial: Box<Ipo>,
    #[source]
    pub error: ExtractError,
}

impl ExtractFailure {
    pub fn new(partial: Ipo, error: ExtractError) -> Self {
        Self {
            partial: Box::new(partial),
            error,
        }
    }
}

/// Which extraction path produced a record.
#[derive(Debug, Clone, PartialEq)]
pub enum Parsed<T> {
    Json(T),
    Html(T),
    /// Nothing on the page was usable; only caller-supplied context.
    Fallback(T),
}

impl<T> Parsed<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Json(v) | Self::Html(v) | Self::Fallback(v) => v,
        }
    }

    pub fn path(&self) -> &'static str {
        match self {
            Self::Json(_) => "json",
            Self::Html(_) => "html",
            Self::Fallback(_) => "fallback",
        }
    }
}

/// Rejects bodies that cannot be a document: invalid UTF-8, blank, or
/// neither markup nor JSON.
pub fn decode_page(body: &[u8]) -> Result<&str, ExtractError> {
    let text = std::str::from_utf8(body).map_err(|e| ExtractError::Parse(format!("invalid utf-8: {e}")))?;
    let trimmed = text.trim_start_matches('\u{feff}').trim();
    if trimmed.is_empty() {
        return Err(ExtractError::Parse("empty document".into()));
    }
    if !trimmed.contains('<') && !trimmed.starts_with('{') && !trimmed.starts_with('[') {
        return Err(ExtractError::Parse("no markup".into()));
    }
    Ok(text)
}

#[async_trait]
pub trait IpoSource: Send + Sync {
    fn source_id(&self) -> &str;

    /// Reads the listing pages. Failing here stops the whole sync.
    async fn list_ipos(&self) -> Result<Vec<ListingMetadata>, ExtractError>;

    /// Fails only when the page cannot be fetched or is not a document at all
    /// (see [`decode_page`]). Markup with nothing recognisable still yields
    /// `Ok`: the record carries the listing context and every other field is
    /// `None`, which is what a half-published IPO page looks like.
    async fn extract_ipo(&self, listing: &ListingMetadata) -> Result<Ipo, ExtractFailure>;

    async fn extract_ipo_batch(&self, listings: &[ListingMetadata], cancel: &CancelSignal) -> BatchOutcome<Ipo> {
        run_sequential(listings, cancel, |listing| async move {
            match self.extract_ipo(listing).await {
                Ok(ipo) => ItemOutcome::one(ipo),
                Err(failure) => {
                    warn!(source = self.source_id(), url = %listing.detail_url, error = %failure.error, "ipo extraction failed");
                    ItemOutcome::Failed {
                        error: failure.to_string(),
                        partial: Some(*failure.partial),
                    }
                }
            }
        })
        .await
    }
}

#[async_trait]
pub trait GmpSource: Send + Sync {
    fn source_id(&self) -> &str;

    fn page_urls(&self) -> Vec<String>;

    async fn extract_gmp_page(&self, url: &str) -> Result<Vec<GmpSnapshot>, ExtractError>;

    /// Every configured page, one at a time. A failing page does not stop the rest.
    async fn extract_gmp_batch(&self, cancel: &CancelSignal) -> BatchOutcome<GmpSnapshot> {
        let urls = self.page_urls();
        run_sequential(&urls, cancel, |url| async move {
            match self.extract_gmp_page(url).await {
                Ok(rows) => ItemOutcome::Records(rows),
                Err(err) => {
                    warn!(source = self.source_id(), %url, error = %err, "gmp page failed");
                    ItemOutcome::failed(format!("{url}: {err}"))
                }
            }
        })
        .await
    }
}
