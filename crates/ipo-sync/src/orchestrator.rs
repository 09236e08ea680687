//! Drives one source at a time through extraction and the upsert writer.

use ipo_adapters::{ExtractError, GmpSource, IpoSource};
use ipo_core::{BatchOutcome, CancelSignal, GmpSnapshot, Ipo};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn, Instrument};

use crate::reconcile::ReconciliationWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncKind {
    Ipo,
    Gmp,
}

impl SyncKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ipo => "ipo",
            Self::Gmp => "gmp",
        }
    }
}

/// Extraction outcome for one source plus what actually reached the store.
#[derive(Debug, Clone)]
pub struct SourceRun<T> {
    pub source_id: String,
    pub outcome: BatchOutcome<T>,
    pub persisted: Vec<T>,
    pub write_errors: Vec<String>,
}

/// Summary row of a [`SourceRun`], as written into run reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceReport {
    pub source_id: String,
    pub kind: SyncKind,
    pub total: usize,
    pub attempted: usize,
    pub failed: usize,
    pub records: usize,
    pub partials: usize,
    pub persisted: usize,
    pub write_failures: usize,
    pub completeness: f64,
    pub error: Option<String>,
    /// The listing step failed, so no item was attempted.
    pub hard_failure: bool,
}

impl<T> SourceRun<T> {
    pub fn report(&self, kind: SyncKind) -> SourceReport {
        SourceReport {
            source_id: self.source_id.clone(),
            kind,
            total: self.outcome.total,
            attempted: self.outcome.attempted,
            failed: self.outcome.failed,
            records: self.outcome.records.len(),
            partials: self.outcome.partials.len(),
            persisted: self.persisted.len(),
            write_failures: self.write_errors.len(),
            completeness: self.outcome.completeness(),
            error: self.outcome.error.as_ref().map(ToString::to_string),
            hard_failure: false,
        }
    }
}

impl SourceReport {
    pub fn hard_failure(source_id: &str, kind: SyncKind, error: impl ToString) -> Self {
        Self {
            source_id: source_id.to_string(),
            kind,
            total: 0,
            attempted: 0,
            failed: 0,
            records: 0,
            partials: 0,
            persisted: 0,
            write_failures: 0,
            completeness: 0.0,
            error: Some(error.to_string()),
            hard_failure: true,
        }
    }
}

/// Lists the source, extracts every detail page and writes the good records.
/// Partial records from failed items are kept in the outcome but never stored.
pub async fn sync_ipo_source(
    source: &dyn IpoSource,
    writer: &ReconciliationWriter,
    cancel: &CancelSignal,
) -> Result<SourceRun<Ipo>, ExtractError> {
    let span = info_span!("ipo_source", source = source.source_id());
    async move {
        let listings = source.list_ipos().await?;
        info!(listings = listings.len(), "listing fetched");

        let outcome = source.extract_ipo_batch(&listings, cancel).await;
        let mut persisted = Vec::with_capacity(outcome.records.len());
        let mut write_errors = Vec::new();
        for ipo in &outcome.records {
            match writer.upsert_ipo(ipo.clone()).await {
                Ok(stored) => persisted.push(stored),
                Err(err) => {
                    warn!(name = %ipo.name, error = %format!("{err:#}"), "ipo write failed");
                    write_errors.push(format!("{err:#}"));
                }
            }
        }
        log_outcome(&outcome, persisted.len());
        Ok(SourceRun {
            source_id: source.source_id().to_string(),
            outcome,
            persisted,
            write_errors,
        })
    }
    .instrument(span)
    .await
}

pub async fn sync_gmp_source(
    source: &dyn GmpSource,
    writer: &ReconciliationWriter,
    cancel: &CancelSignal,
) -> SourceRun<GmpSnapshot> {
    let span = info_span!("gmp_source", source = source.source_id());
    async move {
        let outcome = source.extract_gmp_batch(cancel).await;
        let mut persisted = Vec::with_capacity(outcome.records.len());
        let mut write_errors = Vec::new();
        for snapshot in &outcome.records {
            match writer.upsert_gmp(snapshot.clone()).await {
                Ok(stored) => persisted.push(stored),
                Err(err) => {
                    warn!(ipo_name = %snapshot.ipo_name, error = %format!("{err:#}"), "gmp write failed");
                    write_errors.push(format!("{err:#}"));
                }
            }
        }
        log_outcome(&outcome, persisted.len());
        SourceRun {
            source_id: source.source_id().to_string(),
            outcome,
            persisted,
            write_errors,
        }
    }
    .instrument(span)
    .await
}

fn log_outcome<T>(outcome: &BatchOutcome<T>, persisted: usize) {
    match &outcome.error {
        None => info!(records = outcome.records.len(), persisted, "batch complete"),
        Some(err) => warn!(
            records = outcome.records.len(),
            persisted,
            completeness = outcome.completeness(),
            error = %err,
            "batch incomplete"
        ),
    }
}
