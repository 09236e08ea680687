//! Normalizes records right before they are written.

use std::sync::Arc;

use anyhow::{Context, Result};
use ipo_core::normalize::generate_company_code;
use ipo_core::{Clock, GmpSnapshot, Ipo};
use ipo_storage::IpoStore;
use tracing::debug;

#[derive(Clone)]
pub struct ReconciliationWriter {
    store: Arc<dyn IpoStore>,
    clock: Arc<dyn Clock>,
}

impl ReconciliationWriter {
    pub fn new(store: Arc<dyn IpoStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &Arc<dyn IpoStore> {
        &self.store
    }

    /// Keyed on `stock_id`, or `company_code` when there is none. The stored
    /// row keeps its `id` and `created_at`; everything else is replaced.
    pub async fn upsert_ipo(&self, mut ipo: Ipo) -> Result<Ipo> {
        let now = self.clock.now();
        ipo.ensure_derived_keys();
        ipo.refresh_status(now);
        ipo.updated_at = now;
        let key = ipo.stock_id.clone().unwrap_or_else(|| ipo.company_code.clone());
        let stored = self
            .store
            .upsert_ipo(&ipo)
            .await
            .with_context(|| format!("upserting ipo {key}"))?;
        debug!(%key, status = %stored.status, "ipo upserted");
        Ok(stored)
    }

    /// Keyed on `ipo_name`.
    pub async fn upsert_gmp(&self, mut snapshot: GmpSnapshot) -> Result<GmpSnapshot> {
        if snapshot.company_code.trim().is_empty() {
            snapshot.company_code = generate_company_code(&snapshot.ipo_name);
        }
        snapshot.recompute_estimated_listing();
        snapshot.recompute_confidence();
        snapshot.last_updated = self.clock.now();
        let stored = self
            .store
            .upsert_gmp(&snapshot)
            .await
            .with_context(|| format!("upserting gmp {}", snapshot.ipo_name))?;
        debug!(ipo_name = %stored.ipo_name, score = stored.confidence.score, "gmp upserted");
        Ok(stored)
    }
}
