//! Scheduled IPO and GMP syncs: extraction, matching, upserts and run reports.

use std::sync::Arc;

use anyhow::{Context, Result};
use ipo_adapters::{GmpExtractor, GmpSource, IpoDetailExtractor, IpoSource};
use ipo_core::{Clock, SystemClock};
use ipo_storage::{BackoffPolicy, Fetcher, HttpClientConfig, HttpFetcher, IpoStore, PageArchive};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub mod config;
pub mod matcher;
pub mod orchestrator;
pub mod reconcile;
pub mod report;

pub use config::{GmpSourceConfig, IpoSourceConfig, SourceRegistry, SyncConfig};
pub use ipo_core::CancelSignal;
pub use matcher::{best_match, match_gmp_to_ipo, match_gmp_to_ipo_inner, match_rule, GmpMatch, MatchRule, MatchedIpo};
pub use orchestrator::{sync_gmp_source, sync_ipo_source, SourceReport, SourceRun, SyncKind};
pub use reconcile::ReconciliationWriter;
pub use report::{list_recent_reports, RunReport};

pub const CRATE_NAME: &str = "ipo-sync";

/// Which syncs a single invocation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTarget {
    Ipo,
    Gmp,
    All,
}

impl SyncTarget {
    pub fn kinds(self) -> &'static [SyncKind] {
        match self {
            Self::Ipo => &[SyncKind::Ipo],
            Self::Gmp => &[SyncKind::Gmp],
            Self::All => &[SyncKind::Ipo, SyncKind::Gmp],
        }
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    writer: ReconciliationWriter,
    fetcher: Arc<dyn Fetcher>,
    clock: Arc<dyn Clock>,
    archive: Option<PageArchive>,
}

impl SyncPipeline {
    /// Live pipeline: rate-limited HTTP, wall clock, pages archived under
    /// `ARTIFACTS_DIR/pages`.
    pub fn new(config: SyncConfig, store: Arc<dyn IpoStore>) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout(),
            user_agent: Some(config.user_agent.clone()),
            min_request_interval: config.min_request_interval(),
            backoff: BackoffPolicy {
                max_retries: config.max_retries,
                ..Default::default()
            },
        })?;
        let archive = PageArchive::new(config.artifacts_dir.join("pages"));
        Ok(Self::with_parts(config, store, Arc::new(http), Arc::new(SystemClock)).with_archive(archive))
    }

    pub fn with_parts(
        config: SyncConfig,
        store: Arc<dyn IpoStore>,
        fetcher: Arc<dyn Fetcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            writer: ReconciliationWriter::new(store, Arc::clone(&clock)),
            config,
            fetcher,
            clock,
            archive: None,
        }
    }

    pub fn with_archive(mut self, archive: PageArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn writer(&self) -> &ReconciliationWriter {
        &self.writer
    }

    /// One signal per run; the deadline, when configured, starts now.
    pub fn cancel_signal(&self) -> CancelSignal {
        match self.config.batch_deadline() {
            Some(deadline) => CancelSignal::with_timeout(deadline),
            None => CancelSignal::new(),
        }
    }

    pub fn ipo_sources(&self, registry: &SourceRegistry) -> Result<Vec<Box<dyn IpoSource>>> {
        registry
            .enabled_ipo_sources()
            .map(|source| {
                let extractor = IpoDetailExtractor::new(
                    source.source_id.clone(),
                    source.base_url.clone(),
                    source.listing_urls.clone(),
                    Arc::clone(&self.fetcher),
                    Arc::clone(&self.clock),
                )
                .with_context(|| format!("building extractor for {}", source.source_id))?;
                let extractor = match &self.archive {
                    Some(archive) => extractor.with_archive(archive.clone()),
                    None => extractor,
                };
                Ok(Box::new(extractor) as Box<dyn IpoSource>)
            })
            .collect()
    }

    pub fn gmp_sources(&self, registry: &SourceRegistry) -> Vec<Box<dyn GmpSource>> {
        registry
            .enabled_gmp_sources()
            .map(|source| {
                let extractor = GmpExtractor::new(
                    source.source_id.clone(),
                    source.urls.clone(),
                    Arc::clone(&self.fetcher),
                    Arc::clone(&self.clock),
                );
                let extractor = match &self.archive {
                    Some(archive) => extractor.with_archive(archive.clone()),
                    None => extractor,
                };
                Box::new(extractor) as Box<dyn GmpSource>
            })
            .collect()
    }

    async fn load_source_registry(&self) -> Result<SourceRegistry> {
        SourceRegistry::load(&self.config.sources_path()).await
    }

    pub async fn run_ipo_sync(&self) -> Result<RunReport> {
        let registry = self.load_source_registry().await?;
        let sources = self.ipo_sources(&registry)?;
        self.sync_ipo_sources(&sources, &self.cancel_signal()).await
    }

    pub async fn run_gmp_sync(&self) -> Result<RunReport> {
        let registry = self.load_source_registry().await?;
        let sources = self.gmp_sources(&registry);
        self.sync_gmp_sources(&sources, &self.cancel_signal()).await
    }

    /// A source whose listing cannot be read is recorded as a hard failure;
    /// the remaining sources still run.
    pub async fn sync_ipo_sources(&self, sources: &[Box<dyn IpoSource>], cancel: &CancelSignal) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let started_at = self.clock.now();
        let mut reports = Vec::with_capacity(sources.len());
        for source in sources {
            match sync_ipo_source(source.as_ref(), &self.writer, cancel).await {
                Ok(run) => reports.push(run.report(SyncKind::Ipo)),
                Err(err) => {
                    warn!(source = source.source_id(), error = %err, "ipo listing failed");
                    reports.push(SourceReport::hard_failure(source.source_id(), SyncKind::Ipo, err));
                }
            }
        }
        let report = RunReport::from_sources(run_id, SyncKind::Ipo, started_at, self.clock.now(), reports);
        self.finish_run(report).await
    }

    pub async fn sync_gmp_sources(&self, sources: &[Box<dyn GmpSource>], cancel: &CancelSignal) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let started_at = self.clock.now();
        let mut reports = Vec::with_capacity(sources.len());
        let mut persisted = Vec::new();
        for source in sources {
            let run = sync_gmp_source(source.as_ref(), &self.writer, cancel).await;
            reports.push(run.report(SyncKind::Gmp));
            persisted.extend(run.persisted);
        }
        let mut report = RunReport::from_sources(run_id, SyncKind::Gmp, started_at, self.clock.now(), reports);
        let manifest = report::export_gmp_snapshot(&self.config.reports_dir(), run_id, &persisted).await?;
        report.parquet_manifest = Some(manifest.display().to_string());
        self.finish_run(report).await
    }

    async fn finish_run(&self, report: RunReport) -> Result<RunReport> {
        let path = report::write_run_report(&self.config.reports_dir(), &report).await?;
        info!(
            run_id = %report.run_id,
            kind = report.kind.as_str(),
            total = report.total,
            failed = report.failed,
            persisted = report.persisted,
            completeness = report.completeness,
            report = %path.display(),
            "sync run finished"
        );
        Ok(report)
    }

    pub async fn run_once(&self, target: SyncTarget) -> Result<Vec<RunReport>> {
        let mut reports = Vec::new();
        for kind in target.kinds() {
            let report = match kind {
                SyncKind::Ipo => self.run_ipo_sync().await?,
                SyncKind::Gmp => self.run_gmp_sync().await?,
            };
            reports.push(report);
        }
        Ok(reports)
    }

    /// Hourly IPO and eight-hourly GMP jobs by default. `None` when the
    /// scheduler is disabled.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for (kind, cron) in [
            (SyncKind::Ipo, &self.config.ipo_sync_cron),
            (SyncKind::Gmp, &self.config.gmp_sync_cron),
        ] {
            let pipeline = Arc::clone(self);
            let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
                let pipeline = Arc::clone(&pipeline);
                Box::pin(async move {
                    let result = match kind {
                        SyncKind::Ipo => pipeline.run_ipo_sync().await,
                        SyncKind::Gmp => pipeline.run_gmp_sync().await,
                    };
                    if let Err(err) = result {
                        error!(kind = kind.as_str(), error = %format!("{err:#}"), "scheduled sync failed");
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
            info!(kind = kind.as_str(), %cron, "scheduled sync job");
        }
        Ok(Some(sched))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::Path;

    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use ipo_core::{FixedClock, IpoStatus};
    use ipo_storage::{FetchError, FetchRequest, FetchedResponse, MemoryIpoStore};

    struct FakeFetcher {
        pages: HashMap<String, Vec<u8>>,
    }

    #[async_trait]
    impl Fetcher for FakeFetcher {
        async fn fetch(&self, request: &FetchRequest) -> Result<FetchedResponse, FetchError> {
            match self.pages.get(&request.url) {
                Some(body) => Ok(FetchedResponse {
                    status: 200,
                    final_url: request.url.clone(),
                    body: body.clone(),
                }),
                None => Err(FetchError::HttpStatus {
                    status: 503,
                    url: request.url.clone(),
                    attempts: 4,
                }),
            }
        }
    }

    fn fixture(path: &str) -> Vec<u8> {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        std::fs::read(root.join("fixtures").join(path)).unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 12, 9, 4, 30, 0).single().unwrap()
    }

    const SOURCES: &str = r#"
ipo_sources:
  - source_id: ipo-central
    enabled: true
    base_url: https://ipo.example.test
    listing_urls: [https://ipo.example.test/ipo-list]
  - source_id: offline
    enabled: true
    base_url: https://offline.test
    listing_urls: [https://offline.test/list]
gmp_sources:
  - source_id: gmp-board
    enabled: true
    urls: [https://gmp.example.test/board, https://gmp.example.test/sme]
"#;

    fn pipeline(root: &Path, store: Arc<MemoryIpoStore>) -> SyncPipeline {
        std::fs::write(root.join("sources.yaml"), SOURCES).unwrap();
        let pages = [
            ("https://ipo.example.test/ipo-list", fixture("ipo-listing/listing.html")),
            ("https://ipo.example.test/ipo/wakefit-innovations", fixture("ipo-detail/next_data.html")),
            ("https://ipo.example.test/ipo/acme-widgets", fixture("ipo-detail/html_only.html")),
            ("https://gmp.example.test/board", fixture("gmp/gmp_table.html")),
        ];
        let fetcher = FakeFetcher {
            pages: pages.into_iter().map(|(u, b)| (u.to_string(), b)).collect(),
        };
        let mut config = SyncConfig::from_env().with_workspace_root(root);
        config.artifacts_dir = root.join("artifacts");
        config.batch_deadline_secs = None;
        SyncPipeline::with_parts(config, store, Arc::new(fetcher), Arc::new(FixedClock(now())))
            .with_archive(PageArchive::new(root.join("artifacts").join("pages")))
    }

    #[tokio::test]
    async fn full_sync_stores_good_records_and_reports_the_rest() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryIpoStore::new());
        let pipeline = pipeline(tmp.path(), store.clone());

        let reports = pipeline.run_once(SyncTarget::All).await.unwrap();
        assert_eq!(reports.len(), 2);

        let ipo = &reports[0];
        assert_eq!(ipo.kind, SyncKind::Ipo);
        assert_eq!((ipo.total, ipo.succeeded, ipo.failed, ipo.persisted), (3, 2, 1, 2));
        assert!(ipo.sources[1].hard_failure);
        assert_eq!(ipo.error_sample.len(), 2);
        assert_eq!(store.ipo_count().await, 2);
        let wakefit = store.find_ipo("WAKEFIT01").await.unwrap().unwrap();
        assert_eq!(wakefit.status, IpoStatus::Active);

        let gmp = &reports[1];
        assert_eq!((gmp.total, gmp.failed), (2, 1));
        assert_eq!(store.gmp_count().await, 3);
        let manifest = gmp.parquet_manifest.as_deref().unwrap();
        assert!(Path::new(manifest).exists());

        for report in &reports {
            assert_eq!((report.started_at, report.finished_at), (now(), now()));
        }

        let listed = list_recent_reports(&tmp.path().join("reports"), 10).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(tmp.path().join("artifacts").join("pages").join("20251209").join("ipo-central").exists());
    }

    #[tokio::test]
    async fn synced_records_join_on_company_code() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryIpoStore::new());
        pipeline(tmp.path(), store.clone()).run_once(SyncTarget::All).await.unwrap();

        let ipos = store.list_ipos().await.unwrap();
        let gmps = store.list_gmp().await.unwrap();
        let joined = match_gmp_to_ipo_inner(&ipos, &gmps);
        assert_eq!(joined.len(), 1);
        assert_eq!(joined[0].ipo.company_code, "acme-widgets");
        let found = joined[0].gmp.as_ref().unwrap();
        assert_eq!(found.rule, MatchRule::CompanyCode);
        assert_eq!(found.snapshot.ipo_name, "Acme Widgets IPO");
    }

    #[tokio::test]
    async fn cancelled_signal_stops_the_batch() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryIpoStore::new());
        let pipeline = pipeline(tmp.path(), store.clone());
        let registry = SourceRegistry::load(&pipeline.config().sources_path()).await.unwrap();
        let sources = pipeline.ipo_sources(&registry).unwrap();

        let cancel = CancelSignal::new();
        cancel.cancel();
        let report = pipeline.sync_ipo_sources(&sources[..1], &cancel).await.unwrap();
        assert_eq!(report.persisted, 0);
        assert!(report.error_sample[0].contains("cancelled"));
        assert_eq!(store.ipo_count().await, 0);
    }

    #[tokio::test]
    async fn scheduler_is_off_unless_enabled() {
        let tmp = tempfile::tempdir().unwrap();
        let mut pipeline = pipeline(tmp.path(), Arc::new(MemoryIpoStore::new()));
        pipeline.config.scheduler_enabled = false;
        assert!(Arc::new(pipeline).maybe_build_scheduler().await.unwrap().is_none());
    }
}
