//! Per-run JSON reports and the GMP parquet snapshot.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use ipo_core::GmpSnapshot;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::warn;
use uuid::Uuid;

use crate::orchestrator::{SourceReport, SyncKind};

const ERROR_SAMPLE_LIMIT: usize = 3;
pub const RUN_REPORT_FILE: &str = "run_report.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub kind: SyncKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub persisted: usize,
    /// Completed items over total items across every source, 0.0–1.0.
    pub completeness: f64,
    pub error_sample: Vec<String>,
    pub sources: Vec<SourceReport>,
    #[serde(default)]
    pub parquet_manifest: Option<String>,
}

impl RunReport {
    pub fn from_sources(
        run_id: Uuid,
        kind: SyncKind,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        sources: Vec<SourceReport>,
    ) -> Self {
        let total = sources.iter().map(|s| s.total).sum::<usize>();
        let failed = sources.iter().map(|s| s.failed).sum::<usize>();
        let succeeded = sources.iter().map(|s| s.attempted.saturating_sub(s.failed)).sum::<usize>();
        let persisted = sources.iter().map(|s| s.persisted).sum();
        let completeness = if sources.iter().any(|s| s.hard_failure) && total == 0 {
            0.0
        } else if total == 0 {
            1.0
        } else {
            succeeded as f64 / total as f64
        };
        let error_sample = sources
            .iter()
            .filter_map(|s| s.error.as_ref().map(|e| format!("{}: {e}", s.source_id)))
            .take(ERROR_SAMPLE_LIMIT)
            .collect();
        Self {
            run_id,
            kind,
            started_at,
            finished_at,
            total,
            succeeded,
            failed,
            persisted,
            completeness,
            error_sample,
            sources,
            parquet_manifest: None,
        }
    }

    /// True when every configured source failed before extracting anything.
    pub fn all_sources_failed(&self) -> bool {
        !self.sources.is_empty() && self.sources.iter().all(|s| s.hard_failure)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

pub fn run_dir(reports_root: &Path, run_id: Uuid) -> PathBuf {
    reports_root.join(run_id.to_string())
}

pub async fn write_run_report(reports_root: &Path, report: &RunReport) -> Result<PathBuf> {
    let dir = run_dir(reports_root, report.run_id);
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join(RUN_REPORT_FILE);
    let bytes = serde_json::to_vec_pretty(report).context("serializing run report")?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// Writes `gmp_snapshots.parquet` plus a sha256 manifest into the run directory
/// and returns the manifest path.
pub async fn export_gmp_snapshot(reports_root: &Path, run_id: Uuid, snapshots: &[GmpSnapshot]) -> Result<PathBuf> {
    let dir = run_dir(reports_root, run_id);
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let parquet_path = dir.join("gmp_snapshots.parquet");
    write_gmp_parquet(&parquet_path, snapshots)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![manifest_entry("gmp_snapshots", &dir, &parquet_path, snapshots.len())?],
    };
    let manifest_path = dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

/// Newest first. Directories without a readable report are skipped.
pub async fn list_recent_reports(reports_root: &Path, limit: usize) -> Result<Vec<RunReport>> {
    if !fs::try_exists(reports_root)
        .await
        .with_context(|| format!("checking {}", reports_root.display()))?
    {
        return Ok(Vec::new());
    }

    let mut reports = Vec::new();
    let mut entries = fs::read_dir(reports_root)
        .await
        .with_context(|| format!("reading {}", reports_root.display()))?;
    while let Some(entry) = entries.next_entry().await.context("listing reports")? {
        let path = entry.path().join(RUN_REPORT_FILE);
        let Ok(bytes) = fs::read(&path).await else {
            continue;
        };
        match serde_json::from_slice::<RunReport>(&bytes) {
            Ok(report) => reports.push(report),
            Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable run report"),
        }
    }
    reports.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| a.run_id.cmp(&b.run_id)));
    reports.truncate(limit);
    Ok(reports)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_gmp_parquet(path: &Path, rows: &[GmpSnapshot]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("ipo_name", DataType::Utf8, false),
        ArrowField::new("company_code", DataType::Utf8, false),
        ArrowField::new("stock_id", DataType::Utf8, true),
        ArrowField::new("gmp_value", DataType::Float64, true),
        ArrowField::new("gain_percent", DataType::Float64, true),
        ArrowField::new("reference_price", DataType::Float64, true),
        ArrowField::new("estimated_listing", DataType::Float64, true),
        ArrowField::new("subscription", DataType::Float64, true),
        ArrowField::new("rating", DataType::UInt32, true),
        ArrowField::new("status_code", DataType::Utf8, true),
        ArrowField::new("data_source", DataType::Utf8, false),
        ArrowField::new("last_updated", DataType::Utf8, false),
        ArrowField::new("confidence_score", DataType::UInt32, false),
    ]));

    let floats = |get: fn(&GmpSnapshot) -> Option<f64>| Float64Array::from(rows.iter().map(get).collect::<Vec<_>>());

    let names = StringArray::from(rows.iter().map(|r| Some(r.ipo_name.as_str())).collect::<Vec<_>>());
    let codes = StringArray::from(rows.iter().map(|r| Some(r.company_code.as_str())).collect::<Vec<_>>());
    let stock_ids = StringArray::from(rows.iter().map(|r| r.stock_id.as_deref()).collect::<Vec<_>>());
    let ratings = UInt32Array::from(rows.iter().map(|r| r.rating.map(u32::from)).collect::<Vec<_>>());
    let statuses = StringArray::from(
        rows.iter()
            .map(|r| r.status_code.as_ref().map(|s| s.as_str()))
            .collect::<Vec<_>>(),
    );
    let sources = StringArray::from(rows.iter().map(|r| Some(r.data_source.as_str())).collect::<Vec<_>>());
    let updated = StringArray::from(
        rows.iter()
            .map(|r| Some(r.last_updated.to_rfc3339()))
            .collect::<Vec<_>>(),
    );
    let scores = UInt32Array::from(rows.iter().map(|r| u32::from(r.confidence.score)).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(names),
            Arc::new(codes),
            Arc::new(stock_ids),
            Arc::new(floats(|r| r.gmp_value)),
            Arc::new(floats(|r| r.gain_percent)),
            Arc::new(floats(|r| r.reference_price)),
            Arc::new(floats(|r| r.estimated_listing)),
            Arc::new(floats(|r| r.subscription)),
            Arc::new(ratings),
            Arc::new(statuses),
            Arc::new(sources),
            Arc::new(updated),
            Arc::new(scores),
        ],
    )
    .context("building gmp_snapshots record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path, rows: usize) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path.strip_prefix(run_dir).unwrap_or(path).display().to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
        rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 12, 9, 4, 30, 0).single().unwrap()
    }

    fn source(id: &str, total: usize, failed: usize) -> SourceReport {
        SourceReport {
            source_id: id.into(),
            kind: SyncKind::Ipo,
            total,
            attempted: total,
            failed,
            records: total - failed,
            partials: failed,
            persisted: total - failed,
            write_failures: 0,
            completeness: (total - failed) as f64 / total as f64,
            error: (failed > 0).then(|| format!("{failed} of {total} items failed")),
            hard_failure: false,
        }
    }

    #[test]
    fn totals_roll_up_across_sources() {
        let report = RunReport::from_sources(
            Uuid::new_v4(),
            SyncKind::Ipo,
            t0(),
            t0(),
            vec![
                source("a", 10, 2),
                source("b", 10, 0),
                SourceReport::hard_failure("c", SyncKind::Ipo, "listing down"),
            ],
        );
        assert_eq!((report.total, report.succeeded, report.failed), (20, 18, 2));
        assert_eq!(report.completeness, 0.9);
        assert_eq!(report.error_sample, vec!["a: 2 of 10 items failed", "c: listing down"]);
        assert!(!report.all_sources_failed());
    }

    #[test]
    fn only_hard_failures_mean_zero_completeness() {
        let report = RunReport::from_sources(
            Uuid::new_v4(),
            SyncKind::Gmp,
            t0(),
            t0(),
            vec![SourceReport::hard_failure("c", SyncKind::Gmp, "down")],
        );
        assert_eq!(report.completeness, 0.0);
        assert!(report.all_sources_failed());
    }

    #[tokio::test]
    async fn reports_are_listed_newest_first() {
        let tmp = tempfile::tempdir().unwrap();
        for offset in 0..3 {
            let started = t0() + Duration::hours(offset);
            let report = RunReport::from_sources(Uuid::new_v4(), SyncKind::Ipo, started, started, vec![source("a", 4, 1)]);
            write_run_report(tmp.path(), &report).await.unwrap();
        }
        std::fs::create_dir_all(tmp.path().join("stray")).unwrap();
        std::fs::write(tmp.path().join("stray").join(RUN_REPORT_FILE), b"{not json").unwrap();

        let listed = list_recent_reports(tmp.path(), 2).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].started_at, t0() + Duration::hours(2));
        assert_eq!(listed[1].started_at, t0() + Duration::hours(1));
        assert_eq!(listed[0].sources[0].partials, 1);
    }

    #[tokio::test]
    async fn missing_reports_dir_lists_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let listed = list_recent_reports(&tmp.path().join("reports"), 5).await.unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn gmp_snapshot_manifest_matches_file() {
        let tmp = tempfile::tempdir().unwrap();
        let mut acme = GmpSnapshot::new("Acme Widgets IPO", "board", t0());
        acme.gmp_value = Some(25.0);
        acme.rating = Some(3);
        let rows = vec![acme, GmpSnapshot::new("Sunrise Agro SME IPO", "board", t0())];
        let run_id = Uuid::new_v4();

        let manifest_path = export_gmp_snapshot(tmp.path(), run_id, &rows).await.unwrap();
        let manifest: ParquetManifest = serde_json::from_slice(&std::fs::read(&manifest_path).unwrap()).unwrap();
        let entry = &manifest.files[0];
        assert_eq!(entry.path, "gmp_snapshots.parquet");
        assert_eq!(entry.rows, 2);

        let bytes = std::fs::read(run_dir(tmp.path(), run_id).join(&entry.path)).unwrap();
        assert_eq!(entry.bytes, bytes.len() as u64);
        assert_eq!(entry.sha256, hex::encode(Sha256::digest(&bytes)));
        assert_eq!(&bytes[..4], b"PAR1");
    }
}
