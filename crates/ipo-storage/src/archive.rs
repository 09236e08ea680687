//! Content-addressed archive of fetched pages.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ArchivedPage {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    /// True when an identical page was already on disk.
    pub deduplicated: bool,
}

#[derive(Debug, Clone)]
pub struct PageArchive {
    root: PathBuf,
}

impl PageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// `<YYYYMMDD>/<source_id>/<sha256>.<ext>`
    pub fn page_path(fetched_at: DateTime<Utc>, source_id: &str, content_hash: &str, extension: &str) -> PathBuf {
        let ext = match extension.trim().trim_start_matches('.') {
            "" => "bin",
            other => other,
        };
        PathBuf::from(fetched_at.format("%Y%m%d").to_string())
            .join(source_id)
            .join(format!("{content_hash}.{ext}"))
    }

    pub async fn archive(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPage> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = Self::page_path(fetched_at, source_id, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let dir = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating archive directory {}", dir.display()))?;

        let deduplicated = if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking {}", absolute_path.display()))?
        {
            true
        } else {
            !write_new_file(&dir, &absolute_path, bytes).await?
        };

        Ok(ArchivedPage {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }

    pub async fn read(&self, relative_path: &Path) -> anyhow::Result<Vec<u8>> {
        let path = self.root.join(relative_path);
        fs::read(&path)
            .await
            .with_context(|| format!("reading archived page {}", path.display()))
    }
}

/// Writes through a temp file and renames into place. Returns false when
/// another writer got there first.
async fn write_new_file(dir: &Path, target: &Path, bytes: &[u8]) -> anyhow::Result<bool> {
    let temp_path = dir.join(format!(".{}.partial", Uuid::new_v4()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing {}", temp_path.display()))?;
    file.flush().await?;
    drop(file);

    if fs::try_exists(target).await.unwrap_or(false) {
        let _ = fs::remove_file(&temp_path).await;
        return Ok(false);
    }
    match fs::rename(&temp_path, target).await {
        Ok(()) => Ok(true),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err).with_context(|| format!("renaming into {}", target.display()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn fetched_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 1, 4, 30, 0).single().unwrap()
    }

    #[test]
    fn hash_is_stable() {
        assert_eq!(
            PageArchive::sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn path_layout_groups_by_day_and_source() {
        let path = PageArchive::page_path(fetched_at(), "gmp-board", "abc", ".html");
        assert_eq!(path, PathBuf::from("20250901/gmp-board/abc.html"));
        let path = PageArchive::page_path(fetched_at(), "gmp-board", "abc", "");
        assert_eq!(path, PathBuf::from("20250901/gmp-board/abc.bin"));
    }

    #[tokio::test]
    async fn identical_pages_are_stored_once() {
        let dir = tempdir().unwrap();
        let archive = PageArchive::new(dir.path());

        let first = archive
            .archive(fetched_at(), "ipo-listing", "html", b"<html>same</html>")
            .await
            .unwrap();
        let second = archive
            .archive(fetched_at(), "ipo-listing", "html", b"<html>same</html>")
            .await
            .unwrap();

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert_eq!(archive.read(&first.relative_path).await.unwrap(), b"<html>same</html>");
    }
}
