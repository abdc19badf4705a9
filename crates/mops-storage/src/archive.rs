use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use mops_core::Platform;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
#[error("{action} {}: {source}", path.display())]
pub struct ArchiveError {
    action: &'static str,
    path: PathBuf,
    #[source]
    source: std::io::Error,
}

fn io_err<'a>(action: &'static str, path: &'a Path) -> impl FnOnce(std::io::Error) -> ArchiveError + 'a {
    move |source| ArchiveError {
        action,
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedResponse {
    pub sha256: String,
    /// Relative to the archive root.
    pub path: PathBuf,
    pub bytes: usize,
    /// True when an identical body was already archived for the same fetch.
    pub reused: bool,
}

/// Raw provider response bodies, one file per platform fetch, kept for
/// debugging upstream shape changes. Never read back by the pipeline.
#[derive(Debug, Clone)]
pub struct ResponseArchive {
    root: PathBuf,
}

impl ResponseArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn digest(body: &[u8]) -> String {
        hex::encode(Sha256::digest(body))
    }

    /// `<platform-slug>/<YYYY-MM-DD>/<HHMMSS>-<first 12 hex of sha256>.json`
    pub fn entry_path(platform: Platform, fetched_at: DateTime<Utc>, sha256: &str) -> PathBuf {
        let short = sha256.get(..12).unwrap_or(sha256);
        PathBuf::from(platform.slug())
            .join(fetched_at.format("%Y-%m-%d").to_string())
            .join(format!("{}-{short}.json", fetched_at.format("%H%M%S")))
    }

    /// Write `body` through a temp file and rename so readers never see a partial file.
    pub async fn store_response(
        &self,
        fetched_at: DateTime<Utc>,
        platform: Platform,
        body: &[u8],
    ) -> Result<ArchivedResponse, ArchiveError> {
        let sha256 = Self::digest(body);
        let path = Self::entry_path(platform, fetched_at, &sha256);
        let target = self.root.join(&path);
        let entry = |reused| ArchivedResponse {
            sha256: sha256.clone(),
            path: path.clone(),
            bytes: body.len(),
            reused,
        };

        if fs::try_exists(&target).await.map_err(io_err("checking", &target))? {
            debug!(path = %path.display(), "raw response already archived");
            return Ok(entry(true));
        }

        let dir = target.parent().unwrap_or(self.root.as_path());
        fs::create_dir_all(dir).await.map_err(io_err("creating", dir))?;

        let temp = dir.join(format!(".{}.partial", Uuid::new_v4()));
        fs::write(&temp, body).await.map_err(io_err("writing", &temp))?;
        if let Err(source) = fs::rename(&temp, &target).await {
            let _ = fs::remove_file(&temp).await;
            return Err(io_err("renaming into", &target)(source));
        }
        debug!(path = %path.display(), bytes = body.len(), "raw response archived");
        Ok(entry(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[test]
    fn digest_is_hex_sha256() {
        assert_eq!(
            ResponseArchive::digest(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn entries_are_grouped_by_platform_then_day() {
        let at = Utc.with_ymd_and_hms(2026, 10, 18, 6, 0, 5).unwrap();
        let path = ResponseArchive::entry_path(Platform::GoogleAds, at, "abcdef0123456789");
        assert_eq!(path, PathBuf::from("google-ads/2026-10-18/060005-abcdef012345.json"));
    }

    #[tokio::test]
    async fn identical_bodies_in_one_fetch_are_written_once() {
        let dir = tempdir().unwrap();
        let archive = ResponseArchive::new(dir.path());
        let at = Utc.with_ymd_and_hms(2026, 10, 18, 18, 0, 0).unwrap();

        let first = archive
            .store_response(at, Platform::MetaAds, br#"{"data":[]}"#)
            .await
            .unwrap();
        let second = archive
            .store_response(at, Platform::MetaAds, br#"{"data":[]}"#)
            .await
            .unwrap();

        assert!(!first.reused);
        assert!(second.reused);
        assert_eq!(first.path, second.path);
        assert_eq!(std::fs::read(dir.path().join(&first.path)).unwrap(), br#"{"data":[]}"#);
        let leftovers = std::fs::read_dir(dir.path().join("meta-ads/2026-10-18"))
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .map(|e| e.file_name().to_string_lossy().ends_with(".partial"))
                    .unwrap_or(false)
            })
            .count();
        assert_eq!(leftovers, 0);
    }
}
