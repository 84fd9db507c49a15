//! Write-once archive of raw report payloads, addressed by content hash.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedReport {
    pub sha256: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    /// The same payload was already archived under this path.
    pub already_present: bool,
}

#[derive(Debug, Clone)]
pub struct ReportArchive {
    root: PathBuf,
}

impl ReportArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn digest(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// `<YYYYmmdd_HHMMSS>/<network>/<sha256>.json`
    pub fn report_path(fetched_at: DateTime<Utc>, network_slug: &str, sha256: &str) -> PathBuf {
        PathBuf::from(fetched_at.format("%Y%m%d_%H%M%S").to_string())
            .join(network_slug)
            .join(format!("{sha256}.json"))
    }

    /// Archives `bytes` unless an identical payload already sits at the same
    /// path. The payload is written to a private temp file and then
    /// hard-linked into place; the link fails if another writer got there
    /// first, so concurrent runs never clobber or half-write an entry.
    pub async fn store_report(
        &self,
        fetched_at: DateTime<Utc>,
        network_slug: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedReport> {
        let sha256 = Self::digest(bytes);
        let relative_path = Self::report_path(fetched_at, network_slug, &sha256);
        let absolute_path = self.root.join(&relative_path);
        let dir = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| anyhow!("archive path {} has no parent", absolute_path.display()))?;
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating archive directory {}", dir.display()))?;

        let staging = dir.join(format!(".{sha256}.{}.tmp", Uuid::new_v4().simple()));
        fs::write(&staging, bytes)
            .await
            .with_context(|| format!("staging report at {}", staging.display()))?;
        let claimed = fs::hard_link(&staging, &absolute_path).await;
        if let Err(err) = fs::remove_file(&staging).await {
            warn!(path = %staging.display(), error = %err, "could not remove staged report");
        }

        let already_present = match claimed {
            Ok(()) => false,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => true,
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("linking archived report into {}", absolute_path.display())
                })
            }
        };
        debug!(
            network = network_slug,
            sha256 = %sha256,
            bytes = bytes.len(),
            already_present,
            "report archived"
        );

        Ok(ArchivedReport {
            sha256,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            already_present,
        })
    }
}
