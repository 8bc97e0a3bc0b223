//! Quota Snapshot Store: an append-only time series of quota percentage
//! observations, persisted to a newline-delimited JSON file so history
//! survives a restart.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::warn;

/// One observation of remaining quota for an account's model family.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuotaSnapshot {
    /// Account identity (email).
    pub account_id: String,
    /// Model family this percentage applies to.
    pub family: String,
    /// Remaining quota, 0-100.
    pub percentage: f64,
    /// When the observation was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// Append-only snapshot history, held in memory and mirrored to disk.
///
/// Operations never propagate storage errors to callers: a failed disk write
/// is logged and the in-memory copy (which already has the new snapshot)
/// remains authoritative for the rest of the process's lifetime. Readers
/// degrade to "no data" rather than erroring.
pub struct SnapshotStore {
    path: Option<PathBuf>,
    snapshots: RwLock<Vec<QuotaSnapshot>>,
}

impl SnapshotStore {
    /// Build a store backed by `path`, loading any existing history. A
    /// missing or unreadable file starts empty rather than failing.
    pub async fn open(path: PathBuf) -> Self {
        let loaded = load_existing(&path).await;
        Self { path: Some(path), snapshots: RwLock::new(loaded) }
    }

    /// Build a purely in-memory store (used in tests and when no on-disk
    /// path is configured).
    #[must_use]
    pub fn in_memory() -> Self {
        Self { path: None, snapshots: RwLock::new(Vec::new()) }
    }

    /// Append one observation.
    pub async fn record(&self, account_id: &str, family: &str, percentage: f64, now: DateTime<Utc>) {
        let snapshot = QuotaSnapshot {
            account_id: account_id.to_string(),
            family: family.to_string(),
            percentage,
            recorded_at: now,
        };
        self.snapshots.write().await.push(snapshot.clone());
        self.append_to_disk(&snapshot).await;
    }

    async fn append_to_disk(&self, snapshot: &QuotaSnapshot) {
        let Some(path) = &self.path else { return };
        let line = match serde_json::to_string(snapshot) {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "failed to serialize quota snapshot");
                return;
            }
        };
        let result = async {
            let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(path).await?;
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await
        }
        .await;
        if let Err(e) = result {
            warn!(error = %e, path = %path.display(), "failed to persist quota snapshot");
        }
    }

    /// Snapshots for `account_id`/`family` recorded at or after
    /// `since_instant`, newest first.
    pub async fn snapshots_since(&self, account_id: &str, family: &str, since_instant: DateTime<Utc>) -> Vec<QuotaSnapshot> {
        let snapshots = self.snapshots.read().await;
        let mut matching: Vec<QuotaSnapshot> = snapshots
            .iter()
            .filter(|s| s.account_id == account_id && s.family == family && s.recorded_at >= since_instant)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        matching
    }

    /// Drop every snapshot older than `older_than`. Idempotent.
    pub async fn prune(&self, older_than: DateTime<Utc>) {
        self.snapshots.write().await.retain(|s| s.recorded_at >= older_than);
    }
}

async fn load_existing(path: &PathBuf) -> Vec<QuotaSnapshot> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents
            .lines()
            .filter_map(|line| match serde_json::from_str::<QuotaSnapshot>(line) {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!(error = %e, "skipping unreadable quota snapshot line");
                    None
                }
            })
            .collect(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => {
            warn!(error = %e, path = %path.display(), "failed to load quota snapshot history");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_and_queries_descending() {
        let store = SnapshotStore::in_memory();
        let now = Utc::now();
        store.record("a@example.com", "claude", 80.0, now - chrono::Duration::hours(1)).await;
        store.record("a@example.com", "claude", 60.0, now).await;

        let since = store.snapshots_since("a@example.com", "claude", now - chrono::Duration::hours(2)).await;
        assert_eq!(since.len(), 2);
        assert_eq!(since[0].percentage, 60.0);
        assert_eq!(since[1].percentage, 80.0);
    }

    #[tokio::test]
    async fn prune_removes_old_entries() {
        let store = SnapshotStore::in_memory();
        let now = Utc::now();
        store.record("a@example.com", "claude", 80.0, now - chrono::Duration::hours(48)).await;
        store.record("a@example.com", "claude", 60.0, now).await;
        store.prune(now - chrono::Duration::hours(24)).await;

        let since = store.snapshots_since("a@example.com", "claude", now - chrono::Duration::hours(72)).await;
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].percentage, 60.0);
    }

    #[tokio::test]
    async fn family_and_account_are_isolated() {
        let store = SnapshotStore::in_memory();
        let now = Utc::now();
        store.record("a@example.com", "claude", 80.0, now).await;
        store.record("b@example.com", "claude", 10.0, now).await;
        store.record("a@example.com", "geminiPro", 50.0, now).await;

        let since = store.snapshots_since("a@example.com", "claude", now - chrono::Duration::hours(1)).await;
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].percentage, 80.0);
    }
}
