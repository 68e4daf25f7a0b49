// refwatch/src/state/snapshot.rs
//
// Snapshot persistence for the in-memory repository.
//
// On startup: restore tables from the JSON snapshot (if one exists) before
// accepting updates. While running: checkpoint every `interval_secs`. On
// graceful shutdown: one final checkpoint.
//
// Writes go to `<path>.tmp` and are renamed over the snapshot, so a crash
// mid-write leaves the previous checkpoint intact.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::state::store::{MemoryRepository, Tables};

#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    pub path:          PathBuf,
    pub interval_secs: u64,
}

pub struct SnapshotPersistence {
    config: SnapshotConfig,
    repo:   Arc<MemoryRepository>,
}

impl SnapshotPersistence {
    pub fn new(config: SnapshotConfig, repo: Arc<MemoryRepository>) -> Self {
        Self { config, repo }
    }

    /// Load a repository from `path`; empty when the file does not exist.
    pub async fn restore(path: &PathBuf) -> Result<MemoryRepository> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let tables: Tables = serde_json::from_slice(&bytes)
                    .with_context(|| format!("parsing snapshot {}", path.display()))?;
                info!(
                    users        = tables.n_users(),
                    attributions = tables.n_attributions(),
                    events       = tables.n_events(),
                    "Restored snapshot from {}", path.display()
                );
                Ok(MemoryRepository::from_tables(tables))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No snapshot at {} — starting empty", path.display());
                Ok(MemoryRepository::new())
            }
            Err(e) => Err(e).with_context(|| format!("reading snapshot {}", path.display())),
        }
    }

    /// Background checkpoint loop.
    pub async fn checkpoint_loop(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.interval_secs.max(1));
        loop {
            tokio::time::sleep(interval).await;
            if let Err(e) = self.save_checkpoint().await {
                error!("Snapshot checkpoint failed: {:#}", e);
            }
        }
    }

    pub async fn save_checkpoint(&self) -> Result<()> {
        let tables = self.repo.export();
        let json   = serde_json::to_vec(&tables)?;
        let tmp    = self.config.path.with_extension("tmp");

        if let Some(dir) = self.config.path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir).await?;
            }
        }
        tokio::fs::write(&tmp, &json).await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.config.path).await
            .with_context(|| format!("renaming into {}", self.config.path.display()))?;

        info!(
            attributions = tables.n_attributions(),
            bytes        = json.len(),
            "Snapshot checkpoint written"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{AttributionStatus, NewAttribution, RiskNote, RiskReason};
    use crate::state::store::{Repository, UnitOfWork};
    use chrono::Utc;

    #[tokio::test]
    async fn checkpoint_then_restore_keeps_rows_and_indexes() {
        let dir  = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("refwatch.json");

        let repo = Arc::new(MemoryRepository::new());
        let now  = Utc::now();
        repo.transaction(|tx| {
            tx.upsert_user(1, Some("owner"), None, None, now)?;
            tx.upsert_user(2, None, Some("Bo"), None, now)?;
            let aff = tx.create_affiliate(1, "https://t.me/+code1", now)?;
            let mut note = RiskNote::new();
            note.insert(RiskReason::FreshAccount);
            tx.create_attribution(NewAttribution {
                affiliate_id:   aff.id,
                joined_user_id: 2,
                joined_at:      now,
                source_ip:      Some("10.1.2.3".into()),
                source_subnet:  Some("10.1.2.0/24".into()),
                note,
            })
        })
        .unwrap();

        let persistence = SnapshotPersistence::new(
            SnapshotConfig { path: path.clone(), interval_secs: 60 },
            Arc::clone(&repo),
        );
        persistence.save_checkpoint().await.unwrap();

        let restored = SnapshotPersistence::restore(&path).await.unwrap();
        restored
            .transaction(|tx| {
                let aff = tx.affiliate_by_code("+code1")?.expect("index rebuilt");
                assert_eq!(aff.owner_user_id, 1);
                let attribution = tx.attribution_by_user(2)?.expect("index rebuilt");
                assert_eq!(attribution.status, AttributionStatus::Pending);
                assert_eq!(attribution.note.to_string(), "fresh_account");
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn missing_snapshot_restores_empty() {
        let dir  = tempfile::tempdir().unwrap();
        let repo = SnapshotPersistence::restore(&dir.path().join("absent.json")).await.unwrap();
        assert_eq!(repo.export().n_users(), 0);
    }
}
