use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use tokio::{fs::File, io::AsyncWriteExt};
use tracing::{info, warn};

use crate::error::CheckpointError;

pub mod state;

pub use state::{CheckpointState, CheckpointStatus};

pub const PROGRESS_FILE: &str = "progress.json";
pub const PROGRESS_TMP_FILE: &str = "progress.tmp";
const BACKUP_FILE_FORMAT: &str = "progress_%Y%m%d_%H%M%S.backup.json";

/// File-backed progress for one state directory. Single writer, single process.
pub struct CheckpointStore {
    state_dir: PathBuf,
    path: PathBuf,
    tmp_path: PathBuf,
}

impl CheckpointStore {
    pub async fn open(state_dir: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let state_dir = state_dir.into();
        tokio::fs::create_dir_all(&state_dir).await?;
        Ok(Self {
            path: state_dir.join(PROGRESS_FILE),
            tmp_path: state_dir.join(PROGRESS_TMP_FILE),
            state_dir,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing or unparsable file both mean there is nothing to resume.
    pub async fn load(&self) -> Option<CheckpointState> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Failed to read checkpoint {}: {e}", self.path.display());
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(
                    "Ignoring malformed checkpoint {}: {e}",
                    self.path.display()
                );
                None
            }
        }
    }

    pub async fn save(&self, state: &mut CheckpointState) -> Result<(), CheckpointError> {
        state.last_updated = Utc::now();
        let body = serde_json::to_vec_pretty(state)?;

        if let Err(e) = self.write_atomic(&body).await {
            drop(tokio::fs::remove_file(&self.tmp_path).await);
            return Err(e);
        }
        Ok(())
    }

    // Write the temp file next to the canonical one and rename over it, so a crash
    // mid-write leaves either the old or the new checkpoint, never a torn one
    async fn write_atomic(&self, body: &[u8]) -> Result<(), CheckpointError> {
        let mut file = File::create(&self.tmp_path).await?;
        file.write_all(body).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&self.tmp_path, &self.path).await?;
        Ok(())
    }

    pub fn create_new(
        &self,
        total_records: u64,
        oldest_timestamp: DateTime<Utc>,
        newest_timestamp: DateTime<Utc>,
        dry_run: bool,
    ) -> CheckpointState {
        CheckpointState::new(total_records, oldest_timestamp, newest_timestamp, dry_run)
    }

    /// Commits one fully written day.
    pub async fn update(
        &self,
        state: &mut CheckpointState,
        date: NaiveDate,
        records: u64,
        batches: u64,
    ) -> Result<(), CheckpointError> {
        state.last_migrated_date = Some(date);
        state.records_migrated += records;
        state.batches_sent += batches;
        state.status = CheckpointStatus::InProgress;
        self.save(state).await?;

        match state.progress_percent() {
            Some(pct) => info!(
                "Checkpoint: {date} committed, {} records migrated ({pct:.1}%)",
                state.records_migrated
            ),
            None => info!(
                "Checkpoint: {date} committed, {} records migrated",
                state.records_migrated
            ),
        }
        Ok(())
    }

    pub async fn mark_completed(&self, state: &mut CheckpointState) -> Result<(), CheckpointError> {
        state.status = CheckpointStatus::Completed;
        self.save(state).await?;
        info!("Migration marked as completed");
        Ok(())
    }

    pub async fn mark_failed(
        &self,
        state: &mut CheckpointState,
        message: impl Into<String>,
    ) -> Result<(), CheckpointError> {
        let message = message.into();
        warn!("Migration marked as failed: {message}");
        state.status = CheckpointStatus::Failed;
        state.errors.push(message);
        self.save(state).await
    }

    /// Deletes the checkpoint, optionally keeping a timestamped copy. Returns the backup path.
    pub async fn reset(&self, backup: bool) -> Result<Option<PathBuf>, CheckpointError> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(None);
        }

        let backup_path = if backup {
            let backup_path = self
                .state_dir
                .join(Utc::now().format(BACKUP_FILE_FORMAT).to_string());
            tokio::fs::copy(&self.path, &backup_path).await?;
            info!("Backed up checkpoint to {}", backup_path.display());
            Some(backup_path)
        } else {
            None
        };

        tokio::fs::remove_file(&self.path).await?;
        info!("Checkpoint reset");
        Ok(backup_path)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use tempfile::TempDir;

    use super::*;

    async fn store() -> (TempDir, CheckpointStore) {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(dir.path().join("state")).await.unwrap();
        (dir, store)
    }

    fn new_state(store: &CheckpointStore) -> CheckpointState {
        store.create_new(
            1000,
            Utc.with_ymd_and_hms(2025, 5, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 11, 28, 23, 59, 59).unwrap(),
            false,
        )
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 5, d).unwrap()
    }

    #[tokio::test]
    async fn test_open_creates_directory() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b");
        let store = CheckpointStore::open(&nested).await.unwrap();
        assert!(nested.is_dir());
        assert_eq!(store.path(), nested.join(PROGRESS_FILE));
        assert!(store.load().await.is_none());
    }

    #[tokio::test]
    async fn test_create_new_is_zeroed() {
        let (_dir, store) = store().await;
        let state = new_state(&store);
        assert_eq!(state.status, CheckpointStatus::NotStarted);
        assert_eq!(state.records_migrated, 0);
        assert_eq!(state.batches_sent, 0);
        assert_eq!(state.last_migrated_date, None);
        assert!(state.errors.is_empty());
        assert_eq!(state.started_at, state.last_updated);
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let (_dir, store) = store().await;
        let mut state = new_state(&store);
        store.save(&mut state).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.last_migrated_date, None);
        assert!(loaded.errors.is_empty());
        assert!(!store.tmp_path.exists());
    }

    #[tokio::test]
    async fn test_save_stamps_last_updated() {
        let (_dir, store) = store().await;
        let mut state = new_state(&store);
        state.last_updated = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
        store.save(&mut state).await.unwrap();
        assert!(state.last_updated > Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn test_update_is_additive() {
        let (_dir, store) = store().await;
        let mut state = new_state(&store);

        store.update(&mut state, day(1), 120, 2).await.unwrap();
        store.update(&mut state, day(2), 30, 1).await.unwrap();

        assert_eq!(state.records_migrated, 150);
        assert_eq!(state.batches_sent, 3);
        assert_eq!(state.last_migrated_date, Some(day(2)));
        assert_eq!(state.status, CheckpointStatus::InProgress);

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn test_mark_failed_appends_errors() {
        let (_dir, store) = store().await;
        let mut state = new_state(&store);

        store.mark_failed(&mut state, "first").await.unwrap();
        store.mark_failed(&mut state, "second").await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.status, CheckpointStatus::Failed);
        assert_eq!(loaded.errors, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_mark_completed() {
        let (_dir, store) = store().await;
        let mut state = new_state(&store);
        store.mark_completed(&mut state).await.unwrap();
        assert_eq!(
            store.load().await.unwrap().status,
            CheckpointStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_corrupted_checkpoint_loads_as_absent() {
        let (_dir, store) = store().await;
        tokio::fs::write(store.path(), b"{\"status\": \"in_progress\", \"trunc")
            .await
            .unwrap();
        assert!(store.load().await.is_none());

        tokio::fs::write(store.path(), b"[1, 2, 3]").await.unwrap();
        assert!(store.load().await.is_none());
    }

    #[tokio::test]
    async fn test_reset_with_backup() {
        let (_dir, store) = store().await;
        let mut state = new_state(&store);
        store.update(&mut state, day(3), 10, 1).await.unwrap();

        let backup = store.reset(true).await.unwrap().unwrap();
        assert!(!store.path().exists());

        let name = backup.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("progress_"));
        assert!(name.ends_with(".backup.json"));

        let restored: CheckpointState =
            serde_json::from_str(&std::fs::read_to_string(&backup).unwrap()).unwrap();
        assert_eq!(restored, state);
    }

    #[tokio::test]
    async fn test_reset_without_backup_and_when_absent() {
        let (dir, store) = store().await;
        assert!(store.reset(true).await.unwrap().is_none());

        let mut state = new_state(&store);
        store.save(&mut state).await.unwrap();
        assert!(store.reset(false).await.unwrap().is_none());
        assert!(!store.path().exists());

        let leftovers = std::fs::read_dir(dir.path().join("state")).unwrap().count();
        assert_eq!(leftovers, 0);
    }
}
