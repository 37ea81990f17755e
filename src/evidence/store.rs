//! Filesystem layout: `<base>/.phaseward/evidence/runs/<run_id>/` holding an
//! append-only `events.jsonl` and a `run.json` manifest.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::evidence::config::EvidenceStoreConfig;
use crate::evidence::record::{EvidenceKind, EvidenceRecord, RunManifest};

const STATE_DIR_NAME: &str = ".phaseward";
const EVIDENCE_DIR_NAME: &str = "evidence";
const RUNS_DIR_NAME: &str = "runs";
const MANIFEST_FILE_NAME: &str = "run.json";
const EVENTS_FILE_NAME: &str = "events.jsonl";
const MAX_RETENTION_DAYS: u64 = 100 * 365;

#[derive(Error, Debug)]
pub enum EvidenceError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Empty, or not usable as a single directory name.
    #[error("Invalid run ID {0:?}")]
    InvalidRunId(String),
}

pub type EvidenceResult<T> = Result<T, EvidenceError>;

/// Evidence store backed by the local filesystem.
///
/// Callers serialize appends for a run; the store itself takes no locks.
#[derive(Debug, Clone)]
pub struct EvidenceStore {
    runs_dir: PathBuf,
    retention: Option<Duration>,
}

impl EvidenceStore {
    pub fn new(base_dir: impl Into<PathBuf>, config: EvidenceStoreConfig) -> EvidenceResult<Self> {
        let runs_dir = base_dir
            .into()
            .join(STATE_DIR_NAME)
            .join(EVIDENCE_DIR_NAME)
            .join(RUNS_DIR_NAME);
        fs::create_dir_all(&runs_dir)?;
        let retention = (config.retention_days > 0)
            .then(|| Duration::days(config.retention_days.min(MAX_RETENTION_DAYS) as i64));
        Ok(Self {
            runs_dir,
            retention,
        })
    }

    /// Directory holding one subdirectory per run.
    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    /// Append a record to its run's log and return the updated manifest.
    pub fn append_record(&self, record: &EvidenceRecord) -> EvidenceResult<RunManifest> {
        let run_dir = self.run_dir(&record.run_id)?;
        fs::create_dir_all(&run_dir)?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(run_dir.join(EVENTS_FILE_NAME))?;
        writeln!(file, "{}", serde_json::to_string(record)?)?;
        file.sync_all()?;

        let mut manifest = read_manifest(&run_dir)?
            .unwrap_or_else(|| RunManifest::new(record.run_id.clone(), record.recorded_at));
        manifest.record(record);
        write_json_atomic(&run_dir.join(MANIFEST_FILE_NAME), &manifest)?;

        debug!(run_id = %record.run_id, kind = %record.kind, "Appended evidence record");
        Ok(manifest)
    }

    /// Mark a run finished. Later appends still land in the log.
    pub fn complete_run(
        &self,
        run_id: &str,
        abort_reason: Option<&str>,
    ) -> EvidenceResult<RunManifest> {
        let run_dir = self.run_dir(run_id)?;
        fs::create_dir_all(&run_dir)?;
        let now = Utc::now();
        let mut manifest = read_manifest(&run_dir)?.unwrap_or_else(|| RunManifest::new(run_id, now));
        manifest.complete(now, abort_reason);
        write_json_atomic(&run_dir.join(MANIFEST_FILE_NAME), &manifest)?;
        Ok(manifest)
    }

    /// Every record of a run, in append order.
    pub fn read_records(&self, run_id: &str) -> EvidenceResult<Vec<EvidenceRecord>> {
        let events_path = self.run_dir(run_id)?.join(EVENTS_FILE_NAME);
        let content = match fs::read_to_string(&events_path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(EvidenceError::from))
            .collect()
    }

    /// Records of one kind, in append order.
    pub fn read_kind(&self, run_id: &str, kind: EvidenceKind) -> EvidenceResult<Vec<EvidenceRecord>> {
        let mut records = self.read_records(run_id)?;
        records.retain(|record| record.kind == kind);
        Ok(records)
    }

    pub fn manifest(&self, run_id: &str) -> EvidenceResult<Option<RunManifest>> {
        read_manifest(&self.run_dir(run_id)?)
    }

    /// Delete runs whose retention window has passed, never touching
    /// `active_run_id`. Finished runs age from completion, unfinished ones
    /// from their last write. Returns the pruned run ids.
    pub fn prune_expired(&self, active_run_id: &str) -> EvidenceResult<Vec<String>> {
        let Some(retention) = self.retention else {
            return Ok(Vec::new());
        };
        let cutoff = Utc::now() - retention;
        let mut pruned = Vec::new();

        for entry in fs::read_dir(&self.runs_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() || entry.file_name().to_str() == Some(active_run_id) {
                continue;
            }
            let run_dir = entry.path();
            let Some(manifest) = read_manifest(&run_dir)? else {
                continue;
            };
            if manifest.retention_anchor() < cutoff {
                fs::remove_dir_all(&run_dir)?;
                pruned.push(manifest.run_id);
            }
        }

        if !pruned.is_empty() {
            info!(
                pruned = pruned.len(),
                retention_days = retention.num_days(),
                "Pruned expired evidence runs"
            );
        }
        Ok(pruned)
    }

    fn run_dir(&self, run_id: &str) -> EvidenceResult<PathBuf> {
        let trimmed = run_id.trim();
        if trimmed.is_empty()
            || trimmed == "."
            || trimmed == ".."
            || run_id.contains(|c: char| c == '/' || c == '\\')
        {
            return Err(EvidenceError::InvalidRunId(run_id.to_string()));
        }
        Ok(self.runs_dir.join(run_id))
    }
}

fn read_manifest(run_dir: &Path) -> EvidenceResult<Option<RunManifest>> {
    match fs::read_to_string(run_dir.join(MANIFEST_FILE_NAME)) {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> EvidenceResult<()> {
    let temp_path = path.with_extension("json.tmp");
    let mut file = fs::File::create(&temp_path)?;
    file.write_all(serde_json::to_string_pretty(value)?.as_bytes())?;
    file.sync_all()?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn store(temp_dir: &TempDir, retention_days: u64) -> EvidenceStore {
        EvidenceStore::new(temp_dir.path(), EvidenceStoreConfig::new(retention_days))
            .expect("store")
    }

    fn age_manifest(store: &EvidenceStore, run_id: &str, days: i64) {
        let path = store.runs_dir().join(run_id).join(MANIFEST_FILE_NAME);
        let mut manifest: RunManifest =
            serde_json::from_str(&fs::read_to_string(&path).expect("manifest")).expect("parse");
        let then = Utc::now() - Duration::days(days);
        manifest.started_at = then;
        manifest.updated_at = then;
        if manifest.completed_at.is_some() {
            manifest.completed_at = Some(then);
        }
        fs::write(&path, serde_json::to_string(&manifest).expect("serialize")).expect("write");
    }

    #[test]
    fn test_layout_under_state_dir() {
        let temp_dir = TempDir::new().expect("temp dir");
        let store = store(&temp_dir, 30);
        store
            .append_record(&EvidenceRecord::new("run-1", EvidenceKind::Lifecycle, json!({})))
            .expect("append");

        let run_dir = temp_dir.path().join(".phaseward/evidence/runs/run-1");
        assert!(run_dir.join(EVENTS_FILE_NAME).exists());
        assert!(run_dir.join(MANIFEST_FILE_NAME).exists());
        assert!(!run_dir.join("run.json.tmp").exists());
    }

    #[test]
    fn test_manifest_tracks_kinds_and_completion() {
        let temp_dir = TempDir::new().expect("temp dir");
        let store = store(&temp_dir, 30);
        for kind in [EvidenceKind::Lifecycle, EvidenceKind::Decision, EvidenceKind::Decision] {
            store
                .append_record(&EvidenceRecord::new("run-abc", kind, json!({})))
                .expect("append");
        }

        let manifest = store.manifest("run-abc").expect("read").expect("exists");
        assert_eq!(manifest.record_count, 3);
        assert_eq!(manifest.count(EvidenceKind::Decision), 2);
        assert!(!manifest.is_complete());

        store.complete_run("run-abc", Some("STOP")).expect("complete");
        let manifest = store.manifest("run-abc").expect("read").expect("exists");
        assert!(manifest.is_complete());
        assert_eq!(manifest.abort_reason.as_deref(), Some("STOP"));
        assert_eq!(manifest.record_count, 3);
    }

    #[test]
    fn test_read_kind_filters_in_order() {
        let temp_dir = TempDir::new().expect("temp dir");
        let store = store(&temp_dir, 30);
        for (n, kind) in [EvidenceKind::Decision, EvidenceKind::Flaw, EvidenceKind::Decision]
            .into_iter()
            .enumerate()
        {
            store
                .append_record(&EvidenceRecord::new("run-k", kind, json!({ "n": n })))
                .expect("append");
        }

        let decisions = store.read_kind("run-k", EvidenceKind::Decision).expect("read");
        let order: Vec<_> = decisions.iter().map(|r| r.payload["n"].clone()).collect();
        assert_eq!(order, vec![json!(0), json!(2)]);
        assert!(store.read_records("run-missing").expect("read").is_empty());
        assert!(store.manifest("run-missing").expect("read").is_none());
    }

    #[test]
    fn test_unsafe_run_ids_rejected() {
        let temp_dir = TempDir::new().expect("temp dir");
        let store = store(&temp_dir, 30);
        for run_id in ["  ", "..", "../escape", "nested/run", "a\\b"] {
            let record = EvidenceRecord::new(run_id, EvidenceKind::Lifecycle, json!({}));
            assert!(matches!(
                store.append_record(&record),
                Err(EvidenceError::InvalidRunId(_))
            ));
        }
        assert!(!temp_dir.path().join(".phaseward/evidence/escape").exists());
    }

    #[test]
    fn test_prune_ages_finished_runs_from_completion() {
        let temp_dir = TempDir::new().expect("temp dir");
        let store = store(&temp_dir, 30);
        for run_id in ["run-old", "run-recent"] {
            store
                .append_record(&EvidenceRecord::new(run_id, EvidenceKind::Lifecycle, json!({})))
                .expect("append");
            store.complete_run(run_id, None).expect("complete");
        }
        age_manifest(&store, "run-old", 45);

        let pruned = store.prune_expired("run-current").expect("prune");
        assert_eq!(pruned, vec!["run-old".to_string()]);
        assert!(!store.runs_dir().join("run-old").exists());
        assert!(store.runs_dir().join("run-recent").exists());
    }

    #[test]
    fn test_prune_skips_active_run_and_ages_abandoned_runs() {
        let temp_dir = TempDir::new().expect("temp dir");
        let store = store(&temp_dir, 30);
        for run_id in ["run-active", "run-crashed"] {
            store
                .append_record(&EvidenceRecord::new(run_id, EvidenceKind::Lifecycle, json!({})))
                .expect("append");
            age_manifest(&store, run_id, 60);
        }

        let pruned = store.prune_expired("run-active").expect("prune");
        assert_eq!(pruned, vec!["run-crashed".to_string()]);
        assert!(store.runs_dir().join("run-active").exists());
    }

    #[test]
    fn test_zero_retention_keeps_everything() {
        let temp_dir = TempDir::new().expect("temp dir");
        let store = store(&temp_dir, 0);
        store
            .append_record(&EvidenceRecord::new("run-keep", EvidenceKind::Lifecycle, json!({})))
            .expect("append");
        age_manifest(&store, "run-keep", 365);

        assert!(store.prune_expired("other").expect("prune").is_empty());
        assert!(store.runs_dir().join("run-keep").exists());
    }
}
