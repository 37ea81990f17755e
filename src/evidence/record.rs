use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current evidence schema version.
pub const EVIDENCE_SCHEMA_VERSION: u32 = 1;

/// Category of an evidence record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    /// Run start/complete and phase transitions.
    Lifecycle,
    /// Stuck-handling decisions.
    Decision,
    /// Approach-flaw detections.
    Flaw,
    /// Run metrics snapshots.
    Metrics,
}

impl fmt::Display for EvidenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EvidenceKind::Lifecycle => "lifecycle",
            EvidenceKind::Decision => "decision",
            EvidenceKind::Flaw => "flaw",
            EvidenceKind::Metrics => "metrics",
        };
        f.write_str(label)
    }
}

/// Evidence record for a run event, decision, or metrics snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    /// Evidence schema version.
    pub schema_version: u32,
    /// Run identifier for correlation.
    pub run_id: String,
    /// Timestamp when the record was captured.
    pub recorded_at: DateTime<Utc>,
    pub kind: EvidenceKind,
    /// JSON payload describing the evidence.
    pub payload: Value,
}

impl EvidenceRecord {
    /// Create a new evidence record with the current timestamp.
    pub fn new(run_id: impl Into<String>, kind: EvidenceKind, payload: Value) -> Self {
        Self {
            schema_version: EVIDENCE_SCHEMA_VERSION,
            run_id: run_id.into(),
            recorded_at: Utc::now(),
            kind,
            payload,
        }
    }
}

/// Per-run manifest kept next to the event log as `run.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub schema_version: u32,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    /// Timestamp of the latest record.
    pub updated_at: DateTime<Utc>,
    /// Set once the run has written its final record.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub abort_reason: Option<String>,
    pub record_count: u64,
    #[serde(default)]
    pub kind_counts: BTreeMap<EvidenceKind, u64>,
}

impl RunManifest {
    pub fn new(run_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            schema_version: EVIDENCE_SCHEMA_VERSION,
            run_id: run_id.into(),
            started_at,
            updated_at: started_at,
            completed_at: None,
            abort_reason: None,
            record_count: 0,
            kind_counts: BTreeMap::new(),
        }
    }

    /// Account for a newly appended record.
    pub fn record(&mut self, record: &EvidenceRecord) {
        self.updated_at = record.recorded_at;
        self.record_count = self.record_count.saturating_add(1);
        let count = self.kind_counts.entry(record.kind).or_insert(0);
        *count = count.saturating_add(1);
    }

    /// Number of stored records of `kind`.
    pub fn count(&self, kind: EvidenceKind) -> u64 {
        self.kind_counts.get(&kind).copied().unwrap_or(0)
    }

    /// Stamp the run as finished.
    pub fn complete(&mut self, at: DateTime<Utc>, abort_reason: Option<&str>) {
        self.completed_at = Some(at);
        self.updated_at = at;
        self.abort_reason = abort_reason.map(str::to_string);
    }

    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }

    /// Instant retention is measured from: completion, or the last write of
    /// a run that never finished.
    pub fn retention_anchor(&self) -> DateTime<Utc> {
        self.completed_at.unwrap_or(self.updated_at)
    }
}
