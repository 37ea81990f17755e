//! Evidence storage module.
//!
//! Append-only audit trail of a run: lifecycle events, phase transitions,
//! stuck-handling decisions and flaw detections, stored as JSONL under
//! `.phaseward/evidence/runs/<run_id>/`.

pub mod config;
pub mod lifecycle;
pub mod record;
pub mod store;
pub mod writer;

pub use config::EvidenceStoreConfig;
pub use lifecycle::{LifecycleEvent, LifecycleEventType};
pub use record::{EvidenceKind, EvidenceRecord, RunManifest, EVIDENCE_SCHEMA_VERSION};
pub use store::{EvidenceError, EvidenceResult, EvidenceStore};
pub use writer::{generate_run_id, EvidenceWriter};
