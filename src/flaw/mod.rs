//! Approach-flaw detection.
//!
//! Keeps a rolling error history per phase and tells a flawed approach
//! (the same failure again and again) apart from transient noise. Messages
//! are normalized before comparison so that differing paths, line numbers
//! and identifiers do not hide a repeat.
//!
//! Detection order:
//! 1. a fatal error type is a flaw on first occurrence;
//! 2. otherwise the last `trigger_threshold` errors must share a type;
//! 3. short messages (or disabled similarity) match on type alone;
//! 4. otherwise every consecutive pair must meet the similarity threshold.

mod detector;
mod normalize;
mod similarity;

pub use detector::{ApproachFlawDetector, ErrorPattern, ErrorRecord, FlawDetectorConfig};
pub use normalize::normalize_message;
pub use similarity::lcs_ratio;
