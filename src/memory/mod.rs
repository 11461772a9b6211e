pub mod context;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Meta key holding the advancing period-start date for the cycle engine.
pub const META_LAST_PERIOD_START: &str = "last_period_start";
/// Meta key marking the one-time legacy memory.json import as complete.
pub const META_LEGACY_IMPORT: &str = "legacy_import_done";

/// One turn in the per-role short-term log. Insertion order is the only
/// order; entries are never reordered or edited in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShortTermEntry {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Durable per-role memory state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub core_memory: String,
    pub short_term: Vec<ShortTermEntry>,
    pub message_count_since_summary: u32,
    pub last_summarized_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_context_block_start: usize,
}

/// Tri-state result of a summarization pass. Callers must be able to tell
/// "gate closed" apart from "the AI call failed".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SummaryOutcome {
    /// A new summary/narrative was produced and persisted.
    Updated(String),
    /// The gate was closed (or the model answered that nothing is needed).
    NoNeed,
    /// The AI call or a store write failed; logged, never fatal.
    Failed,
}
