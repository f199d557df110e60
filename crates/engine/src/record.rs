//! Failure bookkeeping for policy-sanctioned halts.

use uuid::Uuid;

/// Which scope a halt aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltKind {
    /// Only the item being processed was aborted; the batch continued.
    Item,
    /// The whole batch was aborted.
    Engine,
}

/// Which pipeline phase a rule ran in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// The single flat pipeline of a single-object engine.
    Single,
    /// Input-only rules of a dual-object pipeline.
    Pre,
    /// Joint input/output rules of a dual-object pipeline.
    Main,
    /// Output-only rules of a dual-object pipeline, run once per batch.
    Post,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Single => "single",
            Self::Pre => "pre",
            Self::Main => "main",
            Self::Post => "post",
        };
        f.write_str(s)
    }
}

/// A record of the most recent policy-sanctioned halt.
///
/// Stored on the engine as the last failure, overwritten on each new halt
/// and cleared at the start of the next top-level apply call. Escalated
/// errors are not recorded here — they propagate to the caller instead.
/// The trace id ties the record back to the context the caller still
/// holds, which carries any typed input/output state the rule touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    /// Item or engine scope.
    pub kind: HaltKind,
    /// Name of the failing rule.
    pub rule: String,
    /// Phase the rule ran in.
    pub phase: Phase,
    /// Trace id of the context active when the halt occurred.
    pub trace_id: Uuid,
    /// Index of the item being processed, when processing a batch.
    pub item_index: Option<usize>,
    /// Rendered failure message.
    pub message: String,
}
