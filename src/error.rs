//! Typed error kinds for the matching core.
//!
//! CLI and other call-in-process boundaries use `anyhow::Result` and attach
//! context with `.context(...)`; internal library code returns `MatchError`
//! so callers can branch on kind per the error-handling policy table.

use thiserror::Error;

/// One group's worth of work failed to be matched or persisted.
#[derive(Debug, Error)]
pub enum MatchError {
    /// Unreachable in well-formed input; normalization never actually fails,
    /// this only fires on pathological inputs (e.g. not valid UTF-8 after
    /// lossy conversion produced an empty token stream where one was required).
    #[error("normalization overflow on input: {0}")]
    NormalizationOverflow(String),

    /// The raw state string did not resolve to any canonical state. Not
    /// fatal: scoring continues with a `-0.1` penalty on every candidate.
    #[error("state could not be resolved: {raw}")]
    StateUnresolved { raw: String },

    /// `CandidateGenerator` produced zero candidates for this group. Not an
    /// error in the usual sense; the orchestrator advances to the next pass.
    #[error("no candidates for group {group_signature}")]
    NoCandidates { group_signature: String },

    /// Two or more candidates scored within 0.01 of each other, both above
    /// the pass's accept threshold. Routed to review, never auto-resolved.
    #[error("ambiguous match for group {group_signature}: top scores {top_scores:?}")]
    AmbiguousMatch {
        group_signature: String,
        top_scores: Vec<f64>,
    },

    /// Stage A guardian rejected a proposed match.
    #[error("guardian rejected match: {reason}")]
    GuardianReject { reason: String },

    /// Stage B LLM call exceeded its soft or hard timeout. Recorded as an
    /// ABSTAIN vote; consensus is computed over the remaining votes.
    #[error("LLM call timed out after {elapsed_ms}ms (model {model})")]
    LlmTimeout { model: String, elapsed_ms: u64 },

    /// Stage B LLM provider returned a malformed or error response.
    #[error("LLM provider error (model {model}): {detail}")]
    LlmProviderError { model: String, detail: String },

    /// Row store read/write failed. Per-group rollback and retry (3
    /// attempts, exponential backoff) is attempted before this escalates.
    #[error("row store error: {0}")]
    RowStoreError(String),

    /// MasterIndex failed to build or was found corrupt at load time.
    /// Fatal: the process aborts with exit code 3.
    #[error("master index corruption: {0}")]
    MasterIndexCorruption(String),
}

impl MatchError {
    /// True for error kinds that should abort the whole run rather than
    /// being recorded against a single group.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MatchError::MasterIndexCorruption(_))
    }
}
