//! Core data model: canonical master entities and row-store entities.
//!
//! Strong record types replace the source's dict-of-dict records (§9
//! redesign flag); missing fields are modeled as `Option`, never as empty
//! strings.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// One of the three coarse streams that gate candidate generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stream {
    Medical,
    Dental,
    Dnb,
}

impl Stream {
    pub fn as_str(self) -> &'static str {
        match self {
            Stream::Medical => "MEDICAL",
            Stream::Dental => "DENTAL",
            Stream::Dnb => "DNB",
        }
    }
}

impl std::fmt::Display for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `MasterCourse.stream` additionally allows `MIXED` (a course valid across
/// more than one stream, e.g. a generic "DIPLOMA").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CourseStream {
    Medical,
    Dental,
    Dnb,
    Mixed,
}

macro_rules! newtype_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

newtype_id!(CollegeId);
newtype_id!(CourseId);
newtype_id!(StateId);

/// A closed enumeration of 35 canonical Indian states and union territories.
/// See [`crate::state_alias`] for the alias table that resolves raw strings
/// to one of these.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CanonicalStateName(pub Arc<str>);

impl std::fmt::Display for CanonicalStateName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl CanonicalStateName {
    pub fn new(s: impl Into<Arc<str>>) -> Self {
        CanonicalStateName(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A single canonical college in the master catalogue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterCollege {
    pub id: CollegeId,
    pub name: String,
    pub address: String,
    pub state: CanonicalStateName,
    pub stream: Stream,
    pub normalized_name: String,
    /// `"{normalized_name}, {normalized_address}"`, upper-case, trimmed.
    pub composite_key: String,
    pub normalized_address: String,
    pub location_keywords: BTreeSet<String>,
    pub pincode: Option<String>,
}

/// A single canonical course offered somewhere in the catalogue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterCourse {
    pub id: CourseId,
    pub name: String,
    pub normalized_name: String,
    pub stream: CourseStream,
}

/// One of the 35 canonical states/UTs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterState {
    pub id: StateId,
    pub name: CanonicalStateName,
}

/// `(state, college)` pair. Invariant: a given `composite_key` appears in
/// exactly one state (enforced when the master snapshot is built).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateCollegeLink {
    pub state_id: StateId,
    pub college_id: CollegeId,
    pub composite_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AliasKind {
    College,
    Course,
    State,
    Abbreviation,
}

/// A known alternate spelling mapped to a canonical target. `confidence`
/// lets hand-curated aliases be weighted lower than machine-derived ones,
/// though in practice all built-in aliases carry confidence 1.0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alias {
    pub alias_text: String,
    pub canonical_target: String,
    pub kind: AliasKind,
    pub confidence: f64,
}

/// A raw row as ingested from a loader, mutated only by the matching core
/// (match columns) and the Verifier (`verified`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeatRow {
    pub row_id: String,
    pub raw_college: String,
    pub raw_state: String,
    pub raw_course: String,
    pub raw_address: Option<String>,
    pub course_type: Option<String>,

    pub normalized_college: String,
    pub normalized_state: Option<String>,
    pub normalized_address: Option<String>,

    pub master_college_id: Option<CollegeId>,
    pub master_course_id: Option<CourseId>,
    pub master_state_id: Option<StateId>,

    pub college_match_score: Option<f64>,
    pub college_match_method: Option<String>,

    pub verified: bool,

    /// Set when the orchestrator's resolved state disagrees with the raw
    /// state's own canonicalization (§9 open question #4: match wins, but
    /// the row is flagged for operator review).
    pub state_mismatch_flagged: bool,
}

/// The deduplicated unit of matching work. All rows sharing the same key
/// inherit one decision, applied atomically.
#[derive(Debug, Clone)]
pub struct GroupEntry {
    pub normalized_state: Option<String>,
    pub normalized_college: String,
    pub normalized_address: Option<String>,
    pub course_type: Option<String>,
    pub row_count: usize,
}

impl GroupEntry {
    /// Stable string used as the key into the `LLMCache` and in logs.
    pub fn signature(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.normalized_state.as_deref().unwrap_or(""),
            self.normalized_college,
            self.normalized_address.as_deref().unwrap_or(""),
            self.course_type.as_deref().unwrap_or(""),
        )
    }
}

/// Where in the candidate generation pipeline a candidate came from. Carried
/// through to the Scorer's method label for provenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    CompositeExact,
    CodeInAddress,
    ExactNormalizedName,
    FtsKeyword,
    PhoneticBucket,
    /// Pass 3's own direct address-keyword-coincidence check (§4.7): at
    /// least two of the seat address's tokens coincide with a pool
    /// college's `location_keywords`, independent of any candidate the
    /// generator ladder itself surfaced.
    AddressKeywordMatch,
}

impl Provenance {
    pub fn as_str(self) -> &'static str {
        match self {
            Provenance::CompositeExact => "composite_exact",
            Provenance::CodeInAddress => "code_in_address",
            Provenance::ExactNormalizedName => "exact_normalized_name",
            Provenance::FtsKeyword => "fts_keyword",
            Provenance::PhoneticBucket => "phonetic_bucket",
            Provenance::AddressKeywordMatch => "address_keyword_match",
        }
    }
}

/// One member of the candidate set produced for a `MatchRequest`.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub college: Arc<MasterCollege>,
    pub provenance: Provenance,
    pub prescore: f64,
}

/// Inputs to candidate generation; all fields already normalized by the
/// caller (the orchestrator).
#[derive(Debug, Clone)]
pub struct MatchRequest {
    pub college: String,
    pub state: String,
    pub address: Option<String>,
    pub course: String,
    pub course_type: Option<String>,
}

/// Per-component breakdown backing a composite score, retained for
/// provenance/debugging and surfaced in review-queue entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Breakdown {
    pub name_score: f64,
    pub address_score: f64,
    pub pincode_boost: f64,
    pub ner_boost: f64,
    pub prescore_component: f64,
    pub state_mismatch: bool,
}

/// Result of scoring one candidate against a `MatchRequest`.
#[derive(Debug, Clone)]
pub struct ScoredMatch {
    pub candidate: Candidate,
    pub score: f64,
    pub components: Breakdown,
    pub method: String,
}

/// One row-level statistics bucket, rolled up into run-wide `MatchingStats`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PassCounts {
    pub pass1: u64,
    pub pass2: u64,
    pub pass3: u64,
    pub pass4: u64,
    pub pass5_queued: u64,
}

/// Run-wide statistics, exported as JSON at the end of a `match` invocation
/// via the `log_phase`/`write_to_file` instrumentation pattern below.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchingStats {
    pub total_groups: u64,
    pub matched_groups: u64,
    pub verified_groups: u64,
    pub rejected_groups: u64,
    pub queued_groups: u64,
    pub pass_counts: PassCounts,
    pub elapsed_ms: u64,
    /// Set when a cancellation token fired mid-run (§5 "Cancellation");
    /// groups not yet reached are left untouched in their pre-pass state.
    pub cancelled: bool,
}

impl MatchingStats {
    pub fn match_rate(&self) -> f64 {
        if self.total_groups == 0 {
            0.0
        } else {
            self.matched_groups as f64 / self.total_groups as f64
        }
    }

    /// Emit the current stats as a single JSON line to stderr.
    pub fn log_phase(&self, phase: &str) {
        if let Ok(json) = serde_json::to_string(self) {
            eprintln!("[{phase}] {json}");
        }
    }

    pub fn write_to_file(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
