//! The five-pass orchestration that turns grouped seat rows into resolved
//! master-entity links (§4.7).
//!
//! Grounded on `examples/original_source/match-and-link-counselling/
//! enhanced_4pass_matcher.py`'s staged-pass structure (try strict, loosen,
//! try alias-expanded, fall back to phonetic, else queue) and the
//! extractor's `rayon`-driven batch-processing loop in `main.rs` for the
//! per-group work distribution and retry/backoff shape.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rayon::prelude::*;
use rustc_hash::FxHashSet;
use strsim::levenshtein;

use crate::alias::AliasStore;
use crate::candidate_gen::CandidateGenerator;
use crate::config::Config;
use crate::course_stream::CourseStreamMapper;
use crate::error::MatchError;
use crate::llm::{LlmCache, LlmProvider};
use crate::master_index::{is_ultra_generic, CourseIndex, MasterIndex, StateRegistry};
use crate::models::{
    Candidate, CanonicalStateName, CourseId, GroupEntry, MatchRequest, MatchingStats, PassCounts,
    Provenance, ScoredMatch, StateId,
};
use crate::normalize::{extract_six_digit_codes, normalize_for_exact, tokenize};
use crate::row_store::{ReviewEntry, RowStore};
use crate::scoring::score;
use crate::state_alias::StateAliaser;
use crate::verifier::{Verifier, VerifierOutcome};

/// Two candidates within this margin of each other, both above the accept
/// threshold, are an `AmbiguousMatch` (§7): neither is auto-resolved, and
/// the group is routed to review rather than silently taking the
/// tie-break winner.
const AMBIGUITY_MARGIN: f64 = 0.01;

const MAX_ROW_STORE_RETRIES: u32 = 3;

/// Outcome of processing one group, for roll-up into `MatchingStats`.
enum GroupOutcome {
    Matched { pass: u8 },
    Rejected,
    Queued,
    /// The cancellation token was observed before this group's pass began
    /// (§5 "Cancellation"); the group is left untouched in its pre-pass
    /// state rather than counted as matched/rejected/queued.
    Cancelled,
}

/// Rewrites the scorer's `pass1_stream_...` label to reflect which pass
/// actually produced the accepted match (§4.6 "Method label", §8 scenarios 1
/// and 4: the recorded method must name the pass and, for Pass 2, the alias
/// rule that fired). Only the `pass1_stream_` prefix is replaced; the
/// provenance/dominant-boost suffix — including a trailing
/// `address_guard_failed` the Verifier checks for — is left untouched.
fn retag_method(method: &str, pass: u8, alias_fired: Option<&str>) -> String {
    if pass == 1 {
        return method.to_string();
    }
    let rest = method.strip_prefix("pass1_stream_").unwrap_or(method);
    match pass {
        2 => match alias_fired {
            Some(alias) => format!("pass2_alias_expansion+alias_match:{alias}+stream_{rest}"),
            None => format!("pass2_alias_expansion+stream_{rest}"),
        },
        3 => format!("pass3_address_driven+stream_{rest}"),
        _ => format!("pass4_phonetic_fallback+stream_{rest}"),
    }
}

/// Drives the whole `match` invocation over an already-built `MasterIndex`/
/// `CourseIndex`/`StateRegistry` triple (refreshed by the caller via
/// `cache::rebuild_all` whenever `CacheLayer` reports a change), fanning
/// per-group work out across a rayon pool.
pub struct PipelineOrchestrator<'a> {
    config: &'a Config,
    row_store: &'a dyn RowStore,
    master_index: &'a MasterIndex,
    course_index: &'a CourseIndex,
    state_registry: &'a StateRegistry,
    state_aliaser: StateAliaser,
    course_mapper: CourseStreamMapper,
    alias_store: &'a AliasStore,
    llm_providers: &'a [Box<dyn LlmProvider>],
    pass_max: Option<usize>,
    cancel: Arc<AtomicBool>,
}

impl<'a> PipelineOrchestrator<'a> {
    pub fn new(
        config: &'a Config,
        row_store: &'a dyn RowStore,
        master_index: &'a MasterIndex,
        course_index: &'a CourseIndex,
        state_registry: &'a StateRegistry,
        alias_store: &'a AliasStore,
        llm_providers: &'a [Box<dyn LlmProvider>],
    ) -> Self {
        PipelineOrchestrator {
            config,
            row_store,
            master_index,
            course_index,
            state_registry,
            state_aliaser: StateAliaser::new(),
            course_mapper: CourseStreamMapper::from_overrides(&config.streams.priority_overrides),
            alias_store,
            llm_providers,
            pass_max: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Caps the per-request candidate set below the built-in default
    /// (`candidate_gen::DEFAULT_K`), for operators debugging one pass at a
    /// time via `match --pass-max K`.
    pub fn with_pass_max(mut self, pass_max: usize) -> Self {
        self.pass_max = Some(pass_max);
        self
    }

    /// Shares a cancellation flag with the caller (§5): the run loop checks
    /// it at every group boundary and, once set, leaves all remaining groups
    /// untouched instead of starting their pass. Whoever owns the `Arc` is
    /// responsible for flipping it, e.g. from a signal handler installed
    /// around the `match` invocation.
    pub fn with_cancel_token(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Runs every group in the row store through the five passes, returning
    /// aggregate statistics. Groups are processed independently (§5), so
    /// this parallelizes across the configured rayon pool; each group's
    /// `LlmCache` lookups/writes are thread-local, merged once the pool
    /// drains.
    pub fn run(&self) -> Result<MatchingStats, MatchError> {
        let started = Instant::now();
        let groups = self.row_store.groups()?;
        let total_groups = groups.len() as u64;

        let outcomes: Vec<Result<GroupOutcome, MatchError>> = groups
            .par_iter()
            .map(|group| {
                if self.cancel.load(Ordering::Relaxed) {
                    return Ok(GroupOutcome::Cancelled);
                }
                self.process_group_with_retry(group)
            })
            .collect();

        let mut stats = MatchingStats {
            total_groups,
            ..Default::default()
        };
        let mut pass_counts = PassCounts::default();

        for outcome in outcomes {
            match outcome? {
                GroupOutcome::Matched { pass } => {
                    stats.matched_groups += 1;
                    stats.verified_groups += 1;
                    match pass {
                        1 => pass_counts.pass1 += 1,
                        2 => pass_counts.pass2 += 1,
                        3 => pass_counts.pass3 += 1,
                        _ => pass_counts.pass4 += 1,
                    }
                }
                GroupOutcome::Rejected => stats.rejected_groups += 1,
                GroupOutcome::Queued => {
                    stats.queued_groups += 1;
                    pass_counts.pass5_queued += 1;
                }
                GroupOutcome::Cancelled => stats.cancelled = true,
            }
        }
        stats.pass_counts = pass_counts;
        stats.elapsed_ms = started.elapsed().as_millis() as u64;
        stats.log_phase("match_complete");
        Ok(stats)
    }

    fn process_group_with_retry(&self, group: &GroupEntry) -> Result<GroupOutcome, MatchError> {
        let mut attempt = 0;
        loop {
            match self.process_group(group) {
                Ok(outcome) => return Ok(outcome),
                Err(e) if !e.is_fatal() && attempt < MAX_ROW_STORE_RETRIES => {
                    attempt += 1;
                    thread::sleep(Duration::from_millis(100 * 2u64.pow(attempt)));
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn process_group(&self, group: &GroupEntry) -> Result<GroupOutcome, MatchError> {
        let rows = self.row_store.fetch_group(group)?;
        let Some(first) = rows.first() else {
            return Ok(GroupOutcome::Rejected);
        };

        let request = MatchRequest {
            college: group.normalized_college.clone(),
            state: group.normalized_state.clone().unwrap_or_else(|| first.raw_state.clone()),
            address: group.normalized_address.clone(),
            course: first.raw_course.clone(),
            course_type: group.course_type.clone(),
        };

        let mut generator = CandidateGenerator::new(
            self.master_index,
            &self.state_aliaser,
            &self.course_mapper,
            self.config.thresholds.accept,
        );
        if let Some(k) = self.pass_max {
            generator = generator.with_k(k);
        }

        let mut llm_cache = LlmCache::new();
        let verifier = Verifier::new(self.llm_providers, &self.config.llm, &self.config.thresholds);

        // Pass 1: stream-filtered state + name, strict accept threshold.
        let pass1 = generator.generate(&request, &first.raw_college, first.raw_address.as_deref());
        let sorted = self.scored_sorted(&request, &pass1.candidates, pass1.canonical_state.as_ref());
        if let Some(top_scores) = self.ambiguous(&sorted) {
            return self.queue_ambiguous(group, pass1.canonical_state.is_none(), top_scores);
        }
        if let Some(best) = sorted.into_iter().next() {
            if best.score >= self.config.thresholds.accept {
                return self.finalize(group, &request, 1, best, &verifier, &mut llm_cache);
            }
        }

        // Pass 2: alias expansion, rerunning Pass 1's logic on the substituted name.
        if let Some((expanded_raw, fired)) = self.alias_store.college.expand(&first.raw_college) {
            let fired = fired.to_string();
            let mut aliased_request = request.clone();
            aliased_request.college = normalize_for_exact(&expanded_raw);
            let pass2 = generator.generate(&aliased_request, &expanded_raw, first.raw_address.as_deref());
            let sorted = self.scored_sorted(&aliased_request, &pass2.candidates, pass2.canonical_state.as_ref());
            if let Some(top_scores) = self.ambiguous(&sorted) {
                return self.queue_ambiguous(group, pass2.canonical_state.is_none(), top_scores);
            }
            if let Some(mut best) = sorted.into_iter().next() {
                if best.score >= self.config.thresholds.accept {
                    best.method = retag_method(&best.method, 2, Some(&fired));
                    return self.finalize(group, &aliased_request, 2, best, &verifier, &mut llm_cache);
                }
            }
        }

        // Pass 3: address/code-driven disambiguation for ultra-generic
        // names (§4.7): requires the seat address to embed either a known
        // six-digit code matching the pool college's own address/pincode,
        // or >=2 location keywords coinciding with that college's address.
        // This scans the full state+stream pool directly against each
        // college's own address text rather than re-filtering Pass 1's
        // already-scored candidate set, since every composite/code-in-
        // address candidate Pass 1 found was already tried there at the
        // same accept threshold.
        if is_ultra_generic(&request.college) {
            if let Some(canonical_state) = pass1.canonical_state.as_ref() {
                let address_driven =
                    self.address_driven_candidates(&request, canonical_state, &pass1.streams_tried);
                let sorted = self.scored_sorted(&request, &address_driven, Some(canonical_state));
                if let Some(top_scores) = self.ambiguous(&sorted) {
                    return self.queue_ambiguous(group, false, top_scores);
                }
                if let Some(mut best) = sorted.into_iter().next() {
                    if best.score >= self.config.thresholds.accept {
                        best.method = retag_method(&best.method, 3, None);
                        return self.finalize(group, &request, 3, best, &verifier, &mut llm_cache);
                    }
                }
            }
        }

        // Pass 4: phonetic/TF-IDF fallback in [pass4_phonetic, accept), never
        // for ultra-generic names, and only when the top candidate is
        // unambiguously ahead of the runner-up.
        if !is_ultra_generic(&request.college) {
            let fallback: Vec<Candidate> = pass1
                .candidates
                .iter()
                .filter(|c| matches!(c.provenance, Provenance::PhoneticBucket | Provenance::FtsKeyword))
                .cloned()
                .collect();
            let mut scored: Vec<ScoredMatch> = fallback
                .iter()
                .map(|c| {
                    score(
                        &request,
                        c.college.stream,
                        c,
                        self.master_index,
                        &self.config.weights,
                        pass1.canonical_state.as_ref(),
                        self.config.thresholds.ultra_generic_address,
                        self.config.thresholds.pass4_phonetic,
                    )
                })
                .collect();
            scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
            if let Some(top) = scored.first() {
                let unique = scored
                    .get(1)
                    .map(|runner_up| top.score - runner_up.score > 0.05)
                    .unwrap_or(true);
                if unique
                    && top.score >= self.config.thresholds.pass4_phonetic
                    && top.score < self.config.thresholds.accept
                {
                    let mut best = top.clone();
                    best.method = retag_method(&best.method, 4, None);
                    return self.finalize(group, &request, 4, best, &verifier, &mut llm_cache);
                }
            }
        }

        // Pass 5: no confident auto-match. Queue the top 3 candidates
        // (by whatever scoring we've already computed) for human review.
        let mut all_scored: Vec<ScoredMatch> = pass1
            .candidates
            .iter()
            .map(|c| {
                score(
                    &request,
                    c.college.stream,
                    c,
                    self.master_index,
                    &self.config.weights,
                    pass1.canonical_state.as_ref(),
                    self.config.thresholds.ultra_generic_address,
                    self.config.thresholds.pass4_phonetic,
                )
            })
            .collect();
        all_scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
        all_scored.truncate(3);

        self.row_store.queue_for_review(&ReviewEntry {
            group_signature: group.signature(),
            top_candidates: all_scored,
        })?;
        self.row_store.update_group_match(
            group, None, None, None, None, None, false,
            pass1.canonical_state.is_none(),
        )?;
        Ok(GroupOutcome::Queued)
    }

    /// Pass 3's own candidate source (§4.7): scans every college in
    /// `streams` (state+stream pools, in priority order, stopping at the
    /// first stream with any hit) and keeps those whose *own* address text
    /// coincides with the seat address — either a shared six-digit code, or
    /// at least two shared location keywords — independent of whichever
    /// narrower candidates the generator ladder surfaced for this group.
    /// Grounded on `enhanced_4pass_matcher.py::_pass4_enhanced_disambiguation`'s
    /// location-keyword-coincidence scoring (`_extract_location_keywords`).
    fn address_driven_candidates(
        &self,
        request: &MatchRequest,
        canonical_state: &CanonicalStateName,
        streams: &[crate::models::Stream],
    ) -> Vec<Candidate> {
        let Some(seat_address) = request.address.as_deref() else {
            return Vec::new();
        };
        let seat_tokens = tokenize(seat_address);
        let seat_codes: FxHashSet<String> = extract_six_digit_codes(seat_address).into_iter().collect();
        if seat_codes.is_empty() && seat_tokens.len() < 2 {
            return Vec::new();
        }

        for stream in streams {
            let pool = self.master_index.state_pool(canonical_state, *stream);
            let mut out = Vec::new();
            for id in pool {
                let Some(college) = self.master_index.get(id) else { continue };
                let code_match = college
                    .pincode
                    .as_deref()
                    .map(|p| seat_codes.contains(p))
                    .unwrap_or(false)
                    || extract_six_digit_codes(&college.address)
                        .iter()
                        .any(|code| seat_codes.contains(code));
                let shared_keywords = college
                    .location_keywords
                    .iter()
                    .filter(|k| seat_tokens.contains(*k))
                    .count();
                if code_match {
                    out.push(Candidate {
                        college: college.clone(),
                        provenance: Provenance::CodeInAddress,
                        prescore: 0.95,
                    });
                } else if shared_keywords >= 2 {
                    out.push(Candidate {
                        college: college.clone(),
                        provenance: Provenance::AddressKeywordMatch,
                        prescore: 0.6,
                    });
                }
            }
            if !out.is_empty() {
                return out;
            }
        }
        Vec::new()
    }

    /// Scores every candidate, sorted best-first: ties broken by higher
    /// prescore, then shorter edit distance between the candidate's
    /// composite key and the seat's own, then the lower `CollegeId` for a
    /// fully stable order (§4.7 "Tie-breaking").
    fn scored_sorted(
        &self,
        request: &MatchRequest,
        candidates: &[Candidate],
        canonical_state: Option<&crate::models::CanonicalStateName>,
    ) -> Vec<ScoredMatch> {
        if candidates.is_empty() {
            return Vec::new();
        }
        let seat_key = format!("{}, {}", request.college, request.address.as_deref().unwrap_or(""));
        let mut scored: Vec<ScoredMatch> = candidates
            .iter()
            .map(|c| {
                score(
                    request,
                    c.college.stream,
                    c,
                    self.master_index,
                    &self.config.weights,
                    canonical_state,
                    self.config.thresholds.ultra_generic_address,
                    self.config.thresholds.pass4_phonetic,
                )
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap()
                .then_with(|| b.candidate.prescore.partial_cmp(&a.candidate.prescore).unwrap())
                .then_with(|| {
                    let da = levenshtein(&seat_key, &a.candidate.college.composite_key);
                    let db = levenshtein(&seat_key, &b.candidate.college.composite_key);
                    da.cmp(&db)
                })
                .then_with(|| a.candidate.college.id.cmp(&b.candidate.college.id))
        });
        scored
    }

    /// Returns the top two scores when they both clear the accept threshold
    /// and sit within `AMBIGUITY_MARGIN` of each other (§7 "AmbiguousMatch"):
    /// neither candidate is auto-resolved in that case, however confident
    /// the tie-break order above would otherwise make one look.
    fn ambiguous(&self, sorted: &[ScoredMatch]) -> Option<Vec<f64>> {
        let top = sorted.first()?;
        let runner_up = sorted.get(1)?;
        if top.score >= self.config.thresholds.accept
            && runner_up.score >= self.config.thresholds.accept
            && (top.score - runner_up.score).abs() <= AMBIGUITY_MARGIN
        {
            Some(vec![top.score, runner_up.score])
        } else {
            None
        }
    }

    fn queue_ambiguous(
        &self,
        group: &GroupEntry,
        state_unresolved: bool,
        top_scores: Vec<f64>,
    ) -> Result<GroupOutcome, MatchError> {
        let reason = MatchError::AmbiguousMatch {
            group_signature: group.signature(),
            top_scores,
        };
        eprintln!("[ambiguous_match] {reason}");
        self.row_store.queue_for_review(&ReviewEntry {
            group_signature: group.signature(),
            top_candidates: Vec::new(),
        })?;
        self.row_store.update_group_match(
            group, None, None, None, None, None, false, state_unresolved,
        )?;
        Ok(GroupOutcome::Queued)
    }

    /// Resolves the two cascading identifiers once college matching has
    /// picked a winner (§4.7): `master_course_id` from the seat's course
    /// name under the matched college's stream, `master_state_id` from the
    /// canonical state already used to score the match. Either may be
    /// `None` when the lookup misses; the college link is never withheld
    /// on their account.
    fn resolve_course_and_state(
        &self,
        request: &MatchRequest,
        best: &ScoredMatch,
        canonical_state: Option<&crate::models::CanonicalStateName>,
    ) -> (Option<CourseId>, Option<StateId>) {
        let course_id = self.course_index.resolve(&request.course, best.candidate.college.stream);
        let state_id = canonical_state.and_then(|s| self.state_registry.resolve(s));
        (course_id, state_id)
    }

    fn finalize(
        &self,
        group: &GroupEntry,
        request: &MatchRequest,
        pass: u8,
        best: ScoredMatch,
        verifier: &Verifier,
        llm_cache: &mut LlmCache,
    ) -> Result<GroupOutcome, MatchError> {
        let canonical_state = self.state_aliaser.canonicalize(&request.state);
        match verifier.verify(request, group, &best, llm_cache) {
            VerifierOutcome::Verified => {
                let (course_id, state_id) =
                    self.resolve_course_and_state(request, &best, canonical_state.as_ref());
                self.row_store.update_group_match(
                    group,
                    Some(best.candidate.college.id),
                    course_id,
                    state_id,
                    Some(best.score),
                    Some(&best.method),
                    true,
                    best.components.state_mismatch,
                )?;
                Ok(GroupOutcome::Matched { pass })
            }
            VerifierOutcome::Rejected { reason } => {
                eprintln!("[guardian_reject] {}: {reason}", group.signature());
                self.row_store.update_group_match(
                    group, None, None, None, None, None, false,
                    best.components.state_mismatch,
                )?;
                // §4.8 "Propagation": a rejected match clears the college
                // fields and routes the group to Pass 5 for human review.
                self.row_store.queue_for_review(&ReviewEntry {
                    group_signature: group.signature(),
                    top_candidates: vec![best],
                })?;
                Ok(GroupOutcome::Rejected)
            }
            VerifierOutcome::NeedsReview => {
                self.row_store.queue_for_review(&ReviewEntry {
                    group_signature: group.signature(),
                    top_candidates: vec![best],
                })?;
                Ok(GroupOutcome::Queued)
            }
        }
    }
}
