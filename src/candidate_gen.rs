//! Produces a bounded candidate set for a `MatchRequest`, respecting
//! state+stream filters and the ultra-generic-name guard (§4.5).
//!
//! Grounded on `examples/original_source/pass_1_stream_filtering.py`'s
//! per-stream candidate search (state pool narrowing, keyword-overlap
//! pre-filter, address validation before accepting a candidate) and
//! `enhanced_4pass_matcher.py`'s multi-strategy union-then-dedup shape,
//! generalized into the five-generator ladder spec.md §4.5 names.

use rustc_hash::FxHashSet;

use crate::course_stream::CourseStreamMapper;
use crate::master_index::{is_ultra_generic, MasterIndex};
use crate::models::{Candidate, CanonicalStateName, MatchRequest, Provenance, Stream};
use crate::normalize::{extract_six_digit_codes, normalize_for_exact, phonetic_key, tokenize};
use crate::state_alias::StateAliaser;

/// Default bound on the number of candidates returned for one request.
pub const DEFAULT_K: usize = 25;

/// Outcome of a full `generate` call: the candidate set, the canonical state
/// resolved from the request (if any), and the streams that were actually
/// searched, in priority order.
pub struct GenerationResult {
    pub candidates: Vec<Candidate>,
    pub canonical_state: Option<CanonicalStateName>,
    pub streams_tried: Vec<Stream>,
}

pub struct CandidateGenerator<'a> {
    index: &'a MasterIndex,
    state_aliaser: &'a StateAliaser,
    course_mapper: &'a CourseStreamMapper,
    k: usize,
    accept_threshold: f64,
}

impl<'a> CandidateGenerator<'a> {
    pub fn new(
        index: &'a MasterIndex,
        state_aliaser: &'a StateAliaser,
        course_mapper: &'a CourseStreamMapper,
        accept_threshold: f64,
    ) -> Self {
        CandidateGenerator {
            index,
            state_aliaser,
            course_mapper,
            k: DEFAULT_K,
            accept_threshold,
        }
    }

    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    /// `raw_college`/`raw_address` are the pre-normalization source strings,
    /// needed to build `composite_key` with `normalize_for_exact` (which
    /// preserves commas/brackets that `request.college`/`request.address`,
    /// already folded via the display-free `normalize()`, have discarded).
    pub fn generate(
        &self,
        request: &MatchRequest,
        raw_college: &str,
        raw_address: Option<&str>,
    ) -> GenerationResult {
        let canonical_state = self.state_aliaser.canonicalize(&request.state);
        let state_penalty = if canonical_state.is_some() { 0.0 } else { -0.1 };
        let streams = self.course_mapper.streams_for(&request.course);

        let mut first_nonempty: Option<(Vec<Candidate>, Stream)> = None;
        let mut tried = Vec::new();

        for stream in &streams {
            tried.push(*stream);
            let candidates = match &canonical_state {
                Some(state) => self.generate_for_stream(
                    request,
                    raw_college,
                    raw_address,
                    state,
                    *stream,
                    state_penalty,
                ),
                None => self.generate_without_state(request, raw_college, raw_address, *stream, state_penalty),
            };

            if candidates.is_empty() {
                continue;
            }

            let meets_threshold = candidates
                .iter()
                .any(|c| c.prescore >= self.accept_threshold);

            if meets_threshold {
                return GenerationResult {
                    candidates,
                    canonical_state,
                    streams_tried: tried,
                };
            }

            if first_nonempty.is_none() {
                first_nonempty = Some((candidates, *stream));
            }
        }

        let candidates = first_nonempty.map(|(c, _)| c).unwrap_or_default();
        GenerationResult {
            candidates,
            canonical_state,
            streams_tried: tried,
        }
    }

    /// §4.5 step 1: "no resolved state defers to fallback scanning, every
    /// candidate penalized" — the full five-generator ladder still runs,
    /// just against a stream-wide pool (`MasterIndex::stream_pool`) instead
    /// of a single `(state, stream)` pool, since without a canonical state
    /// there is no state pool to narrow to. Every candidate already carries
    /// `state_penalty` via each generator's own `prescore` arithmetic.
    fn generate_without_state(
        &self,
        request: &MatchRequest,
        raw_college: &str,
        raw_address: Option<&str>,
        stream: Stream,
        state_penalty: f64,
    ) -> Vec<Candidate> {
        let mut out: Vec<Candidate> = Vec::new();
        let mut seen: FxHashSet<crate::models::CollegeId> = FxHashSet::default();
        let ultra_generic = is_ultra_generic(&request.college);
        let pool = self.index.stream_pool(stream);

        self.composite_exact(request, raw_college, raw_address, &mut out, state_penalty);
        for c in &out {
            seen.insert(c.college.id);
        }
        if out.len() >= self.k {
            out.truncate(self.k);
            return out;
        }

        self.code_in_address(request, raw_address, None, &mut out, &mut seen, ultra_generic, state_penalty);
        if out.len() >= self.k {
            out.truncate(self.k);
            return out;
        }

        self.exact_normalized_name(request, &pool, &mut out, &mut seen, ultra_generic, state_penalty);
        if out.len() >= self.k {
            out.truncate(self.k);
            return out;
        }

        self.fts_intersection(request, &pool, &mut out, &mut seen, ultra_generic, state_penalty);
        if out.len() >= self.k {
            out.truncate(self.k);
            return out;
        }

        self.phonetic_bucket(request, &pool, &mut out, &mut seen, ultra_generic, state_penalty);

        out.truncate(self.k);
        out
    }

    fn generate_for_stream(
        &self,
        request: &MatchRequest,
        raw_college: &str,
        raw_address: Option<&str>,
        state: &CanonicalStateName,
        stream: Stream,
        state_penalty: f64,
    ) -> Vec<Candidate> {
        let mut out: Vec<Candidate> = Vec::new();
        let mut seen: FxHashSet<crate::models::CollegeId> = FxHashSet::default();
        let pool = self.index.state_pool(state, stream);

        self.composite_exact(request, raw_college, raw_address, &mut out, state_penalty);
        for c in &out {
            seen.insert(c.college.id);
        }
        if out.len() >= self.k {
            out.truncate(self.k);
            return out;
        }

        // Ultra-generic guard: generators b-e each individually suppress a
        // candidate unless a location keyword from its master address also
        // appears in the seat address (checked per-candidate below).
        let ultra_generic = is_ultra_generic(&request.college);

        self.code_in_address(request, raw_address, Some(state), &mut out, &mut seen, ultra_generic, state_penalty);
        if out.len() >= self.k {
            out.truncate(self.k);
            return out;
        }

        self.exact_normalized_name(request, &pool, &mut out, &mut seen, ultra_generic, state_penalty);
        if out.len() >= self.k {
            out.truncate(self.k);
            return out;
        }

        self.fts_intersection(request, &pool, &mut out, &mut seen, ultra_generic, state_penalty);
        if out.len() >= self.k {
            out.truncate(self.k);
            return out;
        }

        self.phonetic_bucket(request, &pool, &mut out, &mut seen, ultra_generic, state_penalty);

        out.truncate(self.k);
        out
    }

    fn composite_exact(
        &self,
        request: &MatchRequest,
        raw_college: &str,
        raw_address: Option<&str>,
        out: &mut Vec<Candidate>,
        state_penalty: f64,
    ) {
        let Some(raw_address) = raw_address.or(request.address.as_deref()) else {
            return;
        };
        let composite_key = format!(
            "{}, {}",
            normalize_for_exact(raw_college),
            normalize_for_exact(raw_address)
        );
        if let Some(id) = self.index.composite_key_lookup(&composite_key) {
            if let Some(college) = self.index.get(id) {
                out.push(Candidate {
                    college: college.clone(),
                    provenance: Provenance::CompositeExact,
                    prescore: (1.0 + state_penalty).max(0.0),
                });
            }
        }
    }

    /// `state` restricts to a single canonical state when one was resolved;
    /// `None` (the §4.5 step 1 fallback-scanning path) scans every state's
    /// colleges for a matching code, relying on `state_penalty` already
    /// baked into `prescore` to flag the result as unconfirmed.
    fn code_in_address(
        &self,
        request: &MatchRequest,
        raw_address: Option<&str>,
        state: Option<&CanonicalStateName>,
        out: &mut Vec<Candidate>,
        seen: &mut FxHashSet<crate::models::CollegeId>,
        ultra_generic: bool,
        state_penalty: f64,
    ) {
        let Some(address) = raw_address.or(request.address.as_deref()) else {
            return;
        };
        let seat_tokens = tokenize(address);
        for code in extract_six_digit_codes(address) {
            for id in self.index.code_in_address_lookup(&code) {
                if seen.contains(id) {
                    continue;
                }
                let Some(college) = self.index.get(*id) else { continue };
                if let Some(state) = state {
                    if &college.state != state {
                        continue;
                    }
                }
                if ultra_generic
                    && college
                        .location_keywords
                        .intersection(&seat_tokens.iter().cloned().collect())
                        .next()
                        .is_none()
                {
                    continue;
                }
                seen.insert(*id);
                out.push(Candidate {
                    college: college.clone(),
                    provenance: Provenance::CodeInAddress,
                    prescore: (0.95 + state_penalty).max(0.0),
                });
            }
        }
    }

    fn exact_normalized_name(
        &self,
        request: &MatchRequest,
        pool: &FxHashSet<crate::models::CollegeId>,
        out: &mut Vec<Candidate>,
        seen: &mut FxHashSet<crate::models::CollegeId>,
        ultra_generic: bool,
        state_penalty: f64,
    ) {
        let seat_tokens = request.address.as_deref().map(tokenize);
        for id in self.index.normalized_name_lookup(&request.college) {
            if seen.contains(id) || !pool.contains(id) {
                continue;
            }
            let Some(college) = self.index.get(*id) else { continue };
            if ultra_generic && !self.location_overlap_ok(college, &seat_tokens) {
                continue;
            }
            seen.insert(*id);
            out.push(Candidate {
                college: college.clone(),
                provenance: Provenance::ExactNormalizedName,
                prescore: (0.9 + state_penalty).max(0.0),
            });
        }
    }

    fn fts_intersection(
        &self,
        request: &MatchRequest,
        pool: &FxHashSet<crate::models::CollegeId>,
        out: &mut Vec<Candidate>,
        seen: &mut FxHashSet<crate::models::CollegeId>,
        ultra_generic: bool,
        state_penalty: f64,
    ) {
        if pool.is_empty() {
            return;
        }
        let query_tokens = tokenize(&request.college);
        let seat_address_tokens = request.address.as_deref().map(tokenize);
        let ranked = self.index.fts().search(&query_tokens, pool);
        let max_score = ranked.first().map(|(_, s)| *s).unwrap_or(1.0).max(1.0);

        for (id, raw_score) in ranked {
            if seen.contains(&id) {
                continue;
            }
            let Some(college) = self.index.get(id) else { continue };
            if ultra_generic && !self.location_overlap_ok(college, &seat_address_tokens) {
                continue;
            }
            // Scale idf-weighted scores into the documented [0.5, 0.9] band.
            let normalized = 0.5 + 0.4 * (raw_score / max_score).clamp(0.0, 1.0);
            seen.insert(id);
            out.push(Candidate {
                college: college.clone(),
                provenance: Provenance::FtsKeyword,
                prescore: (normalized + state_penalty).max(0.0),
            });
            if out.len() >= self.k {
                return;
            }
        }
    }

    fn phonetic_bucket(
        &self,
        request: &MatchRequest,
        pool: &FxHashSet<crate::models::CollegeId>,
        out: &mut Vec<Candidate>,
        seen: &mut FxHashSet<crate::models::CollegeId>,
        ultra_generic: bool,
        state_penalty: f64,
    ) {
        if pool.is_empty() {
            return;
        }
        let seat_address_tokens = request.address.as_deref().map(tokenize);
        let tokens = tokenize(&request.college);
        for token in tokens {
            let key = phonetic_key(&token);
            if key.is_empty() {
                continue;
            }
            for id in self.index.phonetic_bucket(&key) {
                if seen.contains(id) || !pool.contains(id) {
                    continue;
                }
                let Some(college) = self.index.get(*id) else { continue };
                if ultra_generic && !self.location_overlap_ok(college, &seat_address_tokens) {
                    continue;
                }
                seen.insert(*id);
                out.push(Candidate {
                    college: college.clone(),
                    provenance: Provenance::PhoneticBucket,
                    prescore: (0.4 + state_penalty).max(0.0),
                });
                if out.len() >= self.k {
                    return;
                }
            }
        }
    }

    fn location_overlap_ok(
        &self,
        college: &crate::models::MasterCollege,
        seat_address_tokens: &Option<FxHashSet<String>>,
    ) -> bool {
        match seat_address_tokens {
            Some(tokens) => college.location_keywords.iter().any(|k| tokens.contains(k)),
            None => false,
        }
    }

}
