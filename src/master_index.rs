//! Builds and holds every lookup structure over the master catalogue
//! (§4.4). Rebuilt wholesale whenever `CacheLayer` detects the master-version
//! hash changed; read-only thereafter, shared across the rayon worker pool.
//!
//! Grounded on the extractor's (`examples/scrolltunes-scrolltunes/...`)
//! `build_fts_index`/`build_lrclib_index` pattern of building owned lookup
//! tables once per run from a `Vec` of rows, generalized here to the seven
//! structures spec.md §4.4 names.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::models::{
    CanonicalStateName, CollegeId, CourseId, CourseStream, MasterCollege, MasterCourse,
    MasterState, StateId, Stream,
};
use crate::normalize::{normalize, phonetic_key, tokenize};

/// Fixed set of college names that are shared by many master entries and
/// therefore require address discrimination before any other generator may
/// fire (§4.5 "ultra-generic guard"). `TALUK HOSPITAL` is included per the
/// open-question decision in SPEC_FULL.md §10.2.
pub const ULTRA_GENERIC_NAMES: &[&str] = &[
    "DISTRICT HOSPITAL",
    "AREA HOSPITAL",
    "GENERAL HOSPITAL",
    "GOVERNMENT HOSPITAL",
    "ESIC HOSPITAL",
    "CIVIL HOSPITAL",
    "TALUK HOSPITAL",
    "SUB DISTRICT HOSPITAL",
    "WOMEN AND CHILDREN HOSPITAL",
];

pub fn is_ultra_generic(normalized_college: &str) -> bool {
    ULTRA_GENERIC_NAMES.contains(&normalized_college)
}

/// Inverted index from token to the set of colleges whose normalized name
/// contains that token, plus the per-term document frequency needed for
/// idf-weighted intersection ranking.
#[derive(Debug, Default)]
pub struct FtsKeywordIndex {
    postings: FxHashMap<String, FxHashSet<CollegeId>>,
    doc_count: usize,
}

impl FtsKeywordIndex {
    fn insert(&mut self, college_id: CollegeId, tokens: &FxHashSet<String>) {
        for token in tokens {
            self.postings.entry(token.clone()).or_default().insert(college_id);
        }
    }

    fn idf(&self, token: &str) -> f64 {
        let df = self.postings.get(token).map(|s| s.len()).unwrap_or(0);
        if df == 0 || self.doc_count == 0 {
            0.0
        } else {
            ((self.doc_count as f64 + 1.0) / (df as f64 + 1.0)).ln() + 1.0
        }
    }

    /// Retrieve postings for `query_tokens`, ranked by the sum of idf over
    /// intersected tokens (descending), restricted to `allowed`.
    pub fn search(
        &self,
        query_tokens: &FxHashSet<String>,
        allowed: &FxHashSet<CollegeId>,
    ) -> Vec<(CollegeId, f64)> {
        let mut scores: FxHashMap<CollegeId, f64> = FxHashMap::default();
        for token in query_tokens {
            let idf = self.idf(token);
            if idf <= 0.0 {
                continue;
            }
            if let Some(ids) = self.postings.get(token) {
                for id in ids {
                    if allowed.contains(id) {
                        *scores.entry(*id).or_insert(0.0) += idf;
                    }
                }
            }
        }
        let mut ranked: Vec<(CollegeId, f64)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
        ranked
    }
}

/// Sparse per-stream TF-IDF model of normalized college names.
#[derive(Debug, Default)]
pub struct TfidfModel {
    /// term -> idf
    idf: FxHashMap<String, f64>,
    /// college -> sparse term weight vector (already idf-weighted) and norm
    vectors: FxHashMap<CollegeId, (FxHashMap<String, f64>, f64)>,
}

impl TfidfModel {
    fn build(docs: &[(CollegeId, FxHashSet<String>)]) -> Self {
        let n = docs.len().max(1);
        let mut df: FxHashMap<String, usize> = FxHashMap::default();
        for (_, tokens) in docs {
            for t in tokens {
                *df.entry(t.clone()).or_insert(0) += 1;
            }
        }
        let idf: FxHashMap<String, f64> = df
            .into_iter()
            .map(|(t, d)| (t, ((n as f64) / (d as f64)).ln() + 1.0))
            .collect();

        let mut vectors = FxHashMap::default();
        for (id, tokens) in docs {
            let mut tf: FxHashMap<String, f64> = FxHashMap::default();
            for t in tokens {
                *tf.entry(t.clone()).or_insert(0.0) += 1.0;
            }
            let mut weighted: FxHashMap<String, f64> = FxHashMap::default();
            let mut norm_sq = 0.0;
            for (t, count) in tf {
                let w = count * idf.get(&t).copied().unwrap_or(0.0);
                norm_sq += w * w;
                weighted.insert(t, w);
            }
            vectors.insert(*id, (weighted, norm_sq.sqrt()));
        }

        TfidfModel { idf, vectors }
    }

    /// Cosine similarity between a query token set and one college's
    /// vector, in `[0,1]`. Zero if either side has no overlapping terms.
    pub fn cosine_similarity(&self, query_tokens: &FxHashSet<String>, college_id: CollegeId) -> f64 {
        let Some((vec, norm)) = self.vectors.get(&college_id) else {
            return 0.0;
        };
        if *norm == 0.0 {
            return 0.0;
        }
        let mut query: FxHashMap<String, f64> = FxHashMap::default();
        for t in query_tokens {
            *query.entry(t.clone()).or_insert(0.0) += 1.0;
        }
        let mut query_weighted: FxHashMap<String, f64> = FxHashMap::default();
        let mut query_norm_sq = 0.0;
        for (t, count) in query {
            let w = count * self.idf.get(&t).copied().unwrap_or(0.0);
            query_norm_sq += w * w;
            query_weighted.insert(t, w);
        }
        let query_norm = query_norm_sq.sqrt();
        if query_norm == 0.0 {
            return 0.0;
        }

        let mut dot = 0.0;
        for (t, w) in &query_weighted {
            if let Some(cw) = vec.get(t) {
                dot += w * cw;
            }
        }
        (dot / (query_norm * norm)).clamp(0.0, 1.0)
    }
}

/// All lookup structures over the master catalogue. Built once per
/// master-version generation; read-only thereafter.
pub struct MasterIndex {
    colleges: FxHashMap<CollegeId, Arc<MasterCollege>>,
    composite_key_map: FxHashMap<String, CollegeId>,
    normalized_name_map: FxHashMap<String, Vec<CollegeId>>,
    fts: FtsKeywordIndex,
    state_pool: FxHashMap<(Arc<str>, Stream), Vec<CollegeId>>,
    stream_pool: FxHashMap<Stream, Vec<CollegeId>>,
    code_in_address: FxHashMap<String, Vec<CollegeId>>,
    tfidf: FxHashMap<Stream, TfidfModel>,
    phonetic_buckets: FxHashMap<String, Vec<CollegeId>>,
}

impl MasterIndex {
    /// Build all structures atomically from the master snapshot's college
    /// list. This is the only place the core pays index-construction cost;
    /// every other component treats `MasterIndex` as a read-only handle.
    pub fn build(colleges: Vec<MasterCollege>) -> Self {
        let colleges: Vec<Arc<MasterCollege>> = colleges.into_iter().map(Arc::new).collect();

        let mut by_id = FxHashMap::default();
        let mut composite_key_map = FxHashMap::default();
        let mut normalized_name_map: FxHashMap<String, Vec<CollegeId>> = FxHashMap::default();
        let mut state_pool: FxHashMap<(Arc<str>, Stream), Vec<CollegeId>> = FxHashMap::default();
        let mut stream_pool: FxHashMap<Stream, Vec<CollegeId>> = FxHashMap::default();
        let mut code_in_address: FxHashMap<String, Vec<CollegeId>> = FxHashMap::default();
        let mut phonetic_buckets: FxHashMap<String, Vec<CollegeId>> = FxHashMap::default();
        let mut fts = FtsKeywordIndex::default();
        let mut docs_by_stream: FxHashMap<Stream, Vec<(CollegeId, FxHashSet<String>)>> =
            FxHashMap::default();

        for college in &colleges {
            by_id.insert(college.id, Arc::clone(college));
            composite_key_map.insert(college.composite_key.clone(), college.id);
            normalized_name_map
                .entry(college.normalized_name.clone())
                .or_default()
                .push(college.id);
            state_pool
                .entry((Arc::clone(&college.state.0), college.stream))
                .or_default()
                .push(college.id);
            stream_pool.entry(college.stream).or_default().push(college.id);

            for code in crate::normalize::extract_six_digit_codes(&college.address) {
                code_in_address.entry(code).or_default().push(college.id);
            }

            let name_tokens = tokenize(&college.normalized_name);
            fts.doc_count += 1;
            fts.insert(college.id, &name_tokens);
            docs_by_stream
                .entry(college.stream)
                .or_default()
                .push((college.id, name_tokens.clone()));

            for token in &name_tokens {
                let key = phonetic_key(token);
                if !key.is_empty() {
                    phonetic_buckets.entry(key).or_default().push(college.id);
                }
            }
        }

        let tfidf = docs_by_stream
            .into_iter()
            .map(|(stream, docs)| (stream, TfidfModel::build(&docs)))
            .collect();

        MasterIndex {
            colleges: by_id,
            composite_key_map,
            normalized_name_map,
            fts,
            state_pool,
            stream_pool,
            code_in_address,
            tfidf,
            phonetic_buckets,
        }
    }

    pub fn get(&self, id: CollegeId) -> Option<&Arc<MasterCollege>> {
        self.colleges.get(&id)
    }

    pub fn composite_key_lookup(&self, composite_key: &str) -> Option<CollegeId> {
        self.composite_key_map.get(composite_key).copied()
    }

    pub fn normalized_name_lookup(&self, normalized_name: &str) -> &[CollegeId] {
        self.normalized_name_map
            .get(normalized_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn state_pool(&self, state: &CanonicalStateName, stream: Stream) -> FxHashSet<CollegeId> {
        self.state_pool
            .get(&(Arc::clone(&state.0), stream))
            .map(|v| v.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Every college in `stream`, regardless of state. Used by the
    /// state-independent fallback scan (§4.5 step 1) when `StateAliaser`
    /// could not canonicalize the seat's state: without a state we cannot
    /// narrow to a single `state_pool`, so generators that would otherwise
    /// take a state+stream pool take this wider, stream-only one instead.
    pub fn stream_pool(&self, stream: Stream) -> FxHashSet<CollegeId> {
        self.stream_pool
            .get(&stream)
            .map(|v| v.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn code_in_address_lookup(&self, code: &str) -> &[CollegeId] {
        self.code_in_address.get(code).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn phonetic_bucket(&self, key: &str) -> &[CollegeId] {
        self.phonetic_buckets.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn fts(&self) -> &FtsKeywordIndex {
        &self.fts
    }

    pub fn tfidf_cosine(&self, stream: Stream, query_tokens: &FxHashSet<String>, college_id: CollegeId) -> f64 {
        self.tfidf
            .get(&stream)
            .map(|m| m.cosine_similarity(query_tokens, college_id))
            .unwrap_or(0.0)
    }

    pub fn len(&self) -> usize {
        self.colleges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.colleges.is_empty()
    }
}

/// Looks up canonical courses by normalized name, for the orchestrator's
/// cascading `master_course_id` resolution (§4.7). Kept separate from
/// `MasterIndex` since candidate generation never searches courses directly
/// (only `CourseStreamMapper` consults the raw course string); this index
/// exists purely to resolve the id once a stream has been decided.
#[derive(Debug, Default)]
pub struct CourseIndex {
    courses: FxHashMap<CourseId, MasterCourse>,
    by_normalized_name: FxHashMap<String, Vec<CourseId>>,
}

impl CourseIndex {
    pub fn build(courses: Vec<MasterCourse>) -> Self {
        let mut by_normalized_name: FxHashMap<String, Vec<CourseId>> = FxHashMap::default();
        let mut by_id = FxHashMap::default();
        for course in courses {
            by_normalized_name
                .entry(course.normalized_name.clone())
                .or_default()
                .push(course.id);
            by_id.insert(course.id, course);
        }
        CourseIndex {
            courses: by_id,
            by_normalized_name,
        }
    }

    pub fn get(&self, id: CourseId) -> Option<&MasterCourse> {
        self.courses.get(&id)
    }

    /// Resolves a raw course string to the best matching `MasterCourse`,
    /// preferring an exact normalized-name match restricted to `stream`
    /// (or `MIXED`, which is valid under any stream) when more than one
    /// course shares that normalized name.
    pub fn resolve(&self, raw_course: &str, stream: Stream) -> Option<CourseId> {
        let key = normalize(raw_course);
        let candidates = self.by_normalized_name.get(&key)?;
        let wanted = match stream {
            Stream::Medical => CourseStream::Medical,
            Stream::Dental => CourseStream::Dental,
            Stream::Dnb => CourseStream::Dnb,
        };
        candidates
            .iter()
            .find(|id| {
                self.courses
                    .get(id)
                    .map(|c| c.stream == wanted || c.stream == CourseStream::Mixed)
                    .unwrap_or(false)
            })
            .or_else(|| candidates.first())
            .copied()
    }

    pub fn len(&self) -> usize {
        self.courses.len()
    }
}

/// Looks up a canonical state's `StateId` by its canonical name, for the
/// orchestrator's cascading `master_state_id` resolution (§4.7). The
/// candidate/scoring path only ever needs the `CanonicalStateName` itself
/// (from `StateAliaser`); this index exists to translate that name into the
/// master store's own id once a match is finalized.
#[derive(Debug, Default)]
pub struct StateRegistry {
    by_name: FxHashMap<String, StateId>,
}

impl StateRegistry {
    pub fn build(states: Vec<MasterState>) -> Self {
        let by_name = states
            .into_iter()
            .map(|s| (s.name.as_str().to_string(), s.id))
            .collect();
        StateRegistry { by_name }
    }

    pub fn resolve(&self, canonical: &CanonicalStateName) -> Option<StateId> {
        self.by_name.get(canonical.as_str()).copied()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CanonicalStateName as St;
    use std::collections::BTreeSet;

    fn college(id: i64, name: &str, state: &str, stream: Stream) -> MasterCollege {
        MasterCollege {
            id: CollegeId(id),
            name: name.to_string(),
            address: format!("{name} ADDRESS"),
            state: St::new(state),
            stream,
            normalized_name: name.to_string(),
            composite_key: format!("{name}, {name} ADDRESS"),
            normalized_address: format!("{name} ADDRESS"),
            location_keywords: BTreeSet::new(),
            pincode: None,
        }
    }

    #[test]
    fn composite_key_and_state_pool_lookup() {
        let idx = MasterIndex::build(vec![
            college(1, "GOVERNMENT MEDICAL COLLEGE KOTTAYAM", "KERALA", Stream::Medical),
            college(2, "GOVERNMENT MEDICAL COLLEGE THRISSUR", "KERALA", Stream::Medical),
        ]);
        assert_eq!(idx.len(), 2);
        assert!(idx
            .composite_key_lookup("GOVERNMENT MEDICAL COLLEGE KOTTAYAM, GOVERNMENT MEDICAL COLLEGE KOTTAYAM ADDRESS")
            .is_some());
        let pool = idx.state_pool(&St::new("KERALA"), Stream::Medical);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn same_normalized_name_different_states_do_not_collide() {
        let idx = MasterIndex::build(vec![
            college(1, "GOVERNMENT MEDICAL COLLEGE", "KERALA", Stream::Medical),
            college(2, "GOVERNMENT MEDICAL COLLEGE", "KARNATAKA", Stream::Medical),
        ]);
        let names = idx.normalized_name_lookup("GOVERNMENT MEDICAL COLLEGE");
        assert_eq!(names.len(), 2);
        let kerala_pool = idx.state_pool(&St::new("KERALA"), Stream::Medical);
        let karnataka_pool = idx.state_pool(&St::new("KARNATAKA"), Stream::Medical);
        assert_eq!(kerala_pool.len(), 1);
        assert_eq!(karnataka_pool.len(), 1);
        assert_ne!(kerala_pool, karnataka_pool);
    }

    #[test]
    fn ultra_generic_names_are_flagged() {
        assert!(is_ultra_generic("DISTRICT HOSPITAL"));
        assert!(is_ultra_generic("TALUK HOSPITAL"));
        assert!(!is_ultra_generic("SETH GS MEDICAL COLLEGE"));
    }
}
