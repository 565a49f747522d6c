//! Derived-state invalidation (§4.9).
//!
//! The `MasterIndex`, the TF-IDF/FTS structures it owns, and the `LlmCache`
//! are all derived from the master store; none of them may be reused across
//! a master-data change. Grounded on the extractor's rebuild-on-change
//! pattern for its own FTS virtual table (`INSERT INTO tracks_fts(tracks_fts)
//! VALUES('rebuild')`), generalized here to a version-hash comparison since
//! this crate's derived structures are in-process, not a SQLite extension.

use crate::llm::LlmCache;
use crate::master_index::{CourseIndex, MasterIndex, StateRegistry};
use crate::master_store::MasterStore;

/// Owns the master-version fingerprint and every structure derived from it.
/// `check_and_invalidate` is the single entrypoint: call it once per `match`
/// invocation (and before any `cache --check`) to decide whether a rebuild
/// is needed.
pub struct CacheLayer {
    version_hash: Option<[u8; 16]>,
}

impl CacheLayer {
    pub fn new() -> Self {
        CacheLayer { version_hash: None }
    }

    /// Returns `true` if the master data changed since the last call (or
    /// this is the first call), meaning the caller must rebuild its
    /// `MasterIndex` and clear its `LlmCache`.
    pub fn check_and_invalidate(&mut self, store: &dyn MasterStore, llm_cache: &mut LlmCache) -> Result<bool, crate::error::MatchError> {
        let current = store.version_hash()?;
        llm_cache.check_invalidate(current);
        let changed = self.version_hash != Some(current);
        self.version_hash = Some(current);
        Ok(changed)
    }

    pub fn current_hash(&self) -> Option<[u8; 16]> {
        self.version_hash
    }
}

impl Default for CacheLayer {
    fn default() -> Self {
        Self::new()
    }
}

/// Rebuilds the `MasterIndex` from a fresh snapshot taken off `store`,
/// bundled here so callers (`main.rs`'s `reindex` subcommand, and the start
/// of every `match` run) share one code path instead of duplicating the
/// snapshot-then-build sequence.
pub fn rebuild_index(store: &dyn MasterStore) -> Result<MasterIndex, crate::error::MatchError> {
    let snapshot = store.snapshot()?;
    let colleges: Vec<_> = snapshot.colleges.into_iter().map(unwrap_or_clone_college).collect();
    Ok(MasterIndex::build(colleges))
}

/// Rebuilds every derived structure the orchestrator needs in one snapshot
/// read: the college-centric `MasterIndex` plus the `CourseIndex`/
/// `StateRegistry` used to resolve the two cascading identifiers (§4.7)
/// once college resolution has picked a stream and canonical state.
pub fn rebuild_all(
    store: &dyn MasterStore,
) -> Result<(MasterIndex, CourseIndex, StateRegistry), crate::error::MatchError> {
    let snapshot = store.snapshot()?;
    let colleges: Vec<_> = snapshot.colleges.into_iter().map(unwrap_or_clone_college).collect();
    Ok((
        MasterIndex::build(colleges),
        CourseIndex::build(snapshot.courses),
        StateRegistry::build(snapshot.states),
    ))
}

// `MasterSnapshot.colleges` is `Vec<Arc<MasterCollege>>` (shared with callers
// that hold their own references), but `MasterIndex::build` takes owned
// `MasterCollege`s and re-wraps them in its own `Arc`s. Cloning the inner
// value only when the `Arc` isn't uniquely held keeps the common case (a
// snapshot built fresh for this call) allocation-free.
fn unwrap_or_clone_college(arc: std::sync::Arc<crate::models::MasterCollege>) -> crate::models::MasterCollege {
    std::sync::Arc::try_unwrap(arc).unwrap_or_else(|shared| (*shared).clone())
}
