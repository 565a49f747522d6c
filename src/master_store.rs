//! The master store: canonical colleges/courses/states plus their links,
//! loaded once per run into an in-memory `MasterSnapshot` that the
//! `MasterIndex` builds on top of (§3, §6).
//!
//! Grounded on `rusqlite`'s `prepare`/`query_map` pattern for bulk reads;
//! `md-5` fingerprints the master tables for `CacheLayer` invalidation
//! (§4.9), the same hashing role `cache_utils.py` gives MD5 for cache keys.

use std::collections::BTreeSet;
use std::sync::Arc;

use md5::{Digest, Md5};
use rusqlite::Connection;

use crate::error::MatchError;
use crate::models::{
    Alias, AliasKind, CanonicalStateName, CollegeId, CourseId, CourseStream, MasterCollege,
    MasterCourse, MasterState, StateCollegeLink, StateId, Stream,
};

/// Everything the matching core reads from the master store in one shot.
/// Built fresh at the start of each `match` invocation (or reused across
/// `--workers` threads behind an `Arc`, since nothing in here mutates).
#[derive(Debug, Clone, Default)]
pub struct MasterSnapshot {
    pub colleges: Vec<Arc<MasterCollege>>,
    pub courses: Vec<MasterCourse>,
    pub states: Vec<MasterState>,
    pub links: Vec<StateCollegeLink>,
    pub aliases: Vec<Alias>,
}

pub trait MasterStore: Send + Sync {
    fn snapshot(&self) -> Result<MasterSnapshot, MatchError>;

    /// 16-byte MD5 fingerprint over row counts and max ids of the core
    /// master tables. Cheap enough to call before every `match` invocation;
    /// a change means `CacheLayer` must invalidate derived caches.
    fn version_hash(&self) -> Result<[u8; 16], MatchError>;
}

pub struct SqliteMasterStore {
    conn: Connection,
}

impl SqliteMasterStore {
    pub fn open(path: &std::path::Path) -> Result<Self, MatchError> {
        let conn = Connection::open(path)
            .map_err(|e| MatchError::MasterIndexCorruption(format!("opening master store: {e}")))?;
        conn.execute_batch("PRAGMA query_only = ON;")
            .map_err(|e| MatchError::MasterIndexCorruption(format!("tuning master store: {e}")))?;
        Ok(SqliteMasterStore { conn })
    }

    fn parse_stream(s: &str) -> Stream {
        match s {
            "DENTAL" => Stream::Dental,
            "DNB" => Stream::Dnb,
            _ => Stream::Medical,
        }
    }

    fn parse_course_stream(s: &str) -> CourseStream {
        match s {
            "DENTAL" => CourseStream::Dental,
            "DNB" => CourseStream::Dnb,
            "MIXED" => CourseStream::Mixed,
            _ => CourseStream::Medical,
        }
    }

    fn parse_alias_kind(s: &str) -> AliasKind {
        match s {
            "COURSE" => AliasKind::Course,
            "STATE" => AliasKind::State,
            "ABBREVIATION" => AliasKind::Abbreviation,
            _ => AliasKind::College,
        }
    }
}

impl MasterStore for SqliteMasterStore {
    fn snapshot(&self) -> Result<MasterSnapshot, MatchError> {
        let mut states_stmt = self
            .conn
            .prepare("SELECT id, name FROM master_states ORDER BY id")
            .map_err(|e| MatchError::MasterIndexCorruption(e.to_string()))?;
        let states = states_stmt
            .query_map([], |row| {
                Ok(MasterState {
                    id: StateId(row.get(0)?),
                    name: CanonicalStateName::new(row.get::<_, String>(1)?),
                })
            })
            .map_err(|e| MatchError::MasterIndexCorruption(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| MatchError::MasterIndexCorruption(e.to_string()))?;

        let mut colleges_stmt = self
            .conn
            .prepare(
                "SELECT id, name, address, state_name, stream, normalized_name,
                        composite_key, normalized_address, location_keywords, pincode
                 FROM master_colleges ORDER BY id",
            )
            .map_err(|e| MatchError::MasterIndexCorruption(e.to_string()))?;
        let colleges = colleges_stmt
            .query_map([], |row| {
                let keywords_raw: String = row.get(8)?;
                let location_keywords: BTreeSet<String> = keywords_raw
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                Ok(Arc::new(MasterCollege {
                    id: CollegeId(row.get(0)?),
                    name: row.get(1)?,
                    address: row.get(2)?,
                    state: CanonicalStateName::new(row.get::<_, String>(3)?),
                    stream: Self::parse_stream(&row.get::<_, String>(4)?),
                    normalized_name: row.get(5)?,
                    composite_key: row.get(6)?,
                    normalized_address: row.get(7)?,
                    location_keywords,
                    pincode: row.get(9)?,
                }))
            })
            .map_err(|e| MatchError::MasterIndexCorruption(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| MatchError::MasterIndexCorruption(e.to_string()))?;

        let mut courses_stmt = self
            .conn
            .prepare("SELECT id, name, normalized_name, stream FROM master_courses ORDER BY id")
            .map_err(|e| MatchError::MasterIndexCorruption(e.to_string()))?;
        let courses = courses_stmt
            .query_map([], |row| {
                Ok(MasterCourse {
                    id: CourseId(row.get(0)?),
                    name: row.get(1)?,
                    normalized_name: row.get(2)?,
                    stream: Self::parse_course_stream(&row.get::<_, String>(3)?),
                })
            })
            .map_err(|e| MatchError::MasterIndexCorruption(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| MatchError::MasterIndexCorruption(e.to_string()))?;

        let mut links_stmt = self
            .conn
            .prepare("SELECT state_id, college_id, composite_key FROM state_college_links")
            .map_err(|e| MatchError::MasterIndexCorruption(e.to_string()))?;
        let links = links_stmt
            .query_map([], |row| {
                Ok(StateCollegeLink {
                    state_id: StateId(row.get(0)?),
                    college_id: CollegeId(row.get(1)?),
                    composite_key: row.get(2)?,
                })
            })
            .map_err(|e| MatchError::MasterIndexCorruption(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| MatchError::MasterIndexCorruption(e.to_string()))?;

        let mut aliases_stmt = self
            .conn
            .prepare("SELECT alias_text, canonical_target, kind, confidence FROM aliases")
            .map_err(|e| MatchError::MasterIndexCorruption(e.to_string()))?;
        let aliases = aliases_stmt
            .query_map([], |row| {
                Ok(Alias {
                    alias_text: row.get(0)?,
                    canonical_target: row.get(1)?,
                    kind: Self::parse_alias_kind(&row.get::<_, String>(2)?),
                    confidence: row.get(3)?,
                })
            })
            .map_err(|e| MatchError::MasterIndexCorruption(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| MatchError::MasterIndexCorruption(e.to_string()))?;

        Ok(MasterSnapshot {
            colleges,
            courses,
            states,
            links,
            aliases,
        })
    }

    fn version_hash(&self) -> Result<[u8; 16], MatchError> {
        let mut hasher = Md5::new();
        for table in [
            "master_colleges",
            "master_courses",
            "master_states",
            "state_college_links",
            "aliases",
        ] {
            let count: i64 = self
                .conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
                .map_err(|e| MatchError::MasterIndexCorruption(e.to_string()))?;
            let max_id: i64 = self
                .conn
                .query_row(
                    &format!("SELECT COALESCE(MAX(rowid), 0) FROM {table}"),
                    [],
                    |r| r.get(0),
                )
                .map_err(|e| MatchError::MasterIndexCorruption(e.to_string()))?;
            hasher.update(table.as_bytes());
            hasher.update(count.to_le_bytes());
            hasher.update(max_id.to_le_bytes());
        }
        Ok(hasher.finalize().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> SqliteMasterStore {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE master_states (id INTEGER PRIMARY KEY, name TEXT);
             CREATE TABLE master_colleges (
                id INTEGER PRIMARY KEY, name TEXT, address TEXT, state_name TEXT,
                stream TEXT, normalized_name TEXT, composite_key TEXT,
                normalized_address TEXT, location_keywords TEXT, pincode TEXT);
             CREATE TABLE master_courses (id INTEGER PRIMARY KEY, name TEXT,
                normalized_name TEXT, stream TEXT);
             CREATE TABLE state_college_links (state_id INTEGER, college_id INTEGER, composite_key TEXT);
             CREATE TABLE aliases (alias_text TEXT, canonical_target TEXT, kind TEXT, confidence REAL);
             INSERT INTO master_states VALUES (1, 'KERALA');
             INSERT INTO master_colleges VALUES (1, 'GOVERNMENT MEDICAL COLLEGE',
                'THIRUVANANTHAPURAM', 'KERALA', 'MEDICAL', 'GOVERNMENT MEDICAL COLLEGE',
                'GOVERNMENT MEDICAL COLLEGE, THIRUVANANTHAPURAM', 'THIRUVANANTHAPURAM',
                'THIRUVANANTHAPURAM,KERALA', '695011');",
        )
        .unwrap();
        // Drop the read-only pragma from the production constructor; we
        // already control the in-memory schema directly in this test.
        SqliteMasterStore { conn }
    }

    #[test]
    fn snapshot_round_trips_one_college() {
        let store = seeded();
        let snap = store.snapshot().unwrap();
        assert_eq!(snap.colleges.len(), 1);
        assert_eq!(snap.colleges[0].id, CollegeId(1));
        assert!(snap.colleges[0].location_keywords.contains("KERALA"));
    }

    #[test]
    fn version_hash_changes_after_insert() {
        let store = seeded();
        let before = store.version_hash().unwrap();
        store
            .conn
            .execute(
                "INSERT INTO master_colleges VALUES (2, 'X', 'Y', 'KERALA', 'MEDICAL', 'X', 'X, Y', 'Y', 'Y', NULL)",
                [],
            )
            .unwrap();
        let after = store.version_hash().unwrap();
        assert_ne!(before, after);
    }
}
