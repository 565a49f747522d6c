//! The row store: opaque to the core beyond the columns named in spec.md §3,
//! consumed through the `RowStore` trait (§6, §9 "explicit application
//! context, no global singletons" redesign flag — no component reaches for
//! a global connection).
//!
//! Grounded on the extractor's direct `rusqlite::Connection` usage (raw SQL,
//! `execute_batch` PRAGMA tuning, `Connection::transaction()` for atomic
//! group updates) since §6 states the row store and master store are
//! themselves SQLite databases in `original_source/`
//! (`seat_data.db`, `counselling_data_partitioned.db`).

use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Mutex;

use crate::error::MatchError;
use crate::models::{CollegeId, CourseId, GroupEntry, ScoredMatch, SeatRow, StateId};
use crate::row_id::validate_row_id;

/// One queued review entry: the group plus its top candidates' breakdowns,
/// persisted for the external review TUI (out of scope beyond this write).
#[derive(Debug, Clone)]
pub struct ReviewEntry {
    pub group_signature: String,
    pub top_candidates: Vec<ScoredMatch>,
}

/// Minimal transactional interface the matching core needs from the row
/// store. Implementations own schema/columns beyond what's listed here;
/// the core never reaches past this trait.
pub trait RowStore: Send + Sync {
    fn groups(&self) -> Result<Vec<GroupEntry>, MatchError>;
    fn fetch_group(&self, key: &GroupEntry) -> Result<Vec<SeatRow>, MatchError>;

    /// Atomic per-group update of the three cascading identifiers plus
    /// score/method/verified. `college_id` may be `None` when a prior
    /// verified match is rejected by the Verifier (clears the college
    /// fields, per §4.8 "Propagation").
    #[allow(clippy::too_many_arguments)]
    fn update_group_match(
        &self,
        key: &GroupEntry,
        college_id: Option<CollegeId>,
        course_id: Option<CourseId>,
        state_id: Option<StateId>,
        score: Option<f64>,
        method: Option<&str>,
        verified: bool,
        state_mismatch_flagged: bool,
    ) -> Result<(), MatchError>;

    fn queue_for_review(&self, entry: &ReviewEntry) -> Result<(), MatchError>;
}

/// SQLite-backed row store. A single connection guarded by a mutex: the
/// rayon worker pool serializes writes through it (§5: "a dedicated
/// writable handle to the row store's group-update endpoint" is modeled
/// here as a shared, lock-protected handle rather than one connection per
/// worker, since sqlite allows only one writer at a time regardless).
pub struct SqliteRowStore {
    conn: Mutex<Connection>,
    table: String,
}

/// A table name supplied on the CLI (`match --table <name>`) is interpolated
/// into DDL/DML since `rusqlite` has no bind-parameter support for
/// identifiers; restrict it to the same charset the row-id format already
/// requires so it can never carry SQL syntax.
fn validate_table_name(table: &str) -> Result<(), MatchError> {
    let ok = !table.is_empty()
        && table.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
        && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(MatchError::RowStoreError(format!(
            "invalid table name {table:?}: expected [a-zA-Z][a-zA-Z0-9_]*"
        )))
    }
}

impl SqliteRowStore {
    /// Opens (creating if necessary) the seat-row table `table` inside the
    /// database at `path`, alongside a `{table}_review_queue` table for
    /// Pass 5. Table scoping lets one database host multiple counselling
    /// batches (`match --table mcc_2024`, `match --table ncc_2024`, ...).
    pub fn open(path: &std::path::Path, table: &str) -> Result<Self, MatchError> {
        validate_table_name(table)?;
        let conn = Connection::open(path)
            .map_err(|e| MatchError::RowStoreError(format!("opening row store: {e}")))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )
        .map_err(|e| MatchError::RowStoreError(format!("tuning row store: {e}")))?;
        let store = SqliteRowStore {
            conn: Mutex::new(conn),
            table: table.to_string(),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<(), MatchError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                row_id TEXT PRIMARY KEY,
                raw_college TEXT NOT NULL,
                raw_state TEXT NOT NULL,
                raw_course TEXT NOT NULL,
                raw_address TEXT,
                course_type TEXT,
                normalized_college TEXT NOT NULL,
                normalized_state TEXT,
                normalized_address TEXT,
                master_college_id INTEGER,
                master_course_id INTEGER,
                master_state_id INTEGER,
                college_match_score REAL,
                college_match_method TEXT,
                verified INTEGER NOT NULL DEFAULT 0,
                state_mismatch_flagged INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_group
                ON {table}(normalized_state, normalized_college, normalized_address, course_type);
            CREATE TABLE IF NOT EXISTS {table}_review_queue (
                group_signature TEXT PRIMARY KEY,
                top_candidates_json TEXT NOT NULL,
                queued_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );",
            table = self.table,
        ))
        .map_err(|e| MatchError::RowStoreError(format!("creating schema: {e}")))
    }

    fn group_key_sql() -> &'static str {
        "normalized_state IS ? AND normalized_college = ? AND normalized_address IS ? AND course_type IS ?"
    }

    /// Validates every row's `row_id` against the `{STATE2}_{STREAM6}_{YEAR}_
    /// {SEQ4}_{CHECKSUM4}` contract (§6), logging and dropping malformed ids
    /// rather than failing the whole group (§7: "logged, row skipped"). This
    /// is the ingest-time gate a loader (out of scope) is expected to run
    /// before rows are considered part of a group; `fetch_group` itself
    /// trusts rows already resident in the store, since by the time the
    /// pipeline groups and matches them they are assumed to have passed this
    /// gate once already.
    pub fn validate_ingested_rows(rows: Vec<SeatRow>) -> Vec<SeatRow> {
        rows.into_iter()
            .filter(|row| {
                let ok = validate_row_id(&row.row_id);
                if !ok {
                    eprintln!("[row_skipped] malformed row_id: {}", row.row_id);
                }
                ok
            })
            .collect()
    }
}

impl RowStore for SqliteRowStore {
    fn groups(&self) -> Result<Vec<GroupEntry>, MatchError> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT normalized_state, normalized_college, normalized_address, course_type, COUNT(*)
             FROM {}
             GROUP BY normalized_state, normalized_college, normalized_address, course_type
             ORDER BY rowid",
            self.table
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| MatchError::RowStoreError(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(GroupEntry {
                    normalized_state: row.get(0)?,
                    normalized_college: row.get(1)?,
                    normalized_address: row.get(2)?,
                    course_type: row.get(3)?,
                    row_count: row.get::<_, i64>(4)? as usize,
                })
            })
            .map_err(|e| MatchError::RowStoreError(e.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| MatchError::RowStoreError(e.to_string()))
    }

    fn fetch_group(&self, key: &GroupEntry) -> Result<Vec<SeatRow>, MatchError> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT row_id, raw_college, raw_state, raw_course, raw_address, course_type,
                    normalized_college, normalized_state, normalized_address,
                    master_college_id, master_course_id, master_state_id,
                    college_match_score, college_match_method, verified, state_mismatch_flagged
             FROM {} WHERE {}",
            self.table,
            Self::group_key_sql()
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| MatchError::RowStoreError(e.to_string()))?;
        let rows = stmt
            .query_map(
                params![
                    key.normalized_state,
                    key.normalized_college,
                    key.normalized_address,
                    key.course_type
                ],
                |row| {
                    Ok(SeatRow {
                        row_id: row.get(0)?,
                        raw_college: row.get(1)?,
                        raw_state: row.get(2)?,
                        raw_course: row.get(3)?,
                        raw_address: row.get(4)?,
                        course_type: row.get(5)?,
                        normalized_college: row.get(6)?,
                        normalized_state: row.get(7)?,
                        normalized_address: row.get(8)?,
                        master_college_id: row.get::<_, Option<i64>>(9)?.map(CollegeId),
                        master_course_id: row.get::<_, Option<i64>>(10)?.map(CourseId),
                        master_state_id: row.get::<_, Option<i64>>(11)?.map(StateId),
                        college_match_score: row.get(12)?,
                        college_match_method: row.get(13)?,
                        verified: row.get::<_, i64>(14)? != 0,
                        state_mismatch_flagged: row.get::<_, i64>(15)? != 0,
                    })
                },
            )
            .map_err(|e| MatchError::RowStoreError(e.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| MatchError::RowStoreError(e.to_string()))
    }

    fn update_group_match(
        &self,
        key: &GroupEntry,
        college_id: Option<CollegeId>,
        course_id: Option<CourseId>,
        state_id: Option<StateId>,
        score: Option<f64>,
        method: Option<&str>,
        verified: bool,
        state_mismatch_flagged: bool,
    ) -> Result<(), MatchError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction()
            .map_err(|e| MatchError::RowStoreError(e.to_string()))?;
        let sql = format!(
            "UPDATE {} SET
                master_college_id = ?1, master_course_id = ?2, master_state_id = ?3,
                college_match_score = ?4, college_match_method = ?5, verified = ?6,
                state_mismatch_flagged = ?7
             WHERE {}",
            self.table,
            Self::group_key_sql()
        );
        tx.execute(
            &sql,
            params![
                college_id.map(|c| c.0),
                course_id.map(|c| c.0),
                state_id.map(|s| s.0),
                score,
                method,
                verified as i64,
                state_mismatch_flagged as i64,
                key.normalized_state,
                key.normalized_college,
                key.normalized_address,
                key.course_type,
            ],
        )
        .map_err(|e| MatchError::RowStoreError(e.to_string()))?;
        tx.commit().map_err(|e| MatchError::RowStoreError(e.to_string()))
    }

    fn queue_for_review(&self, entry: &ReviewEntry) -> Result<(), MatchError> {
        let conn = self.conn.lock().unwrap();
        let json = serde_json::to_string(
            &entry
                .top_candidates
                .iter()
                .map(|m| serde_json::json!({
                    "college_id": m.candidate.college.id.0,
                    "college_name": m.candidate.college.name,
                    "score": m.score,
                    "method": m.method,
                }))
                .collect::<Vec<_>>(),
        )
        .map_err(|e| MatchError::RowStoreError(e.to_string()))?;
        conn.execute(
            &format!(
                "INSERT INTO {}_review_queue (group_signature, top_candidates_json)
                 VALUES (?1, ?2)
                 ON CONFLICT(group_signature) DO UPDATE SET
                    top_candidates_json = excluded.top_candidates_json,
                    queued_at = CURRENT_TIMESTAMP",
                self.table
            ),
            params![entry.group_signature, json],
        )
        .optional()
        .map_err(|e| MatchError::RowStoreError(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn store() -> (SqliteRowStore, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let store = SqliteRowStore::open(file.path(), "seat_rows").unwrap();
        (store, file)
    }

    fn seed(conn: &Connection) {
        conn.execute(
            "INSERT INTO seat_rows (row_id, raw_college, raw_state, raw_course, raw_address,
                course_type, normalized_college, normalized_state, normalized_address)
             VALUES ('KL_MEDICA_2024_0001_AB12', 'GOVT. MEDICAL COLLEGE', 'KL',
                'MBBS', 'THIRUVANANTHAPURAM', 'MEDICAL', 'GOVERNMENT MEDICAL COLLEGE',
                'KERALA', 'THIRUVANANTHAPURAM')",
            [],
        )
        .unwrap();
    }

    #[test]
    fn rejects_unsafe_table_names() {
        let file = NamedTempFile::new().unwrap();
        assert!(SqliteRowStore::open(file.path(), "seat_rows; DROP TABLE x").is_err());
        assert!(SqliteRowStore::open(file.path(), "1table").is_err());
        assert!(SqliteRowStore::open(file.path(), "").is_err());
    }

    #[test]
    fn groups_and_fetch_roundtrip() {
        let (store, _file) = store();
        seed(&store.conn.lock().unwrap());
        let groups = store.groups().unwrap();
        assert_eq!(groups.len(), 1);
        let rows = store.fetch_group(&groups[0]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].raw_college, "GOVT. MEDICAL COLLEGE");
    }

    #[test]
    fn update_group_match_is_atomic_per_group() {
        let (store, _file) = store();
        seed(&store.conn.lock().unwrap());
        let groups = store.groups().unwrap();
        store
            .update_group_match(
                &groups[0],
                Some(CollegeId(42)),
                Some(CourseId(7)),
                Some(StateId(1)),
                Some(0.95),
                Some("pass1_stream_MEDICAL+composite_exact"),
                true,
                false,
            )
            .unwrap();
        let rows = store.fetch_group(&groups[0]).unwrap();
        assert_eq!(rows[0].master_college_id, Some(CollegeId(42)));
        assert!(rows[0].verified);
    }
}
