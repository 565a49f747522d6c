//! End-to-end coverage of the five-pass orchestration against an in-memory
//! master catalogue and a tempfile-backed row store, bypassing the SQLite
//! master store entirely (`MasterIndex`/`CourseIndex`/`StateRegistry` are all
//! buildable straight from owned `Vec`s, per their own doc comments).

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use rusqlite::{params, Connection};
use tempfile::NamedTempFile;

use collmatch::alias::AliasStore;
use collmatch::config::Config;
use collmatch::llm::LlmProvider;
use collmatch::master_index::{CourseIndex, MasterIndex, StateRegistry};
use collmatch::models::{
    Alias, AliasKind, CanonicalStateName, CollegeId, MasterCollege, MasterState, StateId, Stream,
};
use collmatch::pipeline::PipelineOrchestrator;
use collmatch::row_store::{RowStore, SqliteRowStore};

const TABLE: &str = "seat_rows";

fn master_college(
    id: i64,
    name: &str,
    address: &str,
    state: &str,
    stream: Stream,
    pincode: Option<&str>,
    location_keywords: &[&str],
) -> MasterCollege {
    MasterCollege {
        id: CollegeId(id),
        name: name.to_string(),
        address: address.to_string(),
        state: CanonicalStateName::new(state),
        stream,
        normalized_name: name.to_string(),
        composite_key: format!("{name}, {address}"),
        normalized_address: address.to_string(),
        location_keywords: location_keywords.iter().map(|s| s.to_string()).collect(),
        pincode: pincode.map(|p| p.to_string()),
    }
}

fn open_store() -> (SqliteRowStore, NamedTempFile) {
    let file = NamedTempFile::new().unwrap();
    let store = SqliteRowStore::open(file.path(), TABLE).unwrap();
    (store, file)
}

#[allow(clippy::too_many_arguments)]
fn insert_row(
    path: &Path,
    row_id: &str,
    raw_college: &str,
    raw_state: &str,
    raw_course: &str,
    raw_address: Option<&str>,
    course_type: Option<&str>,
    normalized_college: &str,
    normalized_state: Option<&str>,
    normalized_address: Option<&str>,
) {
    let conn = Connection::open(path).unwrap();
    conn.execute(
        &format!(
            "INSERT INTO {TABLE} (row_id, raw_college, raw_state, raw_course, raw_address,
                course_type, normalized_college, normalized_state, normalized_address)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
        ),
        params![
            row_id,
            raw_college,
            raw_state,
            raw_course,
            raw_address,
            course_type,
            normalized_college,
            normalized_state,
            normalized_address
        ],
    )
    .unwrap();
}

fn no_llm() -> Vec<Box<dyn LlmProvider>> {
    Vec::new()
}

/// Pass 1 composite-exact match: identical college/address text on both
/// sides, no pincode at all, a clean accept above threshold without Stage B.
#[test]
fn composite_exact_match_is_verified_on_pass_one() {
    let (store, file) = open_store();
    insert_row(
        file.path(),
        "ROW1",
        "KASTURBA MEDICAL COLLEGE MANIPAL",
        "KARNATAKA",
        "MBBS",
        Some("MANIPAL KARNATAKA"),
        Some("MEDICAL"),
        "KASTURBA MEDICAL COLLEGE MANIPAL",
        Some("KARNATAKA"),
        Some("MANIPAL KARNATAKA"),
    );

    let index = MasterIndex::build(vec![master_college(
        101,
        "KASTURBA MEDICAL COLLEGE MANIPAL",
        "MANIPAL KARNATAKA",
        "KARNATAKA",
        Stream::Medical,
        None,
        &[],
    )]);
    let course_index = CourseIndex::build(Vec::new());
    let state_registry = StateRegistry::build(vec![MasterState {
        id: StateId(1),
        name: CanonicalStateName::new("KARNATAKA"),
    }]);
    let alias_store = AliasStore::build(Vec::new());
    let config = Config::default();
    let providers = no_llm();

    let orchestrator = PipelineOrchestrator::new(
        &config, &store, &index, &course_index, &state_registry, &alias_store, &providers,
    );
    let stats = orchestrator.run().unwrap();

    assert_eq!(stats.total_groups, 1);
    assert_eq!(stats.matched_groups, 1);
    assert_eq!(stats.pass_counts.pass1, 1);

    let group = &store.groups().unwrap()[0];
    let row = &store.fetch_group(group).unwrap()[0];
    assert_eq!(row.master_college_id, Some(CollegeId(101)));
    assert_eq!(row.master_state_id, Some(StateId(1)));
    assert!(row.verified);
    assert!(!row.state_mismatch_flagged);
    let score = row.college_match_score.unwrap();
    assert!((score - 0.875).abs() < 1e-9, "expected 0.875, got {score}");
    let method = row.college_match_method.as_deref().unwrap();
    assert!(method.starts_with("pass1_stream_MEDICAL"), "got {method}");
    assert!(method.contains("composite_exact"), "got {method}");
}

/// Two identically-named "AREA HOSPITAL" masters in different states; the
/// ultra-generic guard plus an embedded pincode discriminate between them.
/// The DNB-prefixed course also exercises the DNB→MEDICAL stream fallback.
#[test]
fn ultra_generic_name_is_discriminated_by_address_and_pincode() {
    let (store, file) = open_store();
    insert_row(
        file.path(),
        "ROW1",
        "AREA HOSPITAL",
        "ANDHRA PRADESH",
        "DNB-GENERAL MEDICINE",
        Some("NH 7 VICTORIAPET ADONI 518301"),
        Some("DNB"),
        "AREA HOSPITAL",
        Some("ANDHRA PRADESH"),
        Some("NH 7 VICTORIAPET ADONI 518301"),
    );

    let index = MasterIndex::build(vec![
        master_college(
            102,
            "AREA HOSPITAL",
            "VICTORIAPET ADONI ANDHRA PRADESH 518301",
            "ANDHRA PRADESH",
            Stream::Medical,
            Some("518301"),
            &["VICTORIAPET", "ADONI"],
        ),
        master_college(
            103,
            "AREA HOSPITAL",
            "VIJAYAPURA KARNATAKA",
            "KARNATAKA",
            Stream::Medical,
            None,
            &["VIJAYAPURA"],
        ),
    ]);
    let course_index = CourseIndex::build(Vec::new());
    let state_registry = StateRegistry::build(Vec::new());
    let alias_store = AliasStore::build(Vec::new());
    let config = Config::default();
    let providers = no_llm();

    let orchestrator = PipelineOrchestrator::new(
        &config, &store, &index, &course_index, &state_registry, &alias_store, &providers,
    );
    let stats = orchestrator.run().unwrap();

    assert_eq!(stats.matched_groups, 1);
    assert_eq!(stats.pass_counts.pass1, 1);

    let group = &store.groups().unwrap()[0];
    let row = &store.fetch_group(group).unwrap()[0];
    assert_eq!(row.master_college_id, Some(CollegeId(102)), "must pick the Andhra Pradesh campus, not Karnataka's");
    assert!(row.verified);
    let score = row.college_match_score.unwrap();
    assert!(score > 0.99, "expected a near-perfect score, got {score}");
    let method = row.college_match_method.as_deref().unwrap();
    assert!(method.contains("code_in_address"), "got {method}");
}

/// A BDS seat row against a catalogue holding only Medical-stream colleges:
/// the stream filter empties every candidate generator, so the group has
/// nothing to try past Pass 4 and lands in the review queue.
#[test]
fn stream_mismatch_with_no_candidates_is_queued_for_review() {
    let (store, file) = open_store();
    insert_row(
        file.path(),
        "ROW1",
        "AIIMS DENTAL COLLEGE",
        "DELHI",
        "BDS",
        None,
        Some("DENTAL"),
        "AIIMS DENTAL COLLEGE",
        Some("DELHI (NCT)"),
        None,
    );

    let index = MasterIndex::build(vec![master_college(
        104,
        "AIIMS NEW DELHI",
        "ANSARI NAGAR NEW DELHI",
        "DELHI (NCT)",
        Stream::Medical,
        None,
        &[],
    )]);
    let course_index = CourseIndex::build(Vec::new());
    let state_registry = StateRegistry::build(Vec::new());
    let alias_store = AliasStore::build(Vec::new());
    let config = Config::default();
    let providers = no_llm();

    let orchestrator = PipelineOrchestrator::new(
        &config, &store, &index, &course_index, &state_registry, &alias_store, &providers,
    );
    let stats = orchestrator.run().unwrap();

    assert_eq!(stats.matched_groups, 0);
    assert_eq!(stats.queued_groups, 1);
    assert_eq!(stats.pass_counts.pass5_queued, 1);

    let group = &store.groups().unwrap()[0];
    let row = &store.fetch_group(group).unwrap()[0];
    assert_eq!(row.master_college_id, None);
    assert!(!row.verified);
    assert!(!row.state_mismatch_flagged);
}

/// Pass 1 on the raw nickname scores too low to accept; Pass 2 substitutes
/// the alias and re-scores to a composite-exact match. The persisted method
/// must name both the pass and the alias that fired (the bug this file was
/// added to pin down: the method label used to always claim Pass 1).
#[test]
fn alias_expansion_recovers_a_match_on_pass_two() {
    let (store, file) = open_store();
    insert_row(
        file.path(),
        "ROW1",
        "GMC KOTTAYAM",
        "KERALA",
        "MBBS",
        Some("KOTTAYAM KERALA"),
        Some("MEDICAL"),
        "GMC KOTTAYAM",
        Some("KERALA"),
        Some("KOTTAYAM KERALA"),
    );

    let index = MasterIndex::build(vec![master_college(
        105,
        "GOVERNMENT MEDICAL COLLEGE KOTTAYAM",
        "KOTTAYAM KERALA",
        "KERALA",
        Stream::Medical,
        None,
        &["KOTTAYAM"],
    )]);
    let course_index = CourseIndex::build(Vec::new());
    let state_registry = StateRegistry::build(Vec::new());
    let alias_store = AliasStore::build(vec![Alias {
        alias_text: "GMC KOTTAYAM".to_string(),
        canonical_target: "GOVERNMENT MEDICAL COLLEGE KOTTAYAM".to_string(),
        kind: AliasKind::College,
        confidence: 1.0,
    }]);
    let config = Config::default();
    let providers = no_llm();

    let orchestrator = PipelineOrchestrator::new(
        &config, &store, &index, &course_index, &state_registry, &alias_store, &providers,
    );
    let stats = orchestrator.run().unwrap();

    assert_eq!(stats.matched_groups, 1);
    assert_eq!(stats.pass_counts.pass1, 0, "pass 1 must not have accepted the bare nickname");
    assert_eq!(stats.pass_counts.pass2, 1);

    let group = &store.groups().unwrap()[0];
    let row = &store.fetch_group(group).unwrap()[0];
    assert_eq!(row.master_college_id, Some(CollegeId(105)));
    assert!(row.verified);
    let score = row.college_match_score.unwrap();
    assert!((score - 1.0).abs() < 1e-9, "expected 1.0, got {score}");
    let method = row.college_match_method.as_deref().unwrap();
    assert!(method.starts_with("pass2_alias_expansion"), "got {method}");
    assert!(method.contains("alias_match:GMC KOTTAYAM"), "got {method}");
}

/// Two masters sharing a name, state and stream, with address overlap that
/// normalizes identically on both sides: their scores tie exactly, so the
/// group is routed to review as an ambiguous match rather than silently
/// taking the tie-break winner.
#[test]
fn tied_scores_are_routed_to_review_as_ambiguous() {
    let (store, file) = open_store();
    insert_row(
        file.path(),
        "ROW1",
        "GOVERNMENT MEDICAL COLLEGE",
        "KERALA",
        "MBBS",
        Some("KOTTAYAM KERALA"),
        Some("MEDICAL"),
        "GOVERNMENT MEDICAL COLLEGE",
        Some("KERALA"),
        Some("KOTTAYAM KERALA"),
    );

    let index = MasterIndex::build(vec![
        master_college(
            106,
            "GOVERNMENT MEDICAL COLLEGE",
            "KOTTAYAM EAST KERALA",
            "KERALA",
            Stream::Medical,
            None,
            &[],
        ),
        master_college(
            107,
            "GOVERNMENT MEDICAL COLLEGE",
            "KOTTAYAM WEST KERALA",
            "KERALA",
            Stream::Medical,
            None,
            &[],
        ),
    ]);
    let course_index = CourseIndex::build(Vec::new());
    let state_registry = StateRegistry::build(Vec::new());
    let alias_store = AliasStore::build(Vec::new());
    let config = Config::default();
    let providers = no_llm();

    let orchestrator = PipelineOrchestrator::new(
        &config, &store, &index, &course_index, &state_registry, &alias_store, &providers,
    );
    let stats = orchestrator.run().unwrap();

    assert_eq!(stats.matched_groups, 0);
    assert_eq!(stats.queued_groups, 1);

    let group = &store.groups().unwrap()[0];
    let row = &store.fetch_group(group).unwrap()[0];
    assert_eq!(row.master_college_id, None);
    assert!(!row.verified);
}

/// Running the whole pipeline twice over the same store and index must
/// leave the persisted decision untouched the second time: matching is a
/// pure function of (row store, master index), not a stateful mutation that
/// drifts on repeated runs.
#[test]
fn running_the_pipeline_twice_is_idempotent() {
    let (store, file) = open_store();
    insert_row(
        file.path(),
        "ROW1",
        "KASTURBA MEDICAL COLLEGE MANIPAL",
        "KARNATAKA",
        "MBBS",
        Some("MANIPAL KARNATAKA"),
        Some("MEDICAL"),
        "KASTURBA MEDICAL COLLEGE MANIPAL",
        Some("KARNATAKA"),
        Some("MANIPAL KARNATAKA"),
    );

    let index = MasterIndex::build(vec![master_college(
        101,
        "KASTURBA MEDICAL COLLEGE MANIPAL",
        "MANIPAL KARNATAKA",
        "KARNATAKA",
        Stream::Medical,
        None,
        &[],
    )]);
    let course_index = CourseIndex::build(Vec::new());
    let state_registry = StateRegistry::build(Vec::new());
    let alias_store = AliasStore::build(Vec::new());
    let config = Config::default();
    let providers = no_llm();

    let orchestrator = PipelineOrchestrator::new(
        &config, &store, &index, &course_index, &state_registry, &alias_store, &providers,
    );

    orchestrator.run().unwrap();
    let group = &store.groups().unwrap()[0];
    let first = store.fetch_group(group).unwrap().into_iter().next().unwrap();

    orchestrator.run().unwrap();
    let second = store.fetch_group(group).unwrap().into_iter().next().unwrap();

    assert_eq!(first.master_college_id, second.master_college_id);
    assert_eq!(first.college_match_score, second.college_match_score);
    assert_eq!(first.college_match_method, second.college_match_method);
    assert_eq!(first.verified, second.verified);
}

/// A cancellation token set before `run()` starts leaves every group in its
/// pre-pass state: no row is updated, and the run reports zero matched/
/// rejected/queued groups alongside `cancelled: true`.
#[test]
fn cancelled_run_leaves_rows_in_pre_pass_state() {
    let (store, file) = open_store();
    insert_row(
        file.path(),
        "ROW1",
        "KASTURBA MEDICAL COLLEGE MANIPAL",
        "KARNATAKA",
        "MBBS",
        Some("MANIPAL KARNATAKA"),
        Some("MEDICAL"),
        "KASTURBA MEDICAL COLLEGE MANIPAL",
        Some("KARNATAKA"),
        Some("MANIPAL KARNATAKA"),
    );

    let index = MasterIndex::build(vec![master_college(
        101,
        "KASTURBA MEDICAL COLLEGE MANIPAL",
        "MANIPAL KARNATAKA",
        "KARNATAKA",
        Stream::Medical,
        None,
        &[],
    )]);
    let course_index = CourseIndex::build(Vec::new());
    let state_registry = StateRegistry::build(Vec::new());
    let alias_store = AliasStore::build(Vec::new());
    let config = Config::default();
    let providers = no_llm();

    let cancel = Arc::new(std::sync::atomic::AtomicBool::new(true));
    let orchestrator = PipelineOrchestrator::new(
        &config, &store, &index, &course_index, &state_registry, &alias_store, &providers,
    )
    .with_cancel_token(cancel);
    let stats = orchestrator.run().unwrap();

    assert!(stats.cancelled);
    assert_eq!(stats.matched_groups, 0);
    assert_eq!(stats.rejected_groups, 0);
    assert_eq!(stats.queued_groups, 0);

    let group = &store.groups().unwrap()[0];
    let row = &store.fetch_group(group).unwrap()[0];
    assert_eq!(row.master_college_id, None);
    assert!(!row.verified);
}

// Silence an unused-import warning when a test module elides `Arc` from its
// own fixture builders; kept here because `MasterIndex::get` (exercised
// indirectly through every scenario above) returns `&Arc<MasterCollege>`.
#[allow(dead_code)]
fn _assert_arc_in_scope(_: &Arc<MasterCollege>) {}
