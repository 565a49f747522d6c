//! Row-id format validation (§6): `{STATE2}_{STREAM6}_{YEAR}_{SEQ4}_{CHECKSUM4}`,
//! where `CHECKSUM4` is the first four hex chars of an MD5 digest over the
//! four preceding fields. Loaders (out of scope) mint these ids; the core's
//! only job is to validate the format on ingest and fail rows that don't
//! conform, per §6's closing paragraph and the "NormalizationOverflow:
//! logged, row skipped" policy in §7.
//!
//! Grounded on the same `md-5` usage already established in
//! `master_store.rs` for `version_hash`.

use md5::{Digest, Md5};
use once_cell::sync::Lazy;
use regex::Regex;

static ROW_ID_SHAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Z]{2})_([A-Z0-9]{6})_([0-9]{4})_([0-9]{4})_([0-9A-Fa-f]{4})$").unwrap()
});

/// Recomputes `CHECKSUM4` over `{STATE2}_{STREAM6}_{YEAR}_{SEQ4}` and
/// compares (case-insensitively) against the id's trailing field. Returns
/// `false` for anything that doesn't even match the five-field shape.
pub fn validate_row_id(row_id: &str) -> bool {
    let Some(caps) = ROW_ID_SHAPE.captures(row_id) else {
        return false;
    };
    let preimage = format!("{}_{}_{}_{}", &caps[1], &caps[2], &caps[3], &caps[4]);
    let expected = checksum4(&preimage);
    caps[5].eq_ignore_ascii_case(&expected)
}

/// Builds a well-formed row id from its fields, computing the checksum.
/// Exposed for tests and for any in-process code (not loaders, which are
/// out of scope) that needs to mint a row id matching the same contract.
pub fn build_row_id(state2: &str, stream6: &str, year: &str, seq4: &str) -> String {
    let preimage = format!("{state2}_{stream6}_{year}_{seq4}");
    format!("{preimage}_{}", checksum4(&preimage))
}

fn checksum4(preimage: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(preimage.as_bytes());
    let digest = hasher.finalize();
    format!("{:02x}{:02x}", digest[0], digest[1]).to_uppercase()
}
