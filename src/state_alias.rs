//! The closed 35-state/UT canonical table and its alias resolution (§4.2).
//!
//! Grounded on `examples/original_source/match-and-link-counselling/scripts/
//! create_state_mapping.py`: pin-code stripping, hyphen normalization, then a
//! substring scan over the canonical names followed by hand-curated special
//! cases (`DELHI`, `CHATTISGARH`→`CHHATTISGARH`, `PONDICHERRY`→`PUDUCHERRY`,
//! `ORISSA`→`ODISHA`, `UTTRAKHAND`→`UTTARAKHAND`, …).

use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::FxHashMap;

use crate::models::CanonicalStateName;
use crate::normalize::SIX_DIGIT_CODE;

static HYPHEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"-").unwrap());
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// The 35 canonical Indian state/UT names, per spec.md §4.2 and the source's
/// `CANONICAL_STATES` table. `DELHI` is canonicalized to `DELHI (NCT)` per
/// the open-question decision recorded in SPEC_FULL.md §10.1.
pub const CANONICAL_STATES: &[&str] = &[
    "ANDAMAN AND NICOBAR ISLANDS",
    "ANDHRA PRADESH",
    "ARUNACHAL PRADESH",
    "ASSAM",
    "BIHAR",
    "CHANDIGARH",
    "CHHATTISGARH",
    "DADRA AND NAGAR HAVELI",
    "DAMAN AND DIU",
    "DELHI (NCT)",
    "GOA",
    "GUJARAT",
    "HARYANA",
    "HIMACHAL PRADESH",
    "JAMMU AND KASHMIR",
    "JHARKHAND",
    "KARNATAKA",
    "KERALA",
    "LADAKH",
    "LAKSHADWEEP",
    "MADHYA PRADESH",
    "MAHARASHTRA",
    "MANIPUR",
    "MEGHALAYA",
    "MIZORAM",
    "NAGALAND",
    "ODISHA",
    "PUDUCHERRY",
    "PUNJAB",
    "RAJASTHAN",
    "SIKKIM",
    "TAMIL NADU",
    "TELANGANA",
    "TRIPURA",
    "UTTAR PRADESH",
    "UTTARAKHAND",
    "WEST BENGAL",
];

/// Ordered so that the longest/most-specific aliases are scanned first,
/// mirroring the source's "check canonical substring, then special cases"
/// two-tier approach collapsed into one table.
static ALIASES: Lazy<Vec<(&'static str, &'static str)>> = Lazy::new(|| {
    vec![
        ("DELHI (NCT)", "DELHI (NCT)"),
        ("NEW DELHI", "DELHI (NCT)"),
        ("DEL HI", "DELHI (NCT)"),
        ("DELHI", "DELHI (NCT)"),
        ("CHATTISGARH", "CHHATTISGARH"),
        ("CHHATTISGARH", "CHHATTISGARH"),
        ("PONDICHERRY", "PUDUCHERRY"),
        ("ORISSA", "ODISHA"),
        ("UTTRAKHAND", "UTTARAKHAND"),
        ("UTTARANCHAL", "UTTARAKHAND"),
        ("ANDAMAN NICOBAR ISLANDS", "ANDAMAN AND NICOBAR ISLANDS"),
        ("ANDAMAN AND NICOBAR", "ANDAMAN AND NICOBAR ISLANDS"),
        ("JAMMU KASHMIR", "JAMMU AND KASHMIR"),
        ("J AND K", "JAMMU AND KASHMIR"),
        ("DAMAN DIU", "DAMAN AND DIU"),
        ("DADRA NAGAR HAVELI", "DADRA AND NAGAR HAVELI"),
    ]
});

/// `canonical_name -> two-letter code`, used for row-id generation (§6).
/// Two-letter codes follow the vehicle-registration abbreviations in
/// common counselling-data usage.
static CODE2: Lazy<FxHashMap<&'static str, &'static str>> = Lazy::new(|| {
    [
        ("ANDAMAN AND NICOBAR ISLANDS", "AN"),
        ("ANDHRA PRADESH", "AP"),
        ("ARUNACHAL PRADESH", "AR"),
        ("ASSAM", "AS"),
        ("BIHAR", "BR"),
        ("CHANDIGARH", "CH"),
        ("CHHATTISGARH", "CG"),
        ("DADRA AND NAGAR HAVELI", "DN"),
        ("DAMAN AND DIU", "DD"),
        ("DELHI (NCT)", "DL"),
        ("GOA", "GA"),
        ("GUJARAT", "GJ"),
        ("HARYANA", "HR"),
        ("HIMACHAL PRADESH", "HP"),
        ("JAMMU AND KASHMIR", "JK"),
        ("JHARKHAND", "JH"),
        ("KARNATAKA", "KA"),
        ("KERALA", "KL"),
        ("LADAKH", "LA"),
        ("LAKSHADWEEP", "LD"),
        ("MADHYA PRADESH", "MP"),
        ("MAHARASHTRA", "MH"),
        ("MANIPUR", "MN"),
        ("MEGHALAYA", "ML"),
        ("MIZORAM", "MZ"),
        ("NAGALAND", "NL"),
        ("ODISHA", "OD"),
        ("PUDUCHERRY", "PY"),
        ("PUNJAB", "PB"),
        ("RAJASTHAN", "RJ"),
        ("SIKKIM", "SK"),
        ("TAMIL NADU", "TN"),
        ("TELANGANA", "TG"),
        ("TRIPURA", "TR"),
        ("UTTAR PRADESH", "UP"),
        ("UTTARAKHAND", "UK"),
        ("WEST BENGAL", "WB"),
    ]
    .into_iter()
    .collect()
});

/// Fixed closed table of 35 canonical states + union territories, with an
/// alias map. Stateless; all state lives in the `Lazy` statics above, so
/// this type is a zero-sized handle callers can construct freely.
#[derive(Debug, Default, Clone, Copy)]
pub struct StateAliaser;

impl StateAliaser {
    pub fn new() -> Self {
        StateAliaser
    }

    /// Strips pin codes (any run of six digits) and hyphens, scans the
    /// result for any canonical name or alias, and returns the canonical
    /// form. Returns `None` only when no canonical token occurs.
    pub fn canonicalize(&self, raw: &str) -> Option<CanonicalStateName> {
        if raw.trim().is_empty() {
            return None;
        }
        let upper = raw.to_uppercase();
        let no_pin = SIX_DIGIT_CODE.replace_all(&upper, "");
        let no_hyphen = HYPHEN.replace_all(&no_pin, " ");
        let cleaned = WHITESPACE.replace_all(no_hyphen.trim(), " ").to_string();

        // Longest alias first so e.g. "DELHI (NCT)" wins over bare "DELHI".
        let mut best: Option<(&'static str, usize)> = None;
        for (alias, canonical) in ALIASES.iter() {
            if cleaned.contains(alias) && alias.len() > best.map(|(a, _)| a.len()).unwrap_or(0) {
                best = Some((canonical, alias.len()));
            }
        }
        if let Some((canonical, _)) = best {
            return Some(CanonicalStateName::new(canonical));
        }

        for canonical in CANONICAL_STATES {
            if cleaned.contains(canonical) {
                return Some(CanonicalStateName::new(*canonical));
            }
        }

        None
    }

    /// Two-letter code for a canonical state name, used in row-id generation
    /// (§6). Panics only if called with a name outside the closed table,
    /// which cannot happen for a name produced by [`Self::canonicalize`].
    pub fn code2(&self, canonical: &CanonicalStateName) -> &'static str {
        CODE2.get(canonical.as_str()).copied().unwrap_or("XX")
    }
}
