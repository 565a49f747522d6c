//! Per-state pincode range table and boost semantics (§4.6).
//!
//! Grounded on `test_pincode_validation.py`'s boost-range test cases (exact
//! match `(0.20, 0.25)`, one side missing `(0.00, 0.10)`, both missing
//! `(-0.05, 0.05)`, mismatched states `(-0.20, 0.0)`) and India's publicly
//! documented postal-zone structure (the leading 1-2 digits of a six-digit
//! PIN identify a postal circle, which maps to one or a small cluster of
//! states). Boundaries are approximate at the margins where circles
//! straddle state lines (documented in DESIGN.md); exactness isn't the
//! goal, only that the boost degrades consistently.

use crate::models::CanonicalStateName;

/// `(state name, inclusive low, inclusive high)`.
const RANGES: &[(&str, u32, u32)] = &[
    ("DELHI (NCT)", 110000, 110099),
    ("HARYANA", 120000, 136999),
    ("PUNJAB", 140000, 160099),
    ("CHANDIGARH", 160000, 160099),
    ("HIMACHAL PRADESH", 171000, 177999),
    ("JAMMU AND KASHMIR", 180000, 194999),
    ("LADAKH", 194100, 194999),
    ("UTTARAKHAND", 244000, 263999),
    ("UTTAR PRADESH", 200000, 285999),
    ("RAJASTHAN", 301000, 345999),
    ("DADRA AND NAGAR HAVELI", 396000, 396399),
    ("DAMAN AND DIU", 362500, 362799),
    ("GUJARAT", 360000, 396999),
    ("MAHARASHTRA", 400000, 445999),
    ("GOA", 403000, 403999),
    ("MADHYA PRADESH", 450000, 488999),
    ("CHHATTISGARH", 490000, 497999),
    ("ANDHRA PRADESH", 510000, 539999),
    ("TELANGANA", 500000, 509999),
    ("KARNATAKA", 560000, 591999),
    ("TAMIL NADU", 600000, 643999),
    ("PUDUCHERRY", 605000, 605999),
    ("KERALA", 670000, 695999),
    ("LAKSHADWEEP", 682550, 682559),
    ("WEST BENGAL", 700000, 743999),
    ("ANDAMAN AND NICOBAR ISLANDS", 744000, 744999),
    ("ODISHA", 751000, 770999),
    ("ASSAM", 780000, 788999),
    ("MEGHALAYA", 793000, 794999),
    ("MANIPUR", 795000, 795999),
    ("MIZORAM", 796000, 796999),
    ("TRIPURA", 799000, 799999),
    ("NAGALAND", 797000, 798999),
    ("ARUNACHAL PRADESH", 790000, 792999),
    ("SIKKIM", 737000, 737999),
    ("BIHAR", 800000, 855999),
    ("JHARKHAND", 813000, 835999),
];

/// Whether `pincode` falls in the known range for `state`. Non-numeric or
/// wrong-length input is always invalid.
pub fn validate_pincode_for_state(pincode: &str, state: &CanonicalStateName) -> bool {
    let Ok(value) = pincode.parse::<u32>() else {
        return false;
    };
    if pincode.len() != 6 {
        return false;
    }
    RANGES
        .iter()
        .any(|(name, low, high)| *name == state.as_str() && value >= *low && value <= *high)
}

/// Pincode boost component (§4.6):
/// `+0.25` exact match, `+0.10` both present and in the same state's range,
/// `0.0` both present but no signal either way, `-0.10` both present and
/// inconsistent with the matched state.
pub fn pincode_boost(
    master_pin: Option<&str>,
    seat_pin: Option<&str>,
    master_state: &CanonicalStateName,
) -> f64 {
    match (master_pin, seat_pin) {
        (Some(m), Some(s)) if m == s => 0.25,
        (Some(_), Some(s)) => {
            if validate_pincode_for_state(s, master_state) {
                0.10
            } else if s.len() == 6 && s.chars().all(|c| c.is_ascii_digit()) {
                -0.10
            } else {
                0.0
            }
        }
        _ => 0.0,
    }
}
