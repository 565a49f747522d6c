//! Composite match scoring with address/pincode/NER boosts (§4.6).
//!
//! `name_score` components reuse `strsim` for fuzzy/token-set ratios;
//! phonetic similarity and tokenization both route through the single
//! [`crate::normalize`] contract. Grounded on `enhanced_4pass_matcher.py`'s
//! multi-strategy name matching (exact/primary/fuzzy/secondary) and
//! `pass_1_stream_filtering.py`'s address-keyword exclusion set,
//! generalized into one composite score instead of separate pass-specific
//! thresholds.

use once_cell::sync::Lazy;
use rustc_hash::FxHashSet;
use strsim::normalized_levenshtein;

use crate::config::Weights;
use crate::master_index::{is_ultra_generic, MasterIndex};
use crate::models::{Breakdown, Candidate, MatchRequest, ScoredMatch};
use crate::normalize::{
    extract_six_digit_codes, keyword_jaccard, phonetic_similarity, tokenize,
};
use crate::pincode::pincode_boost;

/// Tokens that are present in nearly every address/name in this domain and
/// therefore carry no discriminating power for the address-overlap score.
/// Grounded on `pass_1_stream_filtering.py`'s `excluded` set.
static ADDRESS_STOPWORDS: Lazy<FxHashSet<&'static str>> = Lazy::new(|| {
    [
        "DISTRICT", "HOSPITAL", "COLLEGE", "MEDICAL", "DENTAL", "OF", "AND", "THE", "INSTITUTE",
        "ROAD", "NEAR", "BY", "PASS", "HOUSE", "NO", "GOVERNMENT", "GENERAL",
    ]
    .into_iter()
    .collect()
});

/// Gazetteer of Indian city/district names used as a lightweight, always-
/// available stand-in for NER (§9: "Phonetic and NER components are
/// optional and graceful... boosts are zero" when unavailable). Grounded on
/// `enhanced_4pass_matcher.py::_extract_location_keywords`'s indicator list.
static LOCATION_GAZETTEER: Lazy<FxHashSet<&'static str>> = Lazy::new(|| {
    [
        "DELHI", "MUMBAI", "BANGALORE", "BENGALURU", "CHENNAI", "KOLKATA", "HYDERABAD", "PUNE",
        "AHMEDABAD", "JAIPUR", "LUCKNOW", "KANPUR", "NAGPUR", "INDORE", "THANE", "BHOPAL",
        "VISAKHAPATNAM", "PATNA", "VADODARA", "AGRA", "NASHIK", "FARIDABAD", "MEERUT", "RAJKOT",
        "KOLHAPUR", "VAPI", "SOLAPUR", "RANCHI", "COIMBATORE", "KOZHIKODE", "THIRUVANANTHAPURAM",
        "TRIVANDRUM", "GUWAHATI", "HUBLI", "DHARWAD", "RAIPUR", "TRICHY", "JALANDHAR", "TIRUPUR",
        "GURGAON", "GURUGRAM", "NOIDA", "VIJAYAWADA", "MADURAI", "WARANGAL", "THRISSUR",
        "KOTTAYAM", "ADONI", "KASHIPUR",
    ]
    .into_iter()
    .collect()
});

const MAX_NER_BOOST: f64 = 0.15;
const MAX_PINCODE_BOOST: f64 = 0.25;
const MIN_PINCODE_BOOST: f64 = -0.10;

fn meaningful_tokens(tokens: &FxHashSet<String>) -> FxHashSet<String> {
    tokens
        .iter()
        .filter(|t| !ADDRESS_STOPWORDS.contains(t.as_str()))
        .cloned()
        .collect()
}

fn token_set_ratio(a: &str, b: &str) -> f64 {
    let mut ta: Vec<String> = tokenize(a).into_iter().collect();
    let mut tb: Vec<String> = tokenize(b).into_iter().collect();
    ta.sort();
    tb.sort();
    normalized_levenshtein(&ta.join(" "), &tb.join(" "))
}

fn ner_boost(seat_tokens: &FxHashSet<String>, master_tokens: &FxHashSet<String>) -> f64 {
    let seat_locations: FxHashSet<&str> = seat_tokens
        .iter()
        .filter(|t| LOCATION_GAZETTEER.contains(t.as_str()))
        .map(|t| t.as_str())
        .collect();
    let master_locations: FxHashSet<&str> = master_tokens
        .iter()
        .filter(|t| LOCATION_GAZETTEER.contains(t.as_str()))
        .map(|t| t.as_str())
        .collect();
    if seat_locations.intersection(&master_locations).next().is_some() {
        MAX_NER_BOOST
    } else {
        0.0
    }
}

/// Compute the composite score for one candidate against a `MatchRequest`.
/// `canonical_state` is the already-resolved canonical state for the seat
/// row (possibly `None` if `StateAliaser` could not resolve it); a `Some`
/// that disagrees with the candidate's state is a hard reject regardless of
/// every other component.
pub fn score(
    request: &MatchRequest,
    stream: crate::models::Stream,
    candidate: &Candidate,
    master_index: &MasterIndex,
    weights: &Weights,
    canonical_state: Option<&crate::models::CanonicalStateName>,
    ultra_generic_address_threshold: f64,
    ordinary_address_threshold: f64,
) -> ScoredMatch {
    let college = &candidate.college;

    if let Some(state) = canonical_state {
        if state != &college.state {
            return ScoredMatch {
                candidate: candidate.clone(),
                score: 0.0,
                components: Breakdown {
                    name_score: 0.0,
                    address_score: 0.0,
                    pincode_boost: 0.0,
                    ner_boost: 0.0,
                    prescore_component: 0.0,
                    state_mismatch: true,
                },
                method: "state_mismatch_reject".to_string(),
            };
        }
    }

    let seat_name_tokens = tokenize(&request.college);
    let master_name_tokens = tokenize(&college.normalized_name);

    let fuzzy = normalized_levenshtein(&request.college, &college.normalized_name);
    let token_set = token_set_ratio(&request.college, &college.normalized_name);
    let phonetic = phonetic_similarity(&request.college, &college.normalized_name);
    let tfidf = master_index.tfidf_cosine(stream, &seat_name_tokens, college.id);
    let name_score = [fuzzy, token_set, phonetic, tfidf]
        .into_iter()
        .fold(0.0_f64, f64::max);

    let ultra_generic = is_ultra_generic(&college.normalized_name);

    let seat_address_tokens = request.address.as_deref().map(tokenize);
    let master_address_tokens = tokenize(&college.normalized_address);

    let address_score = match &seat_address_tokens {
        Some(seat_tokens) => {
            let seat_meaningful = meaningful_tokens(seat_tokens);
            let master_meaningful = meaningful_tokens(&master_address_tokens);
            keyword_jaccard(&seat_meaningful, &master_meaningful)
        }
        None => 0.0,
    };

    let required_threshold = if ultra_generic {
        ultra_generic_address_threshold
    } else {
        ordinary_address_threshold
    };
    let address_ok = seat_address_tokens.is_none() || address_score >= required_threshold;
    if !address_ok {
        return ScoredMatch {
            candidate: candidate.clone(),
            score: 0.0,
            components: Breakdown {
                name_score,
                address_score,
                pincode_boost: 0.0,
                ner_boost: 0.0,
                prescore_component: candidate.prescore,
                state_mismatch: false,
            },
            method: format!("{}+address_guard_failed", candidate.provenance.as_str()),
        };
    }

    let seat_pincode = request
        .address
        .as_deref()
        .and_then(|a| extract_six_digit_codes(a).into_iter().next());
    let state_for_pincode = canonical_state.unwrap_or(&college.state);
    let pincode_component =
        pincode_boost(college.pincode.as_deref(), seat_pincode.as_deref(), state_for_pincode);

    let ner = match &seat_address_tokens {
        Some(seat_tokens) => ner_boost(seat_tokens, &master_address_tokens),
        None => ner_boost(&seat_name_tokens, &master_name_tokens),
    };

    // Weight redistribution: address/pincode weight only applies when the
    // corresponding field is present on at least one side; otherwise its
    // share is redistributed proportionally to the remaining components.
    let address_active = seat_address_tokens.is_some();
    let pincode_active = college.pincode.is_some() || seat_pincode.is_some();

    let mut active: Vec<(f64, f64)> = vec![
        (weights.name, name_score),
        (weights.ner, (ner / MAX_NER_BOOST).clamp(0.0, 1.0)),
        (weights.prescore, candidate.prescore),
    ];
    if address_active {
        active.push((weights.address, address_score));
    }
    if pincode_active {
        let normalized_pincode = if pincode_component >= 0.0 {
            pincode_component / MAX_PINCODE_BOOST
        } else {
            pincode_component / MIN_PINCODE_BOOST.abs()
        };
        active.push((weights.pincode, normalized_pincode.clamp(-1.0, 1.0)));
    }

    let total_weight: f64 = active.iter().map(|(w, _)| w).sum();
    let score = if total_weight > 0.0 {
        active.iter().map(|(w, v)| (w / total_weight) * v).sum::<f64>()
    } else {
        0.0
    }
    .clamp(0.0, 1.0);

    let dominant = [
        ("name_match", weights.name * name_score),
        ("pincode_match", weights.pincode * pincode_component.max(0.0)),
        ("ner_match", weights.ner * ner),
        ("address_match", weights.address * address_score),
    ]
    .into_iter()
    .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap())
    .map(|(label, _)| label)
    .unwrap_or("name_match");

    let stream_label = stream.as_str();
    let method = format!(
        "pass1_stream_{stream_label}+{}+{}",
        candidate.provenance.as_str(),
        dominant
    );

    ScoredMatch {
        candidate: candidate.clone(),
        score,
        components: Breakdown {
            name_score,
            address_score,
            pincode_boost: pincode_component,
            ner_boost: ner,
            prescore_component: candidate.prescore,
            state_mismatch: false,
        },
        method,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master_index::MasterIndex;
    use crate::models::{CanonicalStateName, CollegeId, MasterCollege, Provenance, Stream};
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn sample_index() -> MasterIndex {
        MasterIndex::build(vec![MasterCollege {
            id: CollegeId(1),
            name: "GOVERNMENT MEDICAL COLLEGE".to_string(),
            address: "THIRUVANANTHAPURAM".to_string(),
            state: CanonicalStateName::new("KERALA"),
            stream: Stream::Medical,
            normalized_name: "GOVERNMENT MEDICAL COLLEGE".to_string(),
            composite_key: "GOVERNMENT MEDICAL COLLEGE, THIRUVANANTHAPURAM".to_string(),
            normalized_address: "THIRUVANANTHAPURAM".to_string(),
            location_keywords: BTreeSet::from(["THIRUVANANTHAPURAM".to_string()]),
            pincode: None,
        }])
    }

    #[test]
    fn state_mismatch_is_hard_reject() {
        let index = sample_index();
        let college = Arc::clone(index.get(CollegeId(1)).unwrap());
        let candidate = Candidate {
            college,
            provenance: Provenance::CompositeExact,
            prescore: 1.0,
        };
        let request = MatchRequest {
            college: "GOVERNMENT MEDICAL COLLEGE".to_string(),
            state: "KARNATAKA".to_string(),
            address: None,
            course: "MBBS".to_string(),
            course_type: None,
        };
        let weights = Weights::default();
        let result = score(
            &request,
            Stream::Medical,
            &candidate,
            &index,
            &weights,
            Some(&CanonicalStateName::new("KARNATAKA")),
            0.75,
            0.25,
        );
        assert_eq!(result.score, 0.0);
        assert!(result.components.state_mismatch);
    }

    #[test]
    fn exact_composite_match_scores_high() {
        let index = sample_index();
        let college = Arc::clone(index.get(CollegeId(1)).unwrap());
        let candidate = Candidate {
            college,
            provenance: Provenance::CompositeExact,
            prescore: 1.0,
        };
        let request = MatchRequest {
            college: "GOVERNMENT MEDICAL COLLEGE".to_string(),
            state: "KERALA".to_string(),
            address: Some("THIRUVANANTHAPURAM".to_string()),
            course: "MBBS".to_string(),
            course_type: None,
        };
        let weights = Weights::default();
        let result = score(
            &request,
            Stream::Medical,
            &candidate,
            &index,
            &weights,
            Some(&CanonicalStateName::new("KERALA")),
            0.75,
            0.25,
        );
        assert!(result.score >= 0.85, "expected high score, got {}", result.score);
        assert!(result.method.contains("composite_exact"));
    }

    #[test]
    fn ultra_generic_requires_strong_address_overlap() {
        let mut colleges = vec![MasterCollege {
            id: CollegeId(2),
            name: "DISTRICT HOSPITAL".to_string(),
            address: "VIJAYAPURA KARNATAKA".to_string(),
            state: CanonicalStateName::new("KARNATAKA"),
            stream: Stream::Medical,
            normalized_name: "DISTRICT HOSPITAL".to_string(),
            composite_key: "DISTRICT HOSPITAL, VIJAYAPURA KARNATAKA".to_string(),
            normalized_address: "VIJAYAPURA KARNATAKA".to_string(),
            location_keywords: BTreeSet::from(["VIJAYAPURA".to_string()]),
            pincode: None,
        }];
        let extra = colleges.pop().unwrap();
        let index = MasterIndex::build(vec![extra]);
        let college = Arc::clone(index.get(CollegeId(2)).unwrap());
        let candidate = Candidate {
            college,
            provenance: Provenance::PhoneticBucket,
            prescore: 0.4,
        };
        let request = MatchRequest {
            college: "DISTRICT HOSPITAL".to_string(),
            state: "KARNATAKA".to_string(),
            address: Some("BALLARI ROAD KARNATAKA".to_string()),
            course: "MBBS".to_string(),
            course_type: None,
        };
        let weights = Weights::default();
        let result = score(
            &request,
            Stream::Medical,
            &candidate,
            &index,
            &weights,
            Some(&CanonicalStateName::new("KARNATAKA")),
            0.75,
            0.25,
        );
        assert_eq!(result.score, 0.0);
        assert!(result.method.contains("address_guard_failed"));
    }
}
