//! The single normalization contract used throughout the core (§4.1).
//!
//! No other component may re-implement normalization; everything else in
//! the crate calls through here. This consolidates what the source spread
//! across multiple overlapping functions (§9 redesign flag).

use any_ascii::any_ascii;
use once_cell::sync::Lazy;
use regex::Regex;
use rphonetic::{Encoder, Soundex};
use rustc_hash::FxHashSet;
use unicode_normalization::UnicodeNormalization;

// ============================================================================
// REGEX PATTERNS
// ============================================================================

/// Six consecutive digits, used both to strip pin codes out of state strings
/// and to harvest codes embedded in addresses.
pub static SIX_DIGIT_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{6}\b").unwrap());

static PUNCT_FOLD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.,;:'\x22/\\_-]+").unwrap());
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static PAREN_PRIMARY: Lazy<Regex> = Lazy::new(|| Regex::new(r"\(.*").unwrap());
static PAREN_SECONDARY: Lazy<Regex> = Lazy::new(|| Regex::new(r"\(([^)]*)\)").unwrap());

/// Conservative punctuation fold for `normalize_for_exact`: keeps commas,
/// brackets and slashes (these distinguish campuses/units) but still
/// collapses whitespace and upper-cases.
static EXACT_WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Word-by-word abbreviation table, ordered; the first matching rule wins
/// and expansions are idempotent (expanding twice is a no-op because the
/// expanded form never itself matches a key).
pub static ABBREVIATIONS: Lazy<Vec<(&'static str, &'static str)>> = Lazy::new(|| {
    vec![
        ("GOVT", "GOVERNMENT"),
        ("GOVT.", "GOVERNMENT"),
        ("GOV", "GOVERNMENT"),
        ("GMC", "GOVERNMENT MEDICAL COLLEGE"),
        ("GDC", "GOVERNMENT DENTAL COLLEGE"),
        ("MC", "MEDICAL COLLEGE"),
        ("DC", "DENTAL COLLEGE"),
        ("ESIC", "EMPLOYEES STATE INSURANCE CORPORATION"),
        ("AIIMS", "ALL INDIA INSTITUTE OF MEDICAL SCIENCES"),
        ("JIPMER", "JAWAHARLAL INSTITUTE OF POSTGRADUATE MEDICAL EDUCATION AND RESEARCH"),
        ("PGIMER", "POST GRADUATE INSTITUTE OF MEDICAL EDUCATION AND RESEARCH"),
        ("VMMC", "VARDHMAN MAHAVIR MEDICAL COLLEGE"),
        ("LHMC", "LADY HARDINGE MEDICAL COLLEGE"),
        ("MAMC", "MAULANA AZAD MEDICAL COLLEGE"),
        ("UCMS", "UNIVERSITY COLLEGE OF MEDICAL SCIENCES"),
        ("KGMU", "KING GEORGE'S MEDICAL UNIVERSITY"),
        ("BHU", "BANARAS HINDU UNIVERSITY"),
        ("PVT", "PRIVATE"),
        ("PVT.", "PRIVATE"),
        ("LTD", "LIMITED"),
        ("LTD.", "LIMITED"),
        ("DT", "DISTRICT"),
        ("DIST", "DISTRICT"),
        ("DIST.", "DISTRICT"),
        ("HOSP", "HOSPITAL"),
        ("HOSP.", "HOSPITAL"),
        ("INST", "INSTITUTE"),
        ("INST.", "INSTITUTE"),
        ("UNIV", "UNIVERSITY"),
        ("COLL", "COLLEGE"),
        ("MED", "MEDICAL"),
        ("DR", "DR"),
        ("DR.", "DR"),
        ("ST", "SAINT"),
        ("ST.", "SAINT"),
    ]
});

/// Stop-words dropped during tokenization; kept distinct from the broken
/// word allow-list below (different purposes: one discards noise tokens,
/// the other protects real short words from being merged as fragments).
pub static STOPWORDS: Lazy<FxHashSet<&'static str>> = Lazy::new(|| {
    [
        "OF", "AND", "THE", "FOR", "WITH", "IN", "AT", "TO", "A", "AN", "ON",
    ]
    .into_iter()
    .collect()
});

/// Valid short tokens that must never be merged into the preceding word by
/// `repair_broken_words`, even though they are ≤3 characters. Grounded
/// directly on `fix_broken_words.py`'s `valid_short_words` set, with `FOR`
/// added alongside it.
pub static VALID_SHORT_WORDS: Lazy<FxHashSet<&'static str>> = Lazy::new(|| {
    [
        "OF", "AND", "THE", "FOR", "PVT", "LTD", "DR", "MR", "MS", "NO",
    ]
    .into_iter()
    .collect()
});

// ============================================================================
// NORMALIZER
// ============================================================================

/// Fold Unicode text to upper-case ASCII: NFKD decomposition strips
/// diacritics, then `any_ascii` transliterates anything left over.
fn fold_to_ascii_upper(s: &str) -> String {
    let stripped: String = s.nfkd().filter(|c| !is_combining_mark(*c)).collect();
    any_ascii(&stripped).to_uppercase()
}

fn is_combining_mark(c: char) -> bool {
    matches!(c as u32, 0x0300..=0x036F | 0x1AB0..=0x1AFF | 0x1DC0..=0x1DFF | 0xFE20..=0xFE2F)
}

fn expand_abbreviations(s: &str) -> String {
    let mut out = Vec::new();
    for word in s.split_whitespace() {
        let mut expanded = None;
        for (abbr, full) in ABBREVIATIONS.iter() {
            if word == *abbr {
                expanded = Some(*full);
                break;
            }
        }
        out.push(expanded.unwrap_or(word).to_string());
    }
    out.join(" ")
}

/// Upper-case, whitespace-collapsed, punctuation-folded, abbreviation-
/// expanded string used for display-free comparison. Never fails; empty
/// input returns empty string.
pub fn normalize(s: &str) -> String {
    if s.is_empty() {
        return String::new();
    }
    let folded = fold_to_ascii_upper(s);
    let folded = repair_broken_words(&folded);
    let no_punct = PUNCT_FOLD.replace_all(&folded, " ");
    let expanded = expand_abbreviations(&no_punct);
    WHITESPACE.replace_all(expanded.trim(), " ").to_string()
}

/// Conservative variant preserving commas, brackets, and slashes; used to
/// build `composite_key`, where campus/unit distinctions inside parentheses
/// must survive.
pub fn normalize_for_exact(s: &str) -> String {
    if s.is_empty() {
        return String::new();
    }
    let folded = fold_to_ascii_upper(s);
    EXACT_WHITESPACE.replace_all(folded.trim(), " ").to_string()
}

/// Merges single/double/triple-character alphabetic fragments into the
/// preceding word, e.g. `"VARDH MAN INSTITU TE"` → `"VARDHMAN INSTITUTE"`,
/// unless the fragment is a recognized short word. Grounded directly on
/// `fix_broken_words.py`.
pub fn repair_broken_words(s: &str) -> String {
    if s.is_empty() {
        return s.to_string();
    }
    let words: Vec<&str> = s.split_whitespace().collect();
    if words.len() <= 1 {
        return s.to_string();
    }

    let mut result: Vec<String> = Vec::new();
    let mut i = 0;
    while i < words.len() {
        let mut current = words[i].to_string();
        while i + 1 < words.len() {
            let next = words[i + 1];
            let is_fragment_candidate =
                next.len() <= 3 && next.chars().all(|c| c.is_ascii_alphabetic());
            if is_fragment_candidate && !VALID_SHORT_WORDS.contains(next) {
                current.push_str(next);
                i += 1;
                continue;
            }
            break;
        }
        result.push(current);
        i += 1;
    }
    result.join(" ")
}

/// Text before the first `(`, trimmed. Used with [`extract_secondary`] to
/// handle `"X COLLEGE (Y CAMPUS)"`.
pub fn extract_primary(s: &str) -> String {
    PAREN_PRIMARY.replace(s, "").trim().to_string()
}

/// Text inside the first `(...)`, or empty string if none.
pub fn extract_secondary(s: &str) -> String {
    PAREN_SECONDARY
        .captures(s)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default()
}

/// Whitespace+punctuation split, dropping the stop-word set and tokens of
/// length ≤ 2.
pub fn tokenize(s: &str) -> FxHashSet<String> {
    let folded = fold_to_ascii_upper(s);
    let no_punct = PUNCT_FOLD.replace_all(&folded, " ");
    no_punct
        .split_whitespace()
        .filter(|w| w.len() > 2 && !STOPWORDS.contains(*w))
        .map(|w| w.to_string())
        .collect()
}

// ============================================================================
// PHONETIC
// ============================================================================

thread_local! {
    static SOUNDEX: Soundex = Soundex::default();
}

/// Soundex-style phonetic key for a single word. Degrades gracefully: an
/// empty or non-alphabetic word returns an empty key rather than panicking,
/// so callers can treat phonetic matching as simply contributing nothing
/// (§9: "phonetic and NER components are optional and graceful").
pub fn phonetic_key(word: &str) -> String {
    if word.is_empty() {
        return String::new();
    }
    SOUNDEX.with(|enc| enc.encode(word))
}

/// Jaccard overlap, in `[0,1]`, of the multisets of per-token phonetic keys
/// for two already-tokenized strings.
pub fn phonetic_similarity(a: &str, b: &str) -> f64 {
    let keys_a: FxHashSet<String> = tokenize(a).iter().map(|t| phonetic_key(t)).collect();
    let keys_b: FxHashSet<String> = tokenize(b).iter().map(|t| phonetic_key(t)).collect();
    if keys_a.is_empty() || keys_b.is_empty() {
        return 0.0;
    }
    let intersection = keys_a.intersection(&keys_b).count();
    let union = keys_a.union(&keys_b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Extract all six-digit codes appearing in a free-text address, in order
/// of appearance.
pub fn extract_six_digit_codes(address: &str) -> Vec<String> {
    SIX_DIGIT_CODE
        .find_iter(address)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Jaccard similarity between two keyword sets, normalized by the smaller
/// side (so a short address isn't unfairly penalized against a long one).
pub fn keyword_jaccard(a: &FxHashSet<String>, b: &FxHashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let smaller = a.len().min(b.len());
    if smaller == 0 {
        0.0
    } else {
        intersection as f64 / smaller as f64
    }
}
