//! Course → stream mapping (§4.3).
//!
//! Default rule table grounded on `examples/original_source/
//! match-and-link-counselling/enhanced_4pass_matcher.py::_detect_course_type`
//! and generalized from a single label into an ordered stream list
//! (a course can legitimately search more than one stream, DNB falling back
//! to MEDICAL). Overridable via `streams.priority_overrides` in the YAML
//! config (§6).

use std::collections::BTreeMap;

use crate::models::Stream;

/// Ordered list of streams to try for a course string, most specific first.
/// The order defines search priority: the pipeline never searches a
/// lower-priority stream once a higher one has produced an accepted match.
#[derive(Debug, Clone)]
pub struct CourseStreamMapper {
    /// Course-string fragment → ordered streams, checked before the built-in
    /// rules so config can override or add recognized fragments.
    overrides: BTreeMap<String, Vec<Stream>>,
}

impl Default for CourseStreamMapper {
    fn default() -> Self {
        CourseStreamMapper {
            overrides: BTreeMap::new(),
        }
    }
}

impl CourseStreamMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the YAML config's `streams.priority_overrides` map. Keys
    /// are course-string fragments (e.g. `"DNB-"`); values are stream names
    /// (`"MEDICAL" | "DENTAL" | "DNB"`), most-specific first. Unknown stream
    /// names in an override are ignored; that fragment falls back to the
    /// built-in rules.
    pub fn from_overrides(raw: &BTreeMap<String, Vec<String>>) -> Self {
        let mut overrides = BTreeMap::new();
        for (fragment, streams) in raw {
            let parsed: Vec<Stream> = streams
                .iter()
                .filter_map(|s| parse_stream(s))
                .collect();
            if !parsed.is_empty() {
                overrides.insert(fragment.to_uppercase(), parsed);
            }
        }
        CourseStreamMapper { overrides }
    }

    /// Returns an ordered list of streams for a course string. Never empty:
    /// an unrecognized course returns the least-restrictive ordering
    /// `[MEDICAL, DENTAL, DNB]` per spec.md §4.3.
    pub fn streams_for(&self, course: &str) -> Vec<Stream> {
        let upper = course.to_uppercase();

        for (fragment, streams) in self.overrides.iter() {
            if upper.contains(fragment.as_str()) {
                return streams.clone();
            }
        }

        if upper.contains("DNB-") || upper.contains("DNB ") || upper.starts_with("DNB") {
            return vec![Stream::Dnb, Stream::Medical];
        }

        if upper.contains("BDS")
            || upper.contains("MDS")
            || upper.contains("DENTAL")
            || upper.contains("PG DIPLOMA")
        {
            return vec![Stream::Dental];
        }

        if upper.contains("MBBS")
            || upper.contains("MD/MS")
            || upper == "MD"
            || upper.starts_with("MD ")
            || upper.contains(" MD ")
            || upper.contains("MS ")
            || upper.starts_with("MS")
            || upper.contains("DM")
            || upper.contains("MCH")
            || upper.contains("DIPLOMA")
            || upper.contains("MPH")
            || upper.contains("POST MBBS")
            || upper.contains("ALL PG COURSES")
        {
            return vec![Stream::Medical];
        }

        vec![Stream::Medical, Stream::Dental, Stream::Dnb]
    }
}

fn parse_stream(s: &str) -> Option<Stream> {
    match s.to_uppercase().as_str() {
        "MEDICAL" => Some(Stream::Medical),
        "DENTAL" => Some(Stream::Dental),
        "DNB" => Some(Stream::Dnb),
        _ => None,
    }
}
