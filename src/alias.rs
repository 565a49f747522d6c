//! College/course/state alias substitution used by Pass 2 (§4.7).
//!
//! Distinct from the `Normalizer`'s abbreviation table: abbreviations expand
//! individual words inline as part of `normalize()`, whereas an `Alias`
//! substitutes a whole raw college/course string for a differently-spelled
//! one before Pass 1's logic reruns (e.g. a counselling-specific nickname
//! that bears no resemblance to the canonical name). Longest-match-wins,
//! grounded on the general alias-table shape described in §3.

use rustc_hash::FxHashMap;

use crate::models::{Alias, AliasKind};

/// Holds `COLLEGE`-kind aliases keyed by their (normalized) alias text,
/// ordered for longest-match-wins substitution.
#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    /// Sorted longest-first so substitution always prefers the most
    /// specific alias text.
    entries: Vec<Alias>,
}

impl AliasTable {
    pub fn new() -> Self {
        AliasTable::default()
    }

    pub fn from_aliases(aliases: impl IntoIterator<Item = Alias>) -> Self {
        let mut entries: Vec<Alias> = aliases
            .into_iter()
            .filter(|a| a.kind == AliasKind::College)
            .collect();
        entries.sort_by(|a, b| b.alias_text.len().cmp(&a.alias_text.len()));
        AliasTable { entries }
    }

    /// Substitute the seat college through the alias table, longest-match
    /// wins. Returns the substituted text and the alias text that fired, or
    /// `None` if no alias text occurs in `college`.
    pub fn expand(&self, college: &str) -> Option<(String, &str)> {
        let upper = college.to_uppercase();
        for alias in &self.entries {
            let Some(start) = upper.find(alias.alias_text.as_str()) else {
                continue;
            };
            let end = start + alias.alias_text.len();
            let prefix = &upper[..start];
            let suffix = &upper[end..];

            // `canonical_target` names the whole college, so it can restate
            // a word that already precedes the match (e.g. alias "GS MEDICAL
            // COLLEGE..." -> "SETH GS MEDICAL COLLEGE..." against raw text
            // that already reads "SETH GS..."). Splicing the full target in
            // verbatim would duplicate that leading word; strip target words
            // already present as the trailing words of `prefix` first.
            let prefix_trimmed = prefix.trim_end();
            let mut canonical = alias.canonical_target.as_str();
            while let Some(word) = canonical.split_whitespace().next() {
                if prefix_trimmed.ends_with(word) {
                    canonical = canonical[word.len()..].trim_start();
                } else {
                    break;
                }
            }

            let expanded = format!("{prefix}{canonical}{suffix}");
            return Some((expanded, alias.alias_text.as_str()));
        }
        None
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Aliases grouped by target kind, as loaded from the master store's alias
/// table (college/course/state/abbreviation). Only the `College` subset is
/// used by Pass 2 today; the others are retained for completeness of the
/// `Alias` entity and future consumers (e.g. a course alias pass).
#[derive(Debug, Clone, Default)]
pub struct AliasStore {
    pub college: AliasTable,
    pub by_kind: FxHashMap<&'static str, Vec<Alias>>,
}

impl AliasStore {
    pub fn build(aliases: Vec<Alias>) -> Self {
        let mut by_kind: FxHashMap<&'static str, Vec<Alias>> = FxHashMap::default();
        for alias in &aliases {
            let key = match alias.kind {
                AliasKind::College => "COLLEGE",
                AliasKind::Course => "COURSE",
                AliasKind::State => "STATE",
                AliasKind::Abbreviation => "ABBREVIATION",
            };
            by_kind.entry(key).or_default().push(alias.clone());
        }
        AliasStore {
            college: AliasTable::from_aliases(aliases),
            by_kind,
        }
    }
}
