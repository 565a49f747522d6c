//! Stage B verification providers (§4.8, §6 `LlmConfig`).
//!
//! Grounded on the extractor's `reqwest::blocking` usage for outbound HTTP
//! (already a teacher dependency) for the production provider, plus a
//! deterministic in-memory fake for tests and for `--llm off` runs, which
//! never actually constructs an HTTP client.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::MatchError;

/// One model's verdict on a single proposed match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Approve,
    Reject,
    /// Counted as neither approve nor reject in the consensus rule (§4.8);
    /// recorded when a model times out or returns an unparseable response.
    Abstain,
}

/// Fields handed to a Stage B model: enough context to judge the match
/// without exposing row-store internals.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationPrompt {
    pub seat_college: String,
    pub seat_state: String,
    pub seat_address: Option<String>,
    pub master_college: String,
    pub master_state: String,
    pub master_address: String,
    pub candidate_score: f64,
    pub candidate_method: String,
}

#[derive(Debug, Clone)]
pub struct VerificationResponse {
    pub verdict: Verdict,
    pub rationale: String,
}

pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;
    fn verify(&self, prompt: &VerificationPrompt) -> Result<VerificationResponse, MatchError>;
}

/// `reqwest::blocking`-backed provider speaking a minimal chat-completion
/// style JSON contract. One instance per configured model (§6 `LlmConfig`).
pub struct HttpLlmProvider {
    name: String,
    endpoint: String,
    api_key: Option<String>,
    client: reqwest::blocking::Client,
    timeout_ms: u64,
}

impl HttpLlmProvider {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>, api_key: Option<String>, timeout_ms: u64) -> Result<Self, MatchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| MatchError::LlmProviderError {
                model: "<client-build>".to_string(),
                detail: e.to_string(),
            })?;
        Ok(HttpLlmProvider {
            name: name.into(),
            endpoint: endpoint.into(),
            api_key,
            client,
            timeout_ms,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ProviderReply {
    verdict: String,
    rationale: String,
}

impl LlmProvider for HttpLlmProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn verify(&self, prompt: &VerificationPrompt) -> Result<VerificationResponse, MatchError> {
        let mut req = self.client.post(&self.endpoint).json(prompt);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().map_err(|e| {
            if e.is_timeout() {
                MatchError::LlmTimeout {
                    model: self.name.clone(),
                    elapsed_ms: self.timeout_ms,
                }
            } else {
                MatchError::LlmProviderError {
                    model: self.name.clone(),
                    detail: e.to_string(),
                }
            }
        })?;
        let reply: ProviderReply = resp.json().map_err(|e| MatchError::LlmProviderError {
            model: self.name.clone(),
            detail: format!("malformed response body: {e}"),
        })?;
        let verdict = match reply.verdict.to_ascii_uppercase().as_str() {
            "APPROVE" => Verdict::Approve,
            "REJECT" => Verdict::Reject,
            _ => Verdict::Abstain,
        };
        Ok(VerificationResponse {
            verdict,
            rationale: reply.rationale,
        })
    }
}

/// Deterministic fake used by tests and available for `--llm off` dry runs:
/// approves whenever the candidate score is at or above a configured floor.
pub struct FakeLlmProvider {
    name: String,
    approve_above: f64,
}

impl FakeLlmProvider {
    pub fn new(name: impl Into<String>, approve_above: f64) -> Self {
        FakeLlmProvider {
            name: name.into(),
            approve_above,
        }
    }
}

impl LlmProvider for FakeLlmProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn verify(&self, prompt: &VerificationPrompt) -> Result<VerificationResponse, MatchError> {
        let verdict = if prompt.candidate_score >= self.approve_above {
            Verdict::Approve
        } else {
            Verdict::Reject
        };
        Ok(VerificationResponse {
            verdict,
            rationale: format!("score {:.3} vs floor {:.3}", prompt.candidate_score, self.approve_above),
        })
    }
}

/// One provider's cached verdict, keyed alongside the model identifier so
/// Stage B can replay every vote (not just the winning verdict) out of the
/// cache (§4.8: "Votes, rationales, and the final verdict are persisted").
#[derive(Debug, Clone)]
pub struct CachedVote {
    pub model: String,
    pub verdict: Verdict,
    pub rationale: String,
}

/// Cached Stage B votes, keyed by `(group_signature, master_college_id)`,
/// invalidated wholesale whenever the master version hash changes (§4.9).
#[derive(Debug, Default)]
pub struct LlmCache {
    version_hash: Option<[u8; 16]>,
    entries: HashMap<(String, i64), Vec<CachedVote>>,
}

impl LlmCache {
    pub fn new() -> Self {
        LlmCache::default()
    }

    /// Drops all cached verdicts if `current_hash` differs from the one the
    /// cache was last populated under.
    pub fn check_invalidate(&mut self, current_hash: [u8; 16]) {
        if self.version_hash != Some(current_hash) {
            self.entries.clear();
            self.version_hash = Some(current_hash);
        }
    }

    /// All cached votes (one per provider that voted last time) for this
    /// group/college pair, or `None` if Stage B hasn't run for it yet.
    pub fn get(&self, group_signature: &str, college_id: i64) -> Option<&[CachedVote]> {
        self.entries
            .get(&(group_signature.to_string(), college_id))
            .map(Vec::as_slice)
    }

    /// Last-writer-wins per §5 "Ordering guarantees": a fresh consensus run
    /// replaces the whole vote set for this key rather than merging into it.
    pub fn put(&mut self, group_signature: &str, college_id: i64, votes: Vec<CachedVote>) {
        self.entries.insert((group_signature.to_string(), college_id), votes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt(score: f64) -> VerificationPrompt {
        VerificationPrompt {
            seat_college: "GOVT MEDICAL COLLEGE".to_string(),
            seat_state: "KERALA".to_string(),
            seat_address: None,
            master_college: "GOVERNMENT MEDICAL COLLEGE".to_string(),
            master_state: "KERALA".to_string(),
            master_address: "THIRUVANANTHAPURAM".to_string(),
            candidate_score: score,
            candidate_method: "pass1_stream_MEDICAL+exact_normalized_name".to_string(),
        }
    }

    #[test]
    fn fake_provider_approves_above_floor() {
        let provider = FakeLlmProvider::new("fake-a", 0.80);
        let resp = provider.verify(&prompt(0.92)).unwrap();
        assert_eq!(resp.verdict, Verdict::Approve);
        let resp = provider.verify(&prompt(0.5)).unwrap();
        assert_eq!(resp.verdict, Verdict::Reject);
    }

    #[test]
    fn cache_invalidates_on_version_change() {
        let mut cache = LlmCache::new();
        cache.check_invalidate([1u8; 16]);
        let votes = vec![CachedVote {
            model: "fake-a".to_string(),
            verdict: Verdict::Approve,
            rationale: "score 0.900 vs floor 0.800".to_string(),
        }];
        cache.put("sig", 7, votes);
        let cached = cache.get("sig", 7).expect("vote should be cached");
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].verdict, Verdict::Approve);
        cache.check_invalidate([2u8; 16]);
        assert!(cache.get("sig", 7).is_none());
    }
}
