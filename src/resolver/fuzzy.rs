//! Fuzzy fixture disambiguation.
//!
//! When the feed does not know a wager's event id, the resolver asks a
//! `FuzzyMatcher` to pick the fixture from a list of same-day candidates.
//! `SimilarityMatcher` is the local, free first pass; `AiMatcher` (see
//! `llm.rs`) is the optional second opinion.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use strsim::jaro_winkler;
use thiserror::Error;

use super::provider::Candidate;

/// What the wager believes it was placed on.
#[derive(Debug, Clone)]
pub struct ExpectedFixture {
    pub home_team: String,
    pub away_team: String,
    pub start_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchDecision {
    Matched { event_id: String, confidence: f64 },
    NoMatch,
}

#[derive(Debug, Error)]
pub enum MatcherError {
    /// Every credential is parked on quota
    #[error("all matcher credentials exhausted")]
    Exhausted,
    #[error("matcher failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait FuzzyMatcher: Send + Sync {
    async fn pick(
        &self,
        expected: &ExpectedFixture,
        candidates: &[Candidate],
    ) -> Result<MatchDecision, MatcherError>;

    fn name(&self) -> &str;
}

/// Club suffixes and filler that carry no identity.
const NOISE_TOKENS: &[&str] = &[
    "fc", "cf", "afc", "sc", "ac", "cd", "sv", "fk", "bk", "if", "club", "the", "de", "calcio",
];

/// Local matcher: Jaro-Winkler over normalized team names plus kick-off proximity.
pub struct SimilarityMatcher {
    /// Minimum score for a confident pick
    threshold: f64,
    /// Runner-up must trail the best by at least this much
    margin: f64,
}

impl SimilarityMatcher {
    pub fn new(threshold: f64) -> Self {
        SimilarityMatcher {
            threshold,
            margin: 0.03,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Score in [0, 1]: 80% names, 20% kick-off time.
    pub fn score(&self, expected: &ExpectedFixture, candidate: &Candidate) -> f64 {
        let home = team_similarity(&expected.home_team, &candidate.home_team);
        let away = team_similarity(&expected.away_team, &candidate.away_team);
        let names = (home + away) / 2.0;
        // Both sides must resemble the wager, one strong name is not enough
        let names = if home.min(away) < 0.6 { names * 0.5 } else { names };

        let time = match candidate.start_time {
            Some(t) => {
                let hours = (t - expected.start_time).num_minutes().abs() as f64 / 60.0;
                if hours <= 1.0 {
                    1.0
                } else {
                    (1.0 - (hours - 1.0) / 35.0).max(0.0)
                }
            }
            None => 0.5,
        };
        0.8 * names + 0.2 * time
    }

    /// Best candidate with its score, if any.
    pub fn rank(&self, expected: &ExpectedFixture, candidates: &[Candidate]) -> Vec<(f64, usize)> {
        let mut scored: Vec<(f64, usize)> = candidates
            .iter()
            .enumerate()
            .map(|(i, c)| (self.score(expected, c), i))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored
    }

    pub fn decide(&self, expected: &ExpectedFixture, candidates: &[Candidate]) -> MatchDecision {
        let ranked = self.rank(expected, candidates);
        let Some(&(best, idx)) = ranked.first() else {
            return MatchDecision::NoMatch;
        };
        if best < self.threshold {
            return MatchDecision::NoMatch;
        }
        if let Some(&(second, _)) = ranked.get(1) {
            if best - second < self.margin {
                return MatchDecision::NoMatch;
            }
        }
        MatchDecision::Matched {
            event_id: candidates[idx].id.clone(),
            confidence: best,
        }
    }
}

#[async_trait]
impl FuzzyMatcher for SimilarityMatcher {
    async fn pick(
        &self,
        expected: &ExpectedFixture,
        candidates: &[Candidate],
    ) -> Result<MatchDecision, MatcherError> {
        Ok(self.decide(expected, candidates))
    }

    fn name(&self) -> &str {
        "similarity"
    }
}

/// Jaro-Winkler on normalized names; a token-subset match ("Man United" vs
/// "Manchester United") counts as near-identical.
pub fn team_similarity(a: &str, b: &str) -> f64 {
    let na = normalize_team(a);
    let nb = normalize_team(b);
    if na.is_empty() || nb.is_empty() {
        return 0.0;
    }
    let joined_a = na.join(" ");
    let joined_b = nb.join(" ");
    if joined_a == joined_b {
        return 1.0;
    }
    let jw = jaro_winkler(&joined_a, &joined_b);

    let (short, long) = if na.len() <= nb.len() { (&na, &nb) } else { (&nb, &na) };
    let covered = short
        .iter()
        .all(|t| long.iter().any(|l| l == t || (t.len() >= 3 && l.starts_with(t.as_str()))));
    if covered {
        jw.max(0.95)
    } else {
        jw
    }
}

/// "Arsenal F.C." → ["arsenal"]
fn normalize_team(name: &str) -> Vec<String> {
    name.to_lowercase()
        .replace('.', "")
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .filter(|s| !NOISE_TOKENS.contains(s))
        .map(|s| s.to_string())
        .collect()
}
