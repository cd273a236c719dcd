//! Match result resolution.
//!
//! Pipeline per leg: cache → provider by id → fuzzy disambiguation.  The
//! fuzzy stage is a separate step with its own rate limit, timeout and
//! circuit breaker; anything that stops it from answering degrades to
//! `NotFinished` so the wager is simply looked at again later.

pub mod circuit_breaker;
pub mod credentials;
pub mod fuzzy;
pub mod llm;
pub mod provider;
pub mod sports;

use chrono::{DateTime, Duration, Utc};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::Serialize;
use std::collections::HashSet;
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{alias_key, candidates_key, event_key, CacheTier, TtlCache};
use crate::db::models::Leg;
use crate::error::{SettlementError, SettlementResult};

use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use fuzzy::{ExpectedFixture, FuzzyMatcher, MatchDecision, MatcherError, SimilarityMatcher};
pub use provider::{Candidate, EventStatus, MatchProvider, ProviderEvent, SelectionResult};

/// What the fixture cache holds.
#[derive(Debug, Clone)]
pub enum CachedFixture {
    Event(ProviderEvent),
    Candidates(Vec<Candidate>),
    /// Wager event id → provider id found by the fuzzy stage
    Alias { event_id: String, confidence: f64 },
}

pub type FixtureCache = TtlCache<CachedFixture>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum MatchSource {
    Cache,
    Provider,
    Fuzzy { confidence: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinalResult {
    /// Provider id the result belongs to
    pub event_id: String,
    pub home_score: i32,
    pub away_score: i32,
    pub selection_results: Vec<SelectionResult>,
    pub matched_by: MatchSource,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Finished(FinalResult),
    NotFinished,
    /// Postponed, cancelled or abandoned
    Cancelled { reason: String },
}

/// One leg's lookup key and snapshot.
#[derive(Debug, Clone)]
pub struct ResolveRequest {
    pub event_id: String,
    pub sport: String,
    pub home_team: String,
    pub away_team: String,
    pub start_time: DateTime<Utc>,
}

impl From<&Leg> for ResolveRequest {
    fn from(leg: &Leg) -> Self {
        ResolveRequest {
            event_id: leg.event_id.clone(),
            sport: leg.sport.clone(),
            home_team: leg.home_team.clone(),
            away_team: leg.away_team.clone(),
            start_time: leg.event_start_time,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub fuzzy_threshold: f64,
    /// Fuzzy attempts allowed per minute across all sweeps
    pub fuzzy_per_minute: u32,
    pub matcher_timeout: std::time::Duration,
    pub breaker: CircuitBreakerConfig,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig {
            fuzzy_threshold: 0.85,
            fuzzy_per_minute: 30,
            matcher_timeout: std::time::Duration::from_secs(15),
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

pub struct MatchResolver {
    provider: Arc<dyn MatchProvider>,
    cache: FixtureCache,
    local: SimilarityMatcher,
    ai: Option<Arc<dyn FuzzyMatcher>>,
    limiter: DefaultDirectRateLimiter,
    breaker: CircuitBreaker,
    matcher_timeout: std::time::Duration,
}

impl MatchResolver {
    pub fn new(
        provider: Arc<dyn MatchProvider>,
        cache: FixtureCache,
        ai: Option<Arc<dyn FuzzyMatcher>>,
        config: ResolverConfig,
    ) -> Self {
        let per_minute = NonZeroU32::new(config.fuzzy_per_minute).unwrap_or(NonZeroU32::MIN);
        MatchResolver {
            provider,
            cache,
            local: SimilarityMatcher::new(config.fuzzy_threshold),
            ai,
            limiter: RateLimiter::direct(Quota::per_minute(per_minute)),
            breaker: CircuitBreaker::new(config.breaker),
            matcher_timeout: config.matcher_timeout,
        }
    }

    pub fn cache(&self) -> &FixtureCache {
        &self.cache
    }

    /// Resolve one event to a final result, a reschedule signal or a call-off.
    pub async fn resolve(&self, req: &ResolveRequest) -> SettlementResult<Resolution> {
        if let Some(CachedFixture::Alias { event_id, confidence }) =
            self.cache.get(&alias_key(&req.event_id)).await
        {
            if let Some(res) = self
                .lookup(&event_id, MatchSource::Fuzzy { confidence })
                .await?
            {
                return Ok(res);
            }
        }

        // An exact id always wins over a fuzzy match
        if let Some(res) = self.lookup(&req.event_id, MatchSource::Provider).await? {
            return Ok(res);
        }

        debug!(
            "Event {} unknown to {}, trying fuzzy match",
            req.event_id,
            self.provider.name()
        );
        self.resolve_fuzzy(req).await
    }

    /// Cache, then provider.  `None` when the provider does not know the id.
    async fn lookup(&self, id: &str, source: MatchSource) -> SettlementResult<Option<Resolution>> {
        if let Some(CachedFixture::Event(ev)) = self.cache.get(&event_key(id)).await {
            let source = match source {
                MatchSource::Provider => MatchSource::Cache,
                other => other,
            };
            return Ok(Some(classify(&ev, source)));
        }

        let fetched = self.provider.fetch_event(id).await.map_err(|e| {
            SettlementError::Provider(format!("{}: {:#}", self.provider.name(), e))
        })?;
        let Some(ev) = fetched else {
            return Ok(None);
        };
        let resolution = classify(&ev, source);
        self.cache
            .set(event_key(id), CachedFixture::Event(ev.clone()), tier_for(ev.status))
            .await;
        Ok(Some(resolution))
    }

    async fn resolve_fuzzy(&self, req: &ResolveRequest) -> SettlementResult<Resolution> {
        if self.limiter.check().is_err() {
            debug!("Fuzzy path rate limited, rescheduling {}", req.event_id);
            return Ok(Resolution::NotFinished);
        }

        let candidates = self.candidates(req).await?;
        let expected = ExpectedFixture {
            home_team: req.home_team.clone(),
            away_team: req.away_team.clone(),
            start_time: req.start_time,
        };

        let decision = match self.local.decide(&expected, &candidates) {
            matched @ MatchDecision::Matched { .. } => matched,
            MatchDecision::NoMatch => match &self.ai {
                Some(ai) if !candidates.is_empty() => {
                    match self.ask_ai(ai.as_ref(), &expected, &candidates).await? {
                        Some(decision) => decision,
                        None => return Ok(Resolution::NotFinished),
                    }
                }
                _ => MatchDecision::NoMatch,
            },
        };

        match decision {
            MatchDecision::Matched { event_id, confidence }
                if confidence >= self.local.threshold() =>
            {
                info!(
                    "Fuzzy matched {} ({} vs {}) → {} (confidence {:.2})",
                    req.event_id, req.home_team, req.away_team, event_id, confidence
                );
                self.cache
                    .set(
                        alias_key(&req.event_id),
                        CachedFixture::Alias {
                            event_id: event_id.clone(),
                            confidence,
                        },
                        CacheTier::Long,
                    )
                    .await;
                match self.lookup(&event_id, MatchSource::Fuzzy { confidence }).await? {
                    Some(res) => Ok(res),
                    None => Err(SettlementError::AmbiguousMatch {
                        event_id: req.event_id.clone(),
                    }),
                }
            }
            _ => Err(SettlementError::AmbiguousMatch {
                event_id: req.event_id.clone(),
            }),
        }
    }

    /// `None` means the matcher could not answer and the caller should reschedule.
    async fn ask_ai(
        &self,
        ai: &dyn FuzzyMatcher,
        expected: &ExpectedFixture,
        candidates: &[Candidate],
    ) -> SettlementResult<Option<MatchDecision>> {
        if !self.breaker.allow() {
            debug!("Matcher breaker open, skipping {}", ai.name());
            return Ok(None);
        }
        match tokio::time::timeout(self.matcher_timeout, ai.pick(expected, candidates)).await {
            Err(_) => {
                warn!("Matcher {} timed out after {:?}", ai.name(), self.matcher_timeout);
                self.breaker.record_failure();
                Ok(None)
            }
            Ok(Err(MatcherError::Exhausted)) => {
                warn!("Matcher {} has no usable credentials", ai.name());
                Ok(None)
            }
            Ok(Err(MatcherError::Failed(msg))) => {
                self.breaker.record_failure();
                Err(SettlementError::Provider(msg))
            }
            Ok(Ok(decision)) => {
                self.breaker.record_success();
                Ok(Some(decision))
            }
        }
    }

    /// Fixtures within a day either side of the expected kick-off.
    async fn candidates(&self, req: &ResolveRequest) -> SettlementResult<Vec<Candidate>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for offset in -1..=1 {
            let date = (req.start_time + Duration::days(offset)).date_naive();
            let key = candidates_key(&req.sport, date);
            let day = match self.cache.get(&key).await {
                Some(CachedFixture::Candidates(list)) => list,
                _ => {
                    let list = self
                        .provider
                        .list_candidates(date, &req.sport)
                        .await
                        .map_err(|e| {
                            SettlementError::Provider(format!(
                                "{} candidates: {:#}",
                                self.provider.name(),
                                e
                            ))
                        })?;
                    self.cache
                        .set(key, CachedFixture::Candidates(list.clone()), CacheTier::Upcoming)
                        .await;
                    list
                }
            };
            for c in day {
                if seen.insert(c.id.clone()) {
                    out.push(c);
                }
            }
        }
        Ok(out)
    }
}

fn classify(ev: &ProviderEvent, source: MatchSource) -> Resolution {
    match ev.status {
        EventStatus::Finished => match (ev.home_score, ev.away_score) {
            (Some(home_score), Some(away_score)) => Resolution::Finished(FinalResult {
                event_id: ev.id.clone(),
                home_score,
                away_score,
                selection_results: ev.selection_results.clone(),
                matched_by: source,
            }),
            _ => {
                warn!("Event {} reported finished without a score", ev.id);
                Resolution::NotFinished
            }
        },
        s if s.is_called_off() => Resolution::Cancelled {
            reason: format!("event {} {:?}", ev.id, s).to_lowercase(),
        },
        _ => Resolution::NotFinished,
    }
}

fn tier_for(status: EventStatus) -> CacheTier {
    match status {
        s if s.is_live() => CacheTier::Live,
        EventStatus::Scheduled | EventStatus::Postponed => CacheTier::Upcoming,
        _ => CacheTier::Long,
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory result feed.
    #[derive(Default)]
    pub struct MockProvider {
        pub events: Mutex<HashMap<String, ProviderEvent>>,
        pub candidates: Mutex<Vec<Candidate>>,
        pub fail: std::sync::atomic::AtomicBool,
        pub fetches: AtomicUsize,
    }

    impl MockProvider {
        pub fn put(&self, ev: ProviderEvent) {
            self.events.lock().unwrap().insert(ev.id.clone(), ev);
        }
    }

    #[async_trait]
    impl MatchProvider for MockProvider {
        async fn fetch_event(&self, event_id: &str) -> Result<Option<ProviderEvent>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("feed down");
            }
            Ok(self.events.lock().unwrap().get(event_id).cloned())
        }

        async fn list_candidates(&self, date: NaiveDate, _sport: &str) -> Result<Vec<Candidate>> {
            Ok(self
                .candidates
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.start_time.map(|t| t.date_naive()) == Some(date))
                .cloned()
                .collect())
        }

        fn name(&self) -> &str {
            "mock"
        }
    }

    pub fn event(id: &str, status: EventStatus, score: Option<(i32, i32)>) -> ProviderEvent {
        ProviderEvent {
            id: id.into(),
            sport: "soccer".into(),
            league: None,
            home_team: "Arsenal".into(),
            away_team: "Chelsea".into(),
            start_time: None,
            status,
            home_score: score.map(|s| s.0),
            away_score: score.map(|s| s.1),
            selection_results: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::cache::TierTtls;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn kickoff() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 15, 0, 0).unwrap()
    }

    fn request(id: &str, home: &str, away: &str) -> ResolveRequest {
        ResolveRequest {
            event_id: id.into(),
            sport: "soccer".into(),
            home_team: home.into(),
            away_team: away.into(),
            start_time: kickoff(),
        }
    }

    fn resolver(
        provider: Arc<MockProvider>,
        ai: Option<Arc<dyn FuzzyMatcher>>,
        config: ResolverConfig,
    ) -> MatchResolver {
        MatchResolver::new(provider, TtlCache::new(TierTtls::default()), ai, config)
    }

    struct ScriptedMatcher {
        calls: AtomicUsize,
        reply: fn() -> Result<MatchDecision, MatcherError>,
        delay: std::time::Duration,
    }

    #[async_trait]
    impl FuzzyMatcher for ScriptedMatcher {
        async fn pick(
            &self,
            _expected: &ExpectedFixture,
            _candidates: &[Candidate],
        ) -> Result<MatchDecision, MatcherError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            (self.reply)()
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn renamed_candidate() -> Candidate {
        Candidate {
            id: "feed-77".into(),
            home_team: "Arsenal FC".into(),
            away_team: "Chelsea FC".into(),
            start_time: Some(kickoff()),
        }
    }

    #[tokio::test]
    async fn test_exact_id_finished_then_cached() {
        let provider = Arc::new(MockProvider::default());
        provider.put(event("e1", EventStatus::Finished, Some((2, 1))));
        let r = resolver(provider.clone(), None, ResolverConfig::default());

        match r.resolve(&request("e1", "Arsenal", "Chelsea")).await.unwrap() {
            Resolution::Finished(res) => {
                assert_eq!((res.home_score, res.away_score), (2, 1));
                assert_eq!(res.matched_by, MatchSource::Provider);
            }
            other => panic!("unexpected {:?}", other),
        }
        match r.resolve(&request("e1", "Arsenal", "Chelsea")).await.unwrap() {
            Resolution::Finished(res) => assert_eq!(res.matched_by, MatchSource::Cache),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_in_progress_is_not_finished() {
        let provider = Arc::new(MockProvider::default());
        provider.put(event("e1", EventStatus::InProgress, Some((0, 0))));
        let r = resolver(provider, None, ResolverConfig::default());
        assert_eq!(
            r.resolve(&request("e1", "Arsenal", "Chelsea")).await.unwrap(),
            Resolution::NotFinished
        );
    }

    #[tokio::test]
    async fn test_postponed_is_cancelled() {
        let provider = Arc::new(MockProvider::default());
        provider.put(event("e1", EventStatus::Postponed, None));
        let r = resolver(provider, None, ResolverConfig::default());
        assert!(matches!(
            r.resolve(&request("e1", "Arsenal", "Chelsea")).await.unwrap(),
            Resolution::Cancelled { .. }
        ));
    }

    #[tokio::test]
    async fn test_provider_failure_is_provider_error() {
        let provider = Arc::new(MockProvider::default());
        provider.fail.store(true, Ordering::SeqCst);
        let r = resolver(provider, None, ResolverConfig::default());
        let err = r.resolve(&request("e1", "Arsenal", "Chelsea")).await.unwrap_err();
        assert!(matches!(err, SettlementError::Provider(_)));
    }

    #[tokio::test]
    async fn test_fuzzy_fallback_finds_renamed_event() {
        let provider = Arc::new(MockProvider::default());
        provider.put(event("feed-77", EventStatus::Finished, Some((1, 1))));
        provider.candidates.lock().unwrap().push(renamed_candidate());
        let r = resolver(provider.clone(), None, ResolverConfig::default());

        match r.resolve(&request("book-1", "Arsenal", "Chelsea")).await.unwrap() {
            Resolution::Finished(res) => {
                assert_eq!(res.event_id, "feed-77");
                assert!(matches!(res.matched_by, MatchSource::Fuzzy { .. }));
            }
            other => panic!("unexpected {:?}", other),
        }

        // Second resolve goes through the cached alias
        let res = r.resolve(&request("book-1", "Arsenal", "Chelsea")).await.unwrap();
        assert!(matches!(res, Resolution::Finished(_)));
    }

    #[tokio::test]
    async fn test_no_confident_candidate_is_ambiguous() {
        let provider = Arc::new(MockProvider::default());
        provider.candidates.lock().unwrap().push(Candidate {
            id: "x".into(),
            home_team: "Everton".into(),
            away_team: "Fulham".into(),
            start_time: Some(kickoff()),
        });
        let r = resolver(provider, None, ResolverConfig::default());
        let err = r.resolve(&request("book-1", "Arsenal", "Chelsea")).await.unwrap_err();
        assert!(matches!(err, SettlementError::AmbiguousMatch { .. }));
    }

    #[tokio::test]
    async fn test_ai_exhaustion_degrades_to_not_finished() {
        let provider = Arc::new(MockProvider::default());
        provider.candidates.lock().unwrap().push(Candidate {
            id: "x".into(),
            home_team: "Bayern München".into(),
            away_team: "BVB".into(),
            start_time: Some(kickoff()),
        });
        let ai = Arc::new(ScriptedMatcher {
            calls: AtomicUsize::new(0),
            reply: || Err(MatcherError::Exhausted),
            delay: std::time::Duration::ZERO,
        });
        let r = resolver(provider, Some(ai.clone()), ResolverConfig::default());
        assert_eq!(
            r.resolve(&request("book-1", "Bayern Munich", "Dortmund")).await.unwrap(),
            Resolution::NotFinished
        );
        assert_eq!(ai.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ai_match_is_used_when_local_refuses() {
        let provider = Arc::new(MockProvider::default());
        provider.put(event("x", EventStatus::Finished, Some((3, 0))));
        provider.candidates.lock().unwrap().push(Candidate {
            id: "x".into(),
            home_team: "Bayern München".into(),
            away_team: "BVB".into(),
            start_time: Some(kickoff()),
        });
        let ai = Arc::new(ScriptedMatcher {
            calls: AtomicUsize::new(0),
            reply: || {
                Ok(MatchDecision::Matched {
                    event_id: "x".into(),
                    confidence: 0.95,
                })
            },
            delay: std::time::Duration::ZERO,
        });
        let r = resolver(provider, Some(ai), ResolverConfig::default());
        match r.resolve(&request("book-1", "Bayern Munich", "Dortmund")).await.unwrap() {
            Resolution::Finished(res) => assert_eq!(res.home_score, 3),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_slow_matcher_times_out_and_trips_breaker() {
        let provider = Arc::new(MockProvider::default());
        provider.candidates.lock().unwrap().push(Candidate {
            id: "x".into(),
            home_team: "Bayern München".into(),
            away_team: "BVB".into(),
            start_time: Some(kickoff()),
        });
        let ai = Arc::new(ScriptedMatcher {
            calls: AtomicUsize::new(0),
            reply: || Ok(MatchDecision::NoMatch),
            delay: std::time::Duration::from_millis(200),
        });
        let config = ResolverConfig {
            matcher_timeout: std::time::Duration::from_millis(10),
            breaker: CircuitBreakerConfig {
                max_consecutive_failures: 2,
                cooldown: std::time::Duration::from_secs(60),
            },
            ..ResolverConfig::default()
        };
        let r = resolver(provider, Some(ai.clone()), config);
        let req = request("book-1", "Bayern Munich", "Dortmund");

        for _ in 0..3 {
            assert_eq!(r.resolve(&req).await.unwrap(), Resolution::NotFinished);
        }
        // Third call was refused by the open breaker
        assert_eq!(ai.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fuzzy_rate_limit_reschedules() {
        let provider = Arc::new(MockProvider::default());
        let config = ResolverConfig {
            fuzzy_per_minute: 1,
            ..ResolverConfig::default()
        };
        let r = resolver(provider, None, config);
        let req = request("book-1", "Arsenal", "Chelsea");

        assert!(matches!(
            r.resolve(&req).await,
            Err(SettlementError::AmbiguousMatch { .. })
        ));
        assert_eq!(r.resolve(&req).await.unwrap(), Resolution::NotFinished);
    }
}
