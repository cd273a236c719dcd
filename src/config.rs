use clap::Parser;
use std::time::Duration;
use uuid::Uuid;

use crate::cache::TierTtls;
use crate::resolver::circuit_breaker::CircuitBreakerConfig;
use crate::resolver::ResolverConfig;
use crate::scheduler::SchedulerConfig;
use crate::settlement::jobs::JobSchedule;
use crate::settlement::EngineSettings;

/// Sports wager settlement engine
#[derive(Parser, Debug, Clone)]
#[command(name = "wager-settlement", version, about)]
pub struct Config {
    /// SQLite database path
    #[arg(long, env = "DATABASE_PATH", default_value = "settlement.db")]
    pub database_path: String,

    /// Wager API listen address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8080")]
    pub api_addr: String,

    /// Scheduler owner id; unique per process unless set
    #[arg(long, env = "INSTANCE_ID")]
    pub instance_id: Option<String>,

    /// Result feed base URL
    #[arg(
        long,
        env = "PROVIDER_URL",
        default_value = "https://www.thesportsdb.com/api/v1/json"
    )]
    pub provider_url: String,

    /// Result feed API key (free tier when absent)
    #[arg(long, env = "PROVIDER_API_KEY")]
    pub provider_api_key: Option<String>,

    /// OpenAI-compatible endpoint for the AI fixture matcher
    #[arg(long, env = "MATCHER_URL", default_value = "https://api.openai.com/v1")]
    pub matcher_url: String,

    /// Comma-separated matcher API keys; the AI matcher is disabled when empty
    #[arg(long, env = "MATCHER_API_KEYS", value_delimiter = ',')]
    pub matcher_api_keys: Vec<String>,

    #[arg(long, env = "MATCHER_MODEL", default_value = "gpt-4o-mini")]
    pub matcher_model: String,

    /// Per-call timeout for the AI matcher in seconds
    #[arg(long, env = "MATCHER_TIMEOUT_SECS", default_value = "15")]
    pub matcher_timeout_secs: u64,

    /// How long a quota-exhausted matcher key is parked, in seconds
    #[arg(long, env = "MATCHER_KEY_COOLDOWN_SECS", default_value = "3600")]
    pub matcher_key_cooldown_secs: u64,

    /// Minimum confidence to accept a fuzzy fixture match (0.0–1.0)
    #[arg(long, env = "FUZZY_THRESHOLD", default_value = "0.85")]
    pub fuzzy_threshold: f64,

    /// Fuzzy-match attempts allowed per minute
    #[arg(long, env = "FUZZY_PER_MINUTE", default_value = "30")]
    pub fuzzy_per_minute: u32,

    /// Consecutive matcher failures before the circuit opens
    #[arg(long, env = "BREAKER_THRESHOLD", default_value = "5")]
    pub breaker_threshold: u32,

    #[arg(long, env = "BREAKER_COOLDOWN_SECS", default_value = "300")]
    pub breaker_cooldown_secs: u64,

    #[arg(long, env = "CACHE_LIVE_TTL_SECS", default_value = "120")]
    pub cache_live_ttl_secs: u64,

    #[arg(long, env = "CACHE_UPCOMING_TTL_SECS", default_value = "3600")]
    pub cache_upcoming_ttl_secs: u64,

    #[arg(long, env = "CACHE_LONG_TTL_SECS", default_value = "86400")]
    pub cache_long_ttl_secs: u64,

    /// Settlement sweep interval in seconds
    #[arg(long, env = "SETTLEMENT_INTERVAL_SECS", default_value = "30")]
    pub settlement_interval_secs: u64,

    /// Wagers settled in parallel per sweep
    #[arg(long, env = "SETTLEMENT_CONCURRENCY", default_value = "5")]
    pub settlement_concurrency: usize,

    /// Retry sweep interval in seconds
    #[arg(long, env = "RETRY_INTERVAL_SECS", default_value = "300")]
    pub retry_interval_secs: u64,

    /// Pause between wagers within a retry sweep, in milliseconds
    #[arg(long, env = "RETRY_SPACING_MS", default_value = "2000")]
    pub retry_spacing_ms: u64,

    /// Retry budget granted to each wager
    #[arg(long, env = "MAX_RETRY_COUNT", default_value = "3")]
    pub max_retry_count: i64,

    /// Hours past the estimated settlement time before a pending wager is cancelled
    #[arg(long, env = "STALE_AFTER_HOURS", default_value = "24")]
    pub stale_after_hours: i64,

    /// Task-queue poll interval in seconds
    #[arg(long, env = "TASK_POLL_SECS", default_value = "5")]
    pub task_poll_secs: u64,

    /// Delay before an unresolved settlement task runs again, in seconds
    #[arg(long, env = "RESCHEDULE_DELAY_SECS", default_value = "900")]
    pub reschedule_delay_secs: i64,

    #[arg(long, env = "CACHE_PURGE_SECS", default_value = "600")]
    pub cache_purge_secs: u64,

    /// UTC hour of the daily ledger reconciliation
    #[arg(long, env = "RECONCILE_HOUR", default_value = "3")]
    pub reconcile_hour: u32,

    /// Scheduler lease on each job row, in seconds
    #[arg(long, env = "JOB_LEASE_SECS", default_value = "60")]
    pub job_lease_secs: i64,

    /// Job bodies allowed to run at once
    #[arg(long, env = "MAX_CONCURRENT_JOBS", default_value = "4")]
    pub max_concurrent_jobs: usize,

    /// Account created at startup when missing
    #[arg(long, env = "SEED_ACCOUNT")]
    pub seed_account: Option<String>,

    /// Opening balance for the seed account
    #[arg(long, env = "SEED_BALANCE", default_value = "1000.0")]
    pub seed_balance: f64,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&self.fuzzy_threshold) {
            anyhow::bail!("fuzzy_threshold must be between 0.0 and 1.0");
        }
        if self.max_retry_count < 0 {
            anyhow::bail!("max_retry_count must not be negative");
        }
        if self.stale_after_hours <= 0 {
            anyhow::bail!("stale_after_hours must be positive");
        }
        if self.reconcile_hour > 23 {
            anyhow::bail!("reconcile_hour must be between 0 and 23");
        }
        if self.job_lease_secs < 3 {
            anyhow::bail!("job_lease_secs must be at least 3");
        }
        if self.reschedule_delay_secs <= 0 {
            anyhow::bail!("reschedule_delay_secs must be positive");
        }
        if self.settlement_concurrency == 0 || self.max_concurrent_jobs == 0 {
            anyhow::bail!("concurrency limits must be at least 1");
        }
        if self.seed_balance < 0.0 {
            anyhow::bail!("seed_balance must not be negative");
        }
        Ok(())
    }

    /// Owner id for job leases.  Without an explicit id every process gets
    /// its own, so two default-configured instances never share leases.
    pub fn instance_id(&self) -> String {
        match self.instance_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => format!("pid{}-{}", std::process::id(), Uuid::new_v4().simple()),
        }
    }

    /// Matcher keys with blanks dropped.
    pub fn matcher_keys(&self) -> Vec<String> {
        self.matcher_api_keys
            .iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect()
    }

    pub fn cache_ttls(&self) -> TierTtls {
        TierTtls {
            live: Duration::from_secs(self.cache_live_ttl_secs),
            upcoming: Duration::from_secs(self.cache_upcoming_ttl_secs),
            long: Duration::from_secs(self.cache_long_ttl_secs),
        }
    }

    pub fn resolver(&self) -> ResolverConfig {
        ResolverConfig {
            fuzzy_threshold: self.fuzzy_threshold,
            fuzzy_per_minute: self.fuzzy_per_minute,
            matcher_timeout: Duration::from_secs(self.matcher_timeout_secs),
            breaker: CircuitBreakerConfig {
                max_consecutive_failures: self.breaker_threshold,
                cooldown: Duration::from_secs(self.breaker_cooldown_secs),
            },
        }
    }

    pub fn engine(&self) -> EngineSettings {
        EngineSettings {
            max_retry_count: self.max_retry_count,
            stale_after: chrono::Duration::hours(self.stale_after_hours),
            reschedule_delay: chrono::Duration::seconds(self.reschedule_delay_secs),
            retry_spacing: Duration::from_millis(self.retry_spacing_ms),
            ..EngineSettings::default()
        }
    }

    pub fn schedule(&self) -> JobSchedule {
        JobSchedule {
            settlement_interval_secs: self.settlement_interval_secs,
            settlement_concurrency: self.settlement_concurrency,
            retry_interval_secs: self.retry_interval_secs,
            task_poll_secs: self.task_poll_secs,
            task_concurrency: self.settlement_concurrency,
            cache_purge_secs: self.cache_purge_secs,
            reconcile_hour: self.reconcile_hour,
        }
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            lease: chrono::Duration::seconds(self.job_lease_secs),
            max_concurrent_jobs: self.max_concurrent_jobs,
        }
    }
}
