use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

mod accounts;
mod api;
mod cache;
mod config;
mod db;
mod error;
mod ledger;
mod markets;
mod resolver;
mod scheduler;
mod settlement;

use accounts::{BalanceAccounts, SqliteAccounts};
use api::AppState;
use cache::TtlCache;
use config::Config;
use db::Database;
use ledger::WagerLedger;
use resolver::credentials::CredentialPool;
use resolver::fuzzy::FuzzyMatcher;
use resolver::llm::AiMatcher;
use resolver::sports::TheSportsDbProvider;
use resolver::{MatchProvider, MatchResolver};
use scheduler::Scheduler;
use settlement::jobs::recurring_jobs;
use settlement::SettlementEngine;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    // Open database
    let db = Database::open(&config.database_path)?;
    info!("Database opened: {}", config.database_path);

    if let Some(account) = &config.seed_account {
        db.ensure_account(account, config.seed_balance)?;
        info!("Seed account {} ready", account);
    }

    // Result feed and fixture matching
    let provider: Arc<dyn MatchProvider> = Arc::new(TheSportsDbProvider::new(
        config.provider_api_key.as_deref(),
        Some(config.provider_url.as_str()),
    )?);

    let keys = config.matcher_keys();
    let ai: Option<Arc<dyn FuzzyMatcher>> = if keys.is_empty() {
        info!("No matcher keys configured, AI fixture matching disabled");
        None
    } else {
        info!("AI fixture matcher enabled with {} key(s)", keys.len());
        let pool = Arc::new(CredentialPool::new(
            keys,
            Duration::from_secs(config.matcher_key_cooldown_secs),
        ));
        let matcher: Arc<dyn FuzzyMatcher> = Arc::new(AiMatcher::new(
            &config.matcher_url,
            &config.matcher_model,
            pool,
            Duration::from_secs(config.matcher_timeout_secs),
        )?);
        Some(matcher)
    };

    let resolver = Arc::new(MatchResolver::new(
        provider,
        TtlCache::new(config.cache_ttls()),
        ai,
        config.resolver(),
    ));

    let accounts: Arc<dyn BalanceAccounts> = Arc::new(SqliteAccounts::new(db.clone()));
    let ledger = WagerLedger::new(db.clone(), accounts.clone());
    let engine = Arc::new(SettlementEngine::new(
        db.clone(),
        ledger,
        accounts.clone(),
        resolver,
        config.engine(),
    ));

    // Recovery before the first tick: stale leases, interrupted tasks,
    // unacknowledged credits, then everything already overdue.
    let scheduler = Scheduler::new(db.clone(), config.instance_id(), config.scheduler());
    scheduler.reconcile()?;
    match engine.recover(Utc::now(), config.settlement_concurrency).await {
        Ok(report) => info!(
            "Recovery: {} settled, {} cancelled, {} unresolved",
            report.settled, report.cancelled, report.unresolved
        ),
        Err(e) => warn!("Recovery pass incomplete: {}", e),
    }
    engine.ledger().backfill_profit()?;

    let mut registered = 0;
    for (desc, handler) in recurring_jobs(engine.clone(), &config.schedule())? {
        if scheduler.register_recurring(desc, handler)? {
            registered += 1;
        }
    }
    info!("Scheduler {} owns {} recurring job(s)", scheduler.owner_id(), registered);

    // Wager API
    let app = api::router(AppState {
        db: db.clone(),
        engine,
        accounts,
    });
    let addr: SocketAddr = config
        .api_addr
        .parse()
        .with_context(|| format!("Invalid API address {}", config.api_addr))?;
    info!("Wager API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown requested");
        })
        .await?;

    scheduler.shutdown().await;
    Ok(())
}
