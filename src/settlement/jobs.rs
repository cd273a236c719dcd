//! Recurring jobs that drive the settlement engine.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::engine::SettlementEngine;
use crate::scheduler::jobs::{JobDescriptor, Trigger};
use crate::scheduler::{JobContext, JobHandler};

pub const SETTLEMENT_SWEEP: &str = "settlement-sweep";
pub const RETRY_SWEEP: &str = "retry-sweep";
pub const TASK_QUEUE: &str = "task-queue";
pub const LEDGER_RECONCILE: &str = "ledger-reconcile";
pub const CACHE_PURGE: &str = "cache-purge";

/// Cadence of each recurring job.
#[derive(Debug, Clone)]
pub struct JobSchedule {
    pub settlement_interval_secs: u64,
    pub settlement_concurrency: usize,
    pub retry_interval_secs: u64,
    pub task_poll_secs: u64,
    pub task_concurrency: usize,
    pub cache_purge_secs: u64,
    /// UTC hour of the daily ledger reconciliation
    pub reconcile_hour: u32,
}

impl Default for JobSchedule {
    fn default() -> Self {
        JobSchedule {
            settlement_interval_secs: 30,
            settlement_concurrency: 5,
            retry_interval_secs: 300,
            task_poll_secs: 5,
            task_concurrency: 5,
            cache_purge_secs: 600,
            reconcile_hour: 3,
        }
    }
}

/// Every job the service runs, ready for `Scheduler::register_recurring`.
pub fn recurring_jobs(
    engine: Arc<SettlementEngine>,
    schedule: &JobSchedule,
) -> Result<Vec<(JobDescriptor, Arc<dyn JobHandler>)>> {
    Ok(vec![
        (
            JobDescriptor::new(
                SETTLEMENT_SWEEP,
                Trigger::every_secs(schedule.settlement_interval_secs),
                schedule.settlement_concurrency,
            ),
            Arc::new(SettlementSweep(engine.clone())) as Arc<dyn JobHandler>,
        ),
        (
            // Retries walk wagers one by one
            JobDescriptor::new(RETRY_SWEEP, Trigger::every_secs(schedule.retry_interval_secs), 1),
            Arc::new(RetrySweep(engine.clone())) as Arc<dyn JobHandler>,
        ),
        (
            JobDescriptor::new(
                TASK_QUEUE,
                Trigger::every_secs(schedule.task_poll_secs),
                schedule.task_concurrency,
            ),
            Arc::new(TaskQueue(engine.clone())) as Arc<dyn JobHandler>,
        ),
        (
            JobDescriptor::new(
                LEDGER_RECONCILE,
                Trigger::daily_at(schedule.reconcile_hour, 0)?,
                1,
            ),
            Arc::new(LedgerReconcile(engine.clone())) as Arc<dyn JobHandler>,
        ),
        (
            JobDescriptor::new(CACHE_PURGE, Trigger::every_secs(schedule.cache_purge_secs), 1),
            Arc::new(CachePurge(engine)) as Arc<dyn JobHandler>,
        ),
    ])
}

pub struct SettlementSweep(pub Arc<SettlementEngine>);

#[async_trait]
impl JobHandler for SettlementSweep {
    async fn run(&self, ctx: JobContext) -> Result<()> {
        self.0
            .run_settlement_sweep(ctx.now, ctx.concurrency_limit)
            .await?;
        Ok(())
    }
}

pub struct RetrySweep(pub Arc<SettlementEngine>);

#[async_trait]
impl JobHandler for RetrySweep {
    async fn run(&self, ctx: JobContext) -> Result<()> {
        let report = self.0.run_retry_sweep(ctx.now).await?;
        if report.examined > 0 {
            info!(
                "Retry sweep: {} examined, {} settled, {} still cancelled",
                report.examined,
                report.settled,
                report.cancelled + report.unresolved + report.failed
            );
        }
        Ok(())
    }
}

pub struct TaskQueue(pub Arc<SettlementEngine>);

#[async_trait]
impl JobHandler for TaskQueue {
    async fn run(&self, ctx: JobContext) -> Result<()> {
        self.0.run_task_queue(ctx.now, ctx.concurrency_limit).await?;
        Ok(())
    }
}

pub struct LedgerReconcile(pub Arc<SettlementEngine>);

#[async_trait]
impl JobHandler for LedgerReconcile {
    async fn run(&self, _ctx: JobContext) -> Result<()> {
        let (credits, backfilled) = self.0.run_ledger_maintenance().await?;
        info!(
            "Ledger maintenance: {} credit(s) repaired, {} profit value(s) backfilled",
            credits, backfilled
        );
        Ok(())
    }
}

pub struct CachePurge(pub Arc<SettlementEngine>);

#[async_trait]
impl JobHandler for CachePurge {
    async fn run(&self, _ctx: JobContext) -> Result<()> {
        self.0.resolver().cache().purge_expired().await;
        Ok(())
    }
}
