//! Durable recurring-job scheduler.
//!
//! Each registered job gets its own loop task.  Ownership is a lease on the
//! job's row in the `jobs` table, so a restarted process (or a second
//! instance sharing the database) never runs a job twice.  A global
//! semaphore bounds how many job bodies execute at once.

pub mod jobs;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::db::{Database, JobUpdate};
use jobs::{JobDescriptor, JobState, Trigger};

/// Passed to a job body on every run.
#[derive(Debug, Clone, Copy)]
pub struct JobContext {
    pub now: DateTime<Utc>,
    pub concurrency_limit: usize,
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: JobContext) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Lease held on each job row; renewed while the loop is alive
    pub lease: Duration,
    /// Job bodies allowed to run at the same time
    pub max_concurrent_jobs: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            lease: Duration::seconds(60),
            max_concurrent_jobs: 4,
        }
    }
}

pub struct Scheduler {
    db: Database,
    owner_id: String,
    config: SchedulerConfig,
    permits: Arc<Semaphore>,
    running: Mutex<HashMap<String, JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl Scheduler {
    pub fn new(db: Database, owner_id: impl Into<String>, config: SchedulerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Scheduler {
            db,
            owner_id: owner_id.into(),
            permits: Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1))),
            config,
            running: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Startup repair: free jobs whose owner died (including an earlier run
    /// under this owner id) and put interrupted settlement tasks back in the
    /// queue.  Call before any `register_recurring`.
    pub fn reconcile(&self) -> Result<(usize, usize)> {
        let released = self.db.release_expired_jobs(Utc::now(), &self.owner_id)?;
        let requeued = self.db.requeue_running_tasks()?;
        if released > 0 || requeued > 0 {
            info!(
                "Scheduler reconcile: released {} stale job lease(s), requeued {} task(s)",
                released, requeued
            );
        }
        Ok((released, requeued))
    }

    /// Schedule `desc` unless it is already scheduled, here or by a live
    /// owner elsewhere.  Returns whether a new loop was started.
    pub fn register_recurring(
        &self,
        desc: JobDescriptor,
        handler: Arc<dyn JobHandler>,
    ) -> Result<bool> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = running.get(&desc.name) {
            if !handle.is_finished() {
                debug!("Job {} already scheduled", desc.name);
                return Ok(false);
            }
        }

        let now = Utc::now();
        let record = self.db.upsert_job(&desc)?;
        if record.leased_by_other(&self.owner_id, now) {
            info!(
                "Job {} is held by {}, not scheduling here",
                desc.name,
                record.owner_id.as_deref().unwrap_or("?")
            );
            return Ok(false);
        }

        let first_run = desc.trigger.next_after(now);
        let Some(record) =
            self.db
                .try_acquire_job(&desc.name, &self.owner_id, now + self.config.lease, first_run, now)?
        else {
            return Ok(false);
        };
        let next_run = record.next_run_at.unwrap_or(first_run);
        info!(
            "Scheduled job {} ({}), next run {}",
            desc.name,
            desc.trigger,
            next_run.format("%Y-%m-%d %H:%M:%S")
        );

        let job = JobLoop {
            db: self.db.clone(),
            owner_id: self.owner_id.clone(),
            name: desc.name.clone(),
            trigger: desc.trigger,
            concurrency_limit: desc.concurrency_limit,
            lease: self.config.lease,
            permits: self.permits.clone(),
            handler,
            shutdown: self.shutdown.subscribe(),
        };
        running.insert(desc.name, tokio::spawn(job.run(next_run)));
        Ok(true)
    }

    /// Stop every loop, wait for in-flight runs and release the jobs.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let handles: Vec<(String, JoinHandle<()>)> = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (name, handle) in handles {
            if let Err(e) = handle.await {
                warn!("Job loop {} ended abnormally: {}", name, e);
            }
        }
        info!("Scheduler stopped");
    }
}

struct JobLoop {
    db: Database,
    owner_id: String,
    name: String,
    trigger: Trigger,
    concurrency_limit: usize,
    lease: Duration,
    permits: Arc<Semaphore>,
    handler: Arc<dyn JobHandler>,
    shutdown: watch::Receiver<bool>,
}

impl JobLoop {
    async fn run(mut self, mut next_run: DateTime<Utc>) {
        // Renew often enough that the lease never lapses while we sleep
        let renew_every = (self.lease / 3)
            .to_std()
            .unwrap_or(std::time::Duration::from_secs(10));

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let wait = (next_run - Utc::now())
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);
            tokio::select! {
                _ = self.shutdown.changed() => break,
                _ = tokio::time::sleep(wait.min(renew_every)) => {}
            }

            let now = Utc::now();
            match self.renew_lease(now) {
                Ok(true) => {}
                Ok(false) => {
                    warn!("Lost lease on job {}, stopping its loop", self.name);
                    return;
                }
                Err(e) => {
                    warn!("Lease renewal for {} failed: {}", self.name, e);
                    continue;
                }
            }
            if now < next_run {
                continue;
            }

            let permit = tokio::select! {
                _ = self.shutdown.changed() => break,
                p = self.permits.clone().acquire_owned() => match p {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            let started = Utc::now();
            if let Err(e) = self.db.transition_job(
                &self.name,
                &self.owner_id,
                JobState::Running,
                JobUpdate {
                    last_scheduled_at: Some(started),
                    ..JobUpdate::default()
                },
            ) {
                warn!("Job {} could not start: {}", self.name, e);
                next_run = self.trigger.next_after(started);
                continue;
            }

            let body = self.handler.run(JobContext {
                now: started,
                concurrency_limit: self.concurrency_limit,
            });
            tokio::pin!(body);
            // A run may outlast the lease; keep it alive until the body returns
            let mut renew = tokio::time::interval(renew_every);
            renew.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let result = loop {
                tokio::select! {
                    r = &mut body => break r,
                    _ = renew.tick() => match self.renew_lease(Utc::now()) {
                        Ok(true) => {}
                        Ok(false) => warn!("Lease on job {} taken over mid-run", self.name),
                        Err(e) => warn!("Lease renewal for {} failed: {}", self.name, e),
                    },
                }
            };
            drop(permit);

            let finished = Utc::now();
            let last_error = match result {
                Ok(()) => {
                    debug!(
                        "Job {} finished in {}ms",
                        self.name,
                        (finished - started).num_milliseconds()
                    );
                    None
                }
                Err(e) => {
                    error!("Job {} failed: {:#}", self.name, e);
                    Some(format!("{:#}", e))
                }
            };
            next_run = self.trigger.next_after(finished);
            if let Err(e) = self.db.transition_job(
                &self.name,
                &self.owner_id,
                JobState::Scheduled,
                JobUpdate {
                    lease_until: Some(finished + self.lease),
                    next_run_at: Some(next_run),
                    last_error: Some(last_error),
                    ..JobUpdate::default()
                },
            ) {
                warn!("Job {} could not be rescheduled: {}", self.name, e);
            }
        }

        self.release();
    }

    fn renew_lease(&self, now: DateTime<Utc>) -> Result<bool> {
        self.db
            .renew_job_lease(&self.name, &self.owner_id, now + self.lease)
    }

    /// `scheduled → cancelling → unscheduled`, giving up the lease.
    fn release(&self) {
        for state in [JobState::Cancelling, JobState::Unscheduled] {
            if let Err(e) =
                self.db
                    .transition_job(&self.name, &self.owner_id, state, JobUpdate::default())
            {
                warn!("Job {} release ({}) failed: {}", self.name, state.as_str(), e);
                return;
            }
        }
        debug!("Job {} released", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl JobHandler for Counting {
        async fn run(&self, _ctx: JobContext) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl JobHandler for Failing {
        async fn run(&self, _ctx: JobContext) -> Result<()> {
            anyhow::bail!("feed unreachable")
        }
    }

    struct Slow(std::time::Duration);

    #[async_trait]
    impl JobHandler for Slow {
        async fn run(&self, _ctx: JobContext) -> Result<()> {
            tokio::time::sleep(self.0).await;
            Ok(())
        }
    }

    fn scheduler(db: &Database, owner: &str) -> Scheduler {
        Scheduler::new(db.clone(), owner, SchedulerConfig::default())
    }

    fn counting() -> (Arc<AtomicUsize>, Arc<dyn JobHandler>) {
        let n = Arc::new(AtomicUsize::new(0));
        (n.clone(), Arc::new(Counting(n)))
    }

    #[tokio::test]
    async fn test_register_twice_is_a_noop() {
        let db = Database::open_in_memory().unwrap();
        let s = scheduler(&db, "a");
        let (_, h) = counting();
        let desc = JobDescriptor::new("sweep", Trigger::every_secs(30), 2);

        assert!(s.register_recurring(desc.clone(), h.clone()).unwrap());
        assert!(!s.register_recurring(desc, h).unwrap());
        assert_eq!(db.list_jobs().unwrap().len(), 1);
        s.shutdown().await;
    }

    #[tokio::test]
    async fn test_job_leased_elsewhere_is_not_scheduled() {
        let db = Database::open_in_memory().unwrap();
        let a = scheduler(&db, "a");
        let b = scheduler(&db, "b");
        let desc = JobDescriptor::new("sweep", Trigger::every_secs(30), 2);

        let (_, h) = counting();
        assert!(a.register_recurring(desc.clone(), h.clone()).unwrap());
        assert!(!b.register_recurring(desc, h).unwrap());
        assert_eq!(db.get_job("sweep").unwrap().unwrap().owner_id.as_deref(), Some("a"));
        a.shutdown().await;
    }

    #[tokio::test]
    async fn test_expired_lease_is_adopted_after_reconcile() {
        let db = Database::open_in_memory().unwrap();
        let desc = JobDescriptor::new("sweep", Trigger::every_secs(30), 2);
        db.upsert_job(&desc).unwrap();
        let past = Utc::now() - Duration::minutes(5);
        db.try_acquire_job("sweep", "crashed", past, past, past).unwrap().unwrap();

        let s = scheduler(&db, "fresh");
        let (released, _) = s.reconcile().unwrap();
        assert_eq!(released, 1);
        let (_, h) = counting();
        assert!(s.register_recurring(desc, h).unwrap());

        let job = db.get_job("sweep").unwrap().unwrap();
        assert_eq!(job.owner_id.as_deref(), Some("fresh"));
        // The persisted schedule survives adoption
        assert_eq!(job.next_run_at, Some(past));
        s.shutdown().await;
    }

    #[tokio::test]
    async fn test_due_job_runs_and_is_rescheduled() {
        let db = Database::open_in_memory().unwrap();
        let s = scheduler(&db, "a");
        let (n, h) = counting();
        s.register_recurring(JobDescriptor::new("tick", Trigger::every_secs(1), 1), h)
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
        assert!(n.load(Ordering::SeqCst) >= 1);

        let job = db.get_job("tick").unwrap().unwrap();
        assert!(job.last_scheduled_at.is_some());
        assert!(job.next_run_at.unwrap() > job.last_scheduled_at.unwrap());
        s.shutdown().await;
    }

    #[tokio::test]
    async fn test_failure_is_recorded_and_loop_survives() {
        let db = Database::open_in_memory().unwrap();
        let s = scheduler(&db, "a");
        s.register_recurring(
            JobDescriptor::new("flaky", Trigger::every_secs(1), 1),
            Arc::new(Failing),
        )
        .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
        let job = db.get_job("flaky").unwrap().unwrap();
        assert_eq!(job.last_error.as_deref(), Some("feed unreachable"));
        assert_ne!(job.state, JobState::Unscheduled);
        s.shutdown().await;
    }

    #[tokio::test]
    async fn test_lease_is_held_through_a_long_run() {
        let db = Database::open_in_memory().unwrap();
        let config = SchedulerConfig {
            lease: Duration::seconds(1),
            max_concurrent_jobs: 1,
        };
        let a = Scheduler::new(db.clone(), "a", config.clone());
        let b = Scheduler::new(db.clone(), "b", config);
        let desc = JobDescriptor::new("retry", Trigger::every_secs(1), 1);
        let slow: Arc<dyn JobHandler> = Arc::new(Slow(std::time::Duration::from_millis(3000)));
        assert!(a.register_recurring(desc.clone(), slow).unwrap());

        // The body starts after ~1s and runs well past one lease length
        tokio::time::sleep(std::time::Duration::from_millis(2500)).await;
        let job = db.get_job("retry").unwrap().unwrap();
        assert_eq!(job.state, JobState::Running);
        assert!(job.lease_expires_at.unwrap() > Utc::now());

        let (_, h) = counting();
        assert!(!b.register_recurring(desc, h).unwrap());
        assert_eq!(db.get_job("retry").unwrap().unwrap().owner_id.as_deref(), Some("a"));
        a.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_releases_jobs() {
        let db = Database::open_in_memory().unwrap();
        let s = scheduler(&db, "a");
        let (_, h) = counting();
        s.register_recurring(JobDescriptor::new("sweep", Trigger::every_secs(30), 1), h)
            .unwrap();
        s.shutdown().await;

        let job = db.get_job("sweep").unwrap().unwrap();
        assert_eq!(job.state, JobState::Unscheduled);
        assert!(job.owner_id.is_none());

        // A restart can pick it straight back up
        let again = scheduler(&db, "b");
        let (_, h) = counting();
        assert!(again
            .register_recurring(JobDescriptor::new("sweep", Trigger::every_secs(30), 1), h)
            .unwrap());
        again.shutdown().await;
    }
}
