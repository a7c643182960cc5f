// Job runner — claims jobs from the store and executes them.
//
// Delivery is at-least-once: a claimed job is locked for the configured
// lifetime, and a worker that dies mid-job leaves the lock to expire so
// another claim picks the job up again. Every job the engine schedules is
// idempotent when re-run.
//
// Failures are split by kind. A FeedError (bad payload, invalid feed,
// unsupported follow) fails the same way every time, so the job is marked
// failed at once. Anything else is retried until the attempt limit.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::EngineSettings;
use crate::db::models::JobRecord;
use crate::db::FeedStore;
use crate::error::is_retryable;

use super::Job;

/// Executes decoded jobs. Implemented by the service, which owns the
/// components every job needs.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, job: Job) -> Result<()>;
}

/// What happened to one claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { id: i64 },
    Retrying { id: i64, error: String },
    Failed { id: i64, error: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
}

pub struct JobRunner {
    store: Arc<dyn FeedStore>,
    handler: Arc<dyn JobHandler>,
    lock_lifetime: chrono::Duration,
    max_attempts: u32,
    poll_interval: Duration,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn FeedStore>,
        handler: Arc<dyn JobHandler>,
        settings: &EngineSettings,
    ) -> Self {
        Self {
            store,
            handler,
            lock_lifetime: chrono::Duration::seconds(settings.lock_lifetime_secs.max(1)),
            max_attempts: settings.max_job_attempts.max(1),
            poll_interval: Duration::from_millis(settings.worker_poll_ms.max(10)),
        }
    }

    /// Claim and run a single job. Returns None when the queue is empty.
    pub async fn run_once(&self) -> Result<Option<RunOutcome>> {
        let Some(record) = self.store.claim_job(Utc::now(), self.lock_lifetime).await? else {
            return Ok(None);
        };

        // A lock that expired past the last allowed attempt means the job
        // keeps killing its worker; stop handing it out.
        if record.attempts > self.max_attempts {
            let message = format!("abandoned after {} attempts", self.max_attempts);
            self.store.fail_job(record.id, &message, false).await?;
            warn!(job_id = record.id, name = %record.name, "{message}");
            return Ok(Some(RunOutcome::Failed {
                id: record.id,
                error: message,
            }));
        }

        debug!(job_id = record.id, name = %record.name, attempt = record.attempts, "running job");
        let result = match Job::decode(&record.name, &record.payload) {
            Ok(job) => self.handler.execute(job).await,
            Err(e) => Err(e),
        };

        let outcome = match result {
            Ok(()) => {
                self.store.complete_job(record.id).await?;
                RunOutcome::Completed { id: record.id }
            }
            Err(e) => self.record_failure(&record, e).await?,
        };
        Ok(Some(outcome))
    }

    async fn record_failure(&self, record: &JobRecord, e: anyhow::Error) -> Result<RunOutcome> {
        let message = format!("{e:#}");
        let retry = is_retryable(&e) && record.attempts < self.max_attempts;
        self.store.fail_job(record.id, &message, retry).await?;
        if retry {
            warn!(
                job_id = record.id,
                name = %record.name,
                attempt = record.attempts,
                error = %message,
                "job failed, will retry"
            );
            Ok(RunOutcome::Retrying {
                id: record.id,
                error: message,
            })
        } else {
            error!(job_id = record.id, name = %record.name, error = %message, "job failed");
            Ok(RunOutcome::Failed {
                id: record.id,
                error: message,
            })
        }
    }

    /// Run jobs until none are runnable, including the jobs that running
    /// jobs schedule (fan-out continuations and delivery tasks).
    pub async fn drain(&self) -> Result<DrainSummary> {
        let mut summary = DrainSummary::default();
        while let Some(outcome) = self.run_once().await? {
            match outcome {
                RunOutcome::Completed { .. } => summary.completed += 1,
                RunOutcome::Retrying { .. } => summary.retried += 1,
                RunOutcome::Failed { .. } => summary.failed += 1,
            }
        }
        Ok(summary)
    }

    /// Work the queue until `shutdown` resolves. Store errors while claiming
    /// are logged and the loop backs off for one poll interval.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);
        info!(poll_ms = self.poll_interval.as_millis() as u64, "worker started");
        loop {
            let idle = match self.run_once().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    error!(error = %e, "job queue unavailable");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            } else if futures::poll!(&mut shutdown).is_ready() {
                break;
            }
        }
        info!("worker stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::JobStatus;
    use crate::db::SqliteStore;
    use crate::error::FeedError;
    use crate::jobs::{Scheduler, StoreScheduler};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` executions with a transient error.
    struct Flaky {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl JobHandler for Flaky {
        async fn execute(&self, job: Job) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Job::UnfollowMany { feed, .. } = &job {
                if feed == "user:null" {
                    return Err(FeedError::InvalidFeedId(feed.clone()).into());
                }
            }
            if call < self.failures {
                anyhow::bail!("connection reset");
            }
            Ok(())
        }
    }

    fn runner(failures: usize, max_attempts: u32) -> (Arc<dyn FeedStore>, Arc<Flaky>, JobRunner) {
        let store: Arc<dyn FeedStore> = Arc::new(SqliteStore::in_memory().unwrap());
        let handler = Arc::new(Flaky {
            failures,
            calls: AtomicUsize::new(0),
        });
        let settings = EngineSettings {
            max_job_attempts: max_attempts,
            ..Default::default()
        };
        let runner = JobRunner::new(store.clone(), handler.clone(), &settings);
        (store, handler, runner)
    }

    fn purge(feed: &str) -> Job {
        Job::UnfollowMany {
            feed: feed.into(),
            sources: vec!["user:2".into()],
        }
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let (store, handler, runner) = runner(2, 5);
        let id = StoreScheduler::new(store.clone())
            .schedule_now(&purge("timeline:1"), 0)
            .await
            .unwrap();

        let summary = runner.drain().await.unwrap();
        assert_eq!(summary, DrainSummary { completed: 1, retried: 2, failed: 0 });
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        let record = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Done);
        assert_eq!(record.attempts, 3);
    }

    #[tokio::test]
    async fn test_attempt_limit_fails_job() {
        let (store, _, runner) = runner(10, 3);
        let id = StoreScheduler::new(store.clone())
            .schedule_now(&purge("timeline:1"), 0)
            .await
            .unwrap();
        let summary = runner.drain().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.retried, 2);
        let record = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.last_error.as_deref(), Some("connection reset"));
    }

    #[tokio::test]
    async fn test_domain_error_is_not_retried() {
        let (store, handler, runner) = runner(0, 5);
        StoreScheduler::new(store.clone())
            .schedule_now(&purge("user:null"), 0)
            .await
            .unwrap();
        let outcome = runner.run_once().await.unwrap().unwrap();
        assert!(matches!(outcome, RunOutcome::Failed { .. }));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(runner.run_once().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_undecodable_payload_fails_without_executing() {
        let (store, handler, runner) = runner(0, 5);
        store
            .enqueue_job("feed_follow_many", "{\"feed\": 3}", 0, Utc::now())
            .await
            .unwrap();
        let outcome = runner.run_once().await.unwrap().unwrap();
        assert!(matches!(outcome, RunOutcome::Failed { .. }));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (_, _, runner) = runner(0, 5);
        runner.run(async {}).await.unwrap();
    }
}
