//! The per-server scheduling loop.
//!
//! Every server runs the same state machine against the shared store:
//!
//! 1. Read the schedule head from `/nextjob` and set a watch on it.
//! 2. If the head fires in the future, release the job lock if held and
//!    wait for whichever comes first: the watch (the head changed), the
//!    timer (the head is due), or shutdown. Then start over.
//! 3. If the head is due and the lock is not held, acquire it and start
//!    over; the re-read under the lock verifies the head is still due,
//!    which is what makes the dispatch at-most-once across the cluster.
//! 4. With the lock held and the head due, detach an execution of the
//!    job's command, reschedule it, recompute and publish the head, and
//!    release the lock.
//!
//! A server that loses the lock race simply finds a future head when its
//! own acquisition is granted and goes back to waiting. Store failures are
//! fatal for the loop after the lock is released; the process is expected
//! to be restarted by its supervisor.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::catalog::{acquire_job_lock, release_job_lock, Catalog, LockToken};
use crate::error::{CronError, Result};
use crate::executor;
use crate::job::Job;
use crate::schedule;
use crate::store::{Store, WatchEvent, PATH_NEXT_JOB};

pub struct Scheduler<S: Store> {
    store: Arc<S>,
    catalog: Catalog<S>,
    lock: Option<LockToken>,
    shutdown: CancellationToken,
}

impl<S: Store> Scheduler<S> {
    pub fn new(store: Arc<S>, shutdown: CancellationToken) -> Self {
        let catalog = Catalog::new(store.clone());
        Self {
            store,
            catalog,
            lock: None,
            shutdown,
        }
    }

    /// Drive the loop until shutdown or a fatal error. The lock is released
    /// on every exit path.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            if self.shutdown.is_cancelled() {
                self.release_lock_if_held().await?;
                return Ok(());
            }

            let (data, _version, watch) = match self.store.get_and_watch(PATH_NEXT_JOB).await {
                Ok(read) => read,
                Err(e) => {
                    let _ = self.release_lock_if_held().await;
                    return Err(e.into());
                }
            };
            let job = match Job::deserialize(&data) {
                Ok(job) => job,
                Err(e) => {
                    let _ = self.release_lock_if_held().await;
                    return Err(e);
                }
            };

            let now = Utc::now();
            if job.next_runtime > now {
                self.release_lock_if_held().await?;
                let delay = (job.next_runtime - now).to_std().unwrap_or_default();
                if !job.is_sentinel() {
                    tracing::trace!(
                        job = %job.name,
                        until = %job.fmt_next_runtime(),
                        "Sleeping until next schedule start"
                    );
                }
                tokio::select! {
                    event = watch.wait() => match event {
                        WatchEvent::SessionLost | WatchEvent::Error => {
                            return Err(CronError::Internal(
                                "schedule head watch failed".to_string(),
                            ));
                        }
                        _ => {
                            tracing::trace!("Schedule head updated; checking schedule");
                        }
                    },
                    _ = tokio::time::sleep(delay) => {
                        tracing::trace!("Wait time expired; checking schedule");
                    }
                    _ = self.shutdown.cancelled() => {}
                }
                continue;
            }

            if self.lock.is_none() {
                let token = acquire_job_lock(self.store.as_ref()).await?;
                self.lock = Some(token);
                // Verify under the lock: re-read the head, which by now may
                // have been run and rescheduled by another server.
                continue;
            }

            executor::spawn(job.clone());
            self.reschedule_after_run(job).await?;
        }
    }

    /// Reschedule the job that just ran and publish the new schedule head.
    /// Consumes and releases the held lock on both success and failure.
    async fn reschedule_after_run(&mut self, job: Job) -> Result<()> {
        let Some(token) = self.lock.take() else {
            return Err(CronError::Internal(
                "rescheduling without the job lock".to_string(),
            ));
        };
        let result = self.reschedule_with_lock(job, &token).await;
        let released = release_job_lock(self.store.as_ref(), token).await;
        result.and(released)
    }

    async fn reschedule_with_lock(&self, mut job: Job, token: &LockToken) -> Result<()> {
        match schedule::next_after(&job.schedule, Utc::now()) {
            Ok(next) if next != job.next_runtime => {
                job.next_runtime = next;
                tracing::info!(
                    job = %job.name,
                    next_runtime = %job.fmt_next_runtime(),
                    "Job next run time"
                );
            }
            Ok(_) => {
                tracing::error!(job = %job.name, "No new run time available; disabling job");
                job.has_error = true;
            }
            Err(e) => {
                tracing::error!(job = %job.name, error = %e, "Cannot reschedule job; disabling");
                job.has_error = true;
            }
        }
        self.catalog.update(&job, token).await?;

        let head = self.catalog.compute_head().await?;
        self.catalog.publish_head(&head, token).await
    }

    async fn release_lock_if_held(&mut self) -> Result<()> {
        if let Some(token) = self.lock.take() {
            release_job_lock(self.store.as_ref(), token).await?;
        }
        Ok(())
    }
}
