//! Authoritative reader/writer of the job catalog and the schedule head.
//!
//! Every write to `/jobs/*` or `/nextjob` happens while the cluster-wide
//! job lock is held, so peers observe a catalog mutation and the matching
//! head publication as one step. Holding the lock is expressed in the type
//! system: mutators take a [`LockToken`], which only
//! [`acquire_job_lock`] can mint and only [`release_job_lock`] consumes.

use std::sync::Arc;

use crate::error::{CronError, Result};
use crate::job::Job;
use crate::store::{job_path, Store, StoreError, PATH_JOBS, PATH_JOB_LOCK, PATH_NEXT_JOB};

/// Proof that the caller holds the job lock. Not cloneable; the scheduler
/// and the CLI keep at most one and thread it through their critical
/// sections, which is what makes re-acquisition unrepresentable.
pub struct LockToken {
    _priv: (),
}

/// Block until the cluster-wide job lock is granted.
pub async fn acquire_job_lock<S: Store>(store: &S) -> Result<LockToken> {
    tracing::trace!(path = PATH_JOB_LOCK, "Requesting job lock");
    store.acquire_lock(PATH_JOB_LOCK).await?;
    tracing::trace!(path = PATH_JOB_LOCK, "Took job lock");
    Ok(LockToken { _priv: () })
}

/// Release the job lock, consuming the proof of ownership.
pub async fn release_job_lock<S: Store>(store: &S, token: LockToken) -> Result<()> {
    drop(token);
    tracing::trace!(path = PATH_JOB_LOCK, "Releasing job lock");
    store.release_lock(PATH_JOB_LOCK).await?;
    Ok(())
}

/// A catalog mutation, as reported to [`Catalog::reconcile_head`].
#[derive(Debug, Clone)]
pub enum CatalogChange {
    Added(Job),
    Updated(Job),
    Removed(String),
}

impl CatalogChange {
    fn name(&self) -> &str {
        match self {
            CatalogChange::Added(job) | CatalogChange::Updated(job) => &job.name,
            CatalogChange::Removed(name) => name,
        }
    }

    fn job(&self) -> Option<&Job> {
        match self {
            CatalogChange::Added(job) | CatalogChange::Updated(job) => Some(job),
            CatalogChange::Removed(_) => None,
        }
    }
}

#[derive(Clone)]
pub struct Catalog<S> {
    store: Arc<S>,
}

impl<S: Store> Catalog<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Store a new job; refuses names already in the catalog.
    pub async fn put_new(&self, job: &Job, _lock: &LockToken) -> Result<()> {
        if job.name.is_empty() {
            return Err(CronError::EmptyJobName);
        }
        let data = job.serialize()?;
        match self.store.create(&job_path(&job.name), &data).await {
            Ok(()) => Ok(()),
            Err(StoreError::NodeExists(_)) => Err(CronError::JobExists(job.name.clone())),
            Err(e) => Err(e.into()),
        }
    }

    /// Overwrite an existing job; fails if it is not in the catalog.
    pub async fn update(&self, job: &Job, _lock: &LockToken) -> Result<()> {
        if job.name.is_empty() {
            return Err(CronError::EmptyJobName);
        }
        let data = job.serialize()?;
        match self.store.set(&job_path(&job.name), &data, -1).await {
            Ok(()) => Ok(()),
            Err(StoreError::NoNode(_)) => Err(CronError::JobNotFound(job.name.clone())),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a job; fails if it is not in the catalog.
    pub async fn remove(&self, name: &str, _lock: &LockToken) -> Result<()> {
        match self.store.delete(&job_path(name)).await {
            Ok(()) => Ok(()),
            Err(StoreError::NoNode(_)) => Err(CronError::JobNotFound(name.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Read one job from the catalog.
    pub async fn get(&self, name: &str) -> Result<Job> {
        match self.store.get(&job_path(name)).await {
            Ok((data, _)) => Job::deserialize(&data),
            Err(StoreError::NoNode(_)) => Err(CronError::JobNotFound(name.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// All jobs, sorted by name, optionally filtered by a glob pattern
    /// where `*` matches one or more characters.
    pub async fn list(&self, pattern: Option<&str>) -> Result<Vec<Job>> {
        let mut names = self.store.list_children(PATH_JOBS).await?;
        names.sort();
        let mut jobs = Vec::new();
        for name in names {
            if let Some(pattern) = pattern {
                if !glob_match(pattern, &name) {
                    continue;
                }
            }
            let (data, _) = self.store.get(&job_path(&name)).await?;
            jobs.push(Job::deserialize(&data)?);
        }
        Ok(jobs)
    }

    /// The job that should run next: minimum `next_runtime` over jobs
    /// without errors, ties broken by name. The sentinel when none qualify.
    pub async fn compute_head(&self) -> Result<Job> {
        let mut head: Option<Job> = None;
        for job in self.list(None).await? {
            if job.has_error {
                continue;
            }
            // `list` returns name order, so strictly-earlier keeps the
            // smaller name on runtime ties.
            let earlier = head
                .as_ref()
                .map(|h| job.next_runtime < h.next_runtime)
                .unwrap_or(true);
            if earlier {
                head = Some(job);
            }
        }
        Ok(head.unwrap_or_else(Job::sentinel))
    }

    /// Write `/nextjob`.
    pub async fn publish_head(&self, job: &Job, _lock: &LockToken) -> Result<()> {
        let data = job.serialize()?;
        self.store.set(PATH_NEXT_JOB, &data, -1).await?;
        if job.is_sentinel() {
            tracing::warn!("No jobs remaining to schedule");
        } else {
            tracing::trace!(job = %job.name, next_runtime = %job.fmt_next_runtime(), "Published schedule head");
        }
        Ok(())
    }

    /// Read the current `/nextjob`.
    pub async fn read_head(&self) -> Result<Job> {
        let (data, _) = self.store.get(PATH_NEXT_JOB).await?;
        Job::deserialize(&data)
    }

    /// Bring `/nextjob` in line with a catalog mutation. Whenever the
    /// change is or displaces the current head, the head is recomputed from
    /// the whole catalog; ties resolve by name there.
    pub async fn reconcile_head(&self, change: &CatalogChange, lock: &LockToken) -> Result<()> {
        let head = self.read_head().await?;

        if head.is_sentinel() {
            if let Some(job) = change.job().filter(|j| !j.has_error) {
                tracing::trace!(job = %job.name, next_runtime = %job.fmt_next_runtime(), "Scheduling first job");
                return self.publish_head(job, lock).await;
            }
            // Removal against an empty schedule falls through to recompute.
        } else if head.name != change.name() {
            let displaces = change
                .job()
                .is_some_and(|j| !j.has_error && j.next_runtime <= head.next_runtime);
            if !displaces {
                tracing::trace!(job = %head.name, next_runtime = %head.fmt_next_runtime(), "Schedule head unchanged");
                return Ok(());
            }
        }

        let new_head = self.compute_head().await?;
        self.publish_head(&new_head, lock).await
    }
}

/// Match `name` against `pattern`, where `*` matches one or more characters
/// and everything else matches literally.
fn glob_match(pattern: &str, name: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == name,
        Some((prefix, rest)) => {
            let Some(tail) = name.strip_prefix(prefix) else {
                return false;
            };
            tail.char_indices()
                .map(|(i, c)| i + c.len_utf8())
                .any(|i| glob_match(rest, &tail[i..]))
        }
    }
}
