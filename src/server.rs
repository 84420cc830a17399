//! Server bootstrap and lifecycle.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::job::Job;
use crate::membership;
use crate::scheduler::Scheduler;
use crate::store::{
    Store, StoreError, NAMESPACE, PATH_JOBS, PATH_JOB_LOCK, PATH_NEXT_JOB, PATH_SERVERS,
};

/// Idempotently create the namespace keys. `/nextjob` starts as the
/// sentinel (empty bytes) so a fresh cluster's schedulers wait harmlessly.
pub async fn ensure_namespace<S: Store>(store: &S) -> Result<()> {
    let sentinel = Job::sentinel().serialize()?;
    for (path, data) in [
        (NAMESPACE, &[][..]),
        (PATH_SERVERS, &[][..]),
        (PATH_JOBS, &[][..]),
        (PATH_NEXT_JOB, &sentinel[..]),
        (PATH_JOB_LOCK, &[][..]),
    ] {
        match store.create(path, data).await {
            Ok(()) => tracing::trace!(path, "Created namespace key"),
            Err(StoreError::NodeExists(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// One scheduler server: presence registration, membership reporting, and
/// the scheduling loop, all over a single store session.
pub struct Server<S: Store> {
    store: Arc<S>,
    config: ServerConfig,
    shutdown: CancellationToken,
}

impl<S: Store> Server<S> {
    pub fn new(store: Arc<S>, config: ServerConfig, shutdown: CancellationToken) -> Self {
        Self {
            store,
            config,
            shutdown,
        }
    }

    /// Register, report membership, and run the scheduling loop until
    /// shutdown or a fatal store error.
    pub async fn run(&self) -> Result<()> {
        let name = membership::register(
            self.store.as_ref(),
            self.config.name_template.as_deref(),
            self.config.force,
        )
        .await?;

        let monitor = membership::spawn_monitor(
            self.store.clone(),
            name.clone(),
            self.shutdown.child_token(),
        );

        let mut scheduler = Scheduler::new(self.store.clone(), self.shutdown.clone());
        let result = scheduler.run().await;

        self.shutdown.cancel();
        monitor.abort();
        tracing::info!(server = %name, "Server stopped");
        result
    }

    /// End the session; the store drops the presence key and any held lock.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.store.close().await;
    }
}
