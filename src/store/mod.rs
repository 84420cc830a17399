//! Gateway contract for the coordination store.
//!
//! Every server and the CLI talk to the cluster exclusively through this
//! interface: a consistent, watchable, hierarchical key-value store with
//! ephemeral keys and exclusive locks. Two implementations are provided:
//! [`memory::MemoryCluster`] for in-process clusters and tests, and
//! [`etcd::EtcdStore`] for production deployments.

pub mod etcd;
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;

/// Application name, also the marker value stored in presence keys.
pub const APP_NAME: &str = "castle-cron";

/// Root of the coordination namespace.
pub const NAMESPACE: &str = "/castle-cron";
/// Container of per-server ephemeral presence keys.
pub const PATH_SERVERS: &str = "/castle-cron/servers";
/// Container of persisted job records.
pub const PATH_JOBS: &str = "/castle-cron/jobs";
/// Single key holding the serialized schedule head.
pub const PATH_NEXT_JOB: &str = "/castle-cron/nextjob";
/// Lock serializing every write to `/jobs/*` and `/nextjob`.
pub const PATH_JOB_LOCK: &str = "/castle-cron/joblock";

/// Key of the job record named `name`.
pub fn job_path(name: &str) -> String {
    format!("{PATH_JOBS}/{name}")
}

/// Presence key of the server named `name`.
pub fn server_path(name: &str) -> String {
    format!("{PATH_SERVERS}/{name}")
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("node {0} does not exist")]
    NoNode(String),

    #[error("node {0} already exists")]
    NodeExists(String),

    #[error("version mismatch writing {0}")]
    BadVersion(String),

    #[error("node {0} has children")]
    NotEmpty(String),

    #[error("store session expired")]
    SessionExpired,

    #[error("store connection error: {0}")]
    Transient(String),

    #[error("store error: {0}")]
    Other(String),
}

impl StoreError {
    /// Transient errors may clear on their own; everything else is a
    /// protocol-level failure the caller must handle.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_) | StoreError::SessionExpired)
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// What a one-shot watch observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    /// Watched key's content changed.
    Changed,
    /// Watched key was deleted.
    Deleted,
    /// A child was added to or removed from the watched key.
    ChildrenChanged,
    /// The session backing the watch ended.
    SessionLost,
    /// The watch itself failed.
    Error,
}

/// One-shot notification handle returned by the `*_and_watch` operations.
///
/// The handle resolves exactly once, on the first change to the watched key
/// (or its child set) or on session loss, and is consumed by waiting.
#[derive(Debug)]
pub struct WatchHandle {
    rx: oneshot::Receiver<WatchEvent>,
}

impl WatchHandle {
    /// Create a sender/handle pair. Dropping the sender without sending is
    /// reported to the waiter as session loss.
    pub fn pair() -> (oneshot::Sender<WatchEvent>, WatchHandle) {
        let (tx, rx) = oneshot::channel();
        (tx, WatchHandle { rx })
    }

    /// Wait for the watch to fire.
    pub async fn wait(self) -> WatchEvent {
        self.rx.await.unwrap_or(WatchEvent::SessionLost)
    }
}

/// The operations the core needs from the coordination store.
///
/// All calls are session-scoped: once the session expires every call fails
/// with [`StoreError::SessionExpired`] and the process must treat its
/// ephemeral state (presence key, held lock) as gone.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Read a key's content and version.
    async fn get(&self, path: &str) -> StoreResult<(Vec<u8>, i64)>;

    /// Read a key and install a one-shot watch on it.
    async fn get_and_watch(&self, path: &str) -> StoreResult<(Vec<u8>, i64, WatchHandle)>;

    /// Overwrite a key. `expected_version` of -1 writes unconditionally;
    /// otherwise the write fails with `BadVersion` unless it matches.
    async fn set(&self, path: &str, data: &[u8], expected_version: i64) -> StoreResult<()>;

    /// Create a persistent key; fails with `NodeExists` if it is present.
    async fn create(&self, path: &str, data: &[u8]) -> StoreResult<()>;

    /// Create a key bound to this session, removed automatically when the
    /// session ends.
    async fn create_ephemeral(&self, path: &str, data: &[u8]) -> StoreResult<()>;

    /// Delete a key; fails with `NoNode` if absent.
    async fn delete(&self, path: &str) -> StoreResult<()>;

    /// Whether a key exists.
    async fn exists(&self, path: &str) -> StoreResult<bool>;

    /// Names (not full paths) of a key's direct children, sorted.
    async fn list_children(&self, path: &str) -> StoreResult<Vec<String>>;

    /// List children and install a one-shot watch on the child set.
    async fn list_children_and_watch(&self, path: &str) -> StoreResult<(Vec<String>, WatchHandle)>;

    /// Block until the named lock is granted to this session. Grants are
    /// first-come-first-served; a session must not re-acquire a lock it
    /// already holds.
    async fn acquire_lock(&self, path: &str) -> StoreResult<()>;

    /// Release a lock held by this session.
    async fn release_lock(&self, path: &str) -> StoreResult<()>;

    /// End the session. The store removes this session's ephemeral keys and
    /// releases any lock it still holds.
    async fn close(&self);
}
