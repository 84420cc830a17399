//! In-process coordination store.
//!
//! [`MemoryCluster`] owns a shared tree of versioned nodes plus the watch and
//! lock tables; [`MemoryStore`] is a per-session handle implementing
//! [`Store`]. Sessions model the coordination service's contract: expiring a
//! session removes its ephemeral keys, releases its locks, and fires its
//! outstanding watches. Tests use [`MemoryCluster::expire_session`] to
//! simulate a server dying without a graceful close.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex};

use super::{Store, StoreError, StoreResult, WatchEvent, WatchHandle};

struct Node {
    data: Vec<u8>,
    version: i64,
    ephemeral_owner: Option<u64>,
}

#[derive(Default)]
struct LockState {
    owner: Option<u64>,
    waiters: VecDeque<(u64, oneshot::Sender<()>)>,
}

#[derive(Default)]
struct Shared {
    nodes: BTreeMap<String, Node>,
    data_watches: HashMap<String, Vec<(u64, oneshot::Sender<WatchEvent>)>>,
    child_watches: HashMap<String, Vec<(u64, oneshot::Sender<WatchEvent>)>>,
    locks: HashMap<String, LockState>,
    live_sessions: HashSet<u64>,
    next_session: u64,
}

fn parent_of(path: &str) -> Option<&str> {
    path.rsplit_once('/')
        .map(|(parent, _)| parent)
        .filter(|p| !p.is_empty())
}

impl Shared {
    fn check_session(&self, session: u64) -> StoreResult<()> {
        if self.live_sessions.contains(&session) {
            Ok(())
        } else {
            Err(StoreError::SessionExpired)
        }
    }

    fn children_of(&self, path: &str) -> Vec<String> {
        let prefix = format!("{path}/");
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn has_children(&self, path: &str) -> bool {
        let prefix = format!("{path}/");
        self.nodes
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(key, _)| key.starts_with(&prefix))
    }

    fn fire_data_watches(&mut self, path: &str, event: WatchEvent) {
        if let Some(watchers) = self.data_watches.remove(path) {
            for (_, tx) in watchers {
                let _ = tx.send(event);
            }
        }
    }

    fn fire_child_watches(&mut self, path: &str) {
        if let Some(watchers) = self.child_watches.remove(path) {
            for (_, tx) in watchers {
                let _ = tx.send(WatchEvent::ChildrenChanged);
            }
        }
    }

    fn create_node(
        &mut self,
        session: u64,
        path: &str,
        data: &[u8],
        ephemeral: bool,
    ) -> StoreResult<()> {
        if self.nodes.contains_key(path) {
            return Err(StoreError::NodeExists(path.to_string()));
        }
        if let Some(parent) = parent_of(path) {
            if !self.nodes.contains_key(parent) {
                return Err(StoreError::NoNode(parent.to_string()));
            }
        }
        self.nodes.insert(
            path.to_string(),
            Node {
                data: data.to_vec(),
                version: 1,
                ephemeral_owner: ephemeral.then_some(session),
            },
        );
        if let Some(parent) = parent_of(path) {
            self.fire_child_watches(parent);
        }
        Ok(())
    }

    fn delete_node(&mut self, path: &str) -> StoreResult<()> {
        if !self.nodes.contains_key(path) {
            return Err(StoreError::NoNode(path.to_string()));
        }
        if self.has_children(path) {
            return Err(StoreError::NotEmpty(path.to_string()));
        }
        self.nodes.remove(path);
        self.fire_data_watches(path, WatchEvent::Deleted);
        if let Some(parent) = parent_of(path) {
            self.fire_child_watches(parent);
        }
        Ok(())
    }

    /// Hand the lock to the first queued waiter whose session is still live.
    fn grant_next(&mut self, path: &str) {
        if let Some(mut lock) = self.locks.remove(path) {
            lock.owner = None;
            while let Some((session, tx)) = lock.waiters.pop_front() {
                if self.live_sessions.contains(&session) && tx.send(()).is_ok() {
                    lock.owner = Some(session);
                    break;
                }
            }
            self.locks.insert(path.to_string(), lock);
        }
    }

    fn drop_session_watches(&mut self, session: u64) {
        for map in [&mut self.data_watches, &mut self.child_watches] {
            for watchers in map.values_mut() {
                let mut kept = Vec::new();
                for (owner, tx) in watchers.drain(..) {
                    if owner == session {
                        let _ = tx.send(WatchEvent::SessionLost);
                    } else {
                        kept.push((owner, tx));
                    }
                }
                *watchers = kept;
            }
        }
    }

    fn expire(&mut self, session: u64) {
        if !self.live_sessions.remove(&session) {
            return;
        }
        self.drop_session_watches(session);

        let ephemerals: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();
        for path in ephemerals {
            self.nodes.remove(&path);
            self.fire_data_watches(&path, WatchEvent::Deleted);
            if let Some(parent) = parent_of(&path) {
                self.fire_child_watches(parent);
            }
        }

        let lock_paths: Vec<String> = self.locks.keys().cloned().collect();
        for path in lock_paths {
            let held = self
                .locks
                .get(&path)
                .is_some_and(|lock| lock.owner == Some(session));
            if held {
                self.grant_next(&path);
            } else if let Some(lock) = self.locks.get_mut(&path) {
                lock.waiters.retain(|(owner, _)| *owner != session);
            }
        }
    }
}

/// Shared in-process store. Cheap to clone; every clone sees the same tree.
#[derive(Clone, Default)]
pub struct MemoryCluster {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new session against the shared tree.
    pub async fn connect(&self) -> MemoryStore {
        let mut shared = self.shared.lock().await;
        shared.next_session += 1;
        let session = shared.next_session;
        shared.live_sessions.insert(session);
        MemoryStore {
            shared: self.shared.clone(),
            session,
        }
    }

    /// Kill a session without a graceful close, as the store would after a
    /// missed heartbeat: ephemerals vanish, locks transfer, watches fire.
    pub async fn expire_session(&self, session: u64) {
        self.shared.lock().await.expire(session);
    }
}

/// One session's handle onto a [`MemoryCluster`].
pub struct MemoryStore {
    shared: Arc<Mutex<Shared>>,
    session: u64,
}

impl MemoryStore {
    pub fn session_id(&self) -> u64 {
        self.session
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, path: &str) -> StoreResult<(Vec<u8>, i64)> {
        let shared = self.shared.lock().await;
        shared.check_session(self.session)?;
        let node = shared
            .nodes
            .get(path)
            .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
        Ok((node.data.clone(), node.version))
    }

    async fn get_and_watch(&self, path: &str) -> StoreResult<(Vec<u8>, i64, WatchHandle)> {
        let mut shared = self.shared.lock().await;
        shared.check_session(self.session)?;
        let (data, version) = {
            let node = shared
                .nodes
                .get(path)
                .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
            (node.data.clone(), node.version)
        };
        let (tx, handle) = WatchHandle::pair();
        shared
            .data_watches
            .entry(path.to_string())
            .or_default()
            .push((self.session, tx));
        Ok((data, version, handle))
    }

    async fn set(&self, path: &str, data: &[u8], expected_version: i64) -> StoreResult<()> {
        let mut shared = self.shared.lock().await;
        shared.check_session(self.session)?;
        let node = shared
            .nodes
            .get_mut(path)
            .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
        if expected_version >= 0 && node.version != expected_version {
            return Err(StoreError::BadVersion(path.to_string()));
        }
        node.data = data.to_vec();
        node.version += 1;
        shared.fire_data_watches(path, WatchEvent::Changed);
        Ok(())
    }

    async fn create(&self, path: &str, data: &[u8]) -> StoreResult<()> {
        let mut shared = self.shared.lock().await;
        shared.check_session(self.session)?;
        shared.create_node(self.session, path, data, false)
    }

    async fn create_ephemeral(&self, path: &str, data: &[u8]) -> StoreResult<()> {
        let mut shared = self.shared.lock().await;
        shared.check_session(self.session)?;
        shared.create_node(self.session, path, data, true)
    }

    async fn delete(&self, path: &str) -> StoreResult<()> {
        let mut shared = self.shared.lock().await;
        shared.check_session(self.session)?;
        shared.delete_node(path)
    }

    async fn exists(&self, path: &str) -> StoreResult<bool> {
        let shared = self.shared.lock().await;
        shared.check_session(self.session)?;
        Ok(shared.nodes.contains_key(path))
    }

    async fn list_children(&self, path: &str) -> StoreResult<Vec<String>> {
        let shared = self.shared.lock().await;
        shared.check_session(self.session)?;
        if !shared.nodes.contains_key(path) {
            return Err(StoreError::NoNode(path.to_string()));
        }
        Ok(shared.children_of(path))
    }

    async fn list_children_and_watch(&self, path: &str) -> StoreResult<(Vec<String>, WatchHandle)> {
        let mut shared = self.shared.lock().await;
        shared.check_session(self.session)?;
        if !shared.nodes.contains_key(path) {
            return Err(StoreError::NoNode(path.to_string()));
        }
        let children = shared.children_of(path);
        let (tx, handle) = WatchHandle::pair();
        shared
            .child_watches
            .entry(path.to_string())
            .or_default()
            .push((self.session, tx));
        Ok((children, handle))
    }

    async fn acquire_lock(&self, path: &str) -> StoreResult<()> {
        let rx = {
            let mut shared = self.shared.lock().await;
            shared.check_session(self.session)?;
            let lock = shared.locks.entry(path.to_string()).or_default();
            match lock.owner {
                None => {
                    lock.owner = Some(self.session);
                    return Ok(());
                }
                Some(owner) if owner == self.session => {
                    return Err(StoreError::Other(format!(
                        "lock {path} already held by this session"
                    )));
                }
                Some(_) => {
                    let (tx, rx) = oneshot::channel();
                    lock.waiters.push_back((self.session, tx));
                    rx
                }
            }
        };
        // The grant arrives through the channel; a dropped sender means the
        // session expired while queued.
        match rx.await {
            Ok(()) => Ok(()),
            Err(_) => Err(StoreError::SessionExpired),
        }
    }

    async fn release_lock(&self, path: &str) -> StoreResult<()> {
        let mut shared = self.shared.lock().await;
        shared.check_session(self.session)?;
        let owned = shared
            .locks
            .get(path)
            .is_some_and(|lock| lock.owner == Some(self.session));
        if !owned {
            return Err(StoreError::Other(format!(
                "lock {path} not held by this session"
            )));
        }
        shared.grant_next(path);
        Ok(())
    }

    async fn close(&self) {
        self.shared.lock().await.expire(self.session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_of_paths() {
        assert_eq!(parent_of("/app/jobs/j1"), Some("/app/jobs"));
        assert_eq!(parent_of("/app"), None);
        assert_eq!(parent_of("app"), None);
    }

    #[tokio::test]
    async fn children_are_direct_and_sorted() {
        let cluster = MemoryCluster::new();
        let store = cluster.connect().await;
        store.create("/app", b"").await.unwrap();
        store.create("/app/jobs", b"").await.unwrap();
        store.create("/app/jobs/b", b"x").await.unwrap();
        store.create("/app/jobs/a", b"x").await.unwrap();
        store.create("/app/jobs/a/nested", b"x").await.unwrap();
        let children = store.list_children("/app/jobs").await.unwrap();
        assert_eq!(children, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn create_requires_parent() {
        let cluster = MemoryCluster::new();
        let store = cluster.connect().await;
        let err = store.create("/app/jobs/j1", b"x").await.unwrap_err();
        assert!(matches!(err, StoreError::NoNode(_)));
    }
}
