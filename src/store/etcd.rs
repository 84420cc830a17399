//! etcd-backed coordination store.
//!
//! The session is an etcd lease sized to the configured session timeout,
//! kept alive by a background task; when keep-alives stop succeeding the
//! session token is cancelled and every subsequent call reports
//! `SessionExpired`. Ephemeral keys are lease-attached puts, exclusive
//! creation is a `version == 0` transaction, children are one-level prefix
//! scans, and locks ride etcd's lock RPC bound to the session lease so a
//! dead server's lock evaporates with its lease.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, EventType, GetOptions, LockOptions, PutOptions,
    Txn, TxnOp, WatchOptions,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{Store, StoreError, StoreResult, WatchEvent, WatchHandle};

pub struct EtcdStore {
    client: Client,
    lease: i64,
    session: CancellationToken,
    lock_keys: Mutex<HashMap<String, Vec<u8>>>,
    keepalive: JoinHandle<()>,
}

impl EtcdStore {
    /// Connect and establish a session lease with the given timeout.
    pub async fn connect(endpoints: &[String], session_timeout: Duration) -> StoreResult<Self> {
        let options = ConnectOptions::new().with_connect_timeout(session_timeout);
        let mut client = Client::connect(endpoints, Some(options))
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))?;
        let ttl = session_timeout.as_secs().max(1) as i64;
        let lease = client
            .lease_grant(ttl, None)
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))?
            .id();

        let session = CancellationToken::new();
        let keepalive = tokio::spawn(keepalive_loop(
            client.clone(),
            lease,
            session_timeout,
            session.clone(),
        ));

        Ok(Self {
            client,
            lease,
            session,
            lock_keys: Mutex::new(HashMap::new()),
            keepalive,
        })
    }

    fn check(&self) -> StoreResult<()> {
        if self.session.is_cancelled() {
            Err(StoreError::SessionExpired)
        } else {
            Ok(())
        }
    }

    fn map_err(&self, e: etcd_client::Error) -> StoreError {
        if self.session.is_cancelled() {
            StoreError::SessionExpired
        } else {
            StoreError::Transient(e.to_string())
        }
    }

    /// Revision to start a watch from, one past the read the caller made.
    fn next_revision(header: Option<&etcd_client::ResponseHeader>) -> i64 {
        header.map(|h| h.revision() + 1).unwrap_or(0)
    }

    fn spawn_data_watch(&self, path: &str, revision: i64) -> WatchHandle {
        let (tx, handle) = WatchHandle::pair();
        let mut client = self.client.clone();
        let token = self.session.clone();
        let key = path.to_string();
        tokio::spawn(async move {
            let options = WatchOptions::new().with_start_revision(revision);
            let (mut watcher, mut stream) = match client.watch(key.as_str(), Some(options)).await {
                Ok(pair) => pair,
                Err(_) => {
                    let _ = tx.send(WatchEvent::Error);
                    return;
                }
            };
            let event = loop {
                tokio::select! {
                    _ = token.cancelled() => break WatchEvent::SessionLost,
                    message = stream.message() => match message {
                        Ok(Some(resp)) => {
                            if resp.canceled() {
                                break WatchEvent::Error;
                            }
                            match resp.events().last() {
                                Some(ev) if ev.event_type() == EventType::Delete => {
                                    break WatchEvent::Deleted
                                }
                                Some(_) => break WatchEvent::Changed,
                                // Progress notification; keep waiting.
                                None => {}
                            }
                        }
                        Ok(None) | Err(_) => break WatchEvent::Error,
                    }
                }
            };
            let _ = watcher.cancel().await;
            let _ = tx.send(event);
        });
        handle
    }

    fn spawn_child_watch(&self, path: &str, revision: i64) -> WatchHandle {
        let (tx, handle) = WatchHandle::pair();
        let mut client = self.client.clone();
        let token = self.session.clone();
        let prefix = format!("{path}/");
        tokio::spawn(async move {
            let options = WatchOptions::new()
                .with_prefix()
                .with_start_revision(revision);
            let (mut watcher, mut stream) =
                match client.watch(prefix.as_str(), Some(options)).await {
                    Ok(pair) => pair,
                    Err(_) => {
                        let _ = tx.send(WatchEvent::Error);
                        return;
                    }
                };
            let event = loop {
                tokio::select! {
                    _ = token.cancelled() => break WatchEvent::SessionLost,
                    message = stream.message() => match message {
                        Ok(Some(resp)) => {
                            if resp.canceled() {
                                break WatchEvent::Error;
                            }
                            if !resp.events().is_empty() {
                                break WatchEvent::ChildrenChanged;
                            }
                        }
                        Ok(None) | Err(_) => break WatchEvent::Error,
                    }
                }
            };
            let _ = watcher.cancel().await;
            let _ = tx.send(event);
        });
        handle
    }

    fn child_names(prefix: &str, resp: &etcd_client::GetResponse) -> Vec<String> {
        resp.kvs()
            .iter()
            .filter_map(|kv| {
                let key = String::from_utf8_lossy(kv.key());
                let rest = key.strip_prefix(prefix)?.to_string();
                (!rest.is_empty() && !rest.contains('/')).then_some(rest)
            })
            .collect()
    }
}

async fn keepalive_loop(
    mut client: Client,
    lease: i64,
    session_timeout: Duration,
    token: CancellationToken,
) {
    let interval = (session_timeout / 3).max(Duration::from_secs(1));
    let (mut keeper, mut stream) = match client.lease_keep_alive(lease).await {
        Ok(pair) => pair,
        Err(e) => {
            tracing::error!(error = %e, "Unable to start session keep-alive");
            token.cancel();
            return;
        }
    };
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(interval) => {
                if keeper.keep_alive().await.is_err() {
                    break;
                }
                match stream.message().await {
                    Ok(Some(resp)) if resp.ttl() > 0 => {}
                    _ => break,
                }
            }
        }
    }
    tracing::error!(lease, "Store session lost");
    token.cancel();
}

#[async_trait]
impl Store for EtcdStore {
    async fn get(&self, path: &str) -> StoreResult<(Vec<u8>, i64)> {
        self.check()?;
        let mut client = self.client.clone();
        let resp = client.get(path, None).await.map_err(|e| self.map_err(e))?;
        match resp.kvs().first() {
            Some(kv) => Ok((kv.value().to_vec(), kv.version())),
            None => Err(StoreError::NoNode(path.to_string())),
        }
    }

    async fn get_and_watch(&self, path: &str) -> StoreResult<(Vec<u8>, i64, WatchHandle)> {
        self.check()?;
        let mut client = self.client.clone();
        let resp = client.get(path, None).await.map_err(|e| self.map_err(e))?;
        let kv = resp
            .kvs()
            .first()
            .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
        let data = kv.value().to_vec();
        let version = kv.version();
        let handle = self.spawn_data_watch(path, Self::next_revision(resp.header()));
        Ok((data, version, handle))
    }

    async fn set(&self, path: &str, data: &[u8], expected_version: i64) -> StoreResult<()> {
        self.check()?;
        let mut client = self.client.clone();
        let compare = if expected_version < 0 {
            Compare::version(path, CompareOp::Greater, 0)
        } else {
            Compare::version(path, CompareOp::Equal, expected_version)
        };
        let txn = Txn::new()
            .when([compare])
            .and_then([TxnOp::put(path, data.to_vec(), None)]);
        let resp = client.txn(txn).await.map_err(|e| self.map_err(e))?;
        if resp.succeeded() {
            return Ok(());
        }
        if self.exists(path).await? {
            Err(StoreError::BadVersion(path.to_string()))
        } else {
            Err(StoreError::NoNode(path.to_string()))
        }
    }

    async fn create(&self, path: &str, data: &[u8]) -> StoreResult<()> {
        self.check()?;
        let mut client = self.client.clone();
        let txn = Txn::new()
            .when([Compare::version(path, CompareOp::Equal, 0)])
            .and_then([TxnOp::put(path, data.to_vec(), None)]);
        let resp = client.txn(txn).await.map_err(|e| self.map_err(e))?;
        if resp.succeeded() {
            Ok(())
        } else {
            Err(StoreError::NodeExists(path.to_string()))
        }
    }

    async fn create_ephemeral(&self, path: &str, data: &[u8]) -> StoreResult<()> {
        self.check()?;
        let mut client = self.client.clone();
        let put = TxnOp::put(
            path,
            data.to_vec(),
            Some(PutOptions::new().with_lease(self.lease)),
        );
        let txn = Txn::new()
            .when([Compare::version(path, CompareOp::Equal, 0)])
            .and_then([put]);
        let resp = client.txn(txn).await.map_err(|e| self.map_err(e))?;
        if resp.succeeded() {
            Ok(())
        } else {
            Err(StoreError::NodeExists(path.to_string()))
        }
    }

    async fn delete(&self, path: &str) -> StoreResult<()> {
        self.check()?;
        let mut client = self.client.clone();
        let resp = client
            .delete(path, None)
            .await
            .map_err(|e| self.map_err(e))?;
        if resp.deleted() == 0 {
            Err(StoreError::NoNode(path.to_string()))
        } else {
            Ok(())
        }
    }

    async fn exists(&self, path: &str) -> StoreResult<bool> {
        self.check()?;
        let mut client = self.client.clone();
        let resp = client
            .get(path, Some(GetOptions::new().with_count_only()))
            .await
            .map_err(|e| self.map_err(e))?;
        Ok(resp.count() > 0)
    }

    async fn list_children(&self, path: &str) -> StoreResult<Vec<String>> {
        self.check()?;
        let mut client = self.client.clone();
        let prefix = format!("{path}/");
        let resp = client
            .get(prefix.as_str(), Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| self.map_err(e))?;
        Ok(Self::child_names(&prefix, &resp))
    }

    async fn list_children_and_watch(&self, path: &str) -> StoreResult<(Vec<String>, WatchHandle)> {
        self.check()?;
        let mut client = self.client.clone();
        let prefix = format!("{path}/");
        let resp = client
            .get(prefix.as_str(), Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| self.map_err(e))?;
        let children = Self::child_names(&prefix, &resp);
        let handle = self.spawn_child_watch(path, Self::next_revision(resp.header()));
        Ok((children, handle))
    }

    async fn acquire_lock(&self, path: &str) -> StoreResult<()> {
        self.check()?;
        if self.lock_keys.lock().await.contains_key(path) {
            return Err(StoreError::Other(format!(
                "lock {path} already held by this session"
            )));
        }
        let mut client = self.client.clone();
        let resp = client
            .lock(path, Some(LockOptions::new().with_lease(self.lease)))
            .await
            .map_err(|e| self.map_err(e))?;
        self.lock_keys
            .lock()
            .await
            .insert(path.to_string(), resp.key().to_vec());
        Ok(())
    }

    async fn release_lock(&self, path: &str) -> StoreResult<()> {
        self.check()?;
        let key = self
            .lock_keys
            .lock()
            .await
            .remove(path)
            .ok_or_else(|| StoreError::Other(format!("lock {path} not held by this session")))?;
        let mut client = self.client.clone();
        client.unlock(key).await.map_err(|e| self.map_err(e))?;
        Ok(())
    }

    async fn close(&self) {
        self.session.cancel();
        self.keepalive.abort();
        let mut client = self.client.clone();
        let _ = client.lease_revoke(self.lease).await;
    }
}
