//! Server presence and membership reporting.
//!
//! Each server owns one ephemeral key under `/servers`; the store removes
//! it when the session ends, so the child set of `/servers` is the live
//! cluster membership. A background task watches that set and logs joins
//! and leaves.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{CronError, Result};
use crate::store::{server_path, Store, StoreError, WatchEvent, APP_NAME, PATH_SERVERS};

/// Register this server's presence key.
///
/// The name comes from the operator-supplied template with `%h` replaced by
/// the hostname and `%p` by the pid; a missing template means the bare
/// hostname. An existing registration with the same name is refused unless
/// `force` is set, in which case the stale key is deleted first.
pub async fn register<S: Store>(store: &S, template: Option<&str>, force: bool) -> Result<String> {
    let name = expand_name(template, &hostname(), std::process::id());
    let path = server_path(&name);
    if store.exists(&path).await? {
        if !force {
            return Err(CronError::ServerExists(name));
        }
        tracing::warn!(server = %name, "Deleting previously registered server entry");
        match store.delete(&path).await {
            // The stale session may expire in the meantime.
            Ok(()) | Err(StoreError::NoNode(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }
    store.create_ephemeral(&path, APP_NAME.as_bytes()).await?;
    tracing::trace!(server = %name, path = %path, "Registered server");
    Ok(name)
}

fn expand_name(template: Option<&str>, hostname: &str, pid: u32) -> String {
    match template {
        None | Some("") => hostname.to_string(),
        Some(template) => template
            .replace("%h", hostname)
            .replace("%p", &pid.to_string()),
    }
}

/// The system hostname, or `unknown-<pid>` if it cannot be determined.
fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("HOST"))
        .unwrap_or_else(|_| {
            tracing::warn!("Running on unknown host");
            format!("unknown-{}", std::process::id())
        })
}

/// Spawn the membership monitor. It reports until shutdown or its first
/// error; reporting errors never affect scheduling.
pub fn spawn_monitor<S: Store>(
    store: Arc<S>,
    server_name: String,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = monitor(store.as_ref(), &server_name, shutdown).await {
            tracing::error!(error = %e, "Server change reporting terminated");
        }
    })
}

async fn monitor<S: Store>(
    store: &S,
    server_name: &str,
    shutdown: CancellationToken,
) -> Result<()> {
    let (snapshot, mut watch) = store.list_children_and_watch(PATH_SERVERS).await?;
    let mut epoch: u64 = 1;
    let mut epochs: HashMap<String, u64> = HashMap::new();
    for server in &snapshot {
        epochs.insert(server.clone(), epoch);
    }
    let mut servers = snapshot;
    servers.sort();
    if servers.is_empty() {
        // The list should at least include this server.
        tracing::warn!(server = %server_name, "Server started; server list missing");
    } else {
        tracing::info!(
            server = %server_name,
            count = servers.len(),
            servers = ?servers,
            "Server started"
        );
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            event = watch.wait() => match event {
                WatchEvent::SessionLost | WatchEvent::Error => {
                    return Err(CronError::Internal(
                        "server list watch failed".to_string(),
                    ));
                }
                _ => {}
            },
        }

        let (snapshot, next_watch) = store.list_children_and_watch(PATH_SERVERS).await?;
        watch = next_watch;
        epoch += 1;
        let (joined, left) = diff_snapshot(&mut epochs, &snapshot, epoch, server_name);
        let mut servers = snapshot;
        servers.sort();
        if !joined.is_empty() {
            tracing::info!(
                joined = ?joined,
                count = servers.len(),
                servers = ?servers,
                "Server(s) started"
            );
        }
        if !left.is_empty() {
            tracing::info!(
                stopped = ?left,
                count = servers.len(),
                servers = ?servers,
                "Server(s) stopped"
            );
        }
    }
}

/// Advance the epoch map to `snapshot` and report which servers joined and
/// which left since the previous snapshot, both sorted. Any entry whose
/// epoch did not advance has left.
fn diff_snapshot(
    epochs: &mut HashMap<String, u64>,
    snapshot: &[String],
    epoch: u64,
    own_name: &str,
) -> (Vec<String>, Vec<String>) {
    let mut joined = Vec::new();
    for server in snapshot {
        if !epochs.contains_key(server) && server != own_name {
            joined.push(server.clone());
        }
        epochs.insert(server.clone(), epoch);
    }
    let mut left: Vec<String> = epochs
        .iter()
        .filter(|(_, seen)| **seen != epoch)
        .map(|(server, _)| server.clone())
        .collect();
    for server in &left {
        epochs.remove(server);
    }
    joined.sort();
    left.sort();
    (joined, left)
}
