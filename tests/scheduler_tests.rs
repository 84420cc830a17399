//! Single-server scheduling loop behavior.


use std::path::Path;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};

use castle_cron::catalog::{acquire_job_lock, release_job_lock, CatalogChange};
use castle_cron::cli;
use castle_cron::job::Job;

use test_harness::{eventually, TestCluster};

fn append_line_job(out: &Path) -> (String, Vec<String>) {
    (
        "/bin/sh".to_string(),
        vec!["-c".to_string(), format!("echo run >> {}", out.display())],
    )
}

fn count_lines(path: &Path) -> usize {
    std::fs::read_to_string(path)
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

#[tokio::test]
async fn due_job_is_dispatched_and_rescheduled() {
    let cluster = TestCluster::new().await;
    let (store, catalog) = cluster.cli().await;
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("j1.log");

    let (cmd, args) = append_line_job(&out);
    cli::add(&store, &catalog, "j1", "* * * * * *", &cmd, args)
        .await
        .unwrap();
    let added = catalog.get("j1").await.unwrap();

    let _server = cluster.start_server("a").await;

    assert!(
        eventually(Duration::from_secs(5), async || { count_lines(&out) >= 1 }).await,
        "job never ran"
    );

    // Rescheduling moved the job past the instant that fired and the head
    // follows the catalog.
    assert!(
        eventually(Duration::from_secs(3), async || {
            let job = catalog.get("j1").await.unwrap();
            !job.has_error && job.next_runtime > added.next_runtime
        })
        .await,
        "job was not rescheduled"
    );
    let head = cluster.read_head().await;
    assert_eq!(head.name, "j1");
}

#[tokio::test]
async fn unschedulable_job_is_disabled_after_running() {
    let cluster = TestCluster::new().await;
    let (store, catalog) = cluster.cli().await;

    // A record whose schedule no longer parses, already due. The CLI could
    // never store this; the scheduler still has to cope and disable it.
    let broken = Job {
        name: "broken".to_string(),
        cmd: "/bin/true".to_string(),
        args: Vec::new(),
        schedule: "not a cron".to_string(),
        next_runtime: Utc::now() - ChronoDuration::seconds(1),
        has_error: false,
    };
    let token = acquire_job_lock(store.as_ref()).await.unwrap();
    catalog.put_new(&broken, &token).await.unwrap();
    catalog
        .reconcile_head(&CatalogChange::Added(broken.clone()), &token)
        .await
        .unwrap();
    release_job_lock(store.as_ref(), token).await.unwrap();

    let _server = cluster.start_server("a").await;

    assert!(
        eventually(Duration::from_secs(5), async || {
            catalog.get("broken").await.unwrap().has_error
        })
        .await,
        "job was never disabled"
    );
    // With the only job errored, the head falls back to the sentinel.
    assert!(
        eventually(Duration::from_secs(3), async || {
            cluster.read_head().await.is_sentinel()
        })
        .await,
        "head still points at the disabled job"
    );
}

#[tokio::test]
async fn shutdown_stops_dispatching() {
    let cluster = TestCluster::new().await;
    let (store, catalog) = cluster.cli().await;
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("late.log");

    let server = cluster.start_server("a").await;
    assert!(
        eventually(Duration::from_secs(2), async || {
            cluster.server_names().await == vec!["a".to_string()]
        })
        .await
    );

    server.stop();
    assert!(
        eventually(Duration::from_secs(2), async || {
            cluster.server_names().await.is_empty()
        })
        .await,
        "presence key survived shutdown"
    );

    // With no server left, a due job must not run.
    let (cmd, args) = append_line_job(&out);
    cli::add(&store, &catalog, "late", "* * * * * *", &cmd, args)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(count_lines(&out), 0);
}
