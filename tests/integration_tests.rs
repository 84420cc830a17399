//! End-to-end cluster scenarios: multiple servers, one catalog, real
//! wall-clock schedules at seconds granularity.


use std::path::Path;
use std::time::Duration;

use chrono::{Timelike, Utc};

use castle_cron::cli;
use castle_cron::store::Store;

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
async fn single_server_runs_a_repeating_job() {
    let cluster = TestCluster::new().await;
    let (store, catalog) = cluster.cli().await;
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("j1.log");

    let _a = cluster.start_server("a").await;

    let (cmd, args) = append_line_job(&out);
    cli::add(&store, &catalog, "j1", "* * * * * *", &cmd, args)
        .await
        .unwrap();

    assert!(
        eventually(Duration::from_secs(5), async || { count_lines(&out) >= 2 }).await,
        "job did not keep firing"
    );

    // The head stays a copy of the cataloged record.
    assert!(
        eventually(Duration::from_secs(3), async || {
            let head = cluster.read_head().await;
            head.name == "j1" && catalog.get("j1").await.unwrap() == head
        })
        .await,
        "head does not mirror the catalog"
    );
}

#[tokio::test]
async fn two_servers_dispatch_a_tick_exactly_once() {
    let cluster = TestCluster::new().await;
    let (store, catalog) = cluster.cli().await;
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("j2.log");

    let _a = cluster.start_server("a").await;
    let _b = cluster.start_server("b").await;
    assert!(
        eventually(Duration::from_secs(2), async || {
            cluster.server_names().await.len() == 2
        })
        .await
    );

    // Pin the job to one second of the minute a few seconds out, so the
    // observation window contains exactly one tick.
    let target = Utc::now() + chrono::Duration::seconds(5);
    let schedule = format!("{} * * * * *", target.second());
    let (cmd, args) = append_line_job(&out);
    cli::add(&store, &catalog, "j2", &schedule, &cmd, args)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(8)).await;
    assert_eq!(count_lines(&out), 1, "tick dispatched other than once");

    // Both servers survived the lock contention.
    assert_eq!(cluster.server_names().await.len(), 2);
}

#[tokio::test]
async fn adding_an_earlier_job_retargets_a_waiting_server() {
    let cluster = TestCluster::new().await;
    let (store, catalog) = cluster.cli().await;
    let dir = tempfile::tempdir().unwrap();
    let far_out = dir.path().join("far.log");
    let soon_out = dir.path().join("soon.log");

    let _a = cluster.start_server("a").await;

    // The server settles into waiting for a job that fires in another era.
    let (cmd, args) = append_line_job(&far_out);
    cli::add(&store, &catalog, "far", "0 0 0 1 1 * 2099", &cmd, args)
        .await
        .unwrap();
    assert!(
        eventually(Duration::from_secs(2), async || {
            cluster.read_head().await.name == "far"
        })
        .await
    );

    // A sooner job must wake it through the head watch.
    let (cmd, args) = append_line_job(&soon_out);
    cli::add(&store, &catalog, "soon", "* * * * * *", &cmd, args)
        .await
        .unwrap();

    assert!(
        eventually(Duration::from_secs(5), async || {
            count_lines(&soon_out) >= 1
        })
        .await,
        "server never woke for the earlier job"
    );
    assert_eq!(count_lines(&far_out), 0);
}

#[tokio::test]
async fn deleting_the_scheduled_job_clears_the_head() {
    let cluster = TestCluster::new().await;
    let (store, catalog) = cluster.cli().await;
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("doomed.log");

    let _a = cluster.start_server("a").await;

    let (cmd, args) = append_line_job(&out);
    cli::add(&store, &catalog, "doomed", "0 0 0 1 1 * 2099", &cmd, args)
        .await
        .unwrap();
    assert!(
        eventually(Duration::from_secs(2), async || {
            cluster.read_head().await.name == "doomed"
        })
        .await
    );

    cli::del(&store, &catalog, "doomed").await.unwrap();
    assert!(
        eventually(Duration::from_secs(2), async || {
            cluster.read_head().await.is_sentinel()
        })
        .await,
        "head still names the deleted job"
    );
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(count_lines(&out), 0);
}

#[tokio::test]
async fn jobs_survive_server_death() {
    let cluster = TestCluster::new().await;
    let (store, catalog) = cluster.cli().await;
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("survivor.log");

    let a = cluster.start_server("a").await;
    let _b = cluster.start_server("b").await;
    assert!(
        eventually(Duration::from_secs(2), async || {
            cluster.server_names().await.len() == 2
        })
        .await
    );

    // SIGKILL semantics: the session expires, the presence key vanishes.
    cluster.kill_server(&a).await;
    assert!(
        eventually(Duration::from_secs(2), async || {
            cluster.server_names().await == vec!["b".to_string()]
        })
        .await,
        "dead server still registered"
    );

    let (cmd, args) = append_line_job(&out);
    cli::add(&store, &catalog, "survivor", "* * * * * *", &cmd, args)
        .await
        .unwrap();
    assert!(
        eventually(Duration::from_secs(5), async || { count_lines(&out) >= 1 }).await,
        "remaining server did not pick up the job"
    );
}

#[tokio::test]
async fn force_replaces_an_existing_registration() {
    let cluster = TestCluster::new().await;

    let _a = cluster.start_server("shared-name").await;
    assert!(
        eventually(Duration::from_secs(2), async || {
            cluster.server_names().await == vec!["shared-name".to_string()]
        })
        .await
    );

    let store = cluster.store.connect().await;
    let name = castle_cron::membership::register(&store, Some("shared-name"), true)
        .await
        .unwrap();
    assert_eq!(name, "shared-name");
    assert_eq!(cluster.server_names().await, vec!["shared-name".to_string()]);
    store.close().await;
}

#[tokio::test]
async fn server_name_collision_without_force_is_refused() {
    let cluster = TestCluster::new().await;

    let _a = cluster.start_server("dup").await;
    assert!(
        eventually(Duration::from_secs(2), async || {
            cluster.server_names().await == vec!["dup".to_string()]
        })
        .await
    );

    // A second server with the same name and no --force must fail its
    // registration and never appear twice.
    let store = std::sync::Arc::new(cluster.store.connect().await);
    let config = castle_cron::config::ServerConfig {
        name_template: Some("dup".to_string()),
        ..Default::default()
    };
    let shutdown = tokio_util::sync::CancellationToken::new();
    let server = castle_cron::server::Server::new(store, config, shutdown);
    let err = server.run().await.unwrap_err();
    assert!(matches!(
        err,
        castle_cron::error::CronError::ServerExists(_)
    ));
    server.stop().await;

    assert_eq!(cluster.server_names().await, vec!["dup".to_string()]);
}
