//! Detached execution of job commands.
//!
//! A dispatched job runs on its own task with no handle retained; the
//! scheduler releases the lock and moves on while the command runs.
//! Execution failures are reported in the log only and never touch
//! scheduling state, and a job is not retried.

use std::time::Instant;

use tokio::process::Command;

use crate::job::Job;

/// Spawn an independent execution of the job's command.
pub fn spawn(job: Job) {
    tokio::spawn(async move {
        run(&job).await;
    });
}

/// Run the job's command to completion and log the outcome.
pub async fn run(job: &Job) {
    tracing::info!(job = %job.name, cmd = %job.cmd, args = ?job.args, "Running job");
    let start = Instant::now();
    match Command::new(&job.cmd).args(&job.args).status().await {
        Ok(status) if status.success() => {
            tracing::info!(
                job = %job.name,
                elapsed_secs = start.elapsed().as_secs_f64(),
                "Job complete"
            );
        }
        Ok(status) => {
            tracing::error!(
                job = %job.name,
                exit_code = ?status.code(),
                elapsed_secs = start.elapsed().as_secs_f64(),
                "Job failed"
            );
        }
        Err(e) => {
            tracing::error!(
                job = %job.name,
                error = %e,
                elapsed_secs = start.elapsed().as_secs_f64(),
                "Job failed to start"
            );
        }
    }
}
