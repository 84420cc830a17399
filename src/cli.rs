//! Catalog maintenance commands: add, upd, del, list, help.
//!
//! Mutations validate the schedule before touching the store, then perform
//! the catalog write and the head reconciliation under the job lock so
//! running servers always observe a consistent head.

use std::sync::Arc;

use chrono::Utc;

use crate::catalog::{acquire_job_lock, release_job_lock, Catalog, CatalogChange};
use crate::error::{CronError, Result};
use crate::job::Job;
use crate::schedule;
use crate::store::Store;

/// Build and validate a job from command arguments. Fails without any
/// store write when the schedule does not parse.
pub fn build_job(name: &str, schedule_expr: &str, cmd: &str, args: Vec<String>) -> Result<Job> {
    if name.is_empty() {
        return Err(CronError::EmptyJobName);
    }
    let next_runtime = schedule::next_after(schedule_expr, Utc::now()).map_err(|source| {
        CronError::InvalidSchedule {
            job: name.to_string(),
            source,
        }
    })?;
    Ok(Job {
        name: name.to_string(),
        cmd: cmd.to_string(),
        args,
        schedule: schedule_expr.to_string(),
        next_runtime,
        has_error: false,
    })
}

/// Add a new job to the schedule.
pub async fn add<S: Store>(
    store: &Arc<S>,
    catalog: &Catalog<S>,
    name: &str,
    schedule_expr: &str,
    cmd: &str,
    args: Vec<String>,
) -> Result<()> {
    let job = build_job(name, schedule_expr, cmd, args)?;
    let token = acquire_job_lock(store.as_ref()).await?;
    let result = async {
        catalog.put_new(&job, &token).await?;
        catalog
            .reconcile_head(&CatalogChange::Added(job.clone()), &token)
            .await
    }
    .await;
    let released = release_job_lock(store.as_ref(), token).await;
    result.and(released)?;
    println!("{}", render_job_table(std::slice::from_ref(&job)));
    Ok(())
}

/// Update an existing job.
pub async fn upd<S: Store>(
    store: &Arc<S>,
    catalog: &Catalog<S>,
    name: &str,
    schedule_expr: &str,
    cmd: &str,
    args: Vec<String>,
) -> Result<()> {
    let job = build_job(name, schedule_expr, cmd, args)?;
    let token = acquire_job_lock(store.as_ref()).await?;
    let result = async {
        catalog.update(&job, &token).await?;
        catalog
            .reconcile_head(&CatalogChange::Updated(job.clone()), &token)
            .await
    }
    .await;
    let released = release_job_lock(store.as_ref(), token).await;
    result.and(released)?;
    println!("{}", render_job_table(std::slice::from_ref(&job)));
    Ok(())
}

/// Delete a job from the schedule.
pub async fn del<S: Store>(store: &Arc<S>, catalog: &Catalog<S>, name: &str) -> Result<()> {
    let token = acquire_job_lock(store.as_ref()).await?;
    let result = async {
        catalog.remove(name, &token).await?;
        catalog
            .reconcile_head(&CatalogChange::Removed(name.to_string()), &token)
            .await
    }
    .await;
    let released = release_job_lock(store.as_ref(), token).await;
    result.and(released)?;
    println!("Job {name} deleted");
    Ok(())
}

/// List jobs, optionally filtered by a glob pattern.
pub async fn list<S: Store>(catalog: &Catalog<S>, pattern: Option<&str>) -> Result<()> {
    let jobs = catalog.list(pattern).await?;
    if jobs.is_empty() {
        println!("No jobs found");
    } else {
        println!("{}", render_job_table(&jobs));
    }
    Ok(())
}

/// Format jobs as a fixed-width table.
pub fn render_job_table(jobs: &[Job]) -> String {
    const HEADER: [&str; 4] = ["Name", "Next Runtime", "Error", "Command"];
    let rows: Vec<[String; 4]> = jobs
        .iter()
        .map(|job| {
            let mut command = job.cmd.clone();
            for arg in &job.args {
                command.push(' ');
                command.push_str(arg);
            }
            [
                job.name.clone(),
                job.fmt_next_runtime(),
                if job.has_error { "Err" } else { "" }.to_string(),
                command,
            ]
        })
        .collect();

    let mut widths = HEADER.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row.iter()) {
            *width = (*width).max(cell.len());
        }
    }

    let format_row = |cells: [&str; 4]| -> String {
        let mut line = String::new();
        for (i, (cell, &width)) in cells.iter().zip(widths.iter()).enumerate() {
            if i > 0 {
                line.push_str("  ");
            }
            line.push_str(&format!("{cell:<width$}"));
        }
        line.trim_end().to_string()
    };

    let mut out = format_row(HEADER);
    for row in &rows {
        out.push('\n');
        out.push_str(&format_row([
            row[0].as_str(),
            row[1].as_str(),
            row[2].as_str(),
            row[3].as_str(),
        ]));
    }
    out
}

/// Help text for a subcommand, or `None` for an unknown topic.
pub fn help_text(topic: Option<&str>) -> Option<String> {
    let text = match topic {
        None => "castle-cron add|upd|del|list <args...>\n\n\
             Maintain the job schedule. Subcommands:\n\
             \x20 add   Add a new job to the schedule\n\
             \x20 upd   Update a job in the schedule\n\
             \x20 del   Delete a job from the schedule\n\
             \x20 list  List scheduled jobs\n\n\
             Use `castle-cron help <subcommand>` for details, or\n\
             `castle-cron help sched` for the schedule string format.\n"
            .to_string(),
        Some("add") => "castle-cron add <name> <schedule> <cmd> [args...]\n\n\
             Add a new job to the schedule\n\
             \x20 name      Name of job; must be unique\n\
             \x20 schedule  cron-like blank-separated schedule string; see `help sched`\n\
             \x20 cmd       Command to run\n\
             \x20 args      Command arguments\n"
            .to_string(),
        Some("upd") => "castle-cron upd <name> <schedule> <cmd> [args...]\n\n\
             Update a job in the schedule\n\
             \x20 name      Name of job; must already exist\n\
             \x20 schedule  cron-like blank-separated schedule string; see `help sched`\n\
             \x20 cmd       Command to run\n\
             \x20 args      Command arguments\n"
            .to_string(),
        Some("del") => "castle-cron del <name>\n\n\
             Delete a job from the schedule\n\
             \x20 name  Name of job; must already exist\n"
            .to_string(),
        Some("list") => "castle-cron list [pattern]\n\n\
             List scheduled jobs\n\
             \x20 pattern  Name pattern to match; * matches one or more characters.\n\
             \x20          Omit to list all jobs\n"
            .to_string(),
        Some("sched") => "Job schedule; a quoted string of 5-7 blank-separated fields.\n\n\
             \x20 Field name    Mandatory?  Allowed values   Allowed special characters\n\
             \x20 ----------    ----------  --------------   --------------------------\n\
             \x20 Seconds       No          0-59             * / , -\n\
             \x20 Minutes       Yes         0-59             * / , -\n\
             \x20 Hours         Yes         0-23             * / , -\n\
             \x20 Day of month  Yes         1-31             * / , -\n\
             \x20 Month         Yes         1-12 or JAN-DEC  * / , -\n\
             \x20 Day of week   Yes         0-6 or SUN-SAT   * / , -\n\
             \x20 Year          No          1970-2099        * / , -\n"
            .to_string(),
        Some(_) => return None,
    };
    Some(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn build_job_computes_next_runtime() {
        let job = build_job("j1", "*/5 * * * *", "/bin/true", vec![]).unwrap();
        assert_eq!(job.name, "j1");
        assert!(job.next_runtime > Utc::now());
        assert!(!job.has_error);
    }

    #[test]
    fn build_job_rejects_invalid_schedule() {
        let err = build_job("j1", "not a cron", "/bin/true", vec![]).unwrap_err();
        assert!(matches!(err, CronError::InvalidSchedule { .. }));
    }

    #[test]
    fn build_job_rejects_empty_name() {
        let err = build_job("", "* * * * *", "/bin/true", vec![]).unwrap_err();
        assert!(matches!(err, CronError::EmptyJobName));
    }

    #[test]
    fn job_table_is_aligned() {
        let jobs = vec![
            Job {
                name: "short".to_string(),
                cmd: "/bin/true".to_string(),
                args: vec![],
                schedule: "* * * * *".to_string(),
                next_runtime: chrono::Utc.with_ymd_and_hms(2024, 6, 1, 2, 0, 0).unwrap(),
                has_error: false,
            },
            Job {
                name: "a-much-longer-name".to_string(),
                cmd: "/bin/echo".to_string(),
                args: vec!["hello".to_string()],
                schedule: "* * * * *".to_string(),
                next_runtime: chrono::Utc.with_ymd_and_hms(2024, 6, 2, 2, 0, 0).unwrap(),
                has_error: true,
            },
        ];
        let table = render_job_table(&jobs);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("Name"));
        assert!(lines[2].contains("Err"));
        // Both rows start their runtime column at the same offset.
        let offset = lines[1].find("2024").unwrap();
        assert_eq!(lines[2].find("2024").unwrap(), offset);
    }

    #[test]
    fn help_topics() {
        assert!(help_text(None).is_some());
        for topic in ["add", "upd", "del", "list", "sched"] {
            assert!(help_text(Some(topic)).is_some());
        }
        assert!(help_text(Some("bogus")).is_none());
    }
}
