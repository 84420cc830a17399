//! The persisted job record and its codec.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// How long the sentinel pushes the next wakeup into the future. The
/// scheduler re-reads the head whenever it changes, so a sleeping server is
/// woken long before this elapses.
const SENTINEL_WAIT_HOURS: i64 = 24;

/// A scheduled job.
///
/// Schedule strings carry 5 to 7 space-separated fields; see the README for
/// the field domains and special characters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Unique name, chosen by the operator. The empty name is reserved for
    /// the sentinel.
    pub name: String,
    /// Command to run.
    pub cmd: String,
    /// Command arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// cron-style schedule expression.
    pub schedule: String,
    /// Instant of the next execution.
    pub next_runtime: DateTime<Utc>,
    /// Set when rescheduling failed; errored jobs are excluded from head
    /// computation and never run.
    #[serde(default)]
    pub has_error: bool,
}

impl Job {
    /// The placeholder published when the catalog holds no runnable job.
    /// Its far-future `next_runtime` keeps the scheduler waiting until a
    /// real job replaces it.
    pub fn sentinel() -> Self {
        Self {
            name: String::new(),
            cmd: String::new(),
            args: Vec::new(),
            schedule: String::new(),
            next_runtime: Utc::now() + Duration::hours(SENTINEL_WAIT_HOURS),
            has_error: false,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.name.is_empty()
    }

    /// Serialize for storage. The sentinel is stored as empty bytes so that
    /// bootstrap's empty `/nextjob` and a published empty schedule agree.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        if self.is_sentinel() {
            return Ok(Vec::new());
        }
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode stored bytes. Empty input (and any record with the reserved
    /// empty name) decodes to a fresh sentinel so it is never dispatched.
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Ok(Self::sentinel());
        }
        let job: Job = serde_json::from_slice(data)?;
        if job.is_sentinel() {
            return Ok(Self::sentinel());
        }
        Ok(job)
    }

    pub fn fmt_next_runtime(&self) -> String {
        self.next_runtime.format("%Y-%m-%d %H:%M:%S%.f").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> Job {
        Job {
            name: "backup".to_string(),
            cmd: "/usr/bin/rsync".to_string(),
            args: vec!["-a".to_string(), "/data".to_string(), "/mnt".to_string()],
            schedule: "0 2 * * *".to_string(),
            next_runtime: Utc.with_ymd_and_hms(2024, 6, 1, 2, 0, 0).unwrap(),
            has_error: false,
        }
    }

    #[test]
    fn round_trip_preserves_job() {
        let job = sample();
        let bytes = job.serialize().unwrap();
        assert_eq!(Job::deserialize(&bytes).unwrap(), job);
    }

    #[test]
    fn round_trip_preserves_error_flag() {
        let mut job = sample();
        job.has_error = true;
        let bytes = job.serialize().unwrap();
        assert!(Job::deserialize(&bytes).unwrap().has_error);
    }

    #[test]
    fn empty_bytes_decode_to_sentinel() {
        let job = Job::deserialize(&[]).unwrap();
        assert!(job.is_sentinel());
        assert!(job.next_runtime > Utc::now() + Duration::hours(23));
    }

    #[test]
    fn sentinel_serializes_to_empty_bytes() {
        assert!(Job::sentinel().serialize().unwrap().is_empty());
    }

    #[test]
    fn stale_sentinel_record_gets_fresh_runtime() {
        // A literal empty-name record must never look dispatchable, no
        // matter what runtime it was stored with.
        let mut stale = Job::sentinel();
        stale.next_runtime = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let bytes = serde_json::to_vec(&stale).unwrap();
        let decoded = Job::deserialize(&bytes).unwrap();
        assert!(decoded.next_runtime > Utc::now());
    }

    #[test]
    fn garbage_bytes_are_an_error() {
        assert!(Job::deserialize(b"not json").is_err());
    }
}
