use thiserror::Error;

use crate::schedule::ScheduleError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum CronError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("job {0} already exists")]
    JobExists(String),

    #[error("job {0} not found")]
    JobNotFound(String),

    #[error("job name must not be empty")]
    EmptyJobName,

    #[error("invalid schedule for job {job}: {source}")]
    InvalidSchedule {
        job: String,
        #[source]
        source: ScheduleError,
    },

    #[error("invalid job record: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("server {0} is already running; use --force to replace its registration")]
    ServerExists(String),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CronError>;
