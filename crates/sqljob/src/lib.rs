//! sqljob drives SQL jobs hosted by a remote job server.
//!
//! A [`JobManager`] holds a pool of [`JobConnection`]s. Each JobConnection
//! owns one duplex byte stream to a job server process, over which requests
//! and responses are exchanged as newline-delimited JSON. Any number of
//! requests may be outstanding on one job at a time, and are correlated
//! with their responses by id. A [`Query`] is one statement of a job and
//! pages through its results.

mod cancel;
mod channel;
mod dispatcher;
mod job;
mod manager;
mod query;
mod registry;
mod spawn;

#[cfg(test)]
mod fake;

pub use cancel::CancelPolicy;
pub use job::{JobConnection, JobContext, JobStatus, SelfCodes, TraceConfig};
pub use manager::{JobManager, ManagerConfig, NamedJob};
pub use query::{Query, QueryOptions, QueryState, DEFAULT_ROWS_TO_FETCH};
pub use registry::QueryRegistry;
pub use spawn::{BoxReader, BoxWriter, CommandSpawner, Spawner, Transport};

pub use sqljob_protocol as protocol;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("job is not connected")]
    NotConnected,
    #[error("job has ended")]
    JobEnded,
    #[error("job has already been started")]
    AlreadyStarted,
    #[error("failed to connect job: {0}")]
    Connect(String),
    #[error("{0}")]
    State(&'static str),
    #[error("{message}")]
    Sql {
        message: String,
        state: Option<String>,
        code: Option<i64>,
    },
    #[error("request id {0:?} is already pending")]
    DuplicateId(String),
    #[error("no job named {0:?}")]
    NoSuchJob(String),
    #[error("no job at index {0}")]
    NoJobAtIndex(usize),
    #[error("failed to start job server")]
    Spawn(#[source] anyhow::Error),
    #[error("ambient SQL execution failed")]
    Runner(#[source] anyhow::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// SqlRunner executes a single statement and returns its result rows.
///
/// It's the seam to SQL execution which happens outside of a pooled job:
/// the ambient connection of the host, or an idle administrative job.
#[async_trait::async_trait]
pub trait SqlRunner: Send + Sync {
    async fn run_sql(&self, statement: &str) -> anyhow::Result<Vec<serde_json::Value>>;
}

/// CompletionCache is notified of objects whose cached descriptions
/// have become stale, for example because a statement just created them.
pub trait CompletionCache: Send + Sync {
    fn invalidate(&self, schema: &str, object: &str);
}
