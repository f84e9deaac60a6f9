use crate::channel::Channel;
use crate::dispatcher::Dispatcher;
use crate::query::{Query, QueryOptions};
use crate::registry::QueryRegistry;
use crate::spawn::Spawner;
use crate::{CompletionCache, Error, Result};
use sqljob_protocol::{
    ConnectResult, JobOptions, QueryResult, Request, RequestBody, Response, SetConfigResult,
    TraceDataResult, TraceDest, TraceLevel, VersionResult, APPLICATION,
};
use std::sync::{Arc, Weak};

/// Status of a JobConnection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    NotStarted,
    Ready,
    /// Ready, and at least one request is awaiting its response.
    Busy,
    Ended,
}

/// Self-logging of SQL errors and warnings encountered by a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelfCodes {
    None,
    All,
    Error,
    Warning,
}

impl SelfCodes {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "*NONE",
            Self::All => "*ALL",
            Self::Error => "*ERROR",
            Self::Warning => "*WARNING",
        }
    }
}

/// Server-confirmed trace configuration of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceConfig {
    pub dest: TraceDest,
    pub level: TraceLevel,
}

/// JobContext holds the collaborators shared by the jobs of a JobManager.
#[derive(Clone)]
pub struct JobContext {
    pub spawner: Arc<dyn Spawner>,
    pub registry: QueryRegistry,
    pub completion_cache: Option<Arc<dyn CompletionCache>>,
}

impl JobContext {
    pub fn new(spawner: Arc<dyn Spawner>) -> Self {
        Self {
            spawner,
            registry: QueryRegistry::new(),
            completion_cache: None,
        }
    }
}

/// JobConnection is one job of a remote job server.
///
/// It's a cheaply cloned handle: all clones refer to the same job.
/// Requests may be sent concurrently from any number of tasks.
#[derive(Clone)]
pub struct JobConnection {
    inner: Arc<Inner>,
}

struct Inner {
    options: JobOptions,
    context: JobContext,
    dispatcher: Dispatcher,
    channel: std::sync::Mutex<Option<Arc<Channel>>>,
    state: std::sync::Mutex<State>,
}

// Stored status of a job. Busy is never stored: it's derived from
// the pending requests of the job's Dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stored {
    NotStarted,
    Connecting,
    Ready,
    Ended,
}

struct State {
    stored: Stored,
    id: Option<String>,
    self_codes: Option<SelfCodes>,
    trace: Option<TraceConfig>,
}

impl JobConnection {
    pub fn new(options: JobOptions, context: JobContext) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                context,
                dispatcher: Dispatcher::default(),
                channel: Default::default(),
                state: std::sync::Mutex::new(State {
                    stored: Stored::NotStarted,
                    id: None,
                    self_codes: None,
                    trace: None,
                }),
            }),
        }
    }

    /// Server-assigned name of this job, available once connected.
    pub fn id(&self) -> Option<String> {
        self.inner.state.lock().unwrap().id.clone()
    }

    pub fn options(&self) -> &JobOptions {
        &self.inner.options
    }

    pub fn context(&self) -> &JobContext {
        &self.inner.context
    }

    pub fn status(&self) -> JobStatus {
        let stored = self.inner.state.lock().unwrap().stored;
        let has_channel = self.inner.channel.lock().unwrap().is_some();
        derive_status(stored, has_channel, self.inner.dispatcher.pending())
    }

    /// Number of requests of this job which are awaiting their response.
    pub fn pending_requests(&self) -> usize {
        self.inner.dispatcher.pending()
    }

    /// Is this the same job as `other`?
    pub fn ptr_eq(&self, other: &JobConnection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn self_codes(&self) -> Option<SelfCodes> {
        self.inner.state.lock().unwrap().self_codes
    }

    pub fn trace_config(&self) -> Option<TraceConfig> {
        self.inner.state.lock().unwrap().trace
    }

    /// Start a job server and connect a job using this JobConnection's options.
    /// On failure the job is ended and the error is returned.
    pub async fn connect(&self) -> Result<ConnectResult> {
        {
            let mut state = self.inner.state.lock().unwrap();
            match state.stored {
                Stored::NotStarted => state.stored = Stored::Connecting,
                Stored::Ended => return Err(Error::JobEnded),
                Stored::Connecting | Stored::Ready => return Err(Error::AlreadyStarted),
            }
        }

        let transport = match self.inner.context.spawner.spawn().await {
            Ok(transport) => transport,
            Err(err) => {
                self.inner.teardown("job server failed to start");
                return Err(Error::Spawn(err));
            }
        };

        let on_message = {
            let weak = Arc::downgrade(&self.inner);
            move |response: Response| {
                if let Some(inner) = weak.upgrade() {
                    inner.dispatcher.dispatch(response);
                }
            }
        };
        let on_close = {
            let weak: Weak<Inner> = Arc::downgrade(&self.inner);
            move |reason: String| {
                if let Some(inner) = weak.upgrade() {
                    inner.teardown(&reason);
                }
            }
        };
        let channel = Channel::open(transport, on_message, on_close);
        *self.inner.channel.lock().unwrap() = Some(Arc::new(channel));

        let request = Request::new(RequestBody::Connect {
            technique: "tcp".to_string(),
            application: APPLICATION.to_string(),
            props: self.inner.options.to_props(),
        });

        let result = match self.send(request).await {
            Ok(response) => response.into_typed::<ConnectResult>().map_err(Error::from),
            Err(err) => Err(err),
        };

        match result {
            Ok(connected @ ConnectResult { success: true, job: Some(_), .. }) => {
                let mut state = self.inner.state.lock().unwrap();

                // The channel may have closed while we awaited the response.
                if state.stored == Stored::Ended {
                    return Err(Error::JobEnded);
                }
                state.stored = Stored::Ready;
                state.id = connected.job.clone();
                tracing::info!(job = ?connected.job, "connected job");

                Ok(connected)
            }
            Ok(ConnectResult { error, .. }) => {
                self.inner.teardown("job failed to connect");
                Err(Error::Connect(error.unwrap_or_else(|| {
                    "job server did not assign a job".to_string()
                })))
            }
            Err(err) => {
                self.inner.teardown("job failed to connect");
                Err(err)
            }
        }
    }

    /// Send `request` and await its Response. If the job ends before the
    /// server answers, the Response is a synthetic failure.
    pub async fn send(&self, request: Request) -> Result<Response> {
        let channel = {
            let channel = self.inner.channel.lock().unwrap();
            match &*channel {
                Some(channel) => channel.clone(),
                None if self.inner.state.lock().unwrap().stored == Stored::Ended => {
                    return Err(Error::JobEnded)
                }
                None => return Err(Error::NotConnected),
            }
        };

        let rx = self.inner.dispatcher.register(&request.id)?;

        if let Err(err) = channel.write(&request).await {
            self.inner.dispatcher.forget(&request.id);
            self.inner.teardown("failed to write to job server");
            return Err(err);
        }

        match rx.await {
            Ok(response) => Ok(response),
            // Resolvers are only dropped by a flush, which fulfills them first.
            Err(_) => Ok(Response::job_ended(request.id)),
        }
    }

    /// Build a Query of `sql` which is bound to this job.
    pub fn query(&self, sql: impl Into<String>, options: QueryOptions) -> Query {
        Query::new(self.clone(), sql.into(), options)
    }

    /// Run `sql` through to its first page of results and then close it.
    /// A statement which fails is returned as an Error::Sql.
    pub async fn execute(&self, sql: impl Into<String>) -> Result<QueryResult> {
        let query = self.query(sql, QueryOptions::default());
        let result = query.run(None).await;

        if let Err(error) = query.close().await {
            tracing::debug!(%error, "failed to close executed statement");
        }
        result
    }

    /// End this job. An exit request is sent on a best-effort basis,
    /// every request still awaiting a response is resolved with a failure,
    /// and the job server's Transport is released.
    pub async fn close(&self) {
        let channel = self.inner.channel.lock().unwrap().clone();

        if let Some(channel) = channel {
            let exit = Request::new(RequestBody::Exit);
            if let Err(error) = channel.write(&exit).await {
                tracing::debug!(%error, "failed to send exit to job server");
            }
        }
        self.inner.teardown("job closed");
    }

    /// Fetch the version of the job server.
    pub async fn get_version(&self) -> Result<VersionResult> {
        let response = self.send(Request::new(RequestBody::Getversion)).await?;
        let result: VersionResult = response.into_typed()?;
        failed_request(result.success, &result.error)?;
        Ok(result)
    }

    /// Configure tracing of the job server. The stored trace configuration
    /// is updated only once the server confirms it.
    pub async fn set_trace_config(&self, dest: TraceDest, level: TraceLevel) -> Result<TraceConfig> {
        let response = self
            .send(Request::new(RequestBody::Setconfig {
                tracedest: dest,
                tracelevel: level,
            }))
            .await?;
        let result: SetConfigResult = response.into_typed()?;
        failed_request(result.success, &result.error)?;

        let confirmed = TraceConfig {
            dest: result.tracedest.unwrap_or(dest),
            level: result.tracelevel.unwrap_or(level),
        };
        self.inner.state.lock().unwrap().trace = Some(confirmed);
        Ok(confirmed)
    }

    /// Fetch the trace data collected by the job server.
    pub async fn get_trace_data(&self) -> Result<String> {
        let response = self.send(Request::new(RequestBody::Gettracedata)).await?;
        let result: TraceDataResult = response.into_typed()?;
        failed_request(result.success, &result.error)?;
        Ok(result.tracedata)
    }

    /// Set the self-logging codes of this job. The stored codes are
    /// updated only once the statement succeeds.
    pub async fn set_self_codes(&self, codes: SelfCodes) -> Result<()> {
        self.execute(format!(
            "SET SYSIBMADM.SELFCODES = SYSIBMADM.VALIDATE_SELF('{}')",
            codes.as_str()
        ))
        .await?;

        self.inner.state.lock().unwrap().self_codes = Some(codes);
        Ok(())
    }
}

#[async_trait::async_trait]
impl crate::SqlRunner for JobConnection {
    async fn run_sql(&self, statement: &str) -> anyhow::Result<Vec<serde_json::Value>> {
        Ok(self.execute(statement).await?.data)
    }
}

impl std::fmt::Debug for JobConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobConnection")
            .field("id", &self.id())
            .field("status", &self.status())
            .finish()
    }
}

impl Inner {
    // Shared shutdown path of close(), connection failures, and the
    // channel's own error or close. Safe to call more than once.
    // The job is ENDED before its pending requests are resolved.
    fn teardown(&self, reason: &str) {
        let channel = self.channel.lock().unwrap().take();
        let ended = {
            let mut state = self.state.lock().unwrap();
            (state.stored != Stored::Ended).then(|| {
                state.stored = Stored::Ended;
                state.id.clone()
            })
        };
        let flushed = self.dispatcher.flush();

        if let Some(job) = ended {
            tracing::debug!(?job, reason, flushed, "job ended");
        }

        if let Some(channel) = channel {
            channel.shutdown();
        }
    }
}

fn derive_status(stored: Stored, has_channel: bool, pending: usize) -> JobStatus {
    match stored {
        Stored::Ended => JobStatus::Ended,
        _ if has_channel && pending != 0 => JobStatus::Busy,
        Stored::NotStarted | Stored::Connecting => JobStatus::NotStarted,
        Stored::Ready => JobStatus::Ready,
    }
}

fn failed_request(success: bool, error: &Option<String>) -> Result<()> {
    if success {
        Ok(())
    } else {
        Err(Error::Sql {
            message: error
                .clone()
                .unwrap_or_else(|| "request failed (unknown error)".to_string()),
            state: None,
            code: None,
        })
    }
}
