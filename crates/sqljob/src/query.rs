use crate::{Error, JobConnection, Result};
use regex::Regex;
use serde_json::Value;
use sqljob_protocol::{QueryResult, Request, RequestBody, JOB_ENDED_ERROR};
use std::sync::{Arc, LazyLock, Weak};

/// Number of rows requested per page when a caller doesn't say otherwise.
pub const DEFAULT_ROWS_TO_FETCH: u32 = 100;

/// State of a Query. States only ever progress forward:
/// a Query which is RunDone stays RunDone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    NotYetRun,
    RunMoreDataAvailable,
    RunDone,
    Error,
}

#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Run the statement as a CL command rather than SQL.
    pub is_cl_command: bool,
    /// Parameter markers of a prepared statement.
    /// Present, even if empty, means the statement is prepared.
    pub parameters: Option<Vec<Value>>,
    /// Request positional (array) rows rather than column-keyed objects.
    pub terse: bool,
    /// Close this Query during the next registry cleanup.
    pub auto_close: bool,
}

/// Query is a single statement of a JobConnection, which pages through
/// its results. It's a cheaply cloned handle: clones share state.
#[derive(Clone)]
pub struct Query {
    inner: Arc<QueryInner>,
}

/// A reference to a Query which doesn't keep it alive.
#[derive(Clone)]
pub(crate) struct WeakQuery(Weak<QueryInner>);

impl WeakQuery {
    pub fn upgrade(&self) -> Option<Query> {
        self.0.upgrade().map(|inner| Query { inner })
    }

    pub fn is_dropped(&self) -> bool {
        self.0.strong_count() == 0
    }

    pub fn refers_to(&self, query: &Query) -> bool {
        std::ptr::eq(self.0.as_ptr(), Arc::as_ptr(&query.inner))
    }
}

struct QueryInner {
    job: JobConnection,
    sql: String,
    options: QueryOptions,
    progress: std::sync::Mutex<Progress>,
}

struct Progress {
    state: QueryState,
    // Server-assigned cursor handle, which is the id of the run() response.
    cursor: Option<String>,
    // A run() request is awaiting its response.
    running: bool,
}

impl Query {
    pub(crate) fn new(job: JobConnection, sql: String, options: QueryOptions) -> Self {
        let query = Self {
            inner: Arc::new(QueryInner {
                job,
                sql,
                options,
                progress: std::sync::Mutex::new(Progress {
                    state: QueryState::NotYetRun,
                    cursor: None,
                    running: false,
                }),
            }),
        };
        query.inner.job.context().registry.add(&query);
        query
    }

    pub fn state(&self) -> QueryState {
        self.inner.progress.lock().unwrap().state
    }

    pub fn cursor_id(&self) -> Option<String> {
        self.inner.progress.lock().unwrap().cursor.clone()
    }

    pub fn sql(&self) -> &str {
        &self.inner.sql
    }

    pub fn job(&self) -> &JobConnection {
        &self.inner.job
    }

    pub fn options(&self) -> &QueryOptions {
        &self.inner.options
    }

    pub fn auto_close(&self) -> bool {
        self.inner.options.auto_close
    }

    pub fn is_prepared(&self) -> bool {
        self.inner.options.parameters.is_some()
    }

    pub(crate) fn downgrade(&self) -> WeakQuery {
        WeakQuery(Arc::downgrade(&self.inner))
    }

    /// Is this the same Query as `other`?
    pub fn ptr_eq(&self, other: &Query) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Run the statement, fetching up to `rows_to_fetch` rows of its results.
    /// A Query may be run only once.
    pub async fn run(&self, rows_to_fetch: Option<u32>) -> Result<QueryResult> {
        {
            let mut progress = self.inner.progress.lock().unwrap();
            match progress.state {
                QueryState::NotYetRun if !progress.running => progress.running = true,
                QueryState::RunDone => {
                    return Err(Error::State("Statement has been fully run already"))
                }
                QueryState::NotYetRun | QueryState::RunMoreDataAvailable | QueryState::Error => {
                    return Err(Error::State("Statement has already been run"))
                }
            }
        }
        let rows = rows_to_fetch.unwrap_or(DEFAULT_ROWS_TO_FETCH);
        let QueryOptions {
            is_cl_command,
            parameters,
            terse,
            ..
        } = &self.inner.options;

        let body = if *is_cl_command {
            RequestBody::Cl {
                terse: *terse,
                cmd: self.inner.sql.clone(),
            }
        } else if let Some(parameters) = parameters {
            RequestBody::PrepareSqlExecute {
                sql: self.inner.sql.clone(),
                terse: *terse,
                rows,
                parameters: parameters.clone(),
            }
        } else {
            RequestBody::Sql {
                sql: self.inner.sql.clone(),
                terse: *terse,
                rows,
            }
        };

        let result = match self.inner.job.send(Request::new(body)).await {
            Ok(response) => response.into_typed::<QueryResult>().map_err(Error::from),
            Err(err) => Err(err),
        };

        let (state, orphaned) = {
            let mut progress = self.inner.progress.lock().unwrap();
            progress.running = false;

            match &result {
                // A close() while we awaited the response has already finished this Query.
                Ok(ran) if progress.state == QueryState::RunDone => (
                    QueryState::RunDone,
                    (ran.success && !ran.is_done).then(|| ran.id.clone()),
                ),
                Ok(ran) => {
                    if !ran.id.is_empty() {
                        progress.cursor = Some(ran.id.clone());
                    }
                    (progress.advance(ran, *is_cl_command), None)
                }
                Err(_) => (progress.state, None),
            }
        };
        let result = result?;
        tracing::debug!(id = %result.id, ?state, rows = result.data.len(), "ran statement");

        if let Some(cont_id) = orphaned {
            if let Err(error) = self.release_cursor(cont_id).await {
                tracing::warn!(sql = %self.inner.sql, %error, "failed to release cursor of closed query");
            }
        }

        if state == QueryState::Error {
            return Err(sql_error(result, "Failed to run query (unknown error)"));
        }
        if result.success && !is_cl_command {
            self.invalidate_created_objects();
        }
        Ok(result)
    }

    /// Fetch up to `rows_to_fetch` further rows of a Query which has been run.
    pub async fn fetch_more(&self, rows_to_fetch: Option<u32>) -> Result<QueryResult> {
        let cursor = {
            let progress = self.inner.progress.lock().unwrap();
            match progress.state {
                QueryState::NotYetRun => return Err(Error::State("Statement has not yet been run")),
                QueryState::RunDone => {
                    return Err(Error::State("Statement has already been fully run"))
                }
                QueryState::Error => return Err(Error::State("Statement has failed")),
                QueryState::RunMoreDataAvailable => progress.cursor.clone(),
            }
        };
        let Some(cont_id) = cursor else {
            return Err(Error::State("Statement has no cursor"));
        };

        let request = Request::new(RequestBody::Sqlmore {
            cont_id,
            sql: self.inner.sql.clone(),
            rows: rows_to_fetch.unwrap_or(DEFAULT_ROWS_TO_FETCH),
        });
        let result: QueryResult = self.inner.job.send(request).await?.into_typed()?;

        let state = self.inner.progress.lock().unwrap().advance(&result, false);
        tracing::debug!(id = %result.id, ?state, rows = result.data.len(), "fetched more rows");

        if state == QueryState::Error {
            return Err(sql_error(result, "Failed to fetch more rows (unknown error)"));
        }
        Ok(result)
    }

    /// Close this Query, releasing its server-side cursor. Valid from any state,
    /// and always leaves the Query RunDone. Only a Query having more rows
    /// holds an open cursor, so any other Query is closed without a request.
    /// A close() during run() leaves that run() to release its cursor.
    pub async fn close(&self) -> Result<()> {
        let cursor = {
            let mut progress = self.inner.progress.lock().unwrap();
            let prior = std::mem::replace(&mut progress.state, QueryState::RunDone);

            if prior == QueryState::RunMoreDataAvailable {
                progress.cursor.clone()
            } else {
                None
            }
        };
        match cursor {
            Some(cont_id) => self.release_cursor(cont_id).await,
            None => Ok(()),
        }
    }

    async fn release_cursor(&self, cont_id: String) -> Result<()> {
        let response = match self
            .inner
            .job
            .send(Request::new(RequestBody::Sqlclose { cont_id }))
            .await
        {
            Ok(response) => response,
            // There's nothing left to close on a job which has ended.
            Err(Error::JobEnded) => return Ok(()),
            Err(err) => return Err(err),
        };

        if response.success {
            return Ok(());
        }
        match response.error {
            // The job ended before answering, taking the cursor with it.
            Some(error) if error == JOB_ENDED_ERROR => Ok(()),
            error => Err(Error::Sql {
                message: error.unwrap_or_else(|| "Failed to close query (unknown error)".to_string()),
                state: None,
                code: None,
            }),
        }
    }

    // Tell the CompletionCache about objects which a CREATE statement may have changed.
    fn invalidate_created_objects(&self) {
        let Some(cache) = &self.inner.job.context().completion_cache else {
            return;
        };
        for (schema, object) in created_objects(&self.inner.sql) {
            tracing::debug!(%schema, %object, "invalidating completions of created object");
            cache.invalidate(&schema, &object);
        }
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("sql", &self.inner.sql)
            .field("state", &self.state())
            .field("cursor", &self.cursor_id())
            .finish()
    }
}

impl Progress {
    fn advance(&mut self, result: &QueryResult, is_cl_command: bool) -> QueryState {
        let next = if !result.success && !is_cl_command {
            QueryState::Error
        } else if result.is_done || !result.success {
            QueryState::RunDone
        } else {
            QueryState::RunMoreDataAvailable
        };

        // A concurrent close() may have already finished this Query.
        if self.state != QueryState::RunDone {
            self.state = next;
        }
        self.state
    }
}

fn sql_error(result: QueryResult, fallback: &str) -> Error {
    Error::Sql {
        message: result.error.unwrap_or_else(|| fallback.to_string()),
        state: result.sql_state,
        code: result.sql_rc,
    }
}

static STRING_LITERAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'(?:[^']|'')*'").unwrap());

static QUALIFIED_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"("[^"]+"|[A-Za-z_$#@][\w$#@]*)\s*[./]\s*("[^"]+"|[A-Za-z_$#@][\w$#@]*)"#)
        .unwrap()
});

/// Schema-qualified object references of a CREATE statement,
/// in either SQL (`schema.object`) or system (`schema/object`) naming.
/// Unquoted names are folded to upper case.
fn created_objects(sql: &str) -> Vec<(String, String)> {
    let is_create = sql
        .trim_start()
        .get(..6)
        .is_some_and(|word| word.eq_ignore_ascii_case("create"));
    if !is_create {
        return Vec::new();
    }
    let sql = STRING_LITERAL_RE.replace_all(sql, "''");

    QUALIFIED_NAME_RE
        .captures_iter(&sql)
        .map(|caps| (fold_name(&caps[1]), fold_name(&caps[2])))
        .collect()
}

fn fold_name(name: &str) -> String {
    match name.strip_prefix('"').and_then(|n| n.strip_suffix('"')) {
        Some(quoted) => quoted.to_string(),
        None => name.to_uppercase(),
    }
}
