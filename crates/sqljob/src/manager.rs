use crate::{
    CancelPolicy, Error, JobConnection, JobContext, JobStatus, QueryOptions, QueryRegistry,
    Result, SqlRunner, DEFAULT_ROWS_TO_FETCH,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqljob_protocol::JobOptions;
use std::sync::Arc;

/// Configuration of a JobManager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ManagerConfig {
    /// Whether job servers are supported in this environment.
    /// If false, no jobs are created and SQL runs on the ambient runner.
    pub job_support: bool,
    /// Options of newly created jobs.
    pub default_options: JobOptions,
    /// Schema set on the ambient runner before each statement.
    /// Defaults to the first library of `default_options`.
    pub current_schema: Option<String>,
    /// Page size of statements run through the selected job.
    pub rows_to_fetch: u32,
    pub cancel: CancelPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            job_support: true,
            default_options: JobOptions::default(),
            current_schema: None,
            rows_to_fetch: DEFAULT_ROWS_TO_FETCH,
            cancel: CancelPolicy::default(),
        }
    }
}

/// A pooled job and its name.
#[derive(Debug, Clone)]
pub struct NamedJob {
    pub name: String,
    pub job: JobConnection,
}

/// JobManager is a pool of jobs, of which at most one is selected.
/// Newly created jobs become the selection.
pub struct JobManager {
    config: ManagerConfig,
    context: JobContext,
    ambient: Arc<dyn SqlRunner>,
    // Non-async lock which *cannot* be held across an await point.
    pool: std::sync::Mutex<Pool>,
}

#[derive(Default)]
struct Pool {
    jobs: Vec<NamedJob>,
    // Always None or a valid index of `jobs`.
    selected: Option<usize>,
}

impl JobManager {
    pub fn new(config: ManagerConfig, context: JobContext, ambient: Arc<dyn SqlRunner>) -> Self {
        Self {
            config,
            context,
            ambient,
            pool: Default::default(),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn registry(&self) -> &QueryRegistry {
        &self.context.registry
    }

    /// Connect and pool a job, which becomes the selection.
    /// The job is `existing` if provided, and is otherwise created using the
    /// default options. An `existing` job which is already pooled is
    /// selected rather than added again. Returns None if job servers aren't
    /// supported. A failure to connect leaves the pool unchanged.
    pub async fn new_job(&self, existing: Option<JobConnection>) -> Result<Option<NamedJob>> {
        if !self.config.job_support {
            tracing::debug!("job servers are not supported; not creating a job");
            return Ok(None);
        }
        if let Some(job) = &existing {
            if let Some(pooled) = self.select_pooled(job) {
                return Ok(Some(pooled));
            }
        }
        let job = existing.unwrap_or_else(|| {
            JobConnection::new(self.config.default_options.clone(), self.context.clone())
        });

        match job.status() {
            JobStatus::NotStarted => {
                job.connect().await?;
            }
            JobStatus::Ended => return Err(Error::JobEnded),
            JobStatus::Ready | JobStatus::Busy => (),
        }
        let name = job.id().ok_or(Error::NotConnected)?;
        let named = NamedJob { name, job };

        let mut pool = self.pool.lock().unwrap();
        // Another caller may have pooled the same job while we connected it.
        if let Some(index) = pool.jobs.iter().position(|n| n.job.ptr_eq(&named.job)) {
            pool.selected = Some(index);
            return Ok(Some(pool.jobs[index].clone()));
        }
        pool.jobs.push(named.clone());
        pool.selected = Some(pool.jobs.len() - 1);

        tracing::info!(name = %named.name, jobs = pool.jobs.len(), "added job");
        Ok(Some(named))
    }

    /// Close every pooled job, empty the pool, and clear the selection.
    pub async fn end_all(&self) {
        let jobs = {
            let mut pool = self.pool.lock().unwrap();
            pool.selected = None;
            std::mem::take(&mut pool.jobs)
        };
        futures::future::join_all(jobs.iter().map(|named| named.job.close())).await;

        self.context.registry.cleanup().await;
        tracing::debug!(closed = jobs.len(), "ended all jobs");
    }

    /// Close and remove the job at `index` of the pool.
    pub async fn close_job(&self, index: usize) -> Result<NamedJob> {
        let removed = {
            let mut pool = self.pool.lock().unwrap();
            if index >= pool.jobs.len() {
                return Err(Error::NoJobAtIndex(index));
            }
            let removed = pool.jobs.remove(index);
            pool.selected = selection_after_removal(pool.selected, index);
            removed
        };
        removed.job.close().await;

        tracing::debug!(name = %removed.name, index, "closed job");
        Ok(removed)
    }

    /// Close and remove the job named `name`.
    pub async fn close_job_by_name(&self, name: &str) -> Result<NamedJob> {
        let index = self
            .index_of(name)
            .ok_or_else(|| Error::NoSuchJob(name.to_string()))?;
        self.close_job(index).await
    }

    /// Select the job named `name`. If there's no such job,
    /// the selection is cleared and None is returned.
    pub fn set_selection(&self, name: &str) -> Option<NamedJob> {
        let mut pool = self.pool.lock().unwrap();
        pool.selected = pool.jobs.iter().position(|named| named.name == name);
        pool.selected.map(|index| pool.jobs[index].clone())
    }

    pub fn selection(&self) -> Option<NamedJob> {
        let pool = self.pool.lock().unwrap();
        pool.selected.map(|index| pool.jobs[index].clone())
    }

    pub fn selected_index(&self) -> Option<usize> {
        self.pool.lock().unwrap().selected
    }

    pub fn get_job(&self, name: &str) -> Option<NamedJob> {
        self.pool
            .lock()
            .unwrap()
            .jobs
            .iter()
            .find(|named| named.name == name)
            .cloned()
    }

    pub fn jobs(&self) -> Vec<NamedJob> {
        self.pool.lock().unwrap().jobs.clone()
    }

    pub fn len(&self) -> usize {
        self.pool.lock().unwrap().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn select_pooled(&self, job: &JobConnection) -> Option<NamedJob> {
        let mut pool = self.pool.lock().unwrap();
        let index = pool.jobs.iter().position(|named| named.job.ptr_eq(job))?;
        pool.selected = Some(index);
        Some(pool.jobs[index].clone())
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.pool
            .lock()
            .unwrap()
            .jobs
            .iter()
            .position(|named| named.name == name)
    }

    /// Run `statement` and return its first page of rows.
    ///
    /// Statements run through the selected job. If there's none, they run
    /// on the ambient runner instead, preceded by setting its current schema.
    pub async fn run_sql(&self, statement: &str) -> Result<Vec<Value>> {
        if let Some(NamedJob { job, .. }) = self.selection().filter(|_| self.config.job_support) {
            let query = job.query(statement, QueryOptions::default());
            let result = query.run(Some(self.config.rows_to_fetch)).await;

            if let Err(error) = query.close().await {
                tracing::debug!(%error, "failed to close statement");
            }
            return Ok(result?.data);
        }

        let schema = self
            .config
            .current_schema
            .as_deref()
            .or(self.config.default_options.default_schema());

        if let Some(schema) = schema {
            self.ambient
                .run_sql(&format!("SET CURRENT SCHEMA = {}", schema.to_uppercase()))
                .await
                .map_err(Error::Runner)?;
        }
        self.ambient.run_sql(statement).await.map_err(Error::Runner)
    }

    /// Cancel the running statement of the job named `name`, using `admin`
    /// to issue the cancellation. Returns whether it was observed to stop.
    pub async fn cancel_job(&self, name: &str, admin: &dyn SqlRunner) -> Result<bool> {
        let named = self
            .get_job(name)
            .ok_or_else(|| Error::NoSuchJob(name.to_string()))?;
        Ok(named.job.request_cancel(admin, &self.config.cancel).await)
    }
}

fn selection_after_removal(selected: Option<usize>, removed: usize) -> Option<usize> {
    match selected {
        Some(index) if index == removed => None,
        Some(index) if removed < index => Some(index - 1),
        other => other,
    }
}
