use crate::query::WeakQuery;
use crate::{JobStatus, Query, QueryState};
use std::sync::Arc;

/// QueryRegistry indexes every Query of the jobs which share it.
///
/// It's a back-reference index, not an owner: it holds weak references
/// which don't keep a Query (or its job) alive. Queries are added as they're
/// constructed, and are evicted by cleanup() once they're finished or dropped.
#[derive(Clone, Default)]
pub struct QueryRegistry {
    // Non-async lock which *cannot* be held across an await point.
    queries: Arc<std::sync::Mutex<Vec<WeakQuery>>>,
}

impl QueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, query: &Query) {
        let mut queries = self.queries.lock().unwrap();
        queries.retain(|q| !q.is_dropped());
        queries.push(query.downgrade());
    }

    /// Remove `query`, returning whether it was present.
    pub fn remove(&self, query: &Query) -> bool {
        let mut queries = self.queries.lock().unwrap();
        let present = queries.iter().any(|q| q.refers_to(query));
        queries.retain(|q| !q.is_dropped() && !q.refers_to(query));
        present
    }

    /// Number of registered Queries which haven't been dropped.
    pub fn len(&self) -> usize {
        self.queries
            .lock()
            .unwrap()
            .iter()
            .filter(|q| !q.is_dropped())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find the Query of any job having cursor `cursor_id`
    /// and which has more rows to fetch.
    pub fn find(&self, cursor_id: &str) -> Option<Query> {
        self.find_where(|query| query.cursor_id().as_deref() == Some(cursor_id))
    }

    /// Find the Query of the job `job_id` having cursor `cursor_id`
    /// and which has more rows to fetch.
    pub fn find_in_job(&self, job_id: &str, cursor_id: &str) -> Option<Query> {
        self.find_where(|query| {
            query.cursor_id().as_deref() == Some(cursor_id)
                && query.job().id().as_deref() == Some(job_id)
        })
    }

    fn find_where(&self, predicate: impl Fn(&Query) -> bool) -> Option<Query> {
        self.queries
            .lock()
            .unwrap()
            .iter()
            .filter_map(WeakQuery::upgrade)
            .find(|query| query.state() == QueryState::RunMoreDataAvailable && predicate(query))
    }

    /// Close every auto-closed Query, and then evict every Query which is
    /// done, dropped, or whose job has ended. Queries which are still in use
    /// are left alone. Returns the number of evicted Queries.
    pub async fn cleanup(&self) -> usize {
        let auto_close: Vec<Query> = self
            .queries
            .lock()
            .unwrap()
            .iter()
            .filter_map(WeakQuery::upgrade)
            .filter(|query| query.auto_close() && query.state() != QueryState::RunDone)
            .collect();

        let closed = futures::future::join_all(auto_close.iter().map(|query| async move {
            if let Err(error) = query.close().await {
                tracing::warn!(sql = query.sql(), %error, "failed to auto-close query");
            }
        }));
        closed.await;

        let mut queries = self.queries.lock().unwrap();
        let before = queries.len();

        queries.retain(|query| {
            query.upgrade().is_some_and(|query| {
                query.state() != QueryState::RunDone && query.job().status() != JobStatus::Ended
            })
        });
        let evicted = before - queries.len();

        if evicted != 0 {
            tracing::debug!(evicted, remaining = queries.len(), "swept finished queries");
        }
        evicted
    }

    /// Spawn a task which runs cleanup() every `interval`.
    /// The task stops when its JoinHandle is aborted.
    pub fn spawn_sweeper(&self, interval: std::time::Duration) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // First tick is immediate.

            loop {
                ticker.tick().await;
                registry.cleanup().await;
            }
        })
    }
}
