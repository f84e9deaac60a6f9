use crate::{JobConnection, SqlRunner};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// CancelPolicy bounds how long a cancellation waits for the
/// cancelled statement to stop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CancelPolicy {
    /// Delay between polls of the job's statement status.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Number of status polls before giving up.
    pub max_polls: u32,
}

impl Default for CancelPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            max_polls: 10,
        }
    }
}

impl JobConnection {
    /// Request cancellation of the statement which is running in this job.
    ///
    /// The job's own channel is blocked by the statement, so the cancel
    /// is issued through `admin`, a different and idle connection. Returns
    /// whether the statement was observed to stop within the `policy`.
    pub async fn request_cancel(&self, admin: &dyn SqlRunner, policy: &CancelPolicy) -> bool {
        let Some(job) = self.id() else {
            tracing::debug!("cannot cancel a job which hasn't connected");
            return false;
        };

        if let Err(error) = admin
            .run_sql(&format!("CALL QSYS2.CANCEL_SQL('{job}')"))
            .await
        {
            tracing::warn!(%job, ?error, "failed to request statement cancellation");
            return false;
        }

        let status_sql = format!(
            "SELECT V_SQL_STMT_STATUS AS STATUS FROM TABLE(QSYS2.GET_JOB_INFO('{job}'))"
        );

        for poll in 1..=policy.max_polls {
            let rows = match admin.run_sql(&status_sql).await {
                Ok(rows) => rows,
                Err(error) => {
                    tracing::warn!(%job, ?error, "failed to poll statement status");
                    return false;
                }
            };

            #[derive(Deserialize, Debug)]
            #[serde(rename_all = "UPPERCASE")]
            struct StatusRow {
                status: Option<String>,
            }
            let status = rows
                .into_iter()
                .next()
                .and_then(|row| serde_json::from_value::<StatusRow>(row).ok())
                .and_then(|row| row.status);

            tracing::trace!(%job, poll, ?status, "polled statement status");

            if status.as_deref() != Some("ACTIVE") {
                tracing::debug!(%job, poll, "statement cancelled");
                return true;
            }
            if poll != policy.max_polls {
                tokio::time::sleep(policy.poll_interval).await;
            }
        }

        tracing::debug!(%job, max_polls = policy.max_polls, "statement is still active");
        false
    }
}
