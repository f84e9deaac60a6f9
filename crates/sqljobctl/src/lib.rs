use anyhow::Context;
use sqljob::protocol::{JobOptions, Naming};
use sqljob::{
    CommandSpawner, JobContext, JobManager, ManagerConfig, QueryOptions, SqlRunner,
    DEFAULT_ROWS_TO_FETCH,
};
use std::io::Write;
use std::sync::Arc;

/// Run SQL statements in a job of a remote job server.
///
/// Rows of each statement are written to stdout as newline-delimited JSON.
#[derive(Debug, clap::Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Command which starts a job server with piped stdio,
    /// such as `ssh my-host java -jar server.jar`.
    #[arg(long, env = "SQLJOB_SERVER", value_delimiter = ' ', required = true)]
    pub server: Vec<String>,
    /// Library list of the job. The first library is its default schema.
    #[arg(long = "library", env = "SQLJOB_LIBRARIES", value_delimiter = ',')]
    pub libraries: Vec<String>,
    /// Naming convention of object references.
    #[arg(long, value_enum, env = "SQLJOB_NAMING")]
    pub naming: Option<NamingArg>,
    /// Number of rows to fetch in each page.
    #[arg(long, default_value_t = DEFAULT_ROWS_TO_FETCH)]
    pub rows: u32,
    /// Fetch every page of each statement, rather than only the first.
    #[arg(long)]
    pub all: bool,
    /// Write rows as arrays rather than column-keyed objects.
    #[arg(long)]
    pub terse: bool,
    /// Run statements as CL commands.
    #[arg(long)]
    pub cl: bool,
    /// Log as JSON rather than text.
    #[arg(long)]
    pub log_json: bool,
    /// Statements to run, in order.
    #[arg(required = true)]
    pub statements: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum NamingArg {
    System,
    Sql,
}

impl Cli {
    pub fn job_options(&self) -> JobOptions {
        JobOptions {
            naming: self.naming.map(|naming| match naming {
                NamingArg::System => Naming::System,
                NamingArg::Sql => Naming::Sql,
            }),
            libraries: (!self.libraries.is_empty()).then(|| self.libraries.clone()),
            ..Default::default()
        }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let spawner = CommandSpawner::new(&self.server)?;
        let config = ManagerConfig {
            default_options: self.job_options(),
            rows_to_fetch: self.rows,
            ..Default::default()
        };
        let manager = JobManager::new(
            config,
            JobContext::new(Arc::new(spawner)),
            Arc::new(NoAmbientConnection),
        );

        let named = manager
            .new_job(None)
            .await
            .context("starting job")?
            .context("job servers are not supported")?;
        tracing::info!(job = %named.name, "started job");

        let result = self.run_statements(&named.job).await;
        manager.end_all().await;
        result
    }

    async fn run_statements(&self, job: &sqljob::JobConnection) -> anyhow::Result<()> {
        for statement in &self.statements {
            let query = job.query(
                statement.as_str(),
                QueryOptions {
                    is_cl_command: self.cl,
                    terse: self.terse,
                    ..Default::default()
                },
            );

            let mut page = query
                .run(Some(self.rows))
                .await
                .with_context(|| format!("running {statement:?}"))?;

            loop {
                if !page.success {
                    anyhow::bail!(
                        "{statement:?} failed: {}",
                        page.error.as_deref().unwrap_or("unknown error")
                    );
                }
                let mut buf = Vec::new();
                for row in &page.data {
                    serde_json::to_writer(&mut buf, row)?;
                    buf.push(b'\n');
                }
                std::io::stdout().write_all(&buf)?;

                if page.is_done || !self.all {
                    break;
                }
                page = query
                    .fetch_more(Some(self.rows))
                    .await
                    .with_context(|| format!("fetching more rows of {statement:?}"))?;
            }
            std::io::stdout().flush()?;
            query.close().await?;
        }
        Ok(())
    }
}

// sqljobctl runs all statements in its job, and has no other connection.
struct NoAmbientConnection;

#[async_trait::async_trait]
impl SqlRunner for NoAmbientConnection {
    async fn run_sql(&self, _statement: &str) -> anyhow::Result<Vec<serde_json::Value>> {
        anyhow::bail!("sqljobctl has no connection outside of its job")
    }
}
