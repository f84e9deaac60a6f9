use anyhow::Context;
use shared_child::SharedChild;
#[cfg(unix)]
use std::os::fd::OwnedFd as OwnedPipe;
#[cfg(windows)]
use std::os::windows::io::OwnedHandle as OwnedPipe;
use std::process::{Command, Stdio};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite};

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Transport is an ordered, duplex byte stream to a job server.
pub struct Transport {
    /// Output of the job server.
    pub reader: BoxReader,
    /// Input of the job server.
    pub writer: BoxWriter,
    /// Opaque resource which keeps the job server alive until dropped.
    pub guard: Option<Box<dyn std::any::Any + Send + Sync>>,
}

/// Spawner starts a job server and returns a Transport to it.
#[async_trait::async_trait]
pub trait Spawner: Send + Sync {
    async fn spawn(&self) -> anyhow::Result<Transport>;
}

/// CommandSpawner starts a job server as a local program with piped stdio,
/// for example `ssh my-host java -jar server.jar`. The program's stderr is
/// forwarded to logs, and it's sent SIGTERM when its Transport is dropped.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    argv: Vec<String>,
    envs: Vec<(String, String)>,
}

impl CommandSpawner {
    /// Build a CommandSpawner from `argv`, a program followed by its arguments.
    pub fn new<S: AsRef<str>>(argv: &[S]) -> anyhow::Result<Self> {
        let argv: Vec<String> = argv.iter().map(|s| s.as_ref().to_string()).collect();
        if argv.is_empty() {
            anyhow::bail!("job server command cannot be empty");
        }
        Ok(Self {
            argv,
            envs: Vec::new(),
        })
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

#[async_trait::async_trait]
impl Spawner for CommandSpawner {
    async fn spawn(&self) -> anyhow::Result<Transport> {
        let (program, args) = self
            .argv
            .split_first()
            .context("job server command cannot be empty")?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("running command {:?}", self.argv))?;

        let writer = adopt_pipe(child.stdin.take())?;
        let reader = adopt_pipe(child.stdout.take())?;
        let stderr = adopt_pipe(child.stderr.take())?;

        let process = ServerProcess {
            child: Arc::new(SharedChild::new(child)?),
        };
        let pid = process.child.id();
        tokio::spawn(forward_stderr(pid, stderr));
        tracing::debug!(%pid, argv = ?self.argv, "started job server");

        Ok(Transport {
            reader: Box::new(reader),
            writer: Box::new(writer),
            guard: Some(Box::new(process)),
        })
    }
}

/// How long a dropped job server has to exit after SIGTERM
/// before we log that it's stuck.
const EXIT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);

// Guard of a running job server process, which is sent SIGTERM on drop.
struct ServerProcess {
    child: Arc<SharedChild>,
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }

        #[cfg(unix)]
        {
            use shared_child::unix::SharedChildExt;

            if let Err(error) = self.child.send_signal(libc::SIGTERM) {
                tracing::warn!(pid = self.child.id(), %error, "failed to signal job server");
            }
        }

        // Without a runtime we can't observe the exit, and the OS reaps it.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(await_exit(self.child.clone()));
        }
    }
}

async fn await_exit(child: Arc<SharedChild>) {
    let pid = child.id();
    let wait = tokio::task::spawn_blocking(move || child.wait());

    match tokio::time::timeout(EXIT_TIMEOUT, wait).await {
        Ok(Ok(Ok(status))) => tracing::debug!(%pid, %status, "dropped job server exited"),
        Ok(Ok(Err(error))) => tracing::warn!(%pid, %error, "failed to wait for dropped job server"),
        Ok(Err(error)) => tracing::warn!(%pid, %error, "wait task of dropped job server failed"),
        Err(_) => tracing::error!(%pid, "dropped job server is not exiting"),
    }
}

// Pipes of a std Child are blocking file descriptors,
// which tokio can drive as Files.
fn adopt_pipe<P: Into<OwnedPipe>>(pipe: Option<P>) -> anyhow::Result<tokio::fs::File> {
    let pipe = pipe.context("job server stdio must be piped")?;
    let file = std::fs::File::from(pipe.into());
    Ok(tokio::fs::File::from_std(file))
}

// Forward lines of the job server's stderr into our own logs.
async fn forward_stderr(pid: u32, stderr: tokio::fs::File) {
    let mut lines = tokio::io::BufReader::new(stderr).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                tracing::debug!(%pid, line = line.trim_end(), "job server stderr");
            }
            Ok(None) => break,
            Err(error) => {
                tracing::warn!(%pid, %error, "failed to read job server stderr");
                break;
            }
        }
    }
}
