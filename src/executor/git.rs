//! Git Executor
//!
//! Runs the git binary against a node's repository directory.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};

use super::{BoxedReader, Invocation, RepositoryExecutor, RunIo};
use crate::error::{Error, Result};

/// Process-backed executor for a git-compatible binary
#[derive(Debug, Clone)]
pub struct GitExecutor {
    binary: PathBuf,
}

impl GitExecutor {
    /// Create an executor invoking `binary`
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self { binary: binary.into() }
    }

    fn spawn(&self, invocation: &Invocation, stdin: bool, stdout: bool) -> Result<Child> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(&invocation.args)
            .current_dir(&invocation.dir)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if stdin { Stdio::piped() } else { Stdio::null() })
            .stdout(if stdout { Stdio::piped() } else { Stdio::null() })
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!("Executing: {}", invocation.description());

        cmd.spawn().map_err(|e| Error::ExecutorFailed {
            description: invocation.description(),
            status: "spawn failure".to_string(),
            stderr: e.to_string(),
        })
    }

    async fn execute(
        &self,
        invocation: Invocation,
        stdin: Option<BoxedReader>,
        stdout: Option<&mut (dyn AsyncWrite + Send + Unpin)>,
    ) -> Result<()> {
        let mut child = self.spawn(&invocation, stdin.is_some(), stdout.is_some())?;

        let driven = drive(&mut child, stdin, stdout);
        let outcome = match invocation.timeout {
            Some(limit) => tokio::time::timeout(limit, driven).await.ok(),
            None => Some(driven.await),
        };
        let (status, stderr, feed) = match outcome {
            Some(result) => result?,
            None => {
                let _ = child.start_kill();
                return Err(Error::ExecutorTimeout {
                    description: invocation.description(),
                    timeout: invocation.timeout.unwrap_or_default(),
                });
            }
        };

        if !status.success() {
            return Err(Error::ExecutorFailed {
                description: invocation.description(),
                status: status.to_string(),
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            });
        }

        // The command may legitimately stop reading early; anything else
        // means it saw a truncated input stream.
        match feed {
            Err(e) if e.kind() != ErrorKind::BrokenPipe => Err(Error::Io(e)),
            _ => Ok(()),
        }
    }
}

/// Pump stdin, stdout and stderr until the child exits
async fn drive(
    child: &mut Child,
    stdin: Option<BoxedReader>,
    stdout: Option<&mut (dyn AsyncWrite + Send + Unpin)>,
) -> Result<(ExitStatus, Vec<u8>, std::io::Result<u64>)> {
    let child_stdin = child.stdin.take();
    let child_stdout = child.stdout.take();
    let child_stderr = child.stderr.take();

    let feed = async move {
        match (stdin, child_stdin) {
            (Some(mut input), Some(mut pipe)) => {
                let copied = tokio::io::copy(&mut input, &mut pipe).await;
                // Dropping the pipe closes the child's stdin.
                drop(pipe);
                copied
            }
            _ => Ok(0),
        }
    };

    let drain = async move {
        match (child_stdout, stdout) {
            (Some(mut pipe), Some(out)) => {
                tokio::io::copy(&mut pipe, &mut *out).await?;
                out.flush().await?;
                Ok::<_, std::io::Error>(())
            }
            _ => Ok(()),
        }
    };

    let collect = async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = child_stderr {
            pipe.read_to_end(&mut buf).await?;
        }
        Ok::<_, std::io::Error>(buf)
    };

    let (feed, drained, stderr) = tokio::join!(feed, drain, collect);
    let status = child.wait().await?;
    if let Err(e) = drained {
        tracing::debug!("stdout consumer went away: {}", e);
    }

    Ok((status, stderr?, feed))
}

#[async_trait]
impl RepositoryExecutor for GitExecutor {
    async fn run(&self, invocation: Invocation, io: RunIo) -> Result<()> {
        let RunIo { stdin, stdout } = io;
        match stdout {
            Some(mut out) => {
                let result = self.execute(invocation, stdin, Some(&mut *out)).await;
                let _ = out.shutdown().await;
                result
            }
            None => self.execute(invocation, stdin, None).await,
        }
    }

    async fn output(&self, invocation: Invocation) -> Result<Vec<u8>> {
        let mut buf: Vec<u8> = Vec::new();
        let sink: &mut (dyn AsyncWrite + Send + Unpin) = &mut buf;
        self.execute(invocation, None, Some(sink)).await?;
        Ok(buf)
    }
}
