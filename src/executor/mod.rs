//! Repository Executor Module
//!
//! Runs storage-engine operations against a single node's repository.

mod git;
#[cfg(test)]
pub(crate) mod scripted;

use std::path::{Path, PathBuf};
use std::time::Duration;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Error, Result};

pub use git::GitExecutor;

/// Owned byte source handed to an executor as stdin
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// Owned byte sink handed to an executor as stdout/stderr
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One executor invocation against a repository directory
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    /// Working directory (the node's repository)
    pub dir: PathBuf,
    /// Arguments passed to the storage engine
    pub args: Vec<String>,
    /// Environment entries added on top of the inherited environment
    pub env: Vec<(String, String)>,
    /// Abort the invocation after this long
    pub timeout: Option<Duration>,
}

impl Invocation {
    /// Start building an invocation in `dir`
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    /// Append a trusted argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several trusted arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Append a caller-supplied argument that must not read as an option
    pub fn checked_arg(self, arg: impl AsRef<str>) -> Result<Self> {
        let arg = arg.as_ref();
        if arg.starts_with('-') {
            return Err(Error::UnsafeArgument(arg.to_string()));
        }
        Ok(self.arg(arg))
    }

    /// Add environment entries
    pub fn envs<I, K, V>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env.extend(env.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Bound the invocation's run time
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Human readable description used in logs and errors
    pub fn description(&self) -> String {
        format!("{} [repo_path: {}]", self.args.join(" "), self.dir.display())
    }
}

/// Stream redirection for a streaming invocation
#[derive(Default)]
pub struct RunIo {
    pub stdin: Option<BoxedReader>,
    pub stdout: Option<BoxedWriter>,
}

impl RunIo {
    pub fn new(stdin: BoxedReader, stdout: BoxedWriter) -> Self {
        Self {
            stdin: Some(stdin),
            stdout: Some(stdout),
        }
    }
}

/// Executes storage-engine commands against one node's directory
#[async_trait]
pub trait RepositoryExecutor: Send + Sync {
    /// Run with streamed stdin/stdout; resolves once the command has exited
    async fn run(&self, invocation: Invocation, io: RunIo) -> Result<()>;

    /// Run without input and return everything written to stdout
    async fn output(&self, invocation: Invocation) -> Result<Vec<u8>>;
}
