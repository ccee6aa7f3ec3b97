//! Scripted executor used by unit tests
//!
//! Records every invocation and answers according to simple rules keyed on
//! the repository directory and the leading arguments.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{Invocation, RepositoryExecutor, RunIo};
use crate::error::{Error, Result};

/// One recorded invocation
#[derive(Debug, Clone)]
pub(crate) struct Call {
    pub dir: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: Vec<u8>,
}

impl Call {
    pub fn command(&self) -> String {
        self.args.join(" ")
    }

    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behavior {
    /// Consume stdin, emit a line, then fail
    Fail,
    /// Fail without reading stdin
    FailEarly,
    /// Consume stdin, then wait before answering
    Delay(Duration),
    /// Answer `output` with these bytes
    Respond,
}

#[derive(Debug, Clone)]
struct Rule {
    dir: Option<PathBuf>,
    prefix: String,
    behavior: Behavior,
    bytes: Vec<u8>,
}

impl Rule {
    fn matches(&self, invocation: &Invocation) -> bool {
        self.dir.as_deref().map_or(true, |dir| dir == invocation.dir)
            && invocation.args.join(" ").starts_with(&self.prefix)
    }
}

#[derive(Default)]
pub(crate) struct ScriptedExecutor {
    calls: Mutex<Vec<Call>>,
    rules: Mutex<Vec<Rule>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, dir: Option<&Path>, prefix: &str, behavior: Behavior, bytes: Vec<u8>) {
        self.rules.lock().unwrap().push(Rule {
            dir: dir.map(Path::to_path_buf),
            prefix: prefix.to_string(),
            behavior,
            bytes,
        });
    }

    /// Fail commands starting with `prefix` in `dir` after reading stdin
    pub fn fail(&self, dir: impl AsRef<Path>, prefix: &str) {
        self.push(Some(dir.as_ref()), prefix, Behavior::Fail, Vec::new());
    }

    /// Fail commands starting with `prefix` in `dir` without reading stdin
    pub fn fail_early(&self, dir: impl AsRef<Path>, prefix: &str) {
        self.push(Some(dir.as_ref()), prefix, Behavior::FailEarly, Vec::new());
    }

    /// Hold commands starting with `prefix` in `dir` for `delay`
    pub fn delay(&self, dir: impl AsRef<Path>, prefix: &str, delay: Duration) {
        self.push(Some(dir.as_ref()), prefix, Behavior::Delay(delay), Vec::new());
    }

    /// Answer commands starting with `prefix` (in `dir`, if given) with `bytes`
    pub fn respond(&self, dir: Option<&Path>, prefix: &str, bytes: impl Into<Vec<u8>>) {
        self.push(dir, prefix, Behavior::Respond, bytes.into());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Commands run in `dir`, in order
    pub fn commands_in(&self, dir: impl AsRef<Path>) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.dir == dir.as_ref())
            .map(|call| call.command())
            .collect()
    }

    fn rule_for(&self, invocation: &Invocation) -> Option<Rule> {
        self.rules
            .lock()
            .unwrap()
            .iter()
            .find(|rule| rule.matches(invocation))
            .cloned()
    }

    fn record(&self, invocation: &Invocation, stdin: Vec<u8>) {
        self.calls.lock().unwrap().push(Call {
            dir: invocation.dir.clone(),
            args: invocation.args.clone(),
            env: invocation.env.clone(),
            stdin,
        });
    }

    fn failure(invocation: &Invocation) -> Error {
        Error::ExecutorFailed {
            description: invocation.description(),
            status: "exit status: 1".to_string(),
            stderr: "scripted failure".to_string(),
        }
    }
}

#[async_trait]
impl RepositoryExecutor for ScriptedExecutor {
    async fn run(&self, invocation: Invocation, io: RunIo) -> Result<()> {
        let rule = self.rule_for(&invocation);
        let behavior = rule.as_ref().map(|r| r.behavior);

        if behavior == Some(Behavior::FailEarly) {
            self.record(&invocation, Vec::new());
            return Err(Self::failure(&invocation));
        }

        let mut stdin = Vec::new();
        if let Some(mut input) = io.stdin {
            input.read_to_end(&mut stdin).await?;
        }
        self.record(&invocation, stdin);

        if let Some(Behavior::Delay(delay)) = behavior {
            tokio::time::sleep(delay).await;
        }

        let reply = match &rule {
            Some(rule) if rule.behavior == Behavior::Respond => rule.bytes.clone(),
            Some(rule) if rule.behavior == Behavior::Fail => {
                format!("error {}\n", invocation.dir.display()).into_bytes()
            }
            _ => format!("ok {}\n", invocation.dir.display()).into_bytes(),
        };
        if let Some(mut out) = io.stdout {
            out.write_all(&reply).await?;
            out.shutdown().await?;
        }

        if behavior == Some(Behavior::Fail) {
            return Err(Self::failure(&invocation));
        }
        Ok(())
    }

    async fn output(&self, invocation: Invocation) -> Result<Vec<u8>> {
        self.record(&invocation, Vec::new());
        match self.rule_for(&invocation) {
            Some(rule) => match rule.behavior {
                Behavior::Fail | Behavior::FailEarly => Err(Self::failure(&invocation)),
                Behavior::Delay(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(Vec::new())
                }
                Behavior::Respond => Ok(rule.bytes),
            },
            None => Ok(Vec::new()),
        }
    }
}
