//! Gitolite reconciliation.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;

const SETUP_SUBCOMMAND: &str = "setup";
const MAX_STDERR: usize = 2048;

/// Error related to the reconciliation command.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("cannot spawn {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot wait for reconciliation: {0}")]
    Wait(#[source] std::io::Error),
    #[error("reconciliation exited with {status}: {stderr}")]
    Exit { status: ExitStatus, stderr: String },
    #[error("reconciliation killed after {0:?}")]
    Timeout(Duration),
}

/// Port triggering a full resync of the keydir.
#[async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(&self) -> Result<(), ReconcileError>;
}

/// External command run to reconcile, `gitolite setup` in production.
#[derive(Debug, Clone)]
pub struct ReconcileCommand {
    program: PathBuf,
    args: Vec<OsString>,
    timeout: Duration,
}

impl ReconcileCommand {
    /// Create a new [`ReconcileCommand`].
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            timeout,
        }
    }

    /// `<bin> setup`.
    pub fn gitolite(bin: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self::new(bin, [SETUP_SUBCOMMAND], timeout)
    }
}

#[async_trait]
impl Reconciler for ReconcileCommand {
    async fn reconcile(&self) -> Result<(), ReconcileError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ReconcileError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        // dropping the future on timeout kills the child.
        let output = timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ReconcileError::Timeout(self.timeout))?
            .map_err(ReconcileError::Wait)?;

        tracing::trace!(
            stdout = %String::from_utf8_lossy(&output.stdout).trim_end(),
            "reconciliation output"
        );

        if output.status.success() {
            Ok(())
        } else {
            let mut stderr = String::from_utf8_lossy(&output.stderr)
                .trim()
                .to_owned();
            if stderr.len() > MAX_STDERR {
                let mut end = MAX_STDERR;
                while !stderr.is_char_boundary(end) {
                    end -= 1;
                }
                stderr.truncate(end);
            }

            Err(ReconcileError::Exit {
                status: output.status,
                stderr,
            })
        }
    }
}

/// Reconciler counting calls, for tests.
#[cfg(test)]
#[derive(Default)]
pub struct CountingReconciler {
    calls: std::sync::atomic::AtomicUsize,
    fail: bool,
    keydir: Option<PathBuf>,
    seen: std::sync::Mutex<Vec<Vec<String>>>,
}

#[cfg(test)]
impl CountingReconciler {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    /// Record the keydir listing on each call.
    pub fn watching(mut self, keydir: impl Into<PathBuf>) -> Self {
        self.keydir = Some(keydir.into());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Keydir listings taken at each call.
    pub fn seen(&self) -> Vec<Vec<String>> {
        self.seen.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl Reconciler for CountingReconciler {
    async fn reconcile(&self) -> Result<(), ReconcileError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);

        if let Some(dir) = &self.keydir {
            let mut names: Vec<String> = std::fs::read_dir(dir)
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            self.seen.lock().unwrap().push(names);
        }

        if self.fail {
            Err(ReconcileError::Timeout(Duration::ZERO))
        } else {
            Ok(())
        }
    }
}
