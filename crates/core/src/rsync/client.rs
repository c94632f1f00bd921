//! Asynchronous rsync CLI client.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, instrument, warn};

use super::parser::{parse_listing, ListEntry};
use crate::errors::RsyncError;
use crate::layout::{COMMITS_DIR, CONFIG_DIR_NAME, LOGS_DIR};

/// Captured output of a successful rsync run.
#[derive(Debug, Clone, Default)]
pub struct RsyncOutput {
    pub stdout: String,
    pub stderr: String,
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Include/exclude rules passed to every invocation.
///
/// Snapshot operations (commit, status, checkout, diff) exclude the whole
/// configuration directory. Synchronization carries the commit and log
/// subtrees along with the working tree. The ledger is left out: excluded
/// files are also protected from `--delete-after`, and the peer's ledger is
/// only ever replaced by a separate publish step.
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    merge_file: Option<PathBuf>,
    carry_history: bool,
}

impl FilterSet {
    /// Rules for operations between the working tree and a snapshot.
    pub fn snapshot(merge_file: Option<PathBuf>) -> Self {
        Self {
            merge_file,
            carry_history: false,
        }
    }

    /// Rules for push and pull.
    pub fn synchronization(merge_file: Option<PathBuf>) -> Self {
        Self {
            merge_file,
            carry_history: true,
        }
    }

    /// Use the replica's `rsync-filter` only when it exists.
    pub fn user_filter(path: PathBuf) -> Option<PathBuf> {
        path.is_file().then_some(path)
    }

    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(ref file) = self.merge_file {
            args.push(format!("--filter=merge {}", file.display()));
        }
        if self.carry_history {
            for sub in [COMMITS_DIR, LOGS_DIR] {
                args.push(format!("--include=/{}/{}", CONFIG_DIR_NAME, sub));
            }
            // /* after the includes: only entries directly under the config dir
            args.push(format!("--exclude=/{}/*", CONFIG_DIR_NAME));
        } else {
            args.push(format!("--exclude=/{}", CONFIG_DIR_NAME));
        }
        args
    }
}

// ---------------------------------------------------------------------------
// Argument builder
// ---------------------------------------------------------------------------

/// Builder for one rsync command line.
#[derive(Debug, Clone, Default)]
pub struct RsyncArgs {
    args: Vec<String>,
}

impl RsyncArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flag(mut self, flag: impl Into<String>) -> Self {
        self.args.push(flag.into());
        self
    }

    pub fn flag_if(self, cond: bool, flag: impl Into<String>) -> Self {
        if cond {
            self.flag(flag)
        } else {
            self
        }
    }

    pub fn filters(mut self, filters: &FilterSet) -> Self {
        self.args.extend(filters.to_args());
        self
    }

    /// Source and destination. Callers pass directory sources with their
    /// trailing slash so that contents, not the directory, are copied.
    pub fn endpoints(mut self, source: impl Into<String>, destination: impl Into<String>) -> Self {
        self.args.push(source.into());
        self.args.push(destination.into());
        self
    }

    pub fn as_slice(&self) -> &[String] {
        &self.args
    }

    /// Shell-like rendering for logs and user output.
    pub fn render(&self, binary: &str) -> String {
        let mut out = binary.to_string();
        for arg in &self.args {
            out.push(' ');
            if arg.contains(' ') {
                out.push('\'');
                out.push_str(arg);
                out.push('\'');
            } else {
                out.push_str(arg);
            }
        }
        out
    }
}

/// A directory as an rsync source: its contents, not itself.
pub fn dir_source(path: &Path) -> String {
    let mut s = path.to_string_lossy().into_owned();
    if !s.ends_with('/') {
        s.push('/');
    }
    s
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Runs rsync and maps its exit status.
#[derive(Debug, Clone)]
pub struct RsyncClient {
    binary: String,
}

impl Default for RsyncClient {
    fn default() -> Self {
        Self::new("rsync")
    }
}

impl RsyncClient {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Whether the binary can be executed at all.
    pub async fn is_available(&self) -> bool {
        Command::new(&self.binary)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Run rsync to completion. Any non-zero exit is a failure carrying the
    /// exit code and stderr verbatim.
    #[instrument(skip(self, args), fields(binary = %self.binary))]
    pub async fn run(&self, args: &RsyncArgs) -> Result<RsyncOutput, RsyncError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args.as_slice())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(cmd = %args.render(&self.binary), "running rsync command");
        let output = cmd.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RsyncError::BinaryNotFound(self.binary.clone())
            } else {
                RsyncError::IoError(e)
            }
        })?;

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() {
            let exit_code = output.status.code().unwrap_or(-1);
            warn!(exit_code, %stderr, "rsync command failed");
            return Err(RsyncError::CommandFailed { exit_code, stderr });
        }
        Ok(RsyncOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
        })
    }

    /// List a directory (local or `host:path`) without transferring data.
    #[instrument(skip(self), fields(binary = %self.binary))]
    pub async fn list(&self, location: &str) -> Result<Vec<ListEntry>, RsyncError> {
        let args = RsyncArgs::new().flag("--list-only").flag(location);
        let output = self.run(&args).await?;
        let entries = parse_listing(&output.stdout);
        debug!(location, count = entries.len(), "listed directory");
        Ok(entries)
    }
}
