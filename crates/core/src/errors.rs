//! Error types for the yarsync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them for callers that want a single
//! error type and an exit code.

use thiserror::Error;

use crate::models::CommitId;

/// Exit code for an operation that is illegal in the current repository state.
pub const EXIT_COMMAND_ERROR: i32 = 7;
/// Exit code for a missing or malformed configuration, or a local I/O failure.
pub const EXIT_CONFIG_ERROR: i32 = 8;
/// Exit code for clock or environment corruption.
pub const EXIT_FATAL_ERROR: i32 = 9;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Fatal(#[from] FatalError),

    /// Local filesystem failure outside the transfer tool.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl CoreError {
    /// Wrap an I/O error with a short description of what was attempted.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Io { .. } => EXIT_CONFIG_ERROR,
            Self::Command(_) => EXIT_COMMAND_ERROR,
            Self::Transfer(e) => e.exit_code,
            Self::Fatal(_) => EXIT_FATAL_ERROR,
        }
    }

    /// Attach "while <doing something>" context to a transfer failure.
    pub fn while_doing(self, context: impl Into<String>) -> Self {
        match self {
            Self::Transfer(mut e) => {
                e.context = Some(context.into());
                Self::Transfer(e)
            }
            other => other,
        }
    }
}

impl From<RsyncError> for CoreError {
    fn from(err: RsyncError) -> Self {
        match err {
            RsyncError::CommandFailed { exit_code, stderr } => Self::Transfer(TransferError {
                exit_code,
                stderr,
                context: None,
            }),
            RsyncError::BinaryNotFound(bin) => Self::Config(ConfigError::InvalidValue {
                field: "rsync".into(),
                detail: format!("transfer tool '{}' not found", bin),
            }),
            RsyncError::IoError(e) => Self::io("failed to run rsync", e),
        }
    }
}

// ---------------------------------------------------------------------------
// Transfer tool errors
// ---------------------------------------------------------------------------

/// Errors from rsync CLI invocations.
#[derive(Debug, Error)]
pub enum RsyncError {
    /// The `rsync` binary was not found on `$PATH`.
    #[error("rsync binary not found: {0}")]
    BinaryNotFound(String),

    /// An `rsync` command exited with a non-zero status.
    #[error("rsync command failed (exit {exit_code}): {stderr}")]
    CommandFailed { exit_code: i32, stderr: String },

    /// Generic I/O wrapper.
    #[error("rsync I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// The external transfer tool returned non-zero. Its code becomes the
/// operation's result.
#[derive(Debug, Error)]
pub struct TransferError {
    pub exit_code: i32,
    /// The tool's own diagnostic output.
    pub stderr: String,
    /// What was being done, e.g. "while pulling from origin".
    pub context: Option<String>,
}

impl std::fmt::Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "an error occurred, rsync returned {}", self.exit_code)?;
        if let Some(ref context) = self.context {
            write!(f, " {}", context)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration discovery, parsing and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No configuration directory in the working directory or its parents.
    #[error("no yarsync configuration directory {0} found")]
    NoConfigDir(String),

    /// A required configuration file is missing.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// Malformed `config.ini`.
    #[error("configuration parse error at line {line}: {detail}")]
    ParseError { line: usize, detail: String },

    /// The replica has no `repo_<name>.txt`, or more than one.
    #[error("replica name not found in {0}; run 'yarsync init <name>'")]
    MissingReplicaName(String),

    /// A peer name is not present in `config.ini`.
    #[error("no remote '{0}' found in configuration")]
    UnknownPeer(String),

    /// A sync ledger file name does not follow `<commit>_<replica>.txt`.
    #[error("invalid synchronization record '{0}'")]
    InvalidLedgerRecord(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },
}

// ---------------------------------------------------------------------------
// Command errors
// ---------------------------------------------------------------------------

/// The repository is structurally valid but the requested operation is illegal
/// in its current state. Every variant names a remedy.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("local repository has uncommitted changes; commit or check out the working tree first")]
    UncommittedChanges,

    #[error("HEAD is detached at commit {0}; check out the newest commit or commit before synchronizing")]
    DetachedHead(CommitId),

    #[error("merge is in progress ({0}); resolve the merge and commit before synchronizing")]
    MergePending(String),

    #[error("destination has commits missing on source: {}; synchronize these commits first or use --force", join_ids(.0))]
    MissingCommits(Vec<CommitId>),

    #[error("remote {0} exists, break")]
    DuplicatePeer(String),

    #[error("remote {0} not found")]
    PeerNotFound(String),

    #[error("commit {0} not found")]
    CommitNotFound(CommitId),

    #[error("neither commit nor log {0} found")]
    NothingToShow(CommitId),

    #[error("histories of this replica and {peer} have diverged; pull --new from it and merge locally first")]
    PushDiverged { peer: String },

    #[error("{peer} has commits this replica lacks; pull from it first")]
    PeerAhead { peer: String },

    #[error("{0} is already a yarsync replica")]
    AlreadyReplica(String),

    #[error("{peer} is not a yarsync replica (no replica name found)")]
    NotAReplica { peer: String },

    #[error("the source replica is already named {0}; choose another name")]
    ReplicaNameTaken(String),

    #[error("invalid replica name '{0}': it must be non-empty and contain no path separators")]
    InvalidReplicaName(String),

    #[error("synchronization requires the configuration directory to be {expected}")]
    DetachedConfigDir { expected: String },
}

fn join_ids(ids: &[CommitId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

// ---------------------------------------------------------------------------
// Fatal errors
// ---------------------------------------------------------------------------

/// Clock or environment corruption. Never retried.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("commit {0} exists")]
    CommitExists(String),

    #[error("temporary commit {0} exists")]
    TemporaryCommitExists(String),
}
