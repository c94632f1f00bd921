//! Paths inside a replica's configuration directory.

use std::path::{Path, PathBuf};

use crate::models::CommitId;

/// Conventional name of the configuration directory under the replica root.
pub const CONFIG_DIR_NAME: &str = ".ys";

pub const COMMITS_DIR: &str = "commits";
pub const LOGS_DIR: &str = "logs";
pub const SYNC_DIR: &str = "sync";
pub const HEAD_FILE: &str = "HEAD.txt";
pub const MERGE_FILE: &str = "MERGE.txt";
pub const COMMIT_LIMIT_FILE: &str = "COMMIT_LIMIT.txt";
pub const CONFIG_FILE: &str = "config.ini";
pub const FILTER_FILE: &str = "rsync-filter";
pub const REPO_FILE_PREFIX: &str = "repo_";

/// Suffix of a commit directory while it is being built.
pub const TMP_SUFFIX: &str = "_tmp";

/// Resolves every well-known file of one configuration directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigLayout {
    dir: PathBuf,
}

impl ConfigLayout {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn commits_dir(&self) -> PathBuf {
        self.dir.join(COMMITS_DIR)
    }

    pub fn commit_dir(&self, id: CommitId) -> PathBuf {
        self.commits_dir().join(id.to_string())
    }

    pub fn tmp_commit_dir(&self, id: CommitId) -> PathBuf {
        self.commits_dir().join(format!("{}{}", id, TMP_SUFFIX))
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.dir.join(LOGS_DIR)
    }

    pub fn log_file(&self, id: CommitId) -> PathBuf {
        self.logs_dir().join(format!("{}.txt", id))
    }

    pub fn sync_dir(&self) -> PathBuf {
        self.dir.join(SYNC_DIR)
    }

    pub fn head_file(&self) -> PathBuf {
        self.dir.join(HEAD_FILE)
    }

    pub fn merge_file(&self) -> PathBuf {
        self.dir.join(MERGE_FILE)
    }

    pub fn commit_limit_file(&self) -> PathBuf {
        self.dir.join(COMMIT_LIMIT_FILE)
    }

    pub fn config_file(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE)
    }

    pub fn filter_file(&self) -> PathBuf {
        self.dir.join(FILTER_FILE)
    }

    pub fn repo_file(&self, name: &str) -> PathBuf {
        self.dir.join(repo_file_name(name))
    }
}

/// `repo_<name>.txt`
pub fn repo_file_name(name: &str) -> String {
    format!("{}{}.txt", REPO_FILE_PREFIX, name)
}

/// Extract the replica name from a `repo_<name>.txt` file name.
pub fn replica_name_from_file(file_name: &str) -> Option<&str> {
    file_name
        .strip_prefix(REPO_FILE_PREFIX)?
        .strip_suffix(".txt")
        .filter(|name| !name.is_empty())
}

/// Remove a file, treating its absence as success. Returns whether a file
/// was removed.
pub(crate) fn remove_if_exists(path: &Path) -> std::io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
