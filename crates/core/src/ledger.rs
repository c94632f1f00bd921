//! The synchronization ledger.
//!
//! Each replica keeps zero-byte files `sync/<commit>_<replica>.txt`. Their
//! names alone say "this replica holds everything up to `<commit>`". Only
//! the highest commit per replica counts; [`SyncLedger::write`] removes the
//! superseded files so the directory holds one record per replica.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::errors::{ConfigError, CoreError};
use crate::models::{parse_commit_id, CommitId};

/// High-water marks keyed by replica name.
pub type LedgerMarks = BTreeMap<String, CommitId>;

/// `<commit>_<replica>.txt`
pub fn record_name(id: CommitId, replica: &str) -> String {
    format!("{}_{}.txt", id, replica)
}

/// Split a record file name on its first underscore. Replica names may
/// themselves contain underscores.
pub fn parse_record_name(name: &str) -> Result<(CommitId, String), ConfigError> {
    let invalid = || ConfigError::InvalidLedgerRecord(name.to_string());
    let stem = name.strip_suffix(".txt").ok_or_else(invalid)?;
    let (id, replica) = stem.split_once('_').ok_or_else(invalid)?;
    let id = parse_commit_id(id).ok_or_else(invalid)?;
    if replica.is_empty() {
        return Err(invalid());
    }
    Ok((id, replica.to_string()))
}

/// Fold record names into high-water marks. Hidden files (rsync's partial
/// transfers) are skipped.
pub fn fold_records<'n>(
    names: impl IntoIterator<Item = &'n str>,
) -> Result<LedgerMarks, ConfigError> {
    let mut marks = LedgerMarks::new();
    for name in names {
        if name.starts_with('.') {
            continue;
        }
        let (id, replica) = parse_record_name(name)?;
        let mark = marks.entry(replica).or_insert(id);
        *mark = (*mark).max(id);
    }
    Ok(marks)
}

/// One replica's view of who holds which commit.
#[derive(Debug, Clone)]
pub struct SyncLedger {
    dir: PathBuf,
    marks: LedgerMarks,
}

impl SyncLedger {
    /// Read every record under `dir`. A missing directory is an empty ledger.
    pub fn load(dir: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let dir = dir.into();
        let names = record_files(&dir)?;
        let marks = fold_records(names.iter().map(String::as_str))?;
        debug!(dir = %dir.display(), replicas = marks.len(), "loaded sync ledger");
        Ok(Self { dir, marks })
    }

    pub fn from_marks(dir: impl Into<PathBuf>, marks: LedgerMarks) -> Self {
        Self {
            dir: dir.into(),
            marks,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn marks(&self) -> &LedgerMarks {
        &self.marks
    }

    pub fn get(&self, replica: &str) -> Option<CommitId> {
        self.marks.get(replica).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }

    /// Adopt every incoming mark that is new or higher. Lower marks are
    /// discarded, so no mark ever decreases. Returns how many marks changed.
    pub fn merge(&mut self, other: &LedgerMarks) -> usize {
        other
            .iter()
            .filter(|(replica, id)| self.record(replica, **id))
            .count()
    }

    /// Raise the mark of one replica. Returns whether it changed.
    pub fn record(&mut self, replica: &str, id: CommitId) -> bool {
        match self.marks.get_mut(replica) {
            Some(mark) if *mark >= id => false,
            Some(mark) => {
                debug!(replica, from = *mark, to = id, "advanced ledger mark");
                *mark = id;
                true
            }
            None => {
                debug!(replica, id, "new ledger mark");
                self.marks.insert(replica.to_string(), id);
                true
            }
        }
    }

    /// Replicas whose mark is exactly `id`.
    pub fn repos_at(&self, id: CommitId) -> Vec<&str> {
        self.marks
            .iter()
            .filter(|(_, mark)| **mark == id)
            .map(|(replica, _)| replica.as_str())
            .collect()
    }

    /// Replica names grouped by their mark.
    pub fn by_commits(&self) -> BTreeMap<CommitId, Vec<&str>> {
        let mut grouped: BTreeMap<CommitId, Vec<&str>> = BTreeMap::new();
        for (replica, id) in &self.marks {
            grouped.entry(*id).or_default().push(replica.as_str());
        }
        grouped
    }

    /// File names that represent this ledger on disk.
    pub fn record_names(&self) -> BTreeSet<String> {
        self.marks
            .iter()
            .map(|(replica, id)| record_name(*id, replica))
            .collect()
    }

    /// Make the directory hold exactly [`Self::record_names`]: create missing
    /// records and retire superseded ones. Returns the number of files
    /// created or removed, so a repeated write returns 0.
    pub fn write(&self) -> Result<usize, CoreError> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| CoreError::io(format!("could not create {}", self.dir.display()), e))?;

        let wanted = self.record_names();
        let present: BTreeSet<String> = record_files(&self.dir)?.into_iter().collect();
        let mut ops = 0;

        for name in present.difference(&wanted) {
            if name.starts_with('.') || parse_record_name(name).is_err() {
                warn!(file = %name, "leaving unrecognized file in ledger directory");
                continue;
            }
            let path = self.dir.join(name);
            std::fs::remove_file(&path)
                .map_err(|e| CoreError::io(format!("could not remove {}", path.display()), e))?;
            ops += 1;
        }
        for name in wanted.difference(&present) {
            let path = self.dir.join(name);
            std::fs::write(&path, "")
                .map_err(|e| CoreError::io(format!("could not write {}", path.display()), e))?;
            ops += 1;
        }

        if ops > 0 {
            info!(dir = %self.dir.display(), ops, "updated sync ledger");
        }
        Ok(ops)
    }
}

fn record_files(dir: &Path) -> Result<Vec<String>, CoreError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(CoreError::io(format!("could not list {}", dir.display()), e)),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry =
            entry.map_err(|e| CoreError::io(format!("could not list {}", dir.display()), e))?;
        if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(names)
}
