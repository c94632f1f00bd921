//! Domain model types shared by the commit store, ledger and coordinator.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::errors::ConfigError;

/// A commit is identified by the wall-clock second it was created at.
pub type CommitId = i64;

/// Ordered set of commit ids. Iteration is ascending, so the newest commit is
/// `last()`.
pub type CommitSet = BTreeSet<CommitId>;

/// Parse a directory or file stem as a commit id.
///
/// Only names made of ASCII digits qualify, so `"01"` is a commit and
/// `"2_tmp"` or `"-1"` are not.
pub fn parse_commit_id(name: &str) -> Option<CommitId> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

// ---------------------------------------------------------------------------
// Commit/log pairing
// ---------------------------------------------------------------------------

/// One row of the history: a commit, its log, or both.
///
/// A commit may exist without its log and a log without its commit; both
/// are partial states that are listed rather than rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryEntry {
    pub commit: Option<CommitId>,
    pub log: Option<CommitId>,
}

impl HistoryEntry {
    /// The id this row is keyed by.
    pub fn id(&self) -> CommitId {
        // One of the two is always present.
        self.commit.or(self.log).unwrap_or_default()
    }
}

/// Merge sorted commit and log ids into one ascending list.
pub fn merge_history(commits: &CommitSet, logs: &CommitSet) -> Vec<HistoryEntry> {
    let ids: BTreeSet<CommitId> = commits.union(logs).copied().collect();
    ids.into_iter()
        .map(|id| HistoryEntry {
            commit: commits.contains(&id).then_some(id),
            log: logs.contains(&id).then_some(id),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Merge marker
// ---------------------------------------------------------------------------

/// A detected divergence awaiting a manual merge commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeMarker {
    pub local_head: CommitId,
    pub peer_head: CommitId,
    /// Most recent commit present on both sides.
    pub common: Option<CommitId>,
}

impl fmt::Display for MergeMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.common {
            Some(common) => write!(f, "{},{},{}", self.local_head, self.peer_head, common),
            None => write!(f, "{},{},none", self.local_head, self.peer_head),
        }
    }
}

impl FromStr for MergeMarker {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidValue {
            field: "MERGE.txt".into(),
            detail: format!("expected 'local,peer,common', found '{}'", s.trim()),
        };
        let mut parts = s.trim().split(',');
        let local_head = parts.next().and_then(parse_commit_id).ok_or_else(invalid)?;
        let peer_head = parts.next().and_then(parse_commit_id).ok_or_else(invalid)?;
        let common = match parts.next().map(str::trim) {
            Some(c) if c.eq_ignore_ascii_case("none") => None,
            Some(c) => Some(parse_commit_id(c).ok_or_else(invalid)?),
            None => return Err(invalid()),
        };
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self {
            local_head,
            peer_head,
            common,
        })
    }
}

impl MergeMarker {
    /// The lineage line recorded in the log of the commit that resolves it.
    pub fn lineage(&self) -> String {
        match self.common {
            Some(common) => format!(
                "Merge: {} and {} (common commit {})",
                self.local_head, self.peer_head, common
            ),
            None => format!(
                "Merge: {} and {} (no common commits)",
                self.local_head, self.peer_head
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commit_id() {
        assert_eq!(parse_commit_id("1"), Some(1));
        assert_eq!(parse_commit_id("01"), Some(1));
        assert_eq!(parse_commit_id("abc"), None);
        assert_eq!(parse_commit_id("2_tmp"), None);
        assert_eq!(parse_commit_id("-1"), None);
        assert_eq!(parse_commit_id(""), None);
    }

    #[test]
    fn test_merge_history() {
        let commits: CommitSet = [1, 3].into_iter().collect();
        let logs: CommitSet = [2, 3].into_iter().collect();
        let history = merge_history(&commits, &logs);
        assert_eq!(
            history,
            vec![
                HistoryEntry { commit: Some(1), log: None },
                HistoryEntry { commit: None, log: Some(2) },
                HistoryEntry { commit: Some(3), log: Some(3) },
            ]
        );
        assert_eq!(history[1].id(), 2);
    }

    #[test]
    fn test_merge_marker_format() {
        let marker = MergeMarker {
            local_head: 5,
            peer_head: 7,
            common: Some(2),
        };
        assert_eq!(marker.to_string(), "5,7,2");
        assert_eq!("5,7,2\n".parse::<MergeMarker>().unwrap(), marker);

        let orphan: MergeMarker = "5,7,none".parse().unwrap();
        assert_eq!(orphan.common, None);
        assert_eq!(orphan.to_string(), "5,7,none");
        assert!("5,7,None".parse::<MergeMarker>().is_ok());
    }

    #[test]
    fn test_merge_marker_rejects_garbage() {
        assert!("5,7".parse::<MergeMarker>().is_err());
        assert!("a,7,2".parse::<MergeMarker>().is_err());
        assert!("5,7,2,9".parse::<MergeMarker>().is_err());
    }
}
