//! Fast-forward versus divergence decisions, and the persisted merge marker.

use tracing::{debug, info};

use crate::errors::{CommandError, CoreError};
use crate::layout::{self, ConfigLayout};
use crate::models::{CommitId, CommitSet, MergeMarker};

/// Which replica lags behind in a fast-forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Local,
    Peer,
}

/// Relation between two commit histories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// Both sides have the same newest commit (or no commits at all).
    UpToDate { newest: Option<CommitId> },
    /// One history is a prefix of the other. Checking out `newest` on the
    /// lagging side is enough.
    FastForward { behind: Side, newest: CommitId },
    /// Neither side contains the other's newest commit.
    Diverged(MergeMarker),
}

impl Reconciliation {
    pub fn is_diverged(&self) -> bool {
        matches!(self, Self::Diverged(_))
    }
}

/// Compares a local and a peer history.
#[derive(Debug, Clone, Copy, Default)]
pub struct DivergenceDetector;

impl DivergenceDetector {
    pub fn new() -> Self {
        Self
    }

    pub fn detect(&self, local: &CommitSet, peer: &CommitSet) -> Reconciliation {
        let result = match (local.last().copied(), peer.last().copied()) {
            (None, None) => Reconciliation::UpToDate { newest: None },
            (Some(l), None) => Reconciliation::FastForward {
                behind: Side::Peer,
                newest: l,
            },
            (None, Some(p)) => Reconciliation::FastForward {
                behind: Side::Local,
                newest: p,
            },
            (Some(l), Some(p)) if l == p => Reconciliation::UpToDate { newest: Some(l) },
            (Some(l), Some(p)) if local.contains(&p) => Reconciliation::FastForward {
                behind: Side::Peer,
                newest: l,
            },
            (Some(l), Some(p)) if peer.contains(&l) => Reconciliation::FastForward {
                behind: Side::Local,
                newest: p,
            },
            (Some(l), Some(p)) => Reconciliation::Diverged(MergeMarker {
                local_head: l,
                peer_head: p,
                common: local.intersection(peer).last().copied(),
            }),
        };
        debug!(?result, "compared histories");
        result
    }
}

// ---------------------------------------------------------------------------
// MERGE.txt
// ---------------------------------------------------------------------------

/// Read the pending merge marker, if any.
pub fn read_merge_marker(layout: &ConfigLayout) -> Result<Option<MergeMarker>, CoreError> {
    let path = layout.merge_file();
    match std::fs::read_to_string(&path) {
        Ok(text) => Ok(Some(text.parse()?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CoreError::io(format!("could not read {}", path.display()), e)),
    }
}

/// Persist a marker. A second divergence is never recorded on top of an
/// unresolved one.
pub fn write_merge_marker(layout: &ConfigLayout, marker: &MergeMarker) -> Result<(), CoreError> {
    let path = layout.merge_file();
    if path.exists() {
        let existing = std::fs::read_to_string(&path).unwrap_or_default();
        return Err(CommandError::MergePending(existing.trim().to_string()).into());
    }
    std::fs::write(&path, format!("{}\n", marker))
        .map_err(|e| CoreError::io(format!("could not write {}", path.display()), e))?;
    info!(%marker, "recorded merge marker");
    Ok(())
}

/// Remove the marker. Returns whether one was present.
pub fn clear_merge_marker(layout: &ConfigLayout) -> Result<bool, CoreError> {
    let path = layout.merge_file();
    let removed = layout::remove_if_exists(&path)
        .map_err(|e| CoreError::io(format!("could not remove {}", path.display()), e))?;
    if removed {
        info!("cleared merge marker");
    }
    Ok(removed)
}
