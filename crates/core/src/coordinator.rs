//! Push/pull state machine.
//!
//! Each run walks `Idle -> PreflightCheck -> TransferInFlight ->
//! PostTransferReconcile` and ends in `Resolved`, `Diverged` or `Failed`:
//!
//! 1. Refuse to run on an unhealthy local replica (detached HEAD, pending
//!    merge, uncommitted changes) unless forced.
//! 2. Inventory the peer with listing-only rsync calls and refuse transfers
//!    that would drop commits held only by the destination.
//! 3. Transfer the working tree together with the commit, log and ledger
//!    subtrees.
//! 4. Only after a successful transfer: fast-forward or record a merge
//!    marker (partial mode), then merge and write the sync ledger.

use tracing::{debug, info, instrument, warn};

use crate::commit_store::CommitStore;
use crate::config::{Location, ReplicaContext};
use crate::divergence::{
    read_merge_marker, write_merge_marker, DivergenceDetector, Reconciliation, Side,
};
use crate::errors::{CommandError, CoreError};
use crate::layout::{self, COMMITS_DIR, FILTER_FILE, SYNC_DIR};
use crate::ledger::{fold_records, LedgerMarks, SyncLedger};
use crate::models::{parse_commit_id, CommitId, CommitSet, MergeMarker};
use crate::rsync::{client::dir_source, FilterSet, RsyncArgs, RsyncClient};
use crate::workspace::Workspace;

// ---------------------------------------------------------------------------
// State machine types
// ---------------------------------------------------------------------------

/// States of one synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    PreflightCheck,
    TransferInFlight,
    PostTransferReconcile,
    Resolved,
    Diverged,
    Failed,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::PreflightCheck => write!(f, "preflight_check"),
            Self::TransferInFlight => write!(f, "transfer_in_flight"),
            Self::PostTransferReconcile => write!(f, "post_transfer_reconcile"),
            Self::Resolved => write!(f, "resolved"),
            Self::Diverged => write!(f, "diverged"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    Push,
    Pull,
}

impl std::fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Push => write!(f, "push"),
            Self::Pull => write!(f, "pull"),
        }
    }
}

/// Flags of `push` and `pull`.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Skip the health gates and the missing-commit check.
    pub force: bool,
    /// `--new`: transfer without deletion and reconcile histories afterwards.
    pub partial: bool,
    pub dry_run: bool,
    pub backup: bool,
    pub backup_dir: Option<String>,
}

impl SyncOptions {
    fn tolerates_unreadable_peer(&self) -> bool {
        self.force || self.partial
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Nothing was changed locally or on the peer beyond rsync's dry run.
    DryRun,
    /// Both sides now share `commit`.
    Synchronized { commit: Option<CommitId> },
    /// The local working tree was checked out at the peer's newest commit.
    FastForwarded { commit: CommitId },
    /// Histories diverged; a merge marker was written.
    Diverged(MergeMarker),
}

/// What a synchronization did.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub direction: SyncDirection,
    /// Section name in `config.ini`.
    pub peer: String,
    /// The peer's own replica name, when it could be read.
    pub peer_name: Option<String>,
    pub command: String,
    /// rsync's verbose file list.
    pub transfer_output: String,
    pub outcome: SyncOutcome,
    pub ledger_writes: usize,
    pub state: SyncState,
}

/// What a listing of the peer's configuration directory revealed.
#[derive(Debug, Clone, Default)]
pub struct PeerInventory {
    pub name: Option<String>,
    pub commits: CommitSet,
    pub marks: LedgerMarks,
    /// Raw ledger file names, kept to restore the peer's ledger verbatim.
    pub record_names: Vec<String>,
    pub has_filter: bool,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct ReplicationCoordinator<'a> {
    ctx: &'a ReplicaContext,
    rsync: &'a RsyncClient,
    detector: DivergenceDetector,
    state: SyncState,
}

impl<'a> ReplicationCoordinator<'a> {
    pub fn new(ctx: &'a ReplicaContext, rsync: &'a RsyncClient) -> Self {
        Self {
            ctx,
            rsync,
            detector: DivergenceDetector::new(),
            state: SyncState::Idle,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    fn transition(&mut self, next: SyncState) {
        info!(from = %self.state, to = %next, "sync state transition");
        self.state = next;
    }

    pub async fn push(&mut self, peer: &str, opts: &SyncOptions) -> Result<SyncReport, CoreError> {
        self.synchronize(SyncDirection::Push, peer, opts).await
    }

    pub async fn pull(&mut self, peer: &str, opts: &SyncOptions) -> Result<SyncReport, CoreError> {
        self.synchronize(SyncDirection::Pull, peer, opts).await
    }

    async fn synchronize(
        &mut self,
        direction: SyncDirection,
        peer: &str,
        opts: &SyncOptions,
    ) -> Result<SyncReport, CoreError> {
        self.state = SyncState::Idle;
        let result = self.run(direction, peer, opts).await;
        if let Err(ref e) = result {
            warn!(%direction, peer, error = %e, "synchronization failed");
            self.transition(SyncState::Failed);
        }
        result
    }

    #[instrument(skip(self, opts), fields(replica = %self.ctx.name()))]
    async fn run(
        &mut self,
        direction: SyncDirection,
        peer: &str,
        opts: &SyncOptions,
    ) -> Result<SyncReport, CoreError> {
        self.transition(SyncState::PreflightCheck);
        self.ctx.ensure_standard_layout()?;
        let location = self.ctx.resolve_peer(peer)?;
        if !opts.force {
            self.preflight().await?;
        }

        let store = CommitStore::new(self.ctx, self.rsync);
        let local = store.list_commits()?;
        let inventory = self
            .peer_inventory(&location, opts.tolerates_unreadable_peer())
            .await?;
        let local_ledger = SyncLedger::load(self.ctx.layout().sync_dir())?;

        let (source, destination) = match direction {
            SyncDirection::Push => (&local, &inventory.commits),
            SyncDirection::Pull => (&inventory.commits, &local),
        };

        if opts.partial {
            if direction == SyncDirection::Push {
                match self.detector.detect(&local, &inventory.commits) {
                    Reconciliation::Diverged(_) => {
                        return Err(CommandError::PushDiverged { peer: peer.into() }.into())
                    }
                    Reconciliation::FastForward {
                        behind: Side::Local,
                        ..
                    } => return Err(CommandError::PeerAhead { peer: peer.into() }.into()),
                    _ => {}
                }
            }
        } else if !opts.force {
            let missing: Vec<CommitId> = destination.difference(source).copied().collect();
            if !missing.is_empty() {
                return Err(CommandError::MissingCommits(missing).into());
            }
        }

        // Transfer
        self.transition(SyncState::TransferInFlight);
        let args = self.transfer_args(direction, &location, opts);
        let command = args.render(self.rsync.binary());
        let context = match direction {
            SyncDirection::Push => format!("while pushing to {}", peer),
            SyncDirection::Pull => format!("while pulling from {}", peer),
        };
        let output = self
            .rsync
            .run(&args)
            .await
            .map_err(|e| CoreError::from(e).while_doing(context))?;

        let mut report = SyncReport {
            direction,
            peer: peer.to_string(),
            peer_name: inventory.name.clone(),
            command,
            transfer_output: output.stdout,
            outcome: SyncOutcome::DryRun,
            ledger_writes: 0,
            state: self.state,
        };
        if opts.dry_run {
            self.transition(SyncState::Resolved);
            report.state = self.state;
            return Ok(report);
        }

        // Reconcile
        self.transition(SyncState::PostTransferReconcile);
        let shared = source.last().copied();
        report.outcome = SyncOutcome::Synchronized { commit: shared };

        if opts.partial && direction == SyncDirection::Pull {
            match self.detector.detect(&local, &inventory.commits) {
                Reconciliation::Diverged(marker) => {
                    write_merge_marker(self.ctx.layout(), &marker)?;
                    self.transition(SyncState::Diverged);
                    report.outcome = SyncOutcome::Diverged(marker);
                    report.state = self.state;
                    return Ok(report);
                }
                Reconciliation::FastForward {
                    behind: Side::Local,
                    newest,
                } => {
                    Workspace::new(self.ctx, self.rsync)
                        .checkout_unchecked(newest, false)
                        .await?;
                    report.outcome = SyncOutcome::FastForwarded { commit: newest };
                }
                // The transfer did not delete or skip older files, so the
                // working tree is restored from the local newest commit.
                Reconciliation::FastForward {
                    behind: Side::Peer,
                    newest,
                }
                | Reconciliation::UpToDate {
                    newest: Some(newest),
                } => {
                    Workspace::new(self.ctx, self.rsync)
                        .checkout_unchecked(newest, false)
                        .await?;
                }
                Reconciliation::UpToDate { newest: None } => {}
            }
        }

        let mut ledger = local_ledger;
        ledger.merge(&inventory.marks);
        match (shared, inventory.name.as_deref()) {
            (Some(id), Some(name)) => {
                ledger.record(self.ctx.name(), id);
                ledger.record(name, id);
            }
            (Some(id), None) => {
                warn!(peer, id, "peer replica name unknown, not recording synchronization")
            }
            (None, _) => debug!(peer, "no commits on the source, nothing to record"),
        }
        report.ledger_writes = ledger.write()?;
        if direction == SyncDirection::Push {
            self.publish_ledger(&location)
                .await
                .map_err(|e| e.while_doing(format!("while updating the ledger of {}", peer)))?;
        }

        self.transition(SyncState::Resolved);
        report.state = self.state;
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Local-repository health gates.
    async fn preflight(&self) -> Result<(), CoreError> {
        let store = CommitStore::new(self.ctx, self.rsync);
        if let Some(head) = store.head()? {
            return Err(CommandError::DetachedHead(head).into());
        }
        if let Some(marker) = read_merge_marker(self.ctx.layout())? {
            return Err(CommandError::MergePending(marker.to_string()).into());
        }
        if Workspace::new(self.ctx, self.rsync)
            .has_uncommitted_changes()
            .await?
        {
            return Err(CommandError::UncommittedChanges.into());
        }
        debug!("preflight checks passed");
        Ok(())
    }

    fn transfer_args(
        &self,
        direction: SyncDirection,
        location: &Location,
        opts: &SyncOptions,
    ) -> RsyncArgs {
        let mut args = RsyncArgs::new()
            .flag("-avH")
            .flag_if(opts.dry_run, "-n")
            .flag_if(!opts.partial, "--delete-after")
            .flag_if(opts.backup || opts.backup_dir.is_some(), "--backup");
        if let Some(ref dir) = opts.backup_dir {
            args = args.flag(format!("--backup-dir={}", dir));
        }
        let args = args.filters(&FilterSet::synchronization(FilterSet::user_filter(
            self.ctx.layout().filter_file(),
        )));
        let local = self.ctx.root_location().to_string();
        let remote = location.to_string();
        match direction {
            SyncDirection::Push => args.endpoints(local, remote),
            SyncDirection::Pull => args.endpoints(remote, local),
        }
    }

    /// List the peer's configuration directory, commits and ledger without
    /// transferring anything. When `tolerant`, an unreadable peer counts as
    /// one without history.
    pub async fn peer_inventory(
        &self,
        location: &Location,
        tolerant: bool,
    ) -> Result<PeerInventory, CoreError> {
        let config_dir = location.config_entry("");
        let entries = match self.rsync.list(&config_dir).await {
            Ok(entries) => entries,
            Err(e) if tolerant => {
                warn!(location = %location, error = %e, "peer is unreadable, assuming no history");
                return Ok(PeerInventory::default());
            }
            Err(e) => {
                return Err(CoreError::from(e).while_doing(format!("while reading {}", config_dir)))
            }
        };

        let names: Vec<&str> = entries
            .iter()
            .filter(|e| !e.is_dir)
            .filter_map(|e| layout::replica_name_from_file(&e.name))
            .collect();
        let name = match names.as_slice() {
            [only] => Some(only.to_string()),
            _ if tolerant => {
                warn!(location = %location, found = names.len(), "peer replica name not found");
                None
            }
            _ => {
                return Err(CommandError::NotAReplica {
                    peer: location.to_string(),
                }
                .into())
            }
        };
        let has_dir = |dir: &str| entries.iter().any(|e| e.is_dir && e.name == dir);
        let has_filter = entries.iter().any(|e| !e.is_dir && e.name == FILTER_FILE);

        let commits = if has_dir(COMMITS_DIR) {
            self.list_under(location, COMMITS_DIR)
                .await?
                .into_iter()
                .filter(|e| e.is_dir)
                .filter_map(|e| parse_commit_id(&e.name))
                .collect()
        } else {
            CommitSet::new()
        };
        let record_names: Vec<String> = if has_dir(SYNC_DIR) {
            self.list_under(location, SYNC_DIR)
                .await?
                .into_iter()
                .filter(|e| !e.is_dir)
                .map(|e| e.name)
                .collect()
        } else {
            Vec::new()
        };
        let marks = fold_records(record_names.iter().map(String::as_str))?;

        debug!(
            location = %location,
            ?name,
            commits = commits.len(),
            replicas = marks.len(),
            "read peer inventory"
        );
        Ok(PeerInventory {
            name,
            commits,
            marks,
            record_names,
            has_filter,
        })
    }

    async fn list_under(
        &self,
        location: &Location,
        sub: &str,
    ) -> Result<Vec<crate::rsync::ListEntry>, CoreError> {
        let path = location.config_entry(&format!("{}/", sub));
        self.rsync
            .list(&path)
            .await
            .map_err(|e| CoreError::from(e).while_doing(format!("while reading {}", path)))
    }

    /// Make the peer's ledger directory identical to the local one.
    pub async fn publish_ledger(&self, location: &Location) -> Result<(), CoreError> {
        let args = RsyncArgs::new()
            .flag("-r")
            .flag("--delete")
            .endpoints(
                dir_source(&self.ctx.layout().sync_dir()),
                location.config_entry(&format!("{}/", SYNC_DIR)),
            );
        self.rsync.run(&args).await?;
        info!(location = %location, "published sync ledger");
        Ok(())
    }
}
