//! Working-tree operations: status, checkout, diff, and the history view.
//!
//! Every comparison is a dry run of rsync between the working tree and a
//! snapshot, or between two snapshots. Snapshots are only ever read here.

use tracing::{info, instrument};

use crate::commit_store::{format_commit_time, CommitStore};
use crate::config::ReplicaContext;
use crate::divergence::read_merge_marker;
use crate::errors::{CommandError, CoreError};
use crate::layout::CONFIG_DIR_NAME;
use crate::ledger::SyncLedger;
use crate::models::{merge_history, CommitId, HistoryEntry, MergeMarker};
use crate::rsync::{
    client::dir_source, effective_changes, parse_itemized, FilterSet, ItemizedChange, RsyncArgs,
    RsyncClient,
};

/// Itemized output of one comparison.
#[derive(Debug, Clone)]
pub struct Comparison {
    pub command: String,
    /// Lines that are real changes, in rsync's order.
    pub changes: Vec<ItemizedChange>,
}

impl Comparison {
    pub fn is_clean(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Ledger view of the newest commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncSummary {
    /// No replica other than this one appears in the ledger.
    NoInformation,
    /// The newest commit is held by these replicas.
    UpToDate(Vec<String>),
    /// `ahead` commits were made after `since`, the latest commit shared
    /// with `replicas`.
    Ahead {
        ahead: usize,
        since: CommitId,
        replicas: Vec<String>,
    },
}

/// Everything `status` reports.
#[derive(Debug, Clone)]
pub struct StatusReport {
    /// None when the replica has no commits yet.
    pub comparison: Option<Comparison>,
    pub reference: Option<CommitId>,
    pub detached: Option<CommitId>,
    pub merge: Option<MergeMarker>,
    pub sync: SyncSummary,
}

/// Result of a checkout.
#[derive(Debug, Clone)]
pub struct CheckoutReport {
    pub id: CommitId,
    pub comparison: Comparison,
    /// Whether HEAD now points to an older commit.
    pub detached: bool,
    pub dry_run: bool,
}

/// One row of `log` or `show`.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub entry: HistoryEntry,
    pub text: Option<String>,
    pub is_head: bool,
    pub synced_with: Vec<String>,
}

impl LogRecord {
    /// Text block as printed by `log` and `show`.
    pub fn render(&self) -> String {
        let id = self.entry.id();
        let mut out = match self.entry.commit {
            Some(_) => format!("commit {}", id),
            None => format!("commit {} is missing", id),
        };
        if self.is_head {
            out.push_str(" (HEAD)");
        }
        if !self.synced_with.is_empty() {
            out.push_str(" <-> ");
            out.push_str(&self.synced_with.join(", "));
        }
        out.push('\n');
        match self.text {
            Some(ref text) => {
                out.push_str(text);
                if !text.ends_with('\n') {
                    out.push('\n');
                }
            }
            None => {
                out.push_str("Log is missing\n");
                out.push_str(&format!("When: {}\n", format_commit_time(id)));
            }
        }
        out
    }
}

/// Working-tree operations of one replica.
pub struct Workspace<'a> {
    ctx: &'a ReplicaContext,
    rsync: &'a RsyncClient,
}

impl<'a> Workspace<'a> {
    pub fn new(ctx: &'a ReplicaContext, rsync: &'a RsyncClient) -> Self {
        Self { ctx, rsync }
    }

    fn store(&self) -> CommitStore<'a> {
        CommitStore::new(self.ctx, self.rsync)
    }

    fn filters(&self) -> FilterSet {
        FilterSet::snapshot(FilterSet::user_filter(self.ctx.layout().filter_file()))
    }

    async fn compare(&self, args: RsyncArgs) -> Result<Comparison, CoreError> {
        let command = args.render(self.rsync.binary());
        let output = self.rsync.run(&args).await?;
        let all = parse_itemized(&output.stdout);
        let changes = effective_changes(&all).into_iter().cloned().collect();
        Ok(Comparison { command, changes })
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    /// Compare the working tree with a commit.
    pub async fn changes_since(&self, id: CommitId) -> Result<Comparison, CoreError> {
        let args = RsyncArgs::new()
            .flag("-aun")
            .flag("--delete")
            .flag("-i")
            .filters(&self.filters())
            .endpoints(
                dir_source(self.ctx.root()),
                self.ctx.layout().commit_dir(id).to_string_lossy().into_owned(),
            );
        self.compare(args)
            .await
            .map_err(|e| e.while_doing("while comparing the working tree"))
    }

    /// Whether the working tree differs from its reference commit. Without
    /// commits, any entry besides the configuration directory is a change.
    pub async fn has_uncommitted_changes(&self) -> Result<bool, CoreError> {
        match self.store().reference_commit()? {
            Some(id) => Ok(!self.changes_since(id).await?.is_clean()),
            None => {
                let root = self.ctx.root();
                let entries = std::fs::read_dir(root)
                    .map_err(|e| CoreError::io(format!("could not list {}", root.display()), e))?;
                Ok(entries
                    .filter_map(|e| e.ok())
                    .any(|e| e.file_name() != CONFIG_DIR_NAME))
            }
        }
    }

    #[instrument(skip(self), fields(replica = %self.ctx.name()))]
    pub async fn status(&self) -> Result<StatusReport, CoreError> {
        let store = self.store();
        let commits = store.list_commits()?;
        let detached = store.head()?;
        let reference = detached.or_else(|| commits.last().copied());
        let comparison = match reference {
            Some(id) => Some(self.changes_since(id).await?),
            None => None,
        };
        let merge = read_merge_marker(self.ctx.layout())?;

        let ledger = SyncLedger::load(self.ctx.layout().sync_dir())?;
        let own = self.ctx.name();
        let sync = match commits.last() {
            None => SyncSummary::NoInformation,
            Some(newest) => {
                let holders = others(ledger.repos_at(*newest), own);
                if !holders.is_empty() {
                    SyncSummary::UpToDate(holders)
                } else {
                    let latest = ledger
                        .marks()
                        .iter()
                        .filter(|(replica, _)| replica.as_str() != own)
                        .map(|(_, id)| *id)
                        .max();
                    match latest {
                        Some(since) => SyncSummary::Ahead {
                            ahead: commits.range(since + 1..).count(),
                            since,
                            replicas: others(ledger.repos_at(since), own),
                        },
                        None => SyncSummary::NoInformation,
                    }
                }
            }
        };

        Ok(StatusReport {
            comparison,
            reference,
            detached,
            merge,
            sync,
        })
    }

    // -----------------------------------------------------------------------
    // Checkout
    // -----------------------------------------------------------------------

    /// Restore the working tree from a commit. Refused when the tree has
    /// uncommitted changes.
    pub async fn checkout(&self, id: CommitId, dry_run: bool) -> Result<CheckoutReport, CoreError> {
        if !self.store().list_commits()?.contains(&id) {
            return Err(CommandError::CommitNotFound(id).into());
        }
        if self.has_uncommitted_changes().await? {
            return Err(CommandError::UncommittedChanges.into());
        }
        self.checkout_unchecked(id, dry_run).await
    }

    /// Checkout without the working-tree gate; used after a pull has already
    /// replaced the tree.
    #[instrument(skip(self), fields(replica = %self.ctx.name()))]
    pub async fn checkout_unchecked(
        &self,
        id: CommitId,
        dry_run: bool,
    ) -> Result<CheckoutReport, CoreError> {
        let store = self.store();
        let commits = store.list_commits()?;
        if !commits.contains(&id) {
            return Err(CommandError::CommitNotFound(id).into());
        }

        let args = RsyncArgs::new()
            .flag("-a")
            .flag_if(dry_run, "-n")
            .flag("--delete")
            .flag("-i")
            .filters(&self.filters())
            .endpoints(
                dir_source(&self.ctx.layout().commit_dir(id)),
                dir_source(self.ctx.root()),
            );
        let comparison = self
            .compare(args)
            .await
            .map_err(|e| e.while_doing(format!("while checking out commit {}", id)))?;

        let detached = commits.last() != Some(&id);
        if !dry_run {
            if detached {
                store.set_head(id)?;
            } else {
                store.clear_head()?;
            }
            info!(id, detached, "checked out commit");
        }
        Ok(CheckoutReport {
            id,
            comparison,
            detached,
            dry_run,
        })
    }

    // -----------------------------------------------------------------------
    // Diff
    // -----------------------------------------------------------------------

    /// Compare two commits, newer against older. The second commit defaults
    /// to the reference commit.
    pub async fn diff(
        &self,
        first: CommitId,
        second: Option<CommitId>,
    ) -> Result<Comparison, CoreError> {
        let store = self.store();
        let commits = store.list_commits()?;
        let second = match second {
            Some(id) => id,
            None => store
                .reference_commit()?
                .ok_or(CommandError::CommitNotFound(first))?,
        };
        for id in [first, second] {
            if !commits.contains(&id) {
                return Err(CommandError::CommitNotFound(id).into());
            }
        }
        let (older, newer) = (first.min(second), first.max(second));

        let args = RsyncArgs::new()
            .flag("-an")
            .flag("--delete")
            .flag("-i")
            .filters(&FilterSet::snapshot(None))
            .endpoints(
                dir_source(&self.ctx.layout().commit_dir(newer)),
                dir_source(&self.ctx.layout().commit_dir(older)),
            );
        self.compare(args)
            .await
            .map_err(|e| e.while_doing(format!("while comparing {} and {}", newer, older)))
    }

    // -----------------------------------------------------------------------
    // History
    // -----------------------------------------------------------------------

    /// All commits and logs, oldest first.
    pub fn history(&self) -> Result<Vec<LogRecord>, CoreError> {
        let store = self.store();
        let commits = store.list_commits()?;
        let logs = store.list_logs()?;
        let head = store.head()?;
        let ledger = SyncLedger::load(self.ctx.layout().sync_dir())?;
        let own = self.ctx.name();

        merge_history(&commits, &logs)
            .into_iter()
            .map(|entry| -> Result<LogRecord, CoreError> {
                let text = match entry.log {
                    Some(id) => store.read_log(id)?,
                    None => None,
                };
                let synced_with = match entry.commit {
                    Some(id) => others(ledger.repos_at(id), own),
                    None => Vec::new(),
                };
                Ok(LogRecord {
                    entry,
                    text,
                    is_head: head.is_some() && entry.commit == head,
                    synced_with,
                })
            })
            .collect()
    }

    /// Newest first unless `reverse`, at most `max` records.
    pub fn log(&self, max: Option<usize>, reverse: bool) -> Result<Vec<LogRecord>, CoreError> {
        let mut records = self.history()?;
        if !reverse {
            records.reverse();
        }
        if let Some(max) = max {
            records.truncate(max);
        }
        Ok(records)
    }

    /// Records for the given ids, in the order asked.
    pub fn show(&self, ids: &[CommitId]) -> Result<Vec<LogRecord>, CoreError> {
        let history = self.history()?;
        ids.iter()
            .map(|id| {
                history
                    .iter()
                    .find(|r| r.entry.id() == *id)
                    .cloned()
                    .ok_or_else(|| CoreError::from(CommandError::NothingToShow(*id)))
            })
            .collect()
    }
}

fn others(replicas: Vec<&str>, own: &str) -> Vec<String> {
    replicas
        .into_iter()
        .filter(|r| *r != own)
        .map(str::to_string)
        .collect()
}
