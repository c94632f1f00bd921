//! Commits, their logs, the HEAD pointer, and the retention limit.
//!
//! A commit is a hardlinked snapshot of the working tree under
//! `commits/<id>/`, where `<id>` is the wall-clock second of its creation.
//! It is built under `commits/<id>_tmp/` and renamed into place only after
//! the transfer tool succeeded, so readers never see a partial snapshot.

use std::path::Path;

use chrono::{Local, TimeZone, Utc};
use tracing::{debug, info, instrument, warn};

use crate::config::ReplicaContext;
use crate::divergence::{clear_merge_marker, read_merge_marker};
use crate::errors::{ConfigError, CoreError, FatalError};
use crate::layout::{self, ConfigLayout};
use crate::models::{parse_commit_id, CommitId, CommitSet, MergeMarker};
use crate::rsync::{client::dir_source, FilterSet, RsyncArgs, RsyncClient};

/// `strftime` format of the `When:` line.
pub const DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S %Z";

/// Parameters of one `commit` invocation.
#[derive(Debug, Clone, Default)]
pub struct CommitOptions {
    pub message: String,
    /// Persist a new retention limit before pruning.
    pub limit: Option<usize>,
}

/// What a successful commit did.
#[derive(Debug, Clone)]
pub struct CommitReport {
    pub id: CommitId,
    /// The rendered rsync command.
    pub command: String,
    pub log: String,
    /// False when the log could not be written; the commit still stands.
    pub log_written: bool,
    /// The merge this commit resolved.
    pub merged: Option<MergeMarker>,
    pub pruned: Vec<CommitId>,
}

/// Render the local time of a commit id.
pub fn format_commit_time(id: CommitId) -> String {
    match Local.timestamp_opt(id, 0).single() {
        Some(time) => time.format(DATE_FORMAT).to_string(),
        None => id.to_string(),
    }
}

/// Creates, lists and prunes commits of one replica.
pub struct CommitStore<'a> {
    ctx: &'a ReplicaContext,
    rsync: &'a RsyncClient,
}

impl<'a> CommitStore<'a> {
    pub fn new(ctx: &'a ReplicaContext, rsync: &'a RsyncClient) -> Self {
        Self { ctx, rsync }
    }

    fn layout(&self) -> &ConfigLayout {
        self.ctx.layout()
    }

    // -----------------------------------------------------------------------
    // Listing
    // -----------------------------------------------------------------------

    /// Ids of all finished commits. A missing commit directory is an empty
    /// history.
    pub fn list_commits(&self) -> Result<CommitSet, CoreError> {
        list_ids(&self.layout().commits_dir(), |name, is_dir| {
            is_dir.then(|| parse_commit_id(name)).flatten()
        })
    }

    /// Ids of all logs, with or without a matching commit.
    pub fn list_logs(&self) -> Result<CommitSet, CoreError> {
        list_ids(&self.layout().logs_dir(), |name, is_dir| {
            (!is_dir)
                .then(|| name.strip_suffix(".txt").and_then(parse_commit_id))
                .flatten()
        })
    }

    pub fn newest(&self) -> Result<Option<CommitId>, CoreError> {
        Ok(self.list_commits()?.last().copied())
    }

    pub fn read_log(&self, id: CommitId) -> Result<Option<String>, CoreError> {
        let path = self.layout().log_file(id);
        match std::fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CoreError::io(format!("could not read {}", path.display()), e)),
        }
    }

    // -----------------------------------------------------------------------
    // HEAD pointer
    // -----------------------------------------------------------------------

    /// The checked-out commit when it is not the newest one.
    pub fn head(&self) -> Result<Option<CommitId>, CoreError> {
        let path = self.layout().head_file();
        match std::fs::read_to_string(&path) {
            Ok(text) => parse_commit_id(text.trim()).map(Some).ok_or_else(|| {
                ConfigError::InvalidValue {
                    field: layout::HEAD_FILE.into(),
                    detail: format!("'{}' is not a commit id", text.trim()),
                }
                .into()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CoreError::io(format!("could not read {}", path.display()), e)),
        }
    }

    pub fn set_head(&self, id: CommitId) -> Result<(), CoreError> {
        let path = self.layout().head_file();
        std::fs::write(&path, format!("{}\n", id))
            .map_err(|e| CoreError::io(format!("could not write {}", path.display()), e))?;
        debug!(id, "detached HEAD");
        Ok(())
    }

    pub fn clear_head(&self) -> Result<bool, CoreError> {
        let path = self.layout().head_file();
        layout::remove_if_exists(&path)
            .map_err(|e| CoreError::io(format!("could not remove {}", path.display()), e))
    }

    /// The commit the working tree is compared against: HEAD when detached,
    /// otherwise the newest.
    pub fn reference_commit(&self) -> Result<Option<CommitId>, CoreError> {
        match self.head()? {
            Some(id) => Ok(Some(id)),
            None => self.newest(),
        }
    }

    // -----------------------------------------------------------------------
    // Retention
    // -----------------------------------------------------------------------

    pub fn commit_limit(&self) -> Result<Option<usize>, CoreError> {
        let path = self.layout().commit_limit_file();
        match std::fs::read_to_string(&path) {
            Ok(text) => match text.trim().parse::<usize>() {
                Ok(limit) if limit > 0 => Ok(Some(limit)),
                _ => Err(ConfigError::InvalidValue {
                    field: layout::COMMIT_LIMIT_FILE.into(),
                    detail: format!("'{}' is not a positive integer", text.trim()),
                }
                .into()),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CoreError::io(format!("could not read {}", path.display()), e)),
        }
    }

    pub fn set_commit_limit(&self, limit: usize) -> Result<(), CoreError> {
        if limit == 0 {
            return Err(ConfigError::InvalidValue {
                field: "limit".into(),
                detail: "the commit limit must be at least 1".into(),
            }
            .into());
        }
        let path = self.layout().commit_limit_file();
        std::fs::write(&path, format!("{}\n", limit))
            .map_err(|e| CoreError::io(format!("could not write {}", path.display()), e))
    }

    /// Delete the oldest commits until at most `limit` remain. Returns the
    /// removed ids in ascending order. A log that cannot be removed is only
    /// reported.
    #[instrument(skip(self))]
    pub fn prune_to_limit(&self, limit: usize) -> Result<Vec<CommitId>, CoreError> {
        let commits = self.list_commits()?;
        let excess = commits.len().saturating_sub(limit);
        let mut removed = Vec::with_capacity(excess);

        for id in commits.into_iter().take(excess) {
            let dir = self.layout().commit_dir(id);
            std::fs::remove_dir_all(&dir)
                .map_err(|e| CoreError::io(format!("could not remove {}", dir.display()), e))?;
            let log = self.layout().log_file(id);
            if let Err(e) = layout::remove_if_exists(&log) {
                warn!(id, error = %e, "could not remove log of pruned commit");
            }
            removed.push(id);
        }
        if !removed.is_empty() {
            info!(count = removed.len(), limit, "pruned old commits");
        }
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    /// Snapshot the working tree as a commit named after the current second.
    pub async fn create_commit(&self, opts: &CommitOptions) -> Result<CommitReport, CoreError> {
        self.create_commit_with_id(Utc::now().timestamp(), opts).await
    }

    /// Snapshot the working tree under an explicit id.
    #[instrument(skip(self, opts), fields(replica = %self.ctx.name()))]
    pub async fn create_commit_with_id(
        &self,
        id: CommitId,
        opts: &CommitOptions,
    ) -> Result<CommitReport, CoreError> {
        let layout = self.layout();
        let commit_dir = layout.commit_dir(id);
        let tmp_dir = layout.tmp_commit_dir(id);

        // The existence check is the only guard against a second commit in
        // the same second.
        if commit_dir.exists() {
            return Err(FatalError::CommitExists(commit_dir.display().to_string()).into());
        }
        if tmp_dir.exists() {
            return Err(FatalError::TemporaryCommitExists(tmp_dir.display().to_string()).into());
        }

        if opts.limit == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "limit".into(),
                detail: "the commit limit must be at least 1".into(),
            }
            .into());
        }
        let merged = read_merge_marker(layout)?;
        let previous = self.list_commits()?.range(..id).next_back().copied();

        let commits_dir = layout.commits_dir();
        std::fs::create_dir_all(&commits_dir)
            .map_err(|e| CoreError::io(format!("could not create {}", commits_dir.display()), e))?;

        let mut args = RsyncArgs::new().flag("-a");
        if let Some(prev) = previous {
            let link_dest = absolute(&layout.commit_dir(prev));
            args = args.flag(format!("--link-dest={}", link_dest.display()));
        }
        let args = args
            .filters(&FilterSet::snapshot(FilterSet::user_filter(
                layout.filter_file(),
            )))
            .endpoints(
                dir_source(self.ctx.root()),
                tmp_dir.to_string_lossy().into_owned(),
            );
        let command = args.render(self.rsync.binary());

        if let Err(err) = self.rsync.run(&args).await {
            if let Err(e) = std::fs::remove_dir_all(&tmp_dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(
                        dir = %tmp_dir.display(),
                        error = %e,
                        "could not remove temporary commit"
                    );
                }
            }
            return Err(CoreError::from(err).while_doing("while creating a commit"));
        }

        let log = self.render_log(opts, merged.as_ref());
        let log_written = match self.write_log(id, &log) {
            Ok(()) => true,
            Err(e) => {
                warn!(id, error = %e, "could not write commit log");
                false
            }
        };

        std::fs::rename(&tmp_dir, &commit_dir).map_err(|e| {
            CoreError::io(
                format!("could not move {} to {}", tmp_dir.display(), commit_dir.display()),
                e,
            )
        })?;
        info!(id, "commit created");

        // The marker survives until both the snapshot and its lineage exist.
        if merged.is_some() && log_written {
            clear_merge_marker(layout)?;
        }
        self.clear_head()?;

        if let Some(limit) = opts.limit {
            self.set_commit_limit(limit)?;
        }
        let pruned = match self.commit_limit()? {
            Some(limit) => self.prune_to_limit(limit)?,
            None => Vec::new(),
        };

        Ok(CommitReport {
            id,
            command,
            log,
            log_written,
            merged,
            pruned,
        })
    }

    fn render_log(&self, opts: &CommitOptions, merged: Option<&MergeMarker>) -> String {
        let mut log = String::new();
        if !opts.message.is_empty() {
            log.push_str(&opts.message);
            log.push_str("\n\n");
        }
        log.push_str(&format!(
            "When: {}\nWhere: {}@{}\n",
            Local::now().format(DATE_FORMAT),
            self.ctx.author(),
            self.ctx.name()
        ));
        if let Some(marker) = merged {
            log.push_str(&marker.lineage());
            log.push('\n');
        }
        log
    }

    fn write_log(&self, id: CommitId, log: &str) -> std::io::Result<()> {
        std::fs::create_dir_all(self.layout().logs_dir())?;
        std::fs::write(self.layout().log_file(id), log)
    }
}

fn absolute(path: &Path) -> std::path::PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

fn list_ids(
    dir: &Path,
    parse: impl Fn(&str, bool) -> Option<CommitId>,
) -> Result<CommitSet, CoreError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(CommitSet::new()),
        Err(e) => return Err(CoreError::io(format!("could not list {}", dir.display()), e)),
    };
    let mut ids = CommitSet::new();
    for entry in entries {
        let entry =
            entry.map_err(|e| CoreError::io(format!("could not list {}", dir.display()), e))?;
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if let Some(id) = parse(&entry.file_name().to_string_lossy(), is_dir) {
            ids.insert(id);
        }
    }
    Ok(ids)
}
