//! Creating a replica from an existing one (`clone`).
//!
//! Every step after the target directory exists is undone on failure: the
//! source's ledger is restored if it was touched, and the new configuration
//! directory (or the whole target, when clone created it) is removed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{info, instrument, warn};

use crate::config::{validate_replica_name, Location, ReplicaContext};
use crate::coordinator::{ReplicationCoordinator, SyncOptions, SyncReport};
use crate::errors::{CommandError, ConfigError, CoreError};
use crate::layout::{CONFIG_DIR_NAME, FILTER_FILE, SYNC_DIR};
use crate::rsync::{client::dir_source, RsyncArgs, RsyncClient};

/// Section name the source is registered under.
pub const ORIGIN: &str = "origin";

/// Arguments of `clone`.
#[derive(Debug, Clone)]
pub struct CloneOptions {
    /// Name of the new replica.
    pub name: String,
    /// Local path or `host:path` of an existing replica.
    pub source: String,
    /// Target directory; defaults to the source's basename under `cwd`.
    pub directory: Option<PathBuf>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub author: String,
}

/// Result of a successful clone.
#[derive(Debug, Clone)]
pub struct CloneReport {
    pub root: PathBuf,
    pub sync: SyncReport,
    pub fetched_filter: bool,
}

/// What has been done so far, for rollback.
#[derive(Debug, Default)]
struct Progress {
    remote_touched: bool,
    remote_records: Vec<String>,
}

/// The source as given, with a relative local path resolved against `cwd`.
fn source_location(cwd: &Path, source: &str) -> Location {
    let location = Location::new(source);
    if location.is_remote() || Path::new(source).is_absolute() {
        location
    } else {
        Location::from_path(&cwd.join(source))
    }
}

pub struct ReplicaBootstrap<'a> {
    rsync: &'a RsyncClient,
}

impl<'a> ReplicaBootstrap<'a> {
    pub fn new(rsync: &'a RsyncClient) -> Self {
        Self { rsync }
    }

    #[instrument(skip(self, opts), fields(name = %opts.name, source = %opts.source))]
    pub async fn clone_replica(&self, opts: &CloneOptions) -> Result<CloneReport, CoreError> {
        validate_replica_name(&opts.name)?;
        let source = source_location(&opts.cwd, &opts.source);
        let root = match opts.directory {
            Some(ref dir) => opts.cwd.join(dir),
            None => {
                let base = source.basename().ok_or_else(|| ConfigError::InvalidValue {
                    field: "source".into(),
                    detail: format!("cannot derive a directory name from '{}'", opts.source),
                })?;
                opts.cwd.join(base)
            }
        };
        let config_dir = root.join(CONFIG_DIR_NAME);
        if config_dir.exists() {
            return Err(CommandError::AlreadyReplica(root.display().to_string()).into());
        }

        let created_root = !root.exists();
        std::fs::create_dir_all(&root)
            .map_err(|e| CoreError::io(format!("could not create {}", root.display()), e))?;
        info!(root = %root.display(), created_root, "cloning replica");

        let mut progress = Progress::default();
        match self.run(opts, &source, &root, &mut progress).await {
            Ok(report) => Ok(report),
            Err(err) => {
                warn!(error = %err, "clone failed, rolling back");
                self.rollback(&source, &root, created_root, &progress).await;
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        opts: &CloneOptions,
        source: &Location,
        root: &Path,
        progress: &mut Progress,
    ) -> Result<CloneReport, CoreError> {
        let config_dir = root.join(CONFIG_DIR_NAME);
        ReplicaContext::init(&config_dir, &opts.name)?;
        let mut ctx =
            ReplicaContext::open(root, &config_dir, opts.env.clone(), opts.author.clone())?;
        ctx.add_peer(ORIGIN, source.as_str().trim_end_matches('/'))?;

        let mut coordinator = ReplicationCoordinator::new(&ctx, self.rsync);
        let inventory = coordinator.peer_inventory(source, false).await?;
        if inventory.name.as_deref() == Some(opts.name.as_str()) {
            return Err(CommandError::ReplicaNameTaken(opts.name.clone()).into());
        }
        progress.remote_records = inventory.record_names.clone();

        let fetched_filter = inventory.has_filter;
        if fetched_filter {
            let args = RsyncArgs::new().endpoints(
                source.config_entry(FILTER_FILE),
                ctx.layout().filter_file().to_string_lossy().into_owned(),
            );
            self.rsync
                .run(&args)
                .await
                .map_err(|e| {
                    CoreError::from(e).while_doing(format!("while fetching {}", FILTER_FILE))
                })?;
        }

        let pull = SyncOptions {
            partial: true,
            ..Default::default()
        };
        let sync = coordinator.pull(ORIGIN, &pull).await?;

        progress.remote_touched = true;
        coordinator
            .publish_ledger(source)
            .await
            .map_err(|e| e.while_doing(format!("while updating the ledger of {}", source)))?;

        info!(root = %root.display(), "clone complete");
        Ok(CloneReport {
            root: root.to_path_buf(),
            sync,
            fetched_filter,
        })
    }

    async fn rollback(
        &self,
        source: &Location,
        root: &Path,
        created_root: bool,
        progress: &Progress,
    ) {
        if progress.remote_touched {
            if let Err(e) = self.restore_remote_ledger(source, &progress.remote_records).await {
                warn!(error = %e, "could not restore the source's ledger");
            }
        }
        let target = if created_root {
            root.to_path_buf()
        } else {
            root.join(CONFIG_DIR_NAME)
        };
        if let Err(e) = std::fs::remove_dir_all(&target) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %target.display(), error = %e, "could not remove clone");
            }
        }
    }

    /// Put the source's ledger back to the recorded file names.
    async fn restore_remote_ledger(
        &self,
        source: &Location,
        records: &[String],
    ) -> Result<(), CoreError> {
        let staging = tempfile::tempdir()
            .map_err(|e| CoreError::io("could not create a staging directory", e))?;
        for name in records {
            let path = staging.path().join(name);
            std::fs::write(&path, "")
                .map_err(|e| CoreError::io(format!("could not write {}", path.display()), e))?;
        }
        let args = RsyncArgs::new().flag("-r").flag("--delete").endpoints(
            dir_source(staging.path()),
            source.config_entry(&format!("{}/", SYNC_DIR)),
        );
        self.rsync.run(&args).await?;
        info!(records = records.len(), "restored the source's ledger");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(cwd: &Path, name: &str, source: &str) -> CloneOptions {
        CloneOptions {
            name: name.into(),
            source: source.into(),
            directory: None,
            cwd: cwd.to_path_buf(),
            env: HashMap::new(),
            author: "me".into(),
        }
    }

    #[test]
    fn test_source_location_resolves_against_cwd() {
        let cwd = Path::new("/home/me/work");
        assert_eq!(source_location(cwd, "../data").as_str(), "/home/me/work/../data/");
        assert_eq!(source_location(cwd, "/srv/data").as_str(), "/srv/data/");
        assert_eq!(source_location(cwd, "host:data").as_str(), "host:data/");
    }

    #[tokio::test]
    async fn test_clone_refuses_existing_replica() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("data").join(CONFIG_DIR_NAME)).unwrap();

        let rsync = RsyncClient::default();
        let err = ReplicaBootstrap::new(&rsync)
            .clone_replica(&options(dir.path(), "laptop", "/mnt/disk/data"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Command(CommandError::AlreadyReplica(_))));
        assert!(dir.path().join("data").join(CONFIG_DIR_NAME).is_dir());
    }

    #[tokio::test]
    async fn test_clone_rejects_bad_name_before_touching_disk() {
        let dir = tempfile::tempdir().unwrap();
        let rsync = RsyncClient::default();
        let err = ReplicaBootstrap::new(&rsync)
            .clone_replica(&options(dir.path(), "a/b", "/mnt/disk/data"))
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), crate::errors::EXIT_COMMAND_ERROR);
        assert!(!dir.path().join("data").exists());
    }
}
