//! End-to-end tests for commits, push/pull and clone between local replicas.
//!
//! These tests run the real `rsync` binary on temporary directories. No
//! network I/O: every peer is a local path.
//!
//! Tests skip gracefully if `rsync` is not installed.

use std::collections::HashMap;
use std::path::Path;
use std::process::Command;

use tempfile::TempDir;

use yarsync_core::bootstrap::{CloneOptions, ReplicaBootstrap};
use yarsync_core::commit_store::{CommitOptions, CommitStore};
use yarsync_core::config::ReplicaContext;
use yarsync_core::coordinator::{ReplicationCoordinator, SyncOptions, SyncOutcome, SyncState};
use yarsync_core::errors::{CommandError, CoreError, FatalError};
use yarsync_core::layout::CONFIG_DIR_NAME;
use yarsync_core::ledger::SyncLedger;
use yarsync_core::models::{CommitSet, MergeMarker};
use yarsync_core::rsync::RsyncClient;
use yarsync_core::workspace::Workspace;

// ===========================================================================
// Helpers
// ===========================================================================

fn rsync_available() -> bool {
    Command::new("rsync")
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn new_replica(root: &Path, name: &str) -> ReplicaContext {
    std::fs::create_dir_all(root).unwrap();
    let config_dir = root.join(CONFIG_DIR_NAME);
    ReplicaContext::init(&config_dir, name).unwrap();
    open_replica(root)
}

fn open_replica(root: &Path) -> ReplicaContext {
    ReplicaContext::open(root, root.join(CONFIG_DIR_NAME), HashMap::new(), "tester").unwrap()
}

async fn commit(ctx: &ReplicaContext, rsync: &RsyncClient, id: i64, file: &str, content: &str) {
    std::fs::write(ctx.root().join(file), content).unwrap();
    let opts = CommitOptions {
        message: format!("commit {}", id),
        limit: None,
    };
    CommitStore::new(ctx, rsync)
        .create_commit_with_id(id, &opts)
        .await
        .unwrap();
}

fn commits(ctx: &ReplicaContext, rsync: &RsyncClient) -> CommitSet {
    CommitStore::new(ctx, rsync).list_commits().unwrap()
}

fn ledger_files(root: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(root.join(".ys/sync"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

fn set(ids: &[i64]) -> CommitSet {
    ids.iter().copied().collect()
}

/// An rsync client running a shell script in front of the real binary.
#[cfg(unix)]
fn scripted_rsync(dir: &Path, body: &str) -> RsyncClient {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("rsync-wrapper.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    RsyncClient::new(path.to_string_lossy().into_owned())
}

// ===========================================================================
// Commits
// ===========================================================================

#[tokio::test]
async fn test_commit_checkout_and_collision() {
    if !rsync_available() {
        eprintln!("SKIPPED: rsync not found in PATH");
        return;
    }

    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("photos");
    let ctx = new_replica(&root, "laptop");
    let rsync = RsyncClient::default();
    let store = CommitStore::new(&ctx, &rsync);

    std::fs::write(root.join("a.txt"), "a").unwrap();
    let opts = CommitOptions {
        message: "init".into(),
        limit: None,
    };
    let report = store.create_commit(&opts).await.unwrap();
    let id = report.id;
    assert!(report.log_written);
    assert!(report.log.starts_with("init\n\nWhen: "));
    assert!(report.log.contains("Where: tester@laptop"));
    assert_eq!(store.list_commits().unwrap(), set(&[id]));
    assert!(root.join(".ys/commits").join(id.to_string()).join("a.txt").exists());
    assert!(!root
        .join(".ys/commits")
        .join(id.to_string())
        .join(CONFIG_DIR_NAME)
        .exists());

    let ws = Workspace::new(&ctx, &rsync);
    let checkout = ws.checkout(id, false).await.unwrap();
    assert!(!checkout.detached);
    assert!(!ctx.layout().head_file().exists());

    // same wall-clock second
    let err = store.create_commit_with_id(id, &opts).await.unwrap_err();
    assert!(matches!(err, CoreError::Fatal(FatalError::CommitExists(_))));
    assert_eq!(err.exit_code(), 9);
}

#[cfg(unix)]
#[tokio::test]
async fn test_commits_share_unchanged_files() {
    use std::os::unix::fs::MetadataExt;

    if !rsync_available() {
        eprintln!("SKIPPED: rsync not found in PATH");
        return;
    }

    let tmp = TempDir::new().unwrap();
    let ctx = new_replica(tmp.path(), "laptop");
    let rsync = RsyncClient::default();
    commit(&ctx, &rsync, 1, "big.bin", "unchanged content").await;
    commit(&ctx, &rsync, 2, "new.txt", "new").await;

    let first = std::fs::metadata(ctx.layout().commit_dir(1).join("big.bin")).unwrap();
    let second = std::fs::metadata(ctx.layout().commit_dir(2).join("big.bin")).unwrap();
    assert_eq!(first.ino(), second.ino());
    assert!(!ctx.layout().commit_dir(1).join("new.txt").exists());
}

#[tokio::test]
async fn test_status_checkout_and_diff() {
    if !rsync_available() {
        eprintln!("SKIPPED: rsync not found in PATH");
        return;
    }

    let tmp = TempDir::new().unwrap();
    let ctx = new_replica(tmp.path(), "laptop");
    let rsync = RsyncClient::default();
    commit(&ctx, &rsync, 1, "a.txt", "one").await;
    commit(&ctx, &rsync, 2, "b.txt", "two").await;
    let ws = Workspace::new(&ctx, &rsync);

    let status = ws.status().await.unwrap();
    assert!(status.comparison.unwrap().is_clean());
    assert_eq!(status.reference, Some(2));

    std::fs::write(tmp.path().join("c.txt"), "three").unwrap();
    assert!(ws.has_uncommitted_changes().await.unwrap());
    let err = ws.checkout(1, false).await.unwrap_err();
    assert!(matches!(err, CoreError::Command(CommandError::UncommittedChanges)));
    std::fs::remove_file(tmp.path().join("c.txt")).unwrap();

    let diff = ws.diff(1, None).await.unwrap();
    assert!(diff.changes.iter().any(|c| c.path == "b.txt"));

    let checkout = ws.checkout(1, false).await.unwrap();
    assert!(checkout.detached);
    assert!(!tmp.path().join("b.txt").exists());
    assert_eq!(
        std::fs::read_to_string(ctx.layout().head_file()).unwrap().trim(),
        "1"
    );
    // snapshots are never touched by checkout or diff
    assert!(ctx.layout().commit_dir(2).join("b.txt").exists());

    ws.checkout(2, false).await.unwrap();
    assert!(!ctx.layout().head_file().exists());
    assert!(tmp.path().join("b.txt").exists());
}

// ===========================================================================
// Push / pull
// ===========================================================================

#[tokio::test]
async fn test_missing_commits_refused_unless_forced() {
    if !rsync_available() {
        eprintln!("SKIPPED: rsync not found in PATH");
        return;
    }

    let tmp = TempDir::new().unwrap();
    let rsync = RsyncClient::default();

    let dest_root = tmp.path().join("b");
    let dest = new_replica(&dest_root, "b");
    for id in [1, 2, 3] {
        commit(&dest, &rsync, id, &format!("{}.txt", id), "x").await;
    }

    let src_root = tmp.path().join("a");
    let mut src = new_replica(&src_root, "a");
    for id in [1, 2] {
        commit(&src, &rsync, id, &format!("{}.txt", id), "x").await;
    }
    src.add_peer("b", &dest_root.to_string_lossy()).unwrap();

    let mut coordinator = ReplicationCoordinator::new(&src, &rsync);
    let err = coordinator.push("b", &SyncOptions::default()).await.unwrap_err();
    match err {
        CoreError::Command(CommandError::MissingCommits(ref missing)) => {
            assert_eq!(missing, &vec![3])
        }
        ref other => panic!("expected missing commits, got {:?}", other),
    }
    assert_eq!(err.exit_code(), 7);
    assert_eq!(coordinator.state(), SyncState::Failed);
    assert_eq!(commits(&dest, &rsync), set(&[1, 2, 3]));

    let forced = SyncOptions {
        force: true,
        ..Default::default()
    };
    let report = coordinator.push("b", &forced).await.unwrap();
    assert_eq!(report.state, SyncState::Resolved);
    assert_eq!(report.outcome, SyncOutcome::Synchronized { commit: Some(2) });
    assert_eq!(commits(&dest, &rsync), set(&[1, 2]));
    assert_eq!(ledger_files(&src_root), vec!["2_a.txt", "2_b.txt"]);
    assert_eq!(ledger_files(&dest_root), vec!["2_a.txt", "2_b.txt"]);
}

#[tokio::test]
async fn test_dry_run_changes_nothing() {
    if !rsync_available() {
        eprintln!("SKIPPED: rsync not found in PATH");
        return;
    }

    let tmp = TempDir::new().unwrap();
    let rsync = RsyncClient::default();
    let dest_root = tmp.path().join("b");
    let dest = new_replica(&dest_root, "b");

    let src_root = tmp.path().join("a");
    let mut src = new_replica(&src_root, "a");
    commit(&src, &rsync, 1, "a.txt", "a").await;
    src.add_peer("b", &dest_root.to_string_lossy()).unwrap();

    let opts = SyncOptions {
        dry_run: true,
        ..Default::default()
    };
    let report = ReplicationCoordinator::new(&src, &rsync)
        .push("b", &opts)
        .await
        .unwrap();
    assert_eq!(report.outcome, SyncOutcome::DryRun);
    assert!(commits(&dest, &rsync).is_empty());
    assert!(!dest_root.join("a.txt").exists());
    assert!(!src_root.join(".ys/sync").exists());
}

// ===========================================================================
// Clone and partial pull
// ===========================================================================

async fn clone_from(source_root: &Path, target: &Path, name: &str, rsync: &RsyncClient) {
    let opts = CloneOptions {
        name: name.into(),
        source: source_root.to_string_lossy().into_owned(),
        directory: Some(target.to_path_buf()),
        cwd: std::env::temp_dir(),
        env: HashMap::new(),
        author: "tester".into(),
    };
    ReplicaBootstrap::new(rsync).clone_replica(&opts).await.unwrap();
}

#[tokio::test]
async fn test_clone_records_ledger_on_both_sides() {
    if !rsync_available() {
        eprintln!("SKIPPED: rsync not found in PATH");
        return;
    }

    let tmp = TempDir::new().unwrap();
    let rsync = RsyncClient::default();
    let a_root = tmp.path().join("a");
    let a = new_replica(&a_root, "a");
    commit(&a, &rsync, 1, "one.txt", "1").await;
    commit(&a, &rsync, 2, "two.txt", "2").await;

    let b_root = tmp.path().join("b");
    clone_from(&a_root, &b_root, "b", &rsync).await;

    let b = open_replica(&b_root);
    assert_eq!(b.name(), "b");
    assert_eq!(commits(&b, &rsync), set(&[1, 2]));
    assert_eq!(std::fs::read_to_string(b_root.join("two.txt")).unwrap(), "2");
    assert!(!b.layout().head_file().exists());
    assert_eq!(
        b.peer("origin").unwrap().location().as_str(),
        format!("{}/", a_root.display())
    );

    assert_eq!(ledger_files(&a_root), vec!["2_a.txt", "2_b.txt"]);
    assert_eq!(ledger_files(&b_root), vec!["2_a.txt", "2_b.txt"]);
    let ledger = SyncLedger::load(b.layout().sync_dir()).unwrap();
    assert_eq!(ledger.repos_at(2), vec!["a", "b"]);
}

#[tokio::test]
async fn test_clone_rolls_back_on_failure() {
    if !rsync_available() {
        eprintln!("SKIPPED: rsync not found in PATH");
        return;
    }

    let tmp = TempDir::new().unwrap();
    let rsync = RsyncClient::default();
    let target = tmp.path().join("b");
    let opts = CloneOptions {
        name: "b".into(),
        source: tmp.path().join("missing").to_string_lossy().into_owned(),
        directory: Some(target.clone()),
        cwd: tmp.path().to_path_buf(),
        env: HashMap::new(),
        author: "tester".into(),
    };
    let err = ReplicaBootstrap::new(&rsync).clone_replica(&opts).await.unwrap_err();
    assert!(matches!(err, CoreError::Transfer(_)));
    assert!(!target.exists());

    // a pre-existing target keeps everything but the configuration directory
    std::fs::create_dir_all(&target).unwrap();
    assert!(ReplicaBootstrap::new(&rsync).clone_replica(&opts).await.is_err());
    assert!(target.exists());
    assert!(!target.join(CONFIG_DIR_NAME).exists());
}

#[tokio::test]
async fn test_partial_pull_fast_forward_has_no_marker() {
    if !rsync_available() {
        eprintln!("SKIPPED: rsync not found in PATH");
        return;
    }

    let tmp = TempDir::new().unwrap();
    let rsync = RsyncClient::default();
    let a_root = tmp.path().join("a");
    let a = new_replica(&a_root, "a");
    commit(&a, &rsync, 1, "one.txt", "1").await;

    let b_root = tmp.path().join("b");
    clone_from(&a_root, &b_root, "b", &rsync).await;
    commit(&a, &rsync, 2, "two.txt", "2").await;

    let b = open_replica(&b_root);
    let opts = SyncOptions {
        partial: true,
        ..Default::default()
    };
    let report = ReplicationCoordinator::new(&b, &rsync)
        .pull("origin", &opts)
        .await
        .unwrap();
    assert_eq!(report.outcome, SyncOutcome::FastForwarded { commit: 2 });
    assert!(!b.layout().merge_file().exists());
    assert!(!b.layout().head_file().exists());
    assert_eq!(commits(&b, &rsync), set(&[1, 2]));
    assert!(b_root.join("two.txt").exists());
    assert_eq!(ledger_files(&b_root), vec!["2_a.txt", "2_b.txt"]);
}

#[tokio::test]
async fn test_partial_pull_divergence_and_merge_commit() {
    if !rsync_available() {
        eprintln!("SKIPPED: rsync not found in PATH");
        return;
    }

    let tmp = TempDir::new().unwrap();
    let rsync = RsyncClient::default();
    let a_root = tmp.path().join("a");
    let a = new_replica(&a_root, "a");
    commit(&a, &rsync, 1, "one.txt", "1").await;
    commit(&a, &rsync, 2, "two.txt", "2").await;

    let b_root = tmp.path().join("b");
    clone_from(&a_root, &b_root, "b", &rsync).await;
    let b = open_replica(&b_root);

    commit(&a, &rsync, 5, "five.txt", "5").await;
    commit(&b, &rsync, 7, "seven.txt", "7").await;

    let opts = SyncOptions {
        partial: true,
        ..Default::default()
    };
    let mut coordinator = ReplicationCoordinator::new(&b, &rsync);

    // pushing diverged histories is refused before any transfer
    let err = coordinator.push("origin", &opts).await.unwrap_err();
    assert!(matches!(err, CoreError::Command(CommandError::PushDiverged { .. })));

    let report = coordinator.pull("origin", &opts).await.unwrap();
    let marker = MergeMarker {
        local_head: 7,
        peer_head: 5,
        common: Some(2),
    };
    assert_eq!(report.outcome, SyncOutcome::Diverged(marker));
    assert_eq!(coordinator.state(), SyncState::Diverged);
    assert_eq!(
        std::fs::read_to_string(b.layout().merge_file()).unwrap(),
        "7,5,2\n"
    );

    // synchronization stays blocked until the merge is committed
    let err = coordinator.pull("origin", &opts).await.unwrap_err();
    assert!(matches!(err, CoreError::Command(CommandError::MergePending(_))));

    let merge = CommitStore::new(&b, &rsync)
        .create_commit_with_id(
            8,
            &CommitOptions {
                message: "merge".into(),
                limit: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(merge.merged, Some(marker));
    assert!(merge.log.contains("Merge: 7 and 5 (common commit 2)"));
    assert!(!b.layout().merge_file().exists());
}

#[tokio::test]
async fn test_partial_pull_restores_tree_when_local_is_ahead() {
    if !rsync_available() {
        eprintln!("SKIPPED: rsync not found in PATH");
        return;
    }

    let tmp = TempDir::new().unwrap();
    let rsync = RsyncClient::default();
    let a_root = tmp.path().join("a");
    let a = new_replica(&a_root, "a");
    commit(&a, &rsync, 1, "notes.txt", "old").await;

    let b_root = tmp.path().join("b");
    clone_from(&a_root, &b_root, "b", &rsync).await;
    let b = open_replica(&b_root);
    commit(&b, &rsync, 2, "notes.txt", "newer text").await;

    let opts = SyncOptions {
        partial: true,
        ..Default::default()
    };
    let report = ReplicationCoordinator::new(&b, &rsync)
        .pull("origin", &opts)
        .await
        .unwrap();
    assert_eq!(report.outcome, SyncOutcome::Synchronized { commit: Some(1) });
    assert_eq!(
        std::fs::read_to_string(b_root.join("notes.txt")).unwrap(),
        "newer text"
    );
    assert!(!b.layout().merge_file().exists());
    assert!(!b.layout().head_file().exists());
    assert_eq!(commits(&b, &rsync), set(&[1, 2]));
    assert!(!Workspace::new(&b, &rsync).has_uncommitted_changes().await.unwrap());
}

#[tokio::test]
async fn test_partial_pull_restores_tree_when_level() {
    if !rsync_available() {
        eprintln!("SKIPPED: rsync not found in PATH");
        return;
    }

    let tmp = TempDir::new().unwrap();
    let rsync = RsyncClient::default();
    let a_root = tmp.path().join("a");
    let a = new_replica(&a_root, "a");
    commit(&a, &rsync, 1, "notes.txt", "committed").await;

    let b_root = tmp.path().join("b");
    clone_from(&a_root, &b_root, "b", &rsync).await;
    let b = open_replica(&b_root);

    // uncommitted work on the peer is not taken over
    std::fs::write(a_root.join("notes.txt"), "edited on a, never committed").unwrap();

    let opts = SyncOptions {
        partial: true,
        ..Default::default()
    };
    ReplicationCoordinator::new(&b, &rsync)
        .pull("origin", &opts)
        .await
        .unwrap();
    assert_eq!(
        std::fs::read_to_string(b_root.join("notes.txt")).unwrap(),
        "committed"
    );
    assert!(!b.layout().merge_file().exists());
}

#[cfg(unix)]
#[tokio::test]
async fn test_failed_transfer_leaves_ledger_and_head_untouched() {
    if !rsync_available() {
        eprintln!("SKIPPED: rsync not found in PATH");
        return;
    }

    let tmp = TempDir::new().unwrap();
    let rsync = RsyncClient::default();
    let dest_root = tmp.path().join("b");
    let dest = new_replica(&dest_root, "b");
    let src_root = tmp.path().join("a");
    let mut src = new_replica(&src_root, "a");
    commit(&src, &rsync, 1, "a.txt", "a").await;
    src.add_peer("b", &dest_root.to_string_lossy()).unwrap();

    ReplicationCoordinator::new(&src, &rsync)
        .push("b", &SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(ledger_files(&src_root), vec!["1_a.txt", "1_b.txt"]);
    commit(&src, &rsync, 2, "b.txt", "b").await;

    let failing = scripted_rsync(
        tmp.path(),
        r#"for arg in "$@"; do
  if [ "$arg" = "-avH" ]; then
    echo "rsync: connection unexpectedly closed" >&2
    exit 12
  fi
done
exec rsync "$@"
"#,
    );
    let mut coordinator = ReplicationCoordinator::new(&src, &failing);
    let err = coordinator.push("b", &SyncOptions::default()).await.unwrap_err();
    match err {
        CoreError::Transfer(ref t) => {
            assert_eq!(t.exit_code, 12);
            assert_eq!(t.context.as_deref(), Some("while pushing to b"));
            assert!(t.stderr.contains("connection unexpectedly closed"));
        }
        other => panic!("expected a transfer error, got {:?}", other),
    }
    assert_eq!(err.exit_code(), 12);
    assert_eq!(coordinator.state(), SyncState::Failed);

    assert_eq!(ledger_files(&src_root), vec!["1_a.txt", "1_b.txt"]);
    assert_eq!(ledger_files(&dest_root), vec!["1_a.txt", "1_b.txt"]);
    assert_eq!(commits(&dest, &rsync), set(&[1]));
    assert!(!src.layout().head_file().exists());
    assert!(!dest.layout().head_file().exists());
}

#[cfg(unix)]
#[tokio::test]
async fn test_clone_rollback_restores_published_ledger() {
    if !rsync_available() {
        eprintln!("SKIPPED: rsync not found in PATH");
        return;
    }

    let tmp = TempDir::new().unwrap();
    let rsync = RsyncClient::default();
    let a_root = tmp.path().join("a");
    let a = new_replica(&a_root, "a");
    commit(&a, &rsync, 1, "one.txt", "1").await;
    std::fs::create_dir_all(a.layout().sync_dir()).unwrap();
    std::fs::write(a.layout().sync_dir().join("1_c.txt"), "").unwrap();

    // the ledger publish to the source succeeds, then reports failure
    let b_root = tmp.path().join("b");
    let publish_source = format!("{}/", b_root.join(CONFIG_DIR_NAME).join("sync").display());
    let flaky = scripted_rsync(
        tmp.path(),
        &format!(
            r#"rsync "$@" || exit $?
for arg in "$@"; do
  if [ "$arg" = "{}" ]; then
    exit 23
  fi
done
exit 0
"#,
            publish_source
        ),
    );

    let opts = CloneOptions {
        name: "b".into(),
        source: a_root.to_string_lossy().into_owned(),
        directory: Some(b_root.clone()),
        cwd: tmp.path().to_path_buf(),
        env: HashMap::new(),
        author: "tester".into(),
    };
    let err = ReplicaBootstrap::new(&flaky).clone_replica(&opts).await.unwrap_err();
    assert_eq!(err.exit_code(), 23);

    assert_eq!(ledger_files(&a_root), vec!["1_c.txt"]);
    assert!(!b_root.exists());
    assert_eq!(commits(&a, &rsync), set(&[1]));
}

#[cfg(unix)]
#[tokio::test]
async fn test_push_transfer_keeps_peer_ledger_when_publish_fails() {
    if !rsync_available() {
        eprintln!("SKIPPED: rsync not found in PATH");
        return;
    }

    let tmp = TempDir::new().unwrap();
    let rsync = RsyncClient::default();
    let dest_root = tmp.path().join("b");
    let dest = new_replica(&dest_root, "b");
    commit(&dest, &rsync, 1, "a.txt", "a").await;
    std::fs::create_dir_all(dest.layout().sync_dir()).unwrap();
    std::fs::write(dest.layout().sync_dir().join("1_c.txt"), "").unwrap();

    let src_root = tmp.path().join("a");
    let mut src = new_replica(&src_root, "a");
    commit(&src, &rsync, 1, "a.txt", "a").await;
    commit(&src, &rsync, 2, "b.txt", "b").await;
    src.add_peer("b", &dest_root.to_string_lossy()).unwrap();

    let publish_source = format!("{}/", src.layout().sync_dir().display());
    let flaky = scripted_rsync(
        tmp.path(),
        &format!(
            r#"for arg in "$@"; do
  if [ "$arg" = "{}" ]; then
    exit 23
  fi
done
exec rsync "$@"
"#,
            publish_source
        ),
    );
    let err = ReplicationCoordinator::new(&src, &flaky)
        .push("b", &SyncOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.exit_code(), 23);

    // the working tree and commits arrived, the peer's ledger was not pruned
    assert_eq!(commits(&dest, &rsync), set(&[1, 2]));
    assert_eq!(ledger_files(&dest_root), vec!["1_c.txt"]);
}
