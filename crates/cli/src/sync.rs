//! Synchronization commands: `push`, `pull`, `clone`.

use std::path::PathBuf;

use anyhow::Result;

use yarsync_core::bootstrap::CloneOptions;
use yarsync_core::config::ContextOptions;
use yarsync_core::coordinator::{SyncOutcome, SyncReport};
use yarsync_core::models::MergeMarker;
use yarsync_core::rsync::RsyncClient;
use yarsync_core::{ReplicaBootstrap, ReplicaContext, ReplicationCoordinator, SyncOptions};

use crate::style::{self, Printer};
use crate::SyncArgs;

impl SyncArgs {
    fn options(&self) -> SyncOptions {
        SyncOptions {
            force: self.force,
            partial: self.new,
            dry_run: self.dry_run,
            backup: self.backup,
            backup_dir: self.backup_dir.clone(),
        }
    }
}

pub async fn cmd_push(
    ctx: &ReplicaContext,
    rsync: &RsyncClient,
    args: &SyncArgs,
    out: Printer,
) -> Result<()> {
    let mut coordinator = ReplicationCoordinator::new(ctx, rsync);
    let spinner = out.spinner(format!("Pushing to {}...", args.remote));
    let result = coordinator.push(&args.remote, &args.options()).await;
    spinner.finish_and_clear();
    print_report(out, &result?);
    Ok(())
}

pub async fn cmd_pull(
    ctx: &ReplicaContext,
    rsync: &RsyncClient,
    args: &SyncArgs,
    out: Printer,
) -> Result<()> {
    let mut coordinator = ReplicationCoordinator::new(ctx, rsync);
    let spinner = out.spinner(format!("Pulling from {}...", args.remote));
    let result = coordinator.pull(&args.remote, &args.options()).await;
    spinner.finish_and_clear();
    print_report(out, &result?);
    Ok(())
}

pub async fn cmd_clone(
    ctx_opts: &ContextOptions,
    rsync: &RsyncClient,
    name: String,
    source: String,
    directory: Option<PathBuf>,
    out: Printer,
) -> Result<()> {
    let opts = CloneOptions {
        name,
        source,
        directory,
        cwd: ctx_opts.cwd.clone(),
        env: ctx_opts.env.clone(),
        author: ctx_opts.author.clone(),
    };

    let spinner = out.spinner(format!("Cloning {}...", opts.source));
    let result = ReplicaBootstrap::new(rsync).clone_replica(&opts).await;
    spinner.finish_and_clear();
    let report = result?;

    if report.fetched_filter {
        out.line("fetched rsync-filter");
    }
    print_report(out, &report.sync);
    out.line(style::success(&format!(
        "cloned '{}' into {}",
        opts.name,
        report.root.display()
    )));
    Ok(())
}

fn print_report(out: Printer, report: &SyncReport) {
    out.line(style::dim(&report.command));
    out.text(&report.transfer_output);
    if !report.transfer_output.is_empty() && !report.transfer_output.ends_with('\n') {
        out.blank();
    }

    let peer = match report.peer_name {
        Some(ref name) if name != &report.peer => format!("{} ({})", report.peer, name),
        _ => report.peer.clone(),
    };
    match report.outcome {
        SyncOutcome::DryRun => out.line(format!("dry run: nothing changed on {}", peer)),
        SyncOutcome::Synchronized { commit: Some(id) } => out.line(style::success(&format!(
            "{} complete: synchronized with {} at commit {}",
            report.direction, peer, id
        ))),
        SyncOutcome::Synchronized { commit: None } => out.line(style::success(&format!(
            "{} complete: {} has no commits yet",
            report.direction, peer
        ))),
        SyncOutcome::FastForwarded { commit } => out.line(style::success(&format!(
            "fast-forwarded to commit {} from {}",
            commit, peer
        ))),
        SyncOutcome::Diverged(ref marker) => print_merge_help(out, marker),
    }
}

fn print_merge_help(out: Printer, marker: &MergeMarker) {
    out.line(style::warn(&format!(
        "histories diverged: local {} and remote {}",
        marker.local_head, marker.peer_head
    )));
    match marker.common {
        Some(common) => out.line(format!("the latest common commit is {}", common)),
        None => out.line("there is no common commit"),
    }
    out.line("Both sets of files are now in the working directory. To finish the merge:");
    out.line(format!(
        "  compare with the commits, e.g. yarsync diff {} {}",
        marker.local_head, marker.peer_head
    ));
    out.line("  resolve the files by hand, then run yarsync commit");
    out.line("  synchronize with push or pull as usual");
}
