//! Working-tree commands: `status`, `checkout`, `diff`, `log`, `show`.

use anyhow::Result;

use yarsync_core::models::CommitId;
use yarsync_core::rsync::RsyncClient;
use yarsync_core::workspace::{Comparison, LogRecord, SyncSummary, Workspace};
use yarsync_core::ReplicaContext;

use crate::style::{self, Printer};

fn print_changes(out: Printer, comparison: &Comparison) {
    for change in &comparison.changes {
        out.line(style::change(&change.flags, &change.path));
    }
}

fn print_records(out: Printer, records: &[LogRecord]) {
    for (i, record) in records.iter().enumerate() {
        if i > 0 {
            out.blank();
        }
        out.text(&record.render());
    }
}

pub async fn cmd_status(ctx: &ReplicaContext, rsync: &RsyncClient, out: Printer) -> Result<()> {
    let report = Workspace::new(ctx, rsync).status().await?;

    match report.comparison {
        None => out.line("No commits found"),
        Some(ref comparison) if comparison.is_clean() => {
            out.line("Nothing to commit, working directory clean.");
        }
        Some(ref comparison) => {
            out.line(style::header("Changes since last commit:"));
            out.line(style::dim(&comparison.command));
            print_changes(out, comparison);
        }
    }

    if let Some(id) = report.detached {
        out.line(style::warn(&format!(
            "HEAD is detached at commit {}; commit or check out the newest commit before synchronizing",
            id
        )));
    }
    if let Some(marker) = report.merge {
        out.line(style::warn(&format!(
            "merging {} and {} (common ancestor {}); commit to finish the merge",
            marker.local_head,
            marker.peer_head,
            marker
                .common
                .map(|c| c.to_string())
                .unwrap_or_else(|| "none".into())
        )));
    }

    match report.sync {
        SyncSummary::NoInformation => out.line("No synchronization information found."),
        SyncSummary::UpToDate(replicas) => {
            out.line(format!("Synchronized with {}.", replicas.join(", ")));
        }
        SyncSummary::Ahead {
            ahead,
            since,
            replicas,
        } => {
            let with = if replicas.is_empty() {
                String::new()
            } else {
                format!(" with {}", replicas.join(", "))
            };
            out.line(format!(
                "{} commit{} made since synchronization at {}{}.",
                ahead,
                if ahead == 1 { "" } else { "s" },
                since,
                with
            ));
        }
    }
    Ok(())
}

pub async fn cmd_checkout(
    ctx: &ReplicaContext,
    rsync: &RsyncClient,
    id: CommitId,
    dry_run: bool,
    out: Printer,
) -> Result<()> {
    let report = Workspace::new(ctx, rsync).checkout(id, dry_run).await?;
    out.line(style::dim(&report.comparison.command));
    print_changes(out, &report.comparison);
    if report.dry_run {
        out.line(format!("dry run: commit {} not checked out", id));
    } else if report.detached {
        out.line(style::warn(&format!(
            "HEAD is now at commit {}, which is not the newest",
            id
        )));
    } else {
        out.line(style::success(&format!("checked out commit {}", id)));
    }
    Ok(())
}

pub async fn cmd_diff(
    ctx: &ReplicaContext,
    rsync: &RsyncClient,
    first: CommitId,
    second: Option<CommitId>,
    out: Printer,
) -> Result<()> {
    let comparison = Workspace::new(ctx, rsync).diff(first, second).await?;
    out.line(style::dim(&comparison.command));
    print_changes(out, &comparison);
    Ok(())
}

pub fn cmd_log(
    ctx: &ReplicaContext,
    rsync: &RsyncClient,
    max: Option<usize>,
    reverse: bool,
    out: Printer,
) -> Result<()> {
    let records = Workspace::new(ctx, rsync).log(max, reverse)?;
    if records.is_empty() {
        out.line("No commits found");
        return Ok(());
    }
    print_records(out, &records);
    Ok(())
}

pub fn cmd_show(
    ctx: &ReplicaContext,
    rsync: &RsyncClient,
    ids: &[CommitId],
    out: Printer,
) -> Result<()> {
    let records = Workspace::new(ctx, rsync).show(ids)?;
    print_records(out, &records);
    Ok(())
}
