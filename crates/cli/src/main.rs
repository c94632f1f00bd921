//! yarsync command-line tool.
//!
//! Parses arguments, builds the [`ReplicaContext`] from the process
//! environment once, calls into `yarsync-core`, and maps core errors to
//! exit codes.

mod style;
mod sync;
mod tree;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use yarsync_core::commit_store::{CommitOptions, CommitStore};
use yarsync_core::config::{ContextOptions, ReplicaContext};
use yarsync_core::errors::{CoreError, EXIT_CONFIG_ERROR};
use yarsync_core::layout::CONFIG_DIR_NAME;
use yarsync_core::models::CommitId;
use yarsync_core::rsync::RsyncClient;

use style::Printer;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// Synchronize replicas of a directory with a history of hardlinked commits.
#[derive(Parser, Debug)]
#[command(
    name = "yarsync",
    version,
    about = "Yet another rsync: replica synchronization with commits"
)]
struct Cli {
    /// Configuration directory; requires --root-dir.
    #[arg(long, global = true, value_name = "DIR")]
    config_dir: Option<PathBuf>,

    /// Root of the working tree; requires --config-dir.
    #[arg(long, global = true, value_name = "DIR")]
    root_dir: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print nothing on success.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize a replica in the current directory.
    Init {
        /// Replica name; defaults to the host name.
        name: Option<String>,
    },

    /// Snapshot the working tree.
    Commit {
        /// Commit message.
        #[arg(short, long, default_value = "")]
        message: String,

        /// Keep at most this many commits (persisted).
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        limit: Option<u64>,
    },

    /// Restore the working tree from a commit.
    Checkout {
        /// Show what would change without changing it.
        #[arg(short = 'n', long)]
        dry_run: bool,

        commit: CommitId,
    },

    /// Compare two commits.
    Diff {
        commit: CommitId,

        /// Defaults to the checked-out commit.
        other: Option<CommitId>,
    },

    /// Print the commit history.
    Log {
        /// Maximum number of entries.
        #[arg(short = 'n', long)]
        max_count: Option<usize>,

        /// Oldest first.
        #[arg(short, long)]
        reverse: bool,
    },

    /// Print the given commits.
    Show {
        #[arg(required = true)]
        commits: Vec<CommitId>,
    },

    /// Show changes since the last commit and synchronization state.
    Status,

    /// Send commits and the working tree to a remote.
    Push(SyncArgs),

    /// Fetch commits and the working tree from a remote.
    Pull(SyncArgs),

    /// Create a replica from an existing one.
    Clone {
        /// Name of the new replica.
        name: String,

        /// Path or host:path of an existing replica.
        source: String,

        /// Target directory; defaults to the source's last path component.
        directory: Option<PathBuf>,
    },

    /// Manage remotes.
    Remote {
        /// Show remote paths.
        #[arg(short, long)]
        verbose: bool,

        #[command(subcommand)]
        action: Option<RemoteAction>,
    },
}

#[derive(Args, Debug)]
struct SyncArgs {
    /// Skip health checks and the missing-commit check.
    #[arg(short, long)]
    force: bool,

    /// Keep files missing on the source and reconcile histories afterwards.
    #[arg(long)]
    new: bool,

    /// Show what would be transferred without changing anything.
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Keep replaced files with a ~ suffix.
    #[arg(long, conflicts_with = "backup_dir")]
    backup: bool,

    /// Move replaced files to this directory on the receiving side.
    #[arg(long, value_name = "DIR")]
    backup_dir: Option<String>,

    /// Remote name from config.ini, or the path of a replica.
    remote: String,
}

#[derive(Subcommand, Debug)]
enum RemoteAction {
    /// Add a remote.
    Add { name: String, path: String },

    /// Remove a remote.
    #[command(alias = "remove")]
    Rm { name: String },

    /// List remotes.
    Show {
        #[arg(short, long)]
        verbose: bool,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = match e.downcast_ref::<CoreError>() {
                Some(CoreError::Transfer(t)) => {
                    if !t.stderr.trim().is_empty() {
                        eprint!("{}", t.stderr);
                    }
                    t.exit_code
                }
                Some(core) => core.exit_code(),
                None => EXIT_CONFIG_ERROR,
            };
            eprintln!("{}", style::error(&format!("{:#}", e)));
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let out = Printer::new(cli.quiet);
    let opts = context_options(&cli)?;
    let rsync = RsyncClient::default();

    match cli.command {
        Commands::Init { name } => cmd_init(&opts, name, out),
        Commands::Clone {
            name,
            source,
            directory,
        } => sync::cmd_clone(&opts, &rsync, name, source, directory, out).await,
        command => {
            let mut ctx = ReplicaContext::discover(&opts)?;
            debug!(root = %ctx.root().display(), replica = %ctx.name(), "opened replica");
            match command {
                Commands::Commit { message, limit } => {
                    cmd_commit(&ctx, &rsync, message, limit, out).await
                }
                Commands::Checkout { dry_run, commit } => {
                    tree::cmd_checkout(&ctx, &rsync, commit, dry_run, out).await
                }
                Commands::Diff { commit, other } => {
                    tree::cmd_diff(&ctx, &rsync, commit, other, out).await
                }
                Commands::Log { max_count, reverse } => {
                    tree::cmd_log(&ctx, &rsync, max_count, reverse, out)
                }
                Commands::Show { commits } => tree::cmd_show(&ctx, &rsync, &commits, out),
                Commands::Status => tree::cmd_status(&ctx, &rsync, out).await,
                Commands::Push(args) => sync::cmd_push(&ctx, &rsync, &args, out).await,
                Commands::Pull(args) => sync::cmd_pull(&ctx, &rsync, &args, out).await,
                Commands::Remote { verbose, action } => cmd_remote(&mut ctx, verbose, action, out),
                Commands::Init { .. } | Commands::Clone { .. } => Ok(()),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Context helpers
// ---------------------------------------------------------------------------

fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

/// Capture the process environment once.
fn context_options(cli: &Cli) -> Result<ContextOptions> {
    let cwd = std::env::current_dir().context("failed to read the working directory")?;
    let env: HashMap<String, String> = std::env::vars().collect();
    Ok(ContextOptions {
        cwd,
        root_dir: cli.root_dir.as_deref().map(expand_tilde),
        config_dir: cli.config_dir.as_deref().map(expand_tilde),
        env,
        author: whoami::username(),
    })
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

fn cmd_init(opts: &ContextOptions, name: Option<String>, out: Printer) -> Result<()> {
    let config_dir = if opts.root_dir.is_none() && opts.config_dir.is_none() {
        opts.cwd.join(CONFIG_DIR_NAME)
    } else {
        opts.locate()?.1
    };
    let name = match name {
        Some(name) => name,
        None => whoami::fallible::hostname().context("failed to read the host name")?,
    };

    let report = ReplicaContext::init(&config_dir, &name)?;
    if report.created_dir {
        out.line(format!("mkdir {}", config_dir.display()));
    }
    if report.created_config {
        out.line(format!("created {}", config_dir.join("config.ini").display()));
    }
    if report.created_name {
        out.line(style::success(&format!(
            "initialized yarsync replica '{}' in {}",
            report.name,
            config_dir.display()
        )));
    } else {
        out.line(format!(
            "replica '{}' already initialized in {}",
            report.name,
            config_dir.display()
        ));
    }
    Ok(())
}

async fn cmd_commit(
    ctx: &ReplicaContext,
    rsync: &RsyncClient,
    message: String,
    limit: Option<u64>,
    out: Printer,
) -> Result<()> {
    let limit = limit
        .map(usize::try_from)
        .transpose()
        .context("commit limit is too large")?;
    let opts = CommitOptions { message, limit };
    let report = CommitStore::new(ctx, rsync).create_commit(&opts).await?;

    out.line(style::dim(&report.command));
    out.line(format!("commit {} created", report.id));
    out.blank();
    out.text(&report.log);
    if !report.log_written {
        out.line(style::warn("the commit log could not be written"));
    }
    if let Some(marker) = report.merged {
        out.line(style::success(&format!(
            "merge of {} and {} recorded",
            marker.local_head, marker.peer_head
        )));
    }
    if !report.pruned.is_empty() {
        let ids: Vec<String> = report.pruned.iter().map(|id| id.to_string()).collect();
        out.line(format!("removed old commits: {}", ids.join(", ")));
    }
    Ok(())
}

fn cmd_remote(
    ctx: &mut ReplicaContext,
    verbose: bool,
    action: Option<RemoteAction>,
    out: Printer,
) -> Result<()> {
    match action {
        Some(RemoteAction::Add { name, path }) => {
            ctx.add_peer(&name, &path)?;
            out.line(style::success(&format!("added remote {}", name)));
        }
        Some(RemoteAction::Rm { name }) => {
            ctx.remove_peer(&name)?;
            out.line(style::success(&format!("removed remote {}", name)));
        }
        Some(RemoteAction::Show { verbose: v }) => show_remotes(ctx, verbose || v, out),
        None => show_remotes(ctx, verbose, out),
    }
    Ok(())
}

fn show_remotes(ctx: &ReplicaContext, verbose: bool, out: Printer) {
    if ctx.peers().is_empty() {
        out.line("No remotes found");
        return;
    }
    if !verbose {
        for peer in ctx.peers().iter() {
            out.line(&peer.name);
        }
        return;
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Name", "Location"]);
    for peer in ctx.peers().iter() {
        table.add_row(vec![
            Cell::new(&peer.name),
            Cell::new(peer.location().as_str()),
        ]);
    }
    out.line(table.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_sync_flags() {
        let cli = Cli::try_parse_from(["yarsync", "pull", "--new", "-n", "origin"]).unwrap();
        match cli.command {
            Commands::Pull(args) => {
                assert!(args.new && args.dry_run && !args.force);
                assert_eq!(args.remote, "origin");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cli_rejects_conflicting_backup_flags() {
        let err = Cli::try_parse_from(["yarsync", "push", "--backup", "--backup-dir", "b", "r"])
            .unwrap_err();
        assert!(err.use_stderr());
    }

    #[test]
    fn test_cli_rejects_zero_limit() {
        assert!(Cli::try_parse_from(["yarsync", "commit", "--limit", "0"]).is_err());
        assert!(Cli::try_parse_from(["yarsync", "commit", "-m", "x", "--limit", "2"]).is_ok());
    }

    #[test]
    fn test_expand_tilde() {
        let expanded = expand_tilde(Path::new("~/data"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expanded, home.join("data"));
        }
        assert_eq!(expand_tilde(Path::new("/srv")), PathBuf::from("/srv"));
    }
}
