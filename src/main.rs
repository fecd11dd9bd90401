use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use prun::model::{RunRequest, TaskOutcome, TaskStatus};
use prun::{bus, manifest, sink, signal};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(
    name = "prun",
    about = "Run a declarative task manifest as a local process supervisor",
    long_about = "Spawns each task in the manifest as a child process, interleaves their \
                  output onto stdout with per-task labels, and shuts everything down cleanly \
                  on Ctrl-C or a sibling task's failure.",
    version
)]
struct Cli {
    /// Path to the task manifest
    #[arg(short, long, default_value = "./prun.toml")]
    config: PathBuf,

    /// Enable verbose (debug-level) logging to stderr
    #[arg(short, long)]
    verbose: bool,

    /// List the tasks in the manifest and exit
    #[arg(short, long)]
    list: bool,

    /// Use the interactive dashboard sink instead of line-prefix output
    #[arg(short, long)]
    interactive: bool,

    /// Restart every selected task on filesystem changes
    #[arg(short, long)]
    watch: bool,

    /// Task names to run (default: every task in the manifest, in manifest order)
    tasks: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(if cli.verbose { "debug" } else { "warn" })
            }),
        )
        .with_writer(std::io::stderr)
        .init();

    let manifest = match manifest::load(&cli.config) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("error: {e}");
            return e.exit_code();
        }
    };

    if cli.list {
        for name in &manifest.order {
            println!("{name}");
        }
        return ExitCode::SUCCESS;
    }

    let request = match RunRequest::new(&manifest, &cli.tasks, cli.verbose, cli.watch) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("error: {e}");
            return e.exit_code();
        }
    };

    if request.selected.is_empty() {
        return ExitCode::SUCCESS;
    }

    let default_cwd = match std::env::current_dir() {
        Ok(d) => d,
        Err(e) => {
            eprintln!("error: failed to determine current directory: {e}");
            return ExitCode::FAILURE;
        }
    };

    let root = CancellationToken::new();
    let signal_handle = tokio::spawn(signal::watch_for_shutdown(root.clone()));

    let (tx, rx) = bus::channel(bus::DEFAULT_CAPACITY);

    let sink_handle: tokio::task::JoinHandle<Option<sink::DashboardSink>> = if cli.interactive {
        let names = request.selected.clone();
        tokio::spawn(async move { Some(sink::DashboardSink::new(names).run(rx).await) })
    } else {
        tokio::spawn(async move {
            sink::LinePrefixSink::new().run(rx).await;
            None
        })
    };

    let results = prun::run(&request, &manifest, &default_cwd, &root, tx).await;
    signal_handle.abort();

    let results = match results {
        Ok(r) => r,
        Err(e) => {
            eprintln!("error: {e}");
            let _ = sink_handle.await;
            return e.exit_code();
        }
    };

    if let Ok(Some(mut dashboard)) = sink_handle.await {
        for result in &results {
            dashboard.record_status(result.task.clone(), task_status(&result.outcome, root.is_cancelled()));
        }
        print_dashboard_summary(&request.selected, &dashboard);
    }

    if root.is_cancelled() {
        ExitCode::from(130)
    } else if results.iter().any(|r| matches!(r.outcome, TaskOutcome::Failure { .. })) {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}

/// Maps a terminal `TaskOutcome` onto the dashboard's status vocabulary.
/// `root_cancelled` distinguishes a `Cancelled` outcome caused by a signal-
/// driven root shutdown from one caused by a sibling's fail-fast failure
/// (SPEC_FULL.md §9): the root token is only ever cancelled by the signal
/// router, so a cancelled outcome while root is *not* cancelled must have
/// come from `run_scope.cancel()` in the supervisor/watch layer's fail-fast
/// path instead.
fn task_status(outcome: &TaskOutcome, root_cancelled: bool) -> TaskStatus {
    match outcome {
        TaskOutcome::Success => TaskStatus::ExitedSuccess,
        TaskOutcome::Failure { .. } => TaskStatus::ExitedFailure,
        TaskOutcome::Cancelled => TaskStatus::Cancelled {
            due_to_failure: !root_cancelled,
        },
    }
}

/// The interactive dashboard's chrome (live TUI rendering) is out of this
/// crate's scope; this prints the same per-task status the dashboard tracks
/// once the run has finished.
fn print_dashboard_summary(selected: &[String], dashboard: &sink::DashboardSink) {
    println!("--- task status ---");
    for name in selected {
        let label = dashboard.status_of(name).map(|s| s.dashboard_label()).unwrap_or("idle");
        println!("{name}: {label}");
    }
}
