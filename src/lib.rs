//! A local process supervisor: reads a declarative task manifest, runs each
//! task as a child process, multiplexes their output onto a single sink with
//! per-task labels, and tears everything down cleanly on an interrupt or a
//! sibling's failure.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use prun::manifest;
//! use prun::model::RunRequest;
//!
//! # #[tokio::main]
//! # async fn main() -> prun::Result<()> {
//! let manifest = manifest::load(std::path::Path::new("prun.toml"))?;
//! let request = RunRequest::new(&manifest, &[], false, false)?;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod error;
pub mod executor;
pub mod manifest;
pub mod model;
pub mod signal;
pub mod sink;
pub mod supervisor;
pub mod watch;

pub use error::{Error, Result};
pub use model::{Manifest, RunRequest, TaskOutcome, TaskResult, TaskSpec};

/// Re-export the cancellation token type used throughout the crate.
pub use tokio_util::sync::CancellationToken;

/// Runs `request` to completion: fans out through the watch layer if any
/// task is watched (per-task `watch` flag or `global_watch`), otherwise
/// through the plain fail-fast supervisor. Either way, every produced
/// `LogEvent` is published on `bus` as tasks run.
pub async fn run(
    request: &RunRequest,
    manifest: &Manifest,
    default_cwd: &std::path::Path,
    root: &CancellationToken,
    bus: bus::Publisher,
) -> Result<Vec<TaskResult>> {
    if request.watched_tasks(manifest).is_empty() {
        supervisor::run(request, manifest, default_cwd, root, bus).await
    } else {
        watch::run(request, manifest, default_cwd, root, bus).await
    }
}
