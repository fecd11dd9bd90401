use std::path::Path;

use tokio_util::sync::CancellationToken;

use crate::bus::Publisher;
use crate::executor;
use crate::model::{Manifest, RunRequest, TaskOutcome, TaskResult};

/// Launches one executor per selected task concurrently and applies a
/// fail-fast policy: the first task to terminate with `Failure` cancels the
/// rest (spec.md §4.2). Each task still honours its own `restart` policy
/// independently of the others (`executor::run_with_restart`).
///
/// Returns one `TaskResult` per selected task, in completion order — the
/// first `Failure` in that order is the run's representative error.
pub async fn run(
    request: &RunRequest,
    manifest: &Manifest,
    default_cwd: &Path,
    root: &CancellationToken,
    bus: Publisher,
) -> crate::error::Result<Vec<TaskResult>> {
    let run_scope = root.child_token();

    let mut set = tokio::task::JoinSet::new();
    for name in &request.selected {
        let task = manifest.get(name)?.clone();
        let cancel = run_scope.clone();
        let bus = bus.clone();
        let default_cwd = default_cwd.to_path_buf();
        let name_owned = name.clone();
        set.spawn(async move {
            let outcome = executor::run_with_restart(&task, &default_cwd, cancel, bus).await;
            (name_owned, outcome)
        });
    }

    let mut results = Vec::with_capacity(request.selected.len());
    let mut first_failure_seen = false;
    while let Some(joined) = set.join_next().await {
        let (name, outcome) = match joined {
            Ok(pair) => pair,
            Err(join_err) => {
                tracing::warn!("task join error: {join_err}");
                continue;
            }
        };
        let outcome = match outcome {
            Ok(o) => o,
            Err(e) => {
                tracing::warn!(task = %name, error = %e, "executor error");
                TaskOutcome::Failure { exit_code: None, message: Some(e.to_string()) }
            }
        };

        if matches!(outcome, TaskOutcome::Failure { .. }) {
            if !first_failure_seen {
                first_failure_seen = true;
                run_scope.cancel();
            } else {
                tracing::debug!(task = %name, "additional failure after fail-fast");
            }
        }

        results.push(TaskResult { task: name, outcome });
    }

    Ok(results)
}
