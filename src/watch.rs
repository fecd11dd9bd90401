use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::event::{EventKind, ModifyKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::bus::Publisher;
use crate::error::{Error, Result};
use crate::executor::{self, should_self_restart};
use crate::model::{Manifest, RunRequest, TaskOutcome, TaskResult, TaskSpec};

/// Quiet period after the last significant filesystem event, after which a
/// coalesced restart pulse is emitted (spec.md §4.3: "500 ms").
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

/// Directory names excluded from recursive registration (spec.md §4.3).
const EXCLUDED_DIRS: &[&str] = &[".git", "node_modules", "vendor", "dist", "build"];

/// Runs `request`'s selected tasks under cancel-and-respawn semantics: tasks
/// in the watched set (per-task `watch` flag, or `global_watch`) are
/// relaunched on debounced filesystem change; everything else runs once
/// (optionally looping on its own `restart` policy) exactly like the plain
/// supervisor.
pub async fn run(
    request: &RunRequest,
    manifest: &Manifest,
    default_cwd: &Path,
    root: &CancellationToken,
    bus: Publisher,
) -> Result<Vec<TaskResult>> {
    let run_scope = root.child_token();
    let watched_names: HashSet<String> = request
        .watched_tasks(manifest)
        .into_iter()
        .map(str::to_string)
        .collect();

    let mut pulses: HashMap<String, Arc<Notify>> = HashMap::new();
    for name in &request.selected {
        pulses.insert(name.clone(), Arc::new(Notify::new()));
    }

    // Keep the watcher alive for the lifetime of this run; dropping it stops
    // delivery. `None` when nothing is watched, so idle tasks cost nothing.
    let _watcher_guard = if watched_names.is_empty() {
        None
    } else {
        let roots = watched_roots(&watched_names, manifest, default_cwd)?;
        let (watcher, fs_rx) = spawn_watcher(&roots)?;

        let debounce_pulses: Vec<Arc<Notify>> = watched_names.iter().map(|n| pulses[n].clone()).collect();
        let debounce_cancel = run_scope.clone();
        tokio::spawn(debounce_loop(fs_rx, debounce_pulses, debounce_cancel));

        Some(watcher)
    };

    let mut set = tokio::task::JoinSet::new();
    for name in &request.selected {
        let spec = manifest.get(name)?.clone();
        let watched = watched_names.contains(name);
        let pulse = pulses[name].clone();
        let cancel = run_scope.clone();
        let bus = bus.clone();
        let default_cwd = default_cwd.to_path_buf();
        let name_owned = name.clone();
        set.spawn(async move {
            let outcome = per_task_loop(spec, default_cwd, pulse, cancel, bus, watched).await;
            (name_owned, outcome)
        });
    }

    let mut results = Vec::new();
    let mut first_failure_seen = false;
    while let Some(joined) = set.join_next().await {
        let (name, outcome) = match joined {
            Ok(pair) => pair,
            Err(join_err) => {
                tracing::warn!("task slot join error: {join_err}");
                continue;
            }
        };
        let is_failure = matches!(outcome, TaskOutcome::Failure { .. });
        if is_failure {
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

fn watched_roots(
    watched_names: &HashSet<String>,
    manifest: &Manifest,
    default_cwd: &Path,
) -> Result<Vec<PathBuf>> {
    let mut roots: Vec<PathBuf> = Vec::new();
    for name in watched_names {
        let spec = manifest.get(name)?;
        let dir = spec
            .working_directory
            .clone()
            .unwrap_or_else(|| default_cwd.to_path_buf());
        if !roots.contains(&dir) {
            roots.push(dir);
        }
    }
    Ok(roots)
}

/// The per-task restart/cancel-and-respawn state machine (spec.md §4.3).
///
/// States `running` / `draining` / `cooldown` are not separate enum values
/// here — they fall out of which branch of the loop body is executing —
/// but they correspond one-to-one with the spec's named states.
async fn per_task_loop(
    task: TaskSpec,
    default_cwd: PathBuf,
    pulse: Arc<Notify>,
    run_scope: CancellationToken,
    bus: Publisher,
    watched: bool,
) -> TaskOutcome {
    loop {
        // RUNNING: race the executor against a restart pulse. Cancellation
        // cascades to `child_cancel` automatically since it is a child of
        // `run_scope`, so a root shutdown is observed here too.
        let child_cancel = run_scope.child_token();
        let mut exec_fut = Box::pin(executor::run(&task, &default_cwd, child_cancel.clone(), bus.clone()));

        let (result, draining) = tokio::select! {
            biased;
            _ = pulse.notified() => {
                // running + pulse -> cancel child scope -> draining.
                child_cancel.cancel();
                ((&mut exec_fut).await, true)
            }
            res = &mut exec_fut => (res, false),
        };

        if run_scope.is_cancelled() {
            return result.unwrap_or(TaskOutcome::Cancelled);
        }

        let outcome = match result {
            Ok(o) => o,
            Err(e) => {
                tracing::warn!(task = %task.name, error = %e, "executor error");
                TaskOutcome::Failure { exit_code: None, message: Some(e.to_string()) }
            }
        };

        if draining {
            // draining -> executor returns -> log "Restarted" -> new child
            // scope -> running. The pulse that triggered this drain was
            // already consumed by the `select!` above, so this transition
            // must happen unconditionally rather than waiting on a second
            // pulse in cooldown.
            tracing::info!(task = %task.name, "restarted");
            drain_pending_pulse(&pulse).await;
            continue;
        }

        if should_self_restart(task.restart, &outcome) {
            tracing::info!(task = %task.name, "restarted");
            drain_pending_pulse(&pulse).await;
            continue;
        }

        if !watched {
            return outcome;
        }

        // COOLDOWN: executor returned with no pending pulse and no
        // self-restart — wait for either.
        tokio::select! {
            _ = run_scope.cancelled() => return outcome,
            _ = pulse.notified() => {
                tracing::info!(task = %task.name, "restarted");
                continue;
            }
        }
    }
}

/// Opportunistically consumes a pulse that coalesced while we were already
/// committed to a restart, so it doesn't trigger a second one immediately.
async fn drain_pending_pulse(pulse: &Notify) {
    let _ = tokio::time::timeout(Duration::ZERO, pulse.notified()).await;
}

fn spawn_watcher(roots: &[PathBuf]) -> Result<(RecommendedWatcher, mpsc::UnboundedReceiver<notify::Event>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if let Ok(event) = res {
            let _ = tx.send(event);
        }
    })
    .map_err(|source| Error::WatchInit { path: PathBuf::new(), source })?;

    for root in roots {
        register_recursive(&mut watcher, root)?;
    }

    Ok((watcher, rx))
}

/// Recursively registers `root` with the watcher, skipping excluded
/// directory names and never following symlinks (breaking any symlink loop
/// by construction, since a symlink is never descended into).
///
/// The root directory itself failing to register is fatal (propagated);
/// any other directory failing is logged and skipped (spec.md §4.3).
fn register_recursive(watcher: &mut RecommendedWatcher, root: &Path) -> Result<()> {
    watcher
        .watch(root, RecursiveMode::NonRecursive)
        .map_err(|source| Error::WatchInit { path: root.to_path_buf(), source })?;
    walk_and_register(watcher, root);
    Ok(())
}

fn walk_and_register(watcher: &mut RecommendedWatcher, dir: &Path) {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "failed to list directory for watching");
            return;
        }
    };

    for entry in entries.flatten() {
        let file_type = match entry.file_type() {
            Ok(ft) => ft,
            Err(_) => continue,
        };
        if file_type.is_symlink() || !file_type.is_dir() {
            continue;
        }
        let name = entry.file_name();
        if !should_descend(&name.to_string_lossy()) {
            continue;
        }
        let path = entry.path();
        if let Err(e) = watcher.watch(&path, RecursiveMode::NonRecursive) {
            tracing::warn!(dir = %path.display(), error = %e, "failed to register watch directory");
            continue;
        }
        walk_and_register(watcher, &path);
    }
}

fn should_descend(name: &str) -> bool {
    !(name.starts_with('.') || EXCLUDED_DIRS.contains(&name))
}

fn is_significant(event: &notify::Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any)
    )
}

/// Debounces raw filesystem events into restart pulses: a significant event
/// opens (or extends) a single global 500ms window; when the window closes
/// without further events, every watched task's mailbox is pulsed once.
async fn debounce_loop(
    mut rx: mpsc::UnboundedReceiver<notify::Event>,
    pulses: Vec<Arc<Notify>>,
    cancel: CancellationToken,
) {
    loop {
        let first = tokio::select! {
            _ = cancel.cancelled() => return,
            ev = rx.recv() => match ev {
                Some(e) => e,
                None => return,
            },
        };
        if !is_significant(&first) {
            continue;
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(DEBOUNCE_WINDOW) => break,
                ev = rx.recv() => match ev {
                    Some(e) if is_significant(&e) => continue,
                    Some(_) => continue,
                    None => return,
                },
            }
        }

        for pulse in &pulses {
            pulse.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, RemoveKind};

    fn create_event() -> notify::Event {
        notify::Event::new(EventKind::Create(CreateKind::File))
    }

    fn remove_event() -> notify::Event {
        notify::Event::new(EventKind::Remove(RemoveKind::File))
    }

    #[test]
    fn create_and_data_modify_are_significant() {
        assert!(is_significant(&create_event()));
        assert!(is_significant(&notify::Event::new(EventKind::Modify(ModifyKind::Data(
            notify::event::DataChange::Content
        )))));
    }

    #[test]
    fn remove_and_rename_are_not_significant() {
        assert!(!is_significant(&remove_event()));
        assert!(!is_significant(&notify::Event::new(EventKind::Modify(ModifyKind::Name(
            notify::event::RenameMode::Any
        )))));
    }

    #[test]
    fn excluded_directory_names_are_skipped() {
        assert!(!should_descend(".git"));
        assert!(!should_descend("node_modules"));
        assert!(!should_descend("vendor"));
        assert!(!should_descend("dist"));
        assert!(!should_descend("build"));
        assert!(!should_descend(".hidden"));
        assert!(should_descend("src"));
    }

    #[tokio::test(start_paused = true)]
    async fn two_events_within_window_produce_one_pulse() {
        let (tx, rx) = mpsc::unbounded_channel();
        let pulse = Arc::new(Notify::new());
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(debounce_loop(rx, vec![pulse.clone()], cancel.clone()));

        tx.send(create_event()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(create_event()).unwrap();

        // Consume the coalesced pulse once the window closes.
        tokio::time::timeout(Duration::from_secs(2), pulse.notified())
            .await
            .expect("expected exactly one pulse after the debounce window");

        // No second pulse should be pending.
        assert!(
            tokio::time::timeout(Duration::from_millis(1), pulse.notified())
                .await
                .is_err()
        );

        cancel.cancel();
        let _ = handle.await;
    }

    #[tokio::test(start_paused = true)]
    async fn insignificant_events_do_not_open_a_window() {
        let (tx, rx) = mpsc::unbounded_channel();
        let pulse = Arc::new(Notify::new());
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(debounce_loop(rx, vec![pulse.clone()], cancel.clone()));
        tx.send(remove_event()).unwrap();

        assert!(
            tokio::time::timeout(Duration::from_millis(700), pulse.notified())
                .await
                .is_err()
        );

        cancel.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn pulse_while_running_restarts_without_a_second_pulse() {
        use crate::bus;
        use crate::model::TaskSpec;

        let (tx, mut rx) = bus::channel(64);
        // Sleeps well past when the pulse fires, so the first run is still
        // `running` (not yet idling in `cooldown`) when it's cancelled.
        let task = TaskSpec::new("ticker", "sleep 0.3 && echo tick");
        let pulse = Arc::new(Notify::new());
        let run_scope = CancellationToken::new();
        let cwd = std::env::current_dir().unwrap();

        let loop_scope = run_scope.clone();
        let pulse_clone = pulse.clone();
        let handle =
            tokio::spawn(async move { per_task_loop(task, cwd, pulse_clone, loop_scope, tx, true).await });

        // One pulse, fired mid-sleep: running -> draining.
        tokio::time::sleep(Duration::from_millis(50)).await;
        pulse.notify_one();

        // The draining run is cancelled before it ever echoes; the restart
        // it triggers should need no further pulse to reach `running` again
        // and produce exactly one "tick".
        let ev = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("expected the post-drain restart to run and emit a line")
            .expect("bus closed unexpectedly");
        assert_eq!(String::from_utf8(ev.line).unwrap(), "tick");

        run_scope.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }
}
