use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// How a task should be relaunched after its process exits on its own
/// (independent of watch-triggered restarts).
///
/// Resolves the manifest's historical `restart` field: absent is `Never`
/// (today's default — run once), `true` is `Always`, and `"on-failure"` is
/// `OnFailure`. A restart under this policy and a watch-triggered restart
/// feed the same per-task mailbox (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    #[default]
    Never,
    Always,
    OnFailure,
}

/// Immutable, per-task configuration as loaded from the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Unique, non-empty task name.
    pub name: String,

    /// Opaque shell command, or the first element of a pre-tokenised argv
    /// when `use_shell` is false.
    pub command: String,

    /// Working directory; defaults to the supervisor's cwd when `None`.
    #[serde(default)]
    pub working_directory: Option<PathBuf>,

    /// Environment overlaid onto the inherited environment. Task values win.
    #[serde(default)]
    pub environment: HashMap<String, String>,

    #[serde(default = "default_true")]
    pub use_shell: bool,

    #[serde(default)]
    pub watch_enabled: bool,

    #[serde(default)]
    pub restart: RestartPolicy,
}

fn default_true() -> bool {
    true
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            working_directory: None,
            environment: HashMap::new(),
            use_shell: true,
            watch_enabled: false,
            restart: RestartPolicy::Never,
        }
    }
}

/// The ordered set of task names plus their specs, as loaded from a manifest.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub order: Vec<String>,
    pub tasks: HashMap<String, TaskSpec>,
}

impl Manifest {
    /// Validates the invariants from the data model: every name in `order`
    /// has an entry in `tasks`, and every spec has a non-empty command.
    pub fn validate(&self) -> crate::error::Result<()> {
        for name in &self.order {
            let spec = self.tasks.get(name).ok_or_else(|| {
                crate::error::Error::ManifestValidation(format!(
                    "unknown task `{name}` listed in `tasks`"
                ))
            })?;
            if spec.command.trim().is_empty() {
                return Err(crate::error::Error::ManifestValidation(format!(
                    "task `{name}` has an empty command"
                )));
            }
        }
        Ok(())
    }

    /// Look up a task spec, erroring with `UnknownTask` if absent.
    pub fn get(&self, name: &str) -> crate::error::Result<&TaskSpec> {
        self.tasks
            .get(name)
            .ok_or_else(|| crate::error::Error::UnknownTask(name.to_string()))
    }
}

/// What the front-end asked the core to do.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Task names to run, in the order they should be displayed. Either the
    /// full manifest order, or an explicit user-provided subset.
    pub selected: Vec<String>,
    pub verbose: bool,
    pub global_watch: bool,
}

impl RunRequest {
    /// Build a request from a manifest and an optional explicit name list.
    /// An empty `names` means "all tasks from the manifest".
    pub fn new(
        manifest: &Manifest,
        names: &[String],
        verbose: bool,
        global_watch: bool,
    ) -> crate::error::Result<Self> {
        let selected = if names.is_empty() {
            manifest.order.clone()
        } else {
            for name in names {
                manifest.get(name)?;
            }
            names.to_vec()
        };
        Ok(Self {
            selected,
            verbose,
            global_watch,
        })
    }

    /// The watched set per §4.3: tasks with `watch_enabled` set, plus (if
    /// `global_watch`) every selected task.
    pub fn watched_tasks<'a>(&self, manifest: &'a Manifest) -> Vec<&'a str> {
        self.selected
            .iter()
            .filter_map(|name| {
                let spec = manifest.tasks.get(name)?;
                if self.global_watch || spec.watch_enabled {
                    Some(name.as_str())
                } else {
                    None
                }
            })
            .collect()
    }
}

/// Per-task mutable status, owned exclusively by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Idle,
    Running,
    ExitedSuccess,
    ExitedFailure,
    /// Cancelled, either because of root-initiated shutdown (`false`) or
    /// because a sibling task's failure triggered fail-fast (`true`).
    Cancelled { due_to_failure: bool },
}

impl TaskStatus {
    /// Dashboard status vocabulary per SPEC_FULL.md §9: cancellation renders
    /// as `done` unless it was fail-fast-triggered, in which case `failed`.
    pub fn dashboard_label(&self) -> &'static str {
        match self {
            TaskStatus::Idle => "idle",
            TaskStatus::Running => "running",
            TaskStatus::ExitedSuccess => "done",
            TaskStatus::ExitedFailure => "failed",
            TaskStatus::Cancelled { due_to_failure: true } => "failed",
            TaskStatus::Cancelled { due_to_failure: false } => "done",
        }
    }
}

/// Which stream a `LogEvent` line came from. Reserved for the dashboard; the
/// line-prefix sink multiplexes both streams onto stdout undifferentiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Out,
    Err,
}

/// A single labelled output line, produced by a line-splitter and consumed
/// by exactly one sink.
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub task: String,
    /// Line content, no trailing newline. May be a partial line, split at
    /// the implementation's maximum length (see `executor::MAX_LINE_BYTES`).
    pub line: Vec<u8>,
    pub stream: Stream,
    pub timestamp: std::time::SystemTime,
}

impl LogEvent {
    pub fn new(task: impl Into<String>, line: Vec<u8>, stream: Stream) -> Self {
        Self {
            task: task.into(),
            line,
            stream,
            timestamp: std::time::SystemTime::now(),
        }
    }
}

/// The terminal outcome of one executor run.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task: String,
    pub outcome: TaskOutcome,
}

#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Success,
    Failure { exit_code: Option<i32>, message: Option<String> },
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest() -> Manifest {
        let mut tasks = HashMap::new();
        tasks.insert("hello".to_string(), TaskSpec::new("hello", "echo hello"));
        tasks.insert("world".to_string(), TaskSpec::new("world", "echo world"));
        Manifest {
            order: vec!["hello".to_string(), "world".to_string()],
            tasks,
        }
    }

    #[test]
    fn validate_accepts_well_formed_manifest() {
        assert!(sample_manifest().validate().is_ok());
    }

    #[test]
    fn validate_rejects_unknown_order_entry() {
        let mut m = sample_manifest();
        m.order.push("ghost".to_string());
        assert!(m.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_command() {
        let mut m = sample_manifest();
        m.tasks.get_mut("hello").unwrap().command = "   ".to_string();
        assert!(m.validate().is_err());
    }

    #[test]
    fn run_request_defaults_to_full_order() {
        let m = sample_manifest();
        let req = RunRequest::new(&m, &[], false, false).unwrap();
        assert_eq!(req.selected, vec!["hello", "world"]);
    }

    #[test]
    fn run_request_rejects_unknown_name() {
        let m = sample_manifest();
        let err = RunRequest::new(&m, &["ghost".to_string()], false, false);
        assert!(err.is_err());
    }

    #[test]
    fn watched_tasks_honours_global_watch() {
        let m = sample_manifest();
        let req = RunRequest::new(&m, &[], false, true).unwrap();
        let watched = req.watched_tasks(&m);
        assert_eq!(watched.len(), 2);
    }

    #[test]
    fn watched_tasks_honours_per_task_flag() {
        let mut m = sample_manifest();
        m.tasks.get_mut("hello").unwrap().watch_enabled = true;
        let req = RunRequest::new(&m, &[], false, false).unwrap();
        assert_eq!(req.watched_tasks(&m), vec!["hello"]);
    }

    #[test]
    fn dashboard_label_distinguishes_cancellation_cause() {
        assert_eq!(
            TaskStatus::Cancelled { due_to_failure: true }.dashboard_label(),
            "failed"
        );
        assert_eq!(
            TaskStatus::Cancelled { due_to_failure: false }.dashboard_label(),
            "done"
        );
    }
}
