use std::collections::{HashMap, VecDeque};
use std::io::{IsTerminal, Write};
use std::sync::Mutex;

use crate::bus::Subscriber;
use crate::model::{LogEvent, Stream, TaskStatus};

/// Writes `"[" + task + "] " + line + "\n"` to stdout, one write call per
/// event, serialised by a mutex so two lines are never byte-interleaved
/// (spec.md §4.4, §8). Bytes in `line` are written as-is — no encoding is
/// assumed.
pub struct LinePrefixSink {
    out: Mutex<std::io::Stdout>,
    colour: bool,
}

impl LinePrefixSink {
    pub fn new() -> Self {
        let colour = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
        Self {
            out: Mutex::new(std::io::stdout()),
            colour,
        }
    }

    /// Runs the sink's consumer loop until the bus closes.
    pub async fn run(self, mut bus: Subscriber) {
        while let Some(event) = bus.recv().await {
            self.write_event(&event);
        }
    }

    fn write_event(&self, event: &LogEvent) {
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        let mut buf = Vec::with_capacity(event.line.len() + event.task.len() + 8);
        if self.colour {
            buf.extend_from_slice(b"\x1b[1m[");
            buf.extend_from_slice(event.task.as_bytes());
            buf.extend_from_slice(b"]\x1b[0m ");
        } else {
            buf.push(b'[');
            buf.extend_from_slice(event.task.as_bytes());
            buf.extend_from_slice(b"] ");
        }
        buf.extend_from_slice(&event.line);
        buf.push(b'\n');
        let _ = out.write_all(&buf);
        let _ = out.flush();
    }
}

impl Default for LinePrefixSink {
    fn default() -> Self {
        Self::new()
    }
}

/// Maximum recent events retained per task in the dashboard's ring buffer
/// (spec.md §4.4: ">= 500").
pub const RING_CAPACITY: usize = 512;

/// The dashboard's state: per-task status plus a bounded ring of recent
/// events. This is the testable mechanism behind the interactive dashboard;
/// actual terminal rendering (chrome) is out of this crate's scope (§1).
pub struct DashboardSink {
    status: HashMap<String, TaskStatus>,
    events: HashMap<String, VecDeque<LogEvent>>,
    selected: Option<String>,
}

impl DashboardSink {
    pub fn new(tasks: impl IntoIterator<Item = String>) -> Self {
        let mut status = HashMap::new();
        let mut events = HashMap::new();
        for task in tasks {
            status.insert(task.clone(), TaskStatus::Idle);
            events.insert(task, VecDeque::with_capacity(RING_CAPACITY));
        }
        Self {
            status,
            events,
            selected: None,
        }
    }

    /// Selects which task's events are shown by `selected_events`.
    pub fn select(&mut self, task: impl Into<String>) {
        self.selected = Some(task.into());
    }

    pub fn status_of(&self, task: &str) -> Option<TaskStatus> {
        self.status.get(task).copied()
    }

    /// Feeds one bus event into the dashboard's state: first-event-seen
    /// transitions a task's status to `Running`, and the event is pushed
    /// onto that task's ring, evicting the oldest on overflow.
    pub fn record_event(&mut self, event: LogEvent) {
        let status = self.status.entry(event.task.clone()).or_insert(TaskStatus::Idle);
        if matches!(status, TaskStatus::Idle) {
            *status = TaskStatus::Running;
        }
        let ring = self
            .events
            .entry(event.task.clone())
            .or_insert_with(|| VecDeque::with_capacity(RING_CAPACITY));
        if ring.len() >= RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(event);
    }

    /// Applies the supervisor's terminal status report for a task, driven
    /// by executor return rather than by the first-event-seen transition.
    pub fn record_status(&mut self, task: impl Into<String>, status: TaskStatus) {
        self.status.insert(task.into(), status);
    }

    /// The currently selected task's events, oldest first.
    pub fn selected_events(&self) -> Vec<&LogEvent> {
        match &self.selected {
            Some(task) => self.events.get(task).map(|r| r.iter().collect()).unwrap_or_default(),
            None => Vec::new(),
        }
    }

    /// Runs the dashboard's consumer loop until the bus closes, recording
    /// every event as it arrives.
    pub async fn run(mut self, mut bus: Subscriber) -> Self {
        while let Some(event) = bus.recv().await {
            self.record_event(event);
        }
        self
    }
}
