//! Mirrors the backend's greeting job into a local state machine by polling
//! status and the log tail on a fixed interval.

use crate::backend_api::{BackendApi, ControlResponse, LogEntry, StartTaskRequest, TaskRun, TASK_START_PATH};
use crate::error::{Result, ShellError};
use crate::timers::{TickFlow, TimerSet};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub const MIN_TARGET_COUNT: u32 = 1;
pub const MAX_TARGET_COUNT: u32 = 300;
pub const LOG_TAIL: usize = 100;

#[derive(Debug, Clone, Copy)]
pub struct TaskTimings {
    pub poll_interval: Duration,
}

impl Default for TaskTimings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Idle,
    Running,
    Completed,
    Errored,
    Cancelled,
}

impl TaskState {
    /// Maps a backend status string. `idle` only means "cancelled" when we
    /// were watching a run that the backend dropped.
    fn from_backend(status: &str, was_running: bool) -> Self {
        match status {
            "running" => Self::Running,
            "completed" | "limit_reached" => Self::Completed,
            "error" => Self::Errored,
            "cancelled" => Self::Cancelled,
            "idle" if was_running => Self::Cancelled,
            "idle" => Self::Idle,
            other => {
                log::warn!("unknown task status {other:?}; treating as errored");
                Self::Errored
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Errored => "errored",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSnapshot {
    pub state: TaskState,
    pub run: Option<TaskRun>,
    pub logs: Vec<LogEntry>,
    pub polling: bool,
    pub message: String,
}

#[derive(Debug, Clone)]
pub enum TaskEvent {
    Updated(TaskSnapshot),
    /// Emitted once when a watched run reaches a terminal status.
    Finished(TaskSnapshot),
}

pub type TaskObserver = Arc<dyn Fn(&TaskEvent) + Send + Sync>;

struct Watch {
    state: TaskState,
    generation: u64,
    run: Option<TaskRun>,
    logs: Vec<LogEntry>,
    message: String,
    timers: TimerSet,
}

impl Watch {
    fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            state: self.state,
            run: self.run.clone(),
            logs: self.logs.clone(),
            polling: !self.timers.is_empty(),
            message: self.message.clone(),
        }
    }

    fn clear(&mut self) -> u64 {
        self.timers.cancel_all();
        self.generation += 1;
        self.state = TaskState::Idle;
        self.run = None;
        self.logs.clear();
        self.message.clear();
        self.generation
    }
}

struct Shared {
    api: Arc<dyn BackendApi>,
    timings: TaskTimings,
    watch: Mutex<Watch>,
    observer: Option<TaskObserver>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Watch> {
        match self.watch.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn publish(&self, event: TaskEvent) {
        if let Some(observer) = &self.observer {
            observer(&event);
        }
    }
}

#[derive(Clone)]
pub struct TaskMonitor {
    shared: Arc<Shared>,
}

impl TaskMonitor {
    pub fn new(api: Arc<dyn BackendApi>, timings: TaskTimings) -> Self {
        Self::with_observer(api, timings, None)
    }

    pub fn with_observer(api: Arc<dyn BackendApi>, timings: TaskTimings, observer: Option<TaskObserver>) -> Self {
        Self {
            shared: Arc::new(Shared {
                api,
                timings,
                watch: Mutex::new(Watch {
                    state: TaskState::Idle,
                    generation: 0,
                    run: None,
                    logs: Vec::new(),
                    message: String::new(),
                    timers: TimerSet::new(),
                }),
                observer,
            }),
        }
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        self.shared.lock().snapshot()
    }

    pub fn validate_target_count(value: i64) -> Result<u32> {
        match u32::try_from(value) {
            Ok(count) if (MIN_TARGET_COUNT..=MAX_TARGET_COUNT).contains(&count) => Ok(count),
            _ => Err(ShellError::InvalidTargetCount {
                value,
                min: MIN_TARGET_COUNT,
                max: MAX_TARGET_COUNT,
            }),
        }
    }

    pub fn start(&self, target_count: i64, expected_positions: Vec<String>) -> Result<TaskSnapshot> {
        let target_count = Self::validate_target_count(target_count)?;
        {
            let watch = self.shared.lock();
            if watch.state == TaskState::Running && !watch.timers.is_empty() {
                return Err(ShellError::InvalidTransition {
                    action: "start".to_string(),
                    subject: "the task",
                    state: watch.state.as_str().to_string(),
                });
            }
        }

        let expected_positions: Vec<String> = expected_positions
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        log::info!("starting greeting task: target={target_count} positions={expected_positions:?}");
        let request = StartTaskRequest {
            target_count,
            expected_positions,
        };
        let accepted = self.shared.api.start_task(&request)?;
        if !accepted.success {
            return Err(ShellError::BackendRejected {
                endpoint: TASK_START_PATH.to_string(),
                status: 200,
                detail: accepted.message,
            });
        }

        let mut watch = self.shared.lock();
        let generation = watch.clear();
        watch.state = TaskState::Running;
        watch.message = accepted.message;
        self.arm_poll(&mut watch, generation)?;
        let snapshot = watch.snapshot();
        drop(watch);
        self.shared.publish(TaskEvent::Updated(snapshot.clone()));
        Ok(snapshot)
    }

    /// Picks up whatever the backend is doing right now, resuming the poll
    /// loop if a run is in progress.
    pub fn attach(&self) -> Result<TaskSnapshot> {
        let run = self.shared.api.task_status()?;
        let logs = self.shared.api.task_logs(LOG_TAIL)?;

        let mut watch = self.shared.lock();
        let was_running = watch.state == TaskState::Running;
        watch.state = TaskState::from_backend(&run.status, was_running);
        let running = run.is_running();
        watch.run = Some(run);
        watch.logs = logs;
        if running && watch.timers.is_empty() {
            watch.generation += 1;
            let generation = watch.generation;
            self.arm_poll(&mut watch, generation)?;
            log::info!("attached to running greeting task");
        }
        let snapshot = watch.snapshot();
        drop(watch);
        self.shared.publish(TaskEvent::Updated(snapshot.clone()));
        Ok(snapshot)
    }

    /// Asks the backend to stop; the poll loop observes the terminal status.
    pub fn stop(&self) -> Result<ControlResponse> {
        log::info!("stopping greeting task");
        self.shared.api.stop_task()
    }

    pub fn reset(&self) -> Result<TaskSnapshot> {
        {
            let watch = self.shared.lock();
            if watch.state == TaskState::Running {
                return Err(ShellError::InvalidTransition {
                    action: "reset".to_string(),
                    subject: "the task",
                    state: watch.state.as_str().to_string(),
                });
            }
        }
        let response = self.shared.api.reset_task()?;

        let mut watch = self.shared.lock();
        watch.clear();
        watch.message = response.message;
        let snapshot = watch.snapshot();
        drop(watch);
        self.shared.publish(TaskEvent::Updated(snapshot.clone()));
        Ok(snapshot)
    }

    /// Operator escape hatch for a run stuck in `running`. The local view is
    /// cleared before the backend is contacted and stays cleared whatever it
    /// answers.
    pub fn force_reset(&self, confirmed: bool) -> Result<TaskSnapshot> {
        if !confirmed {
            return Err(ShellError::ConfirmationRequired);
        }
        let mut watch = self.shared.lock();
        watch.clear();
        let snapshot = watch.snapshot();
        drop(watch);
        log::warn!("force-resetting greeting task");
        self.shared.publish(TaskEvent::Updated(snapshot));

        let message = match self.shared.api.force_reset_task() {
            Ok(response) => response.message,
            Err(e) => {
                log::error!("backend force-reset failed: {e}");
                format!("Local state cleared; backend reset failed: {e}")
            }
        };
        let mut watch = self.shared.lock();
        watch.message = message;
        Ok(watch.snapshot())
    }

    /// Stops polling without touching the backend. Used during shutdown.
    pub fn halt(&self) {
        let mut watch = self.shared.lock();
        watch.timers.cancel_all();
        watch.generation += 1;
    }

    fn arm_poll(&self, watch: &mut Watch, generation: u64) -> Result<()> {
        let shared = self.shared.clone();
        watch
            .timers
            .every("task-poll", self.shared.timings.poll_interval, move || {
                poll_once(&shared, generation)
            })?;
        Ok(())
    }
}

fn poll_once(shared: &Shared, generation: u64) -> TickFlow {
    if shared.lock().generation != generation {
        return TickFlow::Stop;
    }
    // Status strictly before logs, so logs are never older than the status.
    let fetched = shared
        .api
        .task_status()
        .and_then(|run| shared.api.task_logs(LOG_TAIL).map(|logs| (run, logs)));
    let (run, logs) = match fetched {
        Ok(pair) => pair,
        Err(e) => {
            log::debug!("task poll failed, retrying next tick: {e}");
            return TickFlow::Continue;
        }
    };

    let mut watch = shared.lock();
    if watch.generation != generation {
        return TickFlow::Stop;
    }
    let running = run.is_running();
    watch.state = TaskState::from_backend(&run.status, true);
    watch.run = Some(run);
    watch.logs = logs;
    if running {
        let snapshot = watch.snapshot();
        drop(watch);
        shared.publish(TaskEvent::Updated(snapshot));
        return TickFlow::Continue;
    }

    watch.timers.cancel_all();
    let snapshot = watch.snapshot();
    drop(watch);
    log::info!("greeting task finished as {}", snapshot.state.as_str());
    shared.publish(TaskEvent::Finished(snapshot));
    TickFlow::Stop
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend_api::fake::FakeBackend;
    use std::sync::atomic::Ordering;
    use std::thread;
    use std::time::Instant;

    fn fast() -> TaskTimings {
        TaskTimings {
            poll_interval: Duration::from_millis(10),
        }
    }

    fn wait_until(monitor: &TaskMonitor, done: impl Fn(&TaskSnapshot) -> bool) -> TaskSnapshot {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let snapshot = monitor.snapshot();
            if done(&snapshot) {
                return snapshot;
            }
            assert!(Instant::now() < deadline, "timed out in {:?}", snapshot.state);
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn target_count_round_trips() {
        for n in [1, 42, 300] {
            let backend = Arc::new(FakeBackend::new());
            let monitor = TaskMonitor::new(backend.clone(), fast());
            monitor.start(n, Vec::new()).unwrap();
            let snapshot = wait_until(&monitor, |s| s.run.is_some());
            assert_eq!(snapshot.run.unwrap().target_count, n as u32);
            monitor.halt();
        }
    }

    #[test]
    fn out_of_range_counts_never_reach_the_backend() {
        let backend = Arc::new(FakeBackend::new());
        let monitor = TaskMonitor::new(backend.clone(), fast());
        for bad in [0, 301, -1] {
            let err = monitor.start(bad, Vec::new()).unwrap_err();
            assert!(matches!(err, ShellError::InvalidTargetCount { value, .. } if value == bad));
        }
        assert_eq!(backend.calls("start_task"), 0);
        assert_eq!(monitor.snapshot().state, TaskState::Idle);
    }

    #[test]
    fn poll_loop_stops_on_first_terminal_status() {
        let backend = Arc::new(FakeBackend::new());
        backend.push_status("running", 3, 1);
        backend.push_status("running", 3, 2);
        backend.push_status("completed", 3, 3);
        let monitor = TaskMonitor::new(backend.clone(), fast());
        monitor.start(3, vec!["Rust".into(), "  ".into()]).unwrap();

        let done = wait_until(&monitor, |s| s.state == TaskState::Completed);
        assert!(!done.polling);
        assert_eq!(done.run.unwrap().current_index, 3);
        assert_eq!(backend.calls("task_status"), 3);
        assert_eq!(backend.calls("task_logs"), 3);

        thread::sleep(Duration::from_millis(80));
        assert_eq!(backend.calls("task_status"), 3);
    }

    #[test]
    fn backend_status_maps_onto_local_states() {
        assert_eq!(TaskState::from_backend("limit_reached", true), TaskState::Completed);
        assert_eq!(TaskState::from_backend("error", true), TaskState::Errored);
        assert_eq!(TaskState::from_backend("cancelled", true), TaskState::Cancelled);
        assert_eq!(TaskState::from_backend("idle", true), TaskState::Cancelled);
        assert_eq!(TaskState::from_backend("idle", false), TaskState::Idle);
    }

    #[test]
    fn transport_errors_are_skipped() {
        let backend = Arc::new(FakeBackend::new());
        backend.push_status("running", 5, 0);
        backend.push_status("error", 5, 2);
        let monitor = TaskMonitor::new(backend.clone(), fast());
        monitor.start(5, Vec::new()).unwrap();
        backend.transport_down.store(true, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(monitor.snapshot().state, TaskState::Running);
        assert!(monitor.snapshot().polling);

        backend.transport_down.store(false, Ordering::SeqCst);
        let done = wait_until(&monitor, |s| s.state == TaskState::Errored);
        assert!(!done.polling);
    }

    #[test]
    fn force_reset_clears_a_stuck_run() {
        let backend = Arc::new(FakeBackend::new());
        backend.push_status("running", 100, 42);
        backend.logs.lock().unwrap().push(LogEntry {
            timestamp: "12:00:00".into(),
            level: "info".into(),
            message: "greeted #42".into(),
        });
        let monitor = TaskMonitor::new(backend.clone(), fast());
        monitor.start(100, Vec::new()).unwrap();
        wait_until(&monitor, |s| s.run.as_ref().is_some_and(|r| r.current_index == 42));

        let cleared = monitor.force_reset(true).unwrap();
        assert_eq!(cleared.state, TaskState::Idle);
        assert!(cleared.run.is_none());
        assert!(cleared.logs.is_empty());
        assert!(!cleared.polling);
        assert_eq!(backend.calls("force_reset_task"), 1);

        // The fake still claims "running"; nothing may bring it back.
        let polls = backend.calls("task_status");
        thread::sleep(Duration::from_millis(80));
        assert!(backend.calls("task_status") <= polls + 1);
        let after = monitor.snapshot();
        assert_eq!(after.state, TaskState::Idle);
        assert!(after.run.is_none());
    }

    #[test]
    fn force_reset_requires_confirmation() {
        let backend = Arc::new(FakeBackend::new());
        let monitor = TaskMonitor::new(backend.clone(), fast());
        assert!(matches!(monitor.force_reset(false), Err(ShellError::ConfirmationRequired)));
        assert_eq!(backend.calls("force_reset_task"), 0);
    }

    #[test]
    fn attach_resumes_polling_for_a_live_run() {
        let backend = Arc::new(FakeBackend::new());
        backend.push_status("running", 10, 4);
        let monitor = TaskMonitor::new(backend.clone(), fast());

        let attached = monitor.attach().unwrap();
        assert_eq!(attached.state, TaskState::Running);
        assert!(attached.polling);

        backend.push_status("cancelled", 10, 4);
        let done = wait_until(&monitor, |s| s.state == TaskState::Cancelled);
        assert!(!done.polling);
    }

    #[test]
    fn attach_to_idle_backend_does_not_poll() {
        let backend = Arc::new(FakeBackend::new());
        let monitor = TaskMonitor::new(backend.clone(), fast());
        let attached = monitor.attach().unwrap();
        assert_eq!(attached.state, TaskState::Idle);
        assert!(!attached.polling);
        thread::sleep(Duration::from_millis(40));
        assert_eq!(backend.calls("task_status"), 1);
    }

    #[test]
    fn reset_is_refused_while_running() {
        let backend = Arc::new(FakeBackend::new());
        let monitor = TaskMonitor::new(backend.clone(), fast());
        monitor.start(2, Vec::new()).unwrap();
        let err = monitor.reset().unwrap_err();
        assert_eq!(err.to_string(), "Cannot reset while the task is running");
        assert_eq!(backend.calls("reset_task"), 0);
        monitor.halt();
    }

    #[test]
    fn finished_event_fires_once() {
        let backend = Arc::new(FakeBackend::new());
        backend.push_status("running", 1, 0);
        backend.push_status("completed", 1, 1);
        let finished = Arc::new(Mutex::new(0));
        let counter = finished.clone();
        let observer: TaskObserver = Arc::new(move |event: &TaskEvent| {
            if let TaskEvent::Finished(_) = event {
                *counter.lock().unwrap() += 1;
            }
        });
        let monitor = TaskMonitor::with_observer(backend, fast(), Some(observer));
        monitor.start(1, Vec::new()).unwrap();
        wait_until(&monitor, |s| s.state == TaskState::Completed);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(*finished.lock().unwrap(), 1);
    }
}
