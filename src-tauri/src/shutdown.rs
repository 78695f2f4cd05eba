//! Single funnel for every way the application can go away.

use crate::process_supervisor::ProcessSupervisor;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Extra time a losing caller waits beyond the backend grace period.
const COMPLETION_SLACK: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    WindowClosed,
    TrayQuit,
    QuitCommand,
    AppExit,
    Signal,
    Fault,
    StartupFailure,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::WindowClosed => "window closed",
            Self::TrayQuit => "quit from tray",
            Self::QuitCommand => "quit requested by UI",
            Self::AppExit => "application exit",
            Self::Signal => "termination signal",
            Self::Fault => "uncaught fault",
            Self::StartupFailure => "startup failure",
        };
        f.write_str(text)
    }
}

type Hook = Box<dyn FnOnce() + Send>;

pub struct ShutdownCoordinator {
    quitting: AtomicBool,
    supervisor: Arc<ProcessSupervisor>,
    poller_halts: Mutex<Vec<Hook>>,
    window_teardown: Mutex<Vec<Hook>>,
    done: Mutex<bool>,
    finished: Condvar,
}

impl ShutdownCoordinator {
    pub fn new(supervisor: Arc<ProcessSupervisor>) -> Self {
        Self {
            quitting: AtomicBool::new(false),
            supervisor,
            poller_halts: Mutex::new(Vec::new()),
            window_teardown: Mutex::new(Vec::new()),
            done: Mutex::new(false),
            finished: Condvar::new(),
        }
    }

    pub fn on_halt_pollers(&self, hook: impl FnOnce() + Send + 'static) {
        push_hook(&self.poller_halts, Box::new(hook));
    }

    pub fn on_destroy_windows(&self, hook: impl FnOnce() + Send + 'static) {
        push_hook(&self.window_teardown, Box::new(hook));
    }

    pub fn is_quitting(&self) -> bool {
        self.quitting.load(Ordering::SeqCst)
    }

    /// True once the winning caller has finished every cleanup step.
    pub fn is_done(&self) -> bool {
        *lock_flag(&self.done)
    }

    /// Blocks until cleanup has finished or `timeout` passes. Returns `is_done()`.
    pub fn wait_until_done(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = lock_flag(&self.done);
        while !*done {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            done = match self.finished.wait_timeout(done, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    /// Runs the cleanup sequence if nobody has yet. Returns `false` when
    /// another entry point got there first; that caller still blocks until the
    /// winner has finished, bounded by the backend grace period plus a margin.
    pub fn request_shutdown(&self, reason: ShutdownReason) -> bool {
        if self
            .quitting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::debug!("shutdown already in progress; waiting on it instead of {reason}");
            let bound = self.supervisor.grace_period() + COMPLETION_SLACK;
            if !self.wait_until_done(bound) {
                log::warn!("shutdown still running after {}s; {reason} gives up waiting", bound.as_secs());
            }
            return false;
        }
        log::info!("shutting down: {reason}");
        self.supervisor.close();

        for halt in take_hooks(&self.poller_halts) {
            halt();
        }

        let supervisor = self.supervisor.clone();
        let teardown = thread::Builder::new()
            .name("backend-teardown".into())
            .spawn(move || supervisor.terminate());
        let teardown = match teardown {
            Ok(handle) => Some(handle),
            Err(e) => {
                log::warn!("could not spawn teardown thread ({e}); terminating inline");
                self.supervisor.terminate();
                None
            }
        };

        // Windows go regardless of how long the backend takes to die.
        for destroy in take_hooks(&self.window_teardown) {
            destroy();
        }

        if let Some(handle) = teardown {
            if handle.join().is_err() {
                log::error!("backend teardown thread panicked");
            }
        }
        *lock_flag(&self.done) = true;
        self.finished.notify_all();
        log::info!("shutdown complete");
        true
    }
}

fn lock_flag(flag: &Mutex<bool>) -> std::sync::MutexGuard<'_, bool> {
    match flag.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn push_hook(slot: &Mutex<Vec<Hook>>, hook: Hook) {
    match slot.lock() {
        Ok(mut hooks) => hooks.push(hook),
        Err(poisoned) => poisoned.into_inner().push(hook),
    }
}

fn take_hooks(slot: &Mutex<Vec<Hook>>) -> Vec<Hook> {
    match slot.lock() {
        Ok(mut hooks) => std::mem::take(&mut *hooks),
        Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn supervisor() -> Arc<ProcessSupervisor> {
        Arc::new(ProcessSupervisor::new(Duration::from_millis(200), None))
    }

    #[test]
    fn only_the_first_request_runs_cleanup() {
        let coordinator = ShutdownCoordinator::new(supervisor());
        let halts = Arc::new(AtomicU32::new(0));
        let counter = halts.clone();
        coordinator.on_halt_pollers(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!coordinator.is_quitting());
        assert!(coordinator.request_shutdown(ShutdownReason::WindowClosed));
        assert!(coordinator.is_quitting());
        assert!(coordinator.is_done());
        assert!(!coordinator.request_shutdown(ShutdownReason::Signal));
        assert!(!coordinator.request_shutdown(ShutdownReason::AppExit));
        assert_eq!(halts.load(Ordering::SeqCst), 1);
        assert!(coordinator.is_quitting());
    }

    #[test]
    fn concurrent_requests_elect_one_winner() {
        let coordinator = Arc::new(ShutdownCoordinator::new(supervisor()));
        let destroyed = Arc::new(AtomicU32::new(0));
        let counter = destroyed.clone();
        coordinator.on_destroy_windows(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let coordinator = coordinator.clone();
                thread::spawn(move || coordinator.request_shutdown(ShutdownReason::Signal))
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }

    #[cfg(unix)]
    #[test]
    fn cleanup_stops_the_backend() {
        use crate::process_supervisor::LaunchPlan;
        use std::path::PathBuf;

        let supervisor = supervisor();
        let plan = LaunchPlan {
            program: PathBuf::from("sleep"),
            args: vec!["30".into()],
            cwd: std::env::temp_dir(),
            env: Vec::new(),
        };
        supervisor.start(&plan).unwrap();
        assert!(supervisor.is_running());

        let coordinator = ShutdownCoordinator::new(supervisor.clone());
        let order = Arc::new(Mutex::new(Vec::new()));
        let trail = order.clone();
        coordinator.on_halt_pollers(move || trail.lock().unwrap().push("halt"));
        let trail = order.clone();
        coordinator.on_destroy_windows(move || trail.lock().unwrap().push("windows"));

        assert!(coordinator.request_shutdown(ShutdownReason::TrayQuit));
        assert!(!supervisor.is_running());
        assert_eq!(*order.lock().unwrap(), vec!["halt", "windows"]);
    }

    #[cfg(unix)]
    #[test]
    fn losing_caller_returns_only_after_the_backend_is_gone() {
        use crate::process_supervisor::LaunchPlan;
        use std::path::PathBuf;

        let grace = Duration::from_millis(1500);
        let supervisor = Arc::new(ProcessSupervisor::new(grace, None));
        let plan = LaunchPlan {
            program: PathBuf::from("sh"),
            args: vec!["-c".into(), "trap '' TERM; sleep 30".into()],
            cwd: std::env::temp_dir(),
            env: Vec::new(),
        };
        let pid = supervisor.start(&plan).unwrap() as i32;
        thread::sleep(Duration::from_millis(150));

        let coordinator = Arc::new(ShutdownCoordinator::new(supervisor.clone()));
        let winner = {
            let coordinator = coordinator.clone();
            thread::spawn(move || coordinator.request_shutdown(ShutdownReason::WindowClosed))
        };
        while !coordinator.is_quitting() {
            thread::sleep(Duration::from_millis(1));
        }

        let started = Instant::now();
        assert!(!coordinator.request_shutdown(ShutdownReason::AppExit));
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(coordinator.is_done());
        assert_ne!(unsafe { libc::kill(pid, 0) }, 0, "backend {pid} outlived shutdown");
        assert!(winner.join().unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn no_backend_starts_after_shutdown() {
        use crate::error::ShellError;
        use crate::process_supervisor::LaunchPlan;
        use std::path::PathBuf;

        let supervisor = supervisor();
        let coordinator = ShutdownCoordinator::new(supervisor.clone());
        assert!(coordinator.request_shutdown(ShutdownReason::WindowClosed));

        let plan = LaunchPlan {
            program: PathBuf::from("sleep"),
            args: vec!["30".into()],
            cwd: std::env::temp_dir(),
            env: Vec::new(),
        };
        assert!(matches!(supervisor.start(&plan), Err(ShellError::Start { .. })));
        assert!(!supervisor.is_running());
        assert_eq!(supervisor.pid(), None);
    }

    #[test]
    fn waiting_times_out_while_cleanup_is_pending() {
        let coordinator = ShutdownCoordinator::new(supervisor());
        assert!(!coordinator.wait_until_done(Duration::from_millis(30)));
        assert!(!coordinator.is_done());
        assert!(coordinator.request_shutdown(ShutdownReason::QuitCommand));
        assert!(coordinator.wait_until_done(Duration::from_millis(30)));
    }
}
