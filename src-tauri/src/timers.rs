//! Thread-backed interval and one-shot timers that are cancelled as a set.

use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickFlow {
    Continue,
    Stop,
}

/// Wakes a sleeping timer thread as soon as it is cancelled.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, wake) = &*self.inner;
        match flag.lock() {
            Ok(mut guard) => *guard = true,
            Err(poisoned) => *poisoned.into_inner() = true,
        }
        wake.notify_all();
    }

    /// Sleeps for `timeout` unless cancelled first. Returns `true` when cancelled.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (flag, wake) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut guard = match flag.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        while !*guard {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            guard = match wake.wait_timeout(guard, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

struct Timer {
    name: &'static str,
    token: CancelToken,
    handle: Option<JoinHandle<()>>,
}

/// A group of timers owned by one state machine.
///
/// `cancel_all` never joins, so it is safe to call from inside a tick.
#[derive(Default)]
pub struct TimerSet {
    timers: Vec<Timer>,
}

impl TimerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `tick` every `period` (first run after one period) until it returns
    /// `Stop` or the set is cancelled. Ticks keep a fixed rate; a tick that
    /// overruns a whole period pushes the schedule back instead of bursting.
    pub fn every<F>(&mut self, name: &'static str, period: Duration, mut tick: F) -> io::Result<()>
    where
        F: FnMut() -> TickFlow + Send + 'static,
    {
        let token = CancelToken::new();
        let thread_token = token.clone();
        let handle = thread::Builder::new()
            .name(format!("timer-{name}"))
            .spawn(move || {
                let mut next = Instant::now() + period;
                while !thread_token.wait(next.saturating_duration_since(Instant::now())) {
                    if tick() == TickFlow::Stop {
                        break;
                    }
                    next += period;
                    let now = Instant::now();
                    if next <= now {
                        next = now + period;
                    }
                }
            })?;
        self.timers.push(Timer {
            name,
            token,
            handle: Some(handle),
        });
        Ok(())
    }

    /// Runs `fire` once after `delay` unless the set is cancelled first.
    pub fn after<F>(&mut self, name: &'static str, delay: Duration, fire: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let token = CancelToken::new();
        let thread_token = token.clone();
        let handle = thread::Builder::new()
            .name(format!("timer-{name}"))
            .spawn(move || {
                if !thread_token.wait(delay) {
                    fire();
                }
            })?;
        self.timers.push(Timer {
            name,
            token,
            handle: Some(handle),
        });
        Ok(())
    }

    pub fn cancel_all(&mut self) {
        for mut timer in self.timers.drain(..) {
            timer.token.cancel();
            log::debug!("cancelled timer {}", timer.name);
            // Detach: the thread exits on its next wake-up.
            timer.handle.take();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

impl Drop for TimerSet {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
