//! QR-code login: issue a code, poll for confirmation, refresh the code a
//! bounded number of times, and give up after a hard backstop.

use crate::backend_api::BackendApi;
use crate::error::{Result, ShellError};
use crate::timers::{TickFlow, TimerSet};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub const MAX_REFRESH: u32 = 5;

#[derive(Debug, Clone, Copy)]
pub struct LoginTimings {
    pub confirm_interval: Duration,
    pub refresh_interval: Duration,
    pub ticker_interval: Duration,
    pub backstop: Duration,
}

impl Default for LoginTimings {
    fn default() -> Self {
        Self {
            confirm_interval: Duration::from_secs(2),
            refresh_interval: Duration::from_secs(30),
            ticker_interval: Duration::from_secs(1),
            backstop: Duration::from_secs(180),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginState {
    NoSession,
    QrIssued,
    Confirmed,
    Expired,
    Cancelled,
}

impl LoginState {
    fn as_str(self) -> &'static str {
        match self {
            Self::NoSession => "no_session",
            Self::QrIssued => "qr_issued",
            Self::Confirmed => "confirmed",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoginSnapshot {
    pub state: LoginState,
    pub qrcode: Option<String>,
    pub refresh_count: u32,
    pub max_refresh: u32,
    pub elapsed_secs: u64,
    pub expired: bool,
    /// False once every timer is gone, including after the backstop fired.
    pub polling: bool,
    pub user_info: Option<Value>,
    pub message: String,
}

struct Session {
    state: LoginState,
    generation: u64,
    qrcode: Option<String>,
    refresh_count: u32,
    started_at: Option<Instant>,
    elapsed_secs: u64,
    user_info: Option<Value>,
    message: String,
    timers: TimerSet,
}

impl Session {
    fn new() -> Self {
        Self {
            state: LoginState::NoSession,
            generation: 0,
            qrcode: None,
            refresh_count: 0,
            started_at: None,
            elapsed_secs: 0,
            user_info: None,
            message: String::new(),
            timers: TimerSet::new(),
        }
    }

    /// Drops everything from the previous attempt and opens a new generation.
    fn reset(&mut self) -> u64 {
        self.timers.cancel_all();
        self.generation += 1;
        self.state = LoginState::NoSession;
        self.qrcode = None;
        self.refresh_count = 0;
        self.started_at = None;
        self.elapsed_secs = 0;
        self.user_info = None;
        self.message.clear();
        self.generation
    }

    fn is_live(&self, generation: u64) -> bool {
        self.generation == generation && self.state == LoginState::QrIssued
    }

    fn snapshot(&self) -> LoginSnapshot {
        LoginSnapshot {
            state: self.state,
            qrcode: self.qrcode.clone(),
            refresh_count: self.refresh_count,
            max_refresh: MAX_REFRESH,
            elapsed_secs: self.elapsed_secs,
            expired: self.state == LoginState::Expired,
            polling: self.state == LoginState::QrIssued && !self.timers.is_empty(),
            user_info: self.user_info.clone(),
            message: self.message.clone(),
        }
    }
}

pub type LoginObserver = Arc<dyn Fn(&LoginSnapshot) + Send + Sync>;

struct Shared {
    api: Arc<dyn BackendApi>,
    timings: LoginTimings,
    session: Mutex<Session>,
    observer: Option<LoginObserver>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Session> {
        match self.session.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Observers run after the lock is released so they may call back in.
    fn publish(&self, snapshot: LoginSnapshot) -> LoginSnapshot {
        if let Some(observer) = &self.observer {
            observer(&snapshot);
        }
        snapshot
    }
}

#[derive(Clone)]
pub struct LoginSessionController {
    shared: Arc<Shared>,
}

impl LoginSessionController {
    pub fn new(api: Arc<dyn BackendApi>, timings: LoginTimings) -> Self {
        Self::with_observer(api, timings, None)
    }

    pub fn with_observer(
        api: Arc<dyn BackendApi>,
        timings: LoginTimings,
        observer: Option<LoginObserver>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                api,
                timings,
                session: Mutex::new(Session::new()),
                observer,
            }),
        }
    }

    pub fn snapshot(&self) -> LoginSnapshot {
        self.shared.lock().snapshot()
    }

    /// Begins a fresh login attempt, abandoning whatever came before.
    pub fn start(&self) -> Result<LoginSnapshot> {
        let generation = self.shared.lock().reset();
        log::info!("login attempt #{generation}: requesting QR code");

        let issued = self.shared.api.qrcode();
        let mut session = self.shared.lock();
        if session.generation != generation {
            return Ok(session.snapshot());
        }

        let response = match issued {
            Ok(response) => response,
            Err(e) => {
                session.message = e.to_string();
                let snapshot = session.snapshot();
                drop(session);
                self.shared.publish(snapshot);
                return Err(e);
            }
        };

        if response.is_already_authenticated() {
            log::info!("backend reports an existing session; skipping QR polling");
            let user_info = response.user_info.clone();
            drop(session);
            return self.confirm_existing(generation, user_info);
        }

        if response.qrcode.is_empty() {
            log::warn!("backend returned no QR code: {}", response.message);
            session.message = response.message;
            let snapshot = session.snapshot();
            drop(session);
            return Ok(self.shared.publish(snapshot));
        }

        session.state = LoginState::QrIssued;
        session.qrcode = Some(response.qrcode);
        session.message = response.message;
        session.started_at = Some(Instant::now());
        if let Err(e) = self.arm_timers(&mut session, generation) {
            session.timers.cancel_all();
            session.state = LoginState::NoSession;
            session.message = e.to_string();
            let snapshot = session.snapshot();
            drop(session);
            self.shared.publish(snapshot);
            return Err(e.into());
        }
        let snapshot = session.snapshot();
        drop(session);
        Ok(self.shared.publish(snapshot))
    }

    fn confirm_existing(&self, generation: u64, user_info: Option<Value>) -> Result<LoginSnapshot> {
        let (user_info, message) = match user_info {
            Some(info) => (Some(info), "Already logged in".to_string()),
            None => match self.shared.api.check_login() {
                Ok(check) if check.logged_in => (check.user_info, check.message),
                Ok(check) => {
                    let mut session = self.shared.lock();
                    if session.generation == generation {
                        session.message = check.message;
                    }
                    let snapshot = session.snapshot();
                    drop(session);
                    return Ok(self.shared.publish(snapshot));
                }
                Err(e) => return Err(e),
            },
        };

        let mut session = self.shared.lock();
        if session.generation != generation {
            return Ok(session.snapshot());
        }
        session.state = LoginState::Confirmed;
        session.user_info = user_info;
        session.message = message;
        let snapshot = session.snapshot();
        drop(session);
        Ok(self.shared.publish(snapshot))
    }

    fn arm_timers(&self, session: &mut Session, generation: u64) -> std::io::Result<()> {
        let timings = self.shared.timings;

        let shared = self.shared.clone();
        session
            .timers
            .every("login-ticker", timings.ticker_interval, move || {
                tick_elapsed(&shared, generation)
            })?;

        let shared = self.shared.clone();
        session
            .timers
            .every("login-confirm", timings.confirm_interval, move || {
                poll_confirmation(&shared, generation)
            })?;

        let shared = self.shared.clone();
        session
            .timers
            .every("login-refresh", timings.refresh_interval, move || {
                refresh_qrcode(&shared, generation)
            })?;

        let shared = self.shared.clone();
        session.timers.after("login-backstop", timings.backstop, move || {
            fire_backstop(&shared, generation)
        })?;
        Ok(())
    }

    /// Operator abandons the attempt. Timers are gone before this returns.
    pub fn cancel(&self) -> LoginSnapshot {
        let mut session = self.shared.lock();
        session.timers.cancel_all();
        session.generation += 1;
        if session.state != LoginState::Confirmed {
            session.state = LoginState::Cancelled;
            session.message = "Login cancelled".to_string();
        }
        let snapshot = session.snapshot();
        drop(session);
        log::info!("login attempt cancelled");
        self.shared.publish(snapshot)
    }

    /// Silences every timer without a state change. Used during shutdown.
    pub fn halt(&self) {
        let mut session = self.shared.lock();
        session.timers.cancel_all();
        session.generation += 1;
    }

    /// Starts over after expiry, cancellation or a backstop stop.
    pub fn retry(&self) -> Result<LoginSnapshot> {
        {
            let session = self.shared.lock();
            let stalled = session.state == LoginState::QrIssued && session.timers.is_empty();
            let retryable = matches!(
                session.state,
                LoginState::Expired | LoginState::Cancelled | LoginState::NoSession
            );
            if !(retryable || stalled) {
                return Err(ShellError::InvalidTransition {
                    action: "retry".to_string(),
                    subject: "login",
                    state: session.state.as_str().to_string(),
                });
            }
        }
        log::info!("retrying login from scratch");
        self.start()
    }
}

fn tick_elapsed(shared: &Shared, generation: u64) -> TickFlow {
    let mut session = shared.lock();
    if !session.is_live(generation) {
        return TickFlow::Stop;
    }
    if let Some(started) = session.started_at {
        session.elapsed_secs = started.elapsed().as_secs();
    }
    let snapshot = session.snapshot();
    drop(session);
    shared.publish(snapshot);
    TickFlow::Continue
}

fn poll_confirmation(shared: &Shared, generation: u64) -> TickFlow {
    if !shared.lock().is_live(generation) {
        return TickFlow::Stop;
    }
    let checked = shared.api.check_login();

    let mut session = shared.lock();
    if !session.is_live(generation) {
        // Answer to a request from a session that no longer exists.
        return TickFlow::Stop;
    }
    match checked {
        Ok(check) if check.logged_in => {
            session.timers.cancel_all();
            session.state = LoginState::Confirmed;
            session.user_info = check.user_info;
            session.message = check.message;
            let snapshot = session.snapshot();
            drop(session);
            log::info!("login confirmed");
            shared.publish(snapshot);
            TickFlow::Stop
        }
        Ok(_) => TickFlow::Continue,
        Err(e) => {
            log::debug!("login check failed, will retry: {e}");
            TickFlow::Continue
        }
    }
}

fn refresh_qrcode(shared: &Shared, generation: u64) -> TickFlow {
    let attempt = {
        let mut session = shared.lock();
        if !session.is_live(generation) {
            return TickFlow::Stop;
        }
        if session.refresh_count >= MAX_REFRESH {
            expire(&mut session);
            let snapshot = session.snapshot();
            drop(session);
            log::warn!("QR code refresh limit ({MAX_REFRESH}) reached; login expired");
            shared.publish(snapshot);
            return TickFlow::Stop;
        }
        // Counted before the call so failed refreshes use up the budget too.
        session.refresh_count += 1;
        session.refresh_count
    };
    log::info!("refreshing QR code ({attempt}/{MAX_REFRESH})");
    let refreshed = shared.api.refresh_qrcode();

    let mut session = shared.lock();
    if !session.is_live(generation) {
        return TickFlow::Stop;
    }
    match refreshed {
        Ok(response) if !response.qrcode.is_empty() => {
            session.qrcode = Some(response.qrcode);
            session.message = response.message;
        }
        Ok(response) => session.message = response.message,
        Err(e) => log::warn!("QR code refresh {attempt} failed: {e}"),
    }
    let snapshot = session.snapshot();
    drop(session);
    shared.publish(snapshot);
    TickFlow::Continue
}

fn fire_backstop(shared: &Shared, generation: u64) {
    let mut session = shared.lock();
    if session.generation != generation {
        return;
    }
    session.timers.cancel_all();
    let expired = session.state == LoginState::QrIssued && session.refresh_count >= MAX_REFRESH;
    if expired {
        // The last refresh tick shares its deadline with the backstop.
        expire(&mut session);
    } else if session.state == LoginState::QrIssued {
        session.message = format!(
            "Stopped waiting for QR confirmation after {}s",
            shared.timings.backstop.as_secs()
        );
    }
    let snapshot = session.snapshot();
    drop(session);
    if expired {
        log::warn!("login backstop fired after {MAX_REFRESH} refreshes; login expired");
    } else {
        log::warn!("login backstop fired; polling stopped");
    }
    shared.publish(snapshot);
}

fn expire(session: &mut Session) {
    session.timers.cancel_all();
    session.state = LoginState::Expired;
    session.message = ShellError::LoginExpired {
        refreshes: session.refresh_count,
    }
    .to_string();
}
