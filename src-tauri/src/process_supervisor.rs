//! Launches the automation backend and tears down its whole process tree.

use crate::config::{LaunchMode, ShellConfig};
use crate::error::{Result, ShellError};
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;
#[cfg(target_os = "windows")]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

const EXIT_WATCH_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

impl LaunchPlan {
    /// Development runs the backend from source through `uv`; production runs
    /// the packaged executable shipped in the resource bundle.
    pub fn for_mode(config: &ShellConfig, resource_dir: Option<&Path>) -> Result<Self> {
        let port = config.backend_port.to_string();
        let mut env = vec![
            ("API_PORT".to_string(), port.clone()),
            ("PORT".to_string(), port),
        ];
        if let Some(account) = &config.account_selector {
            env.push(("GREETDESK_ACCOUNT_ID".to_string(), account.clone()));
        }

        match config.mode {
            LaunchMode::Development => {
                let cwd = config
                    .backend_dir
                    .clone()
                    .unwrap_or_else(default_dev_backend_dir);
                Ok(Self {
                    program: PathBuf::from(uv_bin()),
                    args: ["run", "python", "-m", "app.main"]
                        .iter()
                        .map(|arg| arg.to_string())
                        .collect(),
                    cwd,
                    env,
                })
            }
            LaunchMode::Production => {
                let bundle = resource_dir.ok_or_else(|| ShellError::Start {
                    program: "backend".to_string(),
                    reason: "resource directory is unavailable".to_string(),
                })?;
                let program = bundled_backend_path(bundle);
                if !program.is_file() {
                    return Err(ShellError::Start {
                        program: program.display().to_string(),
                        reason: "bundled backend executable not found".to_string(),
                    });
                }
                env.push((
                    "PLAYWRIGHT_BROWSERS_PATH".to_string(),
                    config.asset_cache_dir.display().to_string(),
                ));
                let cwd = program
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| bundle.to_path_buf());
                Ok(Self {
                    program,
                    args: Vec::new(),
                    cwd,
                    env,
                })
            }
        }
    }

    fn display(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

pub fn bundled_backend_path(resource_dir: &Path) -> PathBuf {
    let name = if cfg!(target_os = "windows") {
        "backend.exe"
    } else {
        "backend"
    };
    resource_dir.join("backend-dist").join(name)
}

fn default_dev_backend_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("..").join("backend")
}

fn uv_bin() -> &'static str {
    if cfg!(target_os = "windows") {
        "uv.exe"
    } else {
        "uv"
    }
}

/// The live backend: its pid, process group and the child handle used to reap it.
#[derive(Debug)]
pub struct BackendProcessHandle {
    pub pid: u32,
    /// Process-group id on POSIX; the backend leads its own group.
    pub pgid: Option<i32>,
    child: Child,
}

pub struct ProcessSupervisor {
    process: Arc<Mutex<Option<BackendProcessHandle>>>,
    exit_code: Arc<Mutex<Option<i32>>>,
    /// Group of a leader that exited on its own; its children may still run.
    stale_group: Arc<Mutex<Option<i32>>>,
    /// Set once shutdown begins; no backend may be launched afterwards.
    closed: AtomicBool,
    grace_period: Duration,
    sweep_pattern: Option<String>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ProcessSupervisor {
    pub fn new(grace_period: Duration, sweep_pattern: Option<String>) -> Self {
        Self {
            process: Arc::new(Mutex::new(None)),
            exit_code: Arc::new(Mutex::new(None)),
            stale_group: Arc::new(Mutex::new(None)),
            closed: AtomicBool::new(false),
            grace_period,
            sweep_pattern,
        }
    }

    pub fn from_config(config: &ShellConfig) -> Self {
        Self::new(config.grace_period, config.sweep_pattern.clone())
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Refuses every later `start`. Called before the final `terminate`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn start(&self, plan: &LaunchPlan) -> Result<u32> {
        let mut slot = lock(&self.process);
        // Checked under the slot lock so a concurrent terminate sees the child.
        if self.closed.load(Ordering::SeqCst) {
            return Err(ShellError::Start {
                program: plan.display(),
                reason: "application is shutting down".to_string(),
            });
        }
        if let Some(existing) = slot.as_ref() {
            return Err(ShellError::Start {
                program: plan.display(),
                reason: format!("backend already running as pid {}", existing.pid),
            });
        }

        let mut cmd = Command::new(&plan.program);
        cmd.args(&plan.args)
            .current_dir(&plan.cwd)
            .envs(plan.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        #[cfg(target_os = "windows")]
        {
            use std::os::windows::process::CommandExt;
            cmd.creation_flags(CREATE_NO_WINDOW | CREATE_NEW_PROCESS_GROUP);
        }

        let mut child = cmd.spawn().map_err(|e| ShellError::Start {
            program: plan.display(),
            reason: e.to_string(),
        })?;
        let pid = child.id();
        log::info!("launched backend `{}` as pid {pid} in {}", plan.display(), plan.cwd.display());

        if let Some(stdout) = child.stdout.take() {
            pump_output(stdout, OutputStream::Stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            pump_output(stderr, OutputStream::Stderr);
        }

        *lock(&self.exit_code) = None;
        *slot = Some(BackendProcessHandle {
            pid,
            pgid: if cfg!(unix) { Some(pid as i32) } else { None },
            child,
        });
        drop(slot);

        self.watch_exit(pid);
        Ok(pid)
    }

    /// Records the exit code when the backend dies on its own.
    fn watch_exit(&self, pid: u32) {
        let process = self.process.clone();
        let exit_code = self.exit_code.clone();
        let stale_group = self.stale_group.clone();
        let spawned = thread::Builder::new()
            .name("backend-exit-watch".into())
            .spawn(move || loop {
                {
                    let mut slot = lock(&process);
                    let polled = match slot.as_mut().filter(|handle| handle.pid == pid) {
                        Some(handle) => handle.child.try_wait(),
                        None => break,
                    };
                    match polled {
                        Ok(Some(status)) => {
                            log::warn!("backend pid {pid} exited on its own: {status}");
                            *lock(&exit_code) = status.code();
                            *lock(&stale_group) = slot.take().and_then(|handle| handle.pgid);
                            break;
                        }
                        Ok(None) => {}
                        Err(e) => {
                            log::warn!("cannot poll backend pid {pid}: {e}");
                            break;
                        }
                    }
                }
                thread::sleep(EXIT_WATCH_INTERVAL);
            });
        if let Err(e) = spawned {
            log::warn!("failed to spawn backend exit watcher: {e}");
        }
    }

    pub fn pid(&self) -> Option<u32> {
        lock(&self.process).as_ref().map(|handle| handle.pid)
    }

    pub fn is_running(&self) -> bool {
        let mut slot = lock(&self.process);
        let polled = match slot.as_mut() {
            Some(handle) => handle.child.try_wait(),
            None => return false,
        };
        match polled {
            Ok(None) => true,
            Ok(Some(status)) => {
                *lock(&self.exit_code) = status.code();
                *lock(&self.stale_group) = slot.take().and_then(|handle| handle.pgid);
                false
            }
            Err(_) => false,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        *lock(&self.exit_code)
    }

    /// Tears down the backend tree. Safe to call any number of times.
    pub fn terminate(&self) {
        let taken = lock(&self.process).take();
        if let Some(mut handle) = taken {
            log::info!("terminating backend process tree (pid {})", handle.pid);
            kill_tree(&mut handle, self.grace_period);
            match handle.child.wait() {
                Ok(status) => {
                    *lock(&self.exit_code) = status.code();
                    log::info!("backend pid {} reaped: {status}", handle.pid);
                }
                Err(e) => log::warn!("failed to reap backend pid {}: {e}", handle.pid),
            }
        }
        if let Some(pgid) = lock(&self.stale_group).take() {
            kill_stale_group(pgid);
        }
        if let Some(pattern) = &self.sweep_pattern {
            sweep_stray_processes(pattern);
        }
    }
}

#[derive(Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

/// Drains a child pipe on its own thread so the backend never blocks on a full pipe.
fn pump_output<R: Read + Send + 'static>(pipe: R, stream: OutputStream) {
    let name = match stream {
        OutputStream::Stdout => "backend-stdout",
        OutputStream::Stderr => "backend-stderr",
    };
    let spawned = thread::Builder::new().name(name.into()).spawn(move || {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end();
                    match stream {
                        OutputStream::Stdout => log::info!(target: "backend", "{line}"),
                        OutputStream::Stderr => log::warn!(target: "backend", "{line}"),
                    }
                }
                Err(e) => {
                    log::debug!("{name} closed: {e}");
                    break;
                }
            }
        }
    });
    if let Err(e) = spawned {
        log::warn!("failed to spawn {name} reader: {e}");
    }
}

fn wait_for_leader(handle: &mut BackendProcessHandle, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if let Ok(Some(_)) = handle.child.try_wait() {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    false
}

#[cfg(unix)]
fn signal_group(pgid: i32, signal: libc::c_int) -> std::io::Result<()> {
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn kill_tree(handle: &mut BackendProcessHandle, grace: Duration) {
    let pgid = handle.pgid.unwrap_or(handle.pid as i32);
    if let Err(e) = signal_group(pgid, libc::SIGTERM) {
        if e.raw_os_error() == Some(libc::ESRCH) {
            log::info!("backend group {pgid} already gone");
            return;
        }
        log::warn!("SIGTERM to backend group {pgid} failed: {e}");
    }
    if wait_for_leader(handle, grace) {
        log::info!("backend pid {} exited after SIGTERM", handle.pid);
    }
    // Survivors in the group get no second chance.
    match signal_group(pgid, libc::SIGKILL) {
        Ok(()) => log::info!("sent SIGKILL to backend group {pgid}"),
        Err(e) if e.raw_os_error() == Some(libc::ESRCH) => {}
        Err(e) => log::warn!("SIGKILL to backend group {pgid} failed: {e}"),
    }
}

/// The leader is already reaped, so there is nothing to wait on.
#[cfg(unix)]
fn kill_stale_group(pgid: i32) {
    match signal_group(pgid, libc::SIGKILL) {
        Ok(()) => log::info!("killed leftovers of exited backend group {pgid}"),
        Err(e) if e.raw_os_error() == Some(libc::ESRCH) => {}
        Err(e) => log::warn!("SIGKILL to stale backend group {pgid} failed: {e}"),
    }
}

#[cfg(not(unix))]
fn kill_stale_group(_pgid: i32) {}

#[cfg(target_os = "windows")]
fn taskkill(pid: u32, force: bool) -> std::io::Result<std::process::ExitStatus> {
    use std::os::windows::process::CommandExt;
    let pid = pid.to_string();
    let mut cmd = Command::new("taskkill");
    cmd.args(["/PID", pid.as_str(), "/T"]);
    if force {
        cmd.arg("/F");
    }
    cmd.creation_flags(CREATE_NO_WINDOW)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
}

#[cfg(target_os = "windows")]
fn kill_tree(handle: &mut BackendProcessHandle, grace: Duration) {
    if let Err(e) = taskkill(handle.pid, false) {
        log::warn!("taskkill for backend pid {} failed: {e}", handle.pid);
    }
    if wait_for_leader(handle, grace) {
        log::info!("backend pid {} exited after taskkill", handle.pid);
    }
    match taskkill(handle.pid, true) {
        Ok(_) => log::info!("forced taskkill on backend tree {}", handle.pid),
        Err(e) => log::warn!("forced taskkill for backend pid {} failed: {e}", handle.pid),
    }
}

/// Best-effort kill of browser processes that escaped the backend's group.
#[cfg(unix)]
fn sweep_stray_processes(pattern: &str) {
    match Command::new("pkill")
        .args(["-f", pattern])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) if status.success() => log::info!("killed stray processes matching `{pattern}`"),
        // 1 means nothing matched.
        Ok(status) if status.code() == Some(1) => {}
        Ok(status) => log::warn!("pkill -f `{pattern}` exited with {status}"),
        Err(e) => log::warn!("pkill -f `{pattern}` could not run: {e}"),
    }
}

#[cfg(not(unix))]
fn sweep_stray_processes(_pattern: &str) {}
