use crate::backend_api::BackendApi;
use crate::desktop;
use crate::login_session::{LoginSessionController, LoginSnapshot};
use crate::process_supervisor::ProcessSupervisor;
use crate::shutdown::{ShutdownCoordinator, ShutdownReason};
use crate::task_monitor::{TaskMonitor, TaskSnapshot};
use serde::Serialize;
use std::sync::Arc;
use tauri::State;

/// Managed state shared by every command.
pub struct AppState {
    pub api: Arc<dyn BackendApi>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub login: LoginSessionController,
    pub tasks: TaskMonitor,
    pub shutdown: Arc<ShutdownCoordinator>,
}

#[derive(Debug, Serialize)]
pub struct BackendHealthStatus {
    healthy: bool,
    pid: Option<u32>,
    exit_code: Option<i32>,
}

#[tauri::command(async)]
pub fn login_start(state: State<'_, AppState>) -> Result<LoginSnapshot, String> {
    state.login.start().map_err(|e| e.to_string())
}

#[tauri::command]
pub fn login_cancel(state: State<'_, AppState>) -> Result<LoginSnapshot, String> {
    Ok(state.login.cancel())
}

#[tauri::command(async)]
pub fn login_retry(state: State<'_, AppState>) -> Result<LoginSnapshot, String> {
    state.login.retry().map_err(|e| e.to_string())
}

#[tauri::command]
pub fn login_snapshot(state: State<'_, AppState>) -> Result<LoginSnapshot, String> {
    Ok(state.login.snapshot())
}

#[tauri::command(async)]
pub fn task_start(
    state: State<'_, AppState>,
    target_count: i64,
    expected_positions: Option<Vec<String>>,
) -> Result<TaskSnapshot, String> {
    state
        .tasks
        .start(target_count, expected_positions.unwrap_or_default())
        .map_err(|e| e.to_string())
}

#[tauri::command(async)]
pub fn task_attach(state: State<'_, AppState>) -> Result<TaskSnapshot, String> {
    state.tasks.attach().map_err(|e| e.to_string())
}

#[tauri::command(async)]
pub fn task_stop(state: State<'_, AppState>) -> Result<TaskSnapshot, String> {
    let response = state.tasks.stop().map_err(|e| e.to_string())?;
    if !response.success {
        return Err(response.message);
    }
    Ok(state.tasks.snapshot())
}

#[tauri::command(async)]
pub fn task_reset(state: State<'_, AppState>) -> Result<TaskSnapshot, String> {
    state.tasks.reset().map_err(|e| e.to_string())
}

#[tauri::command(async)]
pub fn task_force_reset(state: State<'_, AppState>, confirmed: bool) -> Result<TaskSnapshot, String> {
    state.tasks.force_reset(confirmed).map_err(|e| e.to_string())
}

#[tauri::command]
pub fn task_snapshot(state: State<'_, AppState>) -> Result<TaskSnapshot, String> {
    Ok(state.tasks.snapshot())
}

#[tauri::command(async)]
pub fn backend_health(state: State<'_, AppState>) -> Result<BackendHealthStatus, String> {
    Ok(BackendHealthStatus {
        healthy: state.api.health().is_ok(),
        pid: state.supervisor.pid(),
        exit_code: state.supervisor.exit_code(),
    })
}

#[tauri::command]
pub fn quit_app(app: tauri::AppHandle, state: State<'_, AppState>) -> Result<(), String> {
    desktop::quit(&app, state.shutdown.clone(), ShutdownReason::QuitCommand);
    Ok(())
}
