//! Everything that touches the window system: tray, events, notifications and dialogs.

use crate::asset_provisioner::ProvisionProgress;
use crate::login_session::{LoginObserver, LoginSnapshot, LoginState};
use crate::shutdown::{ShutdownCoordinator, ShutdownReason};
use crate::task_monitor::{TaskEvent, TaskObserver, TaskSnapshot};
use serde::Serialize;
use std::sync::Arc;
use std::thread;
use tauri::image::Image;
use tauri::menu::{MenuBuilder, MenuItemBuilder, PredefinedMenuItem};
use tauri::tray::TrayIconBuilder;
use tauri::{AppHandle, Emitter, Manager};
use tauri_plugin_dialog::{DialogExt, MessageDialogKind};
use tauri_plugin_notification::NotificationExt;

pub const MAIN_WINDOW: &str = "main";
pub const LOGIN_CHANGED: &str = "login://changed";
pub const TASK_CHANGED: &str = "task://changed";
pub const ASSETS_PROGRESS: &str = "assets://progress";
pub const BACKEND_READY: &str = "backend://ready";

const TRAY_ID: &str = "greetdesk-tray";
const MENU_ID_SHOW: &str = "show_window";
const MENU_ID_QUIT: &str = "quit_app";

#[derive(Debug, Clone, Serialize)]
struct BackendReady {
    pid: u32,
}

pub fn show_main_window(app: &AppHandle) {
    if let Some(window) = app.get_webview_window(MAIN_WINDOW) {
        let _ = window.show();
        let _ = window.unminimize();
        let _ = window.set_focus();
    }
}

pub fn destroy_windows(app: &AppHandle) {
    for (label, window) in app.webview_windows() {
        if let Err(e) = window.destroy() {
            log::warn!("failed to destroy window {label}: {e}");
        }
    }
}

fn emit<S: Serialize + Clone>(app: &AppHandle, event: &str, payload: S) {
    if let Err(e) = app.emit(event, payload) {
        log::debug!("dropping {event} event: {e}");
    }
}

pub fn emit_asset_progress(app: &AppHandle, progress: &ProvisionProgress) {
    emit(app, ASSETS_PROGRESS, progress.clone());
}

pub fn emit_backend_ready(app: &AppHandle, pid: u32) {
    emit(app, BACKEND_READY, BackendReady { pid });
}

pub fn notify(app: &AppHandle, title: &str, body: &str) {
    if let Err(e) = app.notification().builder().title(title).body(body).show() {
        log::warn!("failed to show notification: {e}");
    }
}

/// Blocks the calling thread until the operator dismisses the dialog.
/// Must not be called from the main thread.
pub fn show_fatal_error(app: &AppHandle, title: &str, cause: &str) {
    app.dialog()
        .message(format!("GreetDesk could not start.\n\n{cause}"))
        .title(title)
        .kind(MessageDialogKind::Error)
        .blocking_show();
}

pub fn login_observer(app: &AppHandle) -> LoginObserver {
    let app = app.clone();
    Arc::new(move |snapshot: &LoginSnapshot| {
        emit(&app, LOGIN_CHANGED, snapshot.clone());
        if snapshot.state == LoginState::Expired {
            notify(&app, "QR code expired", "Scan timed out. Use Retry to get a fresh code.");
        }
    })
}

pub fn task_observer(app: &AppHandle) -> TaskObserver {
    let app = app.clone();
    Arc::new(move |event: &TaskEvent| match event {
        TaskEvent::Updated(snapshot) => emit(&app, TASK_CHANGED, snapshot.clone()),
        TaskEvent::Finished(snapshot) => {
            emit(&app, TASK_CHANGED, snapshot.clone());
            let (title, body) = task_summary(snapshot);
            notify(&app, &title, &body);
        }
    })
}

fn task_summary(snapshot: &TaskSnapshot) -> (String, String) {
    let title = format!("Greeting task {}", snapshot.state.as_str());
    let body = match &snapshot.run {
        Some(run) => {
            let mut body = format!(
                "Greeted {} · failed {} · skipped {} of {}",
                run.success_count, run.failed_count, run.skipped_count, run.target_count
            );
            if let Some(error) = run.error_message.as_deref().filter(|e| !e.is_empty()) {
                body.push_str(&format!("\n{error}"));
            }
            body
        }
        None => "No run details available".to_string(),
    };
    (title, body)
}

/// Runs the shutdown off the calling thread, then exits the event loop.
pub fn quit(app: &AppHandle, coordinator: Arc<ShutdownCoordinator>, reason: ShutdownReason) {
    let app = app.clone();
    let spawned = thread::Builder::new().name("shutdown".into()).spawn(move || {
        coordinator.request_shutdown(reason);
        app.exit(0);
    });
    if let Err(e) = spawned {
        log::error!("failed to spawn shutdown thread: {e}");
    }
}

pub fn build_tray(app: &tauri::App, coordinator: Arc<ShutdownCoordinator>) -> tauri::Result<()> {
    let show_item = MenuItemBuilder::with_id(MENU_ID_SHOW, "Show window").build(app)?;
    let quit_item = MenuItemBuilder::with_id(MENU_ID_QUIT, "Quit").build(app)?;
    let separator = PredefinedMenuItem::separator(app)?;
    let tray_menu = MenuBuilder::new(app)
        .items(&[&show_item, &separator, &quit_item])
        .build()?;

    let tray_icon_image = Image::from_bytes(include_bytes!("../icons/icon.png"))?;

    TrayIconBuilder::with_id(TRAY_ID)
        .icon(tray_icon_image)
        .icon_as_template(false)
        .menu(&tray_menu)
        .show_menu_on_left_click(true)
        .tooltip("GreetDesk")
        .on_menu_event(move |app, event| match event.id().as_ref() {
            MENU_ID_SHOW => show_main_window(app),
            MENU_ID_QUIT => quit(app, coordinator.clone(), ShutdownReason::TrayQuit),
            _ => {}
        })
        .build(app)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend_api::TaskRun;
    use crate::task_monitor::TaskState;

    #[test]
    fn summary_reports_final_counters() {
        let snapshot = TaskSnapshot {
            state: TaskState::Errored,
            run: Some(TaskRun {
                status: "error".into(),
                target_count: 50,
                success_count: 12,
                failed_count: 1,
                skipped_count: 3,
                error_message: Some("browser crashed".into()),
                ..TaskRun::default()
            }),
            logs: Vec::new(),
            polling: false,
            message: String::new(),
        };
        let (title, body) = task_summary(&snapshot);
        assert_eq!(title, "Greeting task errored");
        assert!(body.contains("Greeted 12"));
        assert!(body.contains("of 50"));
        assert!(body.ends_with("browser crashed"));
    }
}
