// Prevents additional console window on Windows in release, DO NOT REMOVE!!
#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")]

mod asset_provisioner;
mod backend_api;
mod commands;
mod config;
mod desktop;
mod error;
mod login_session;
mod process_supervisor;
mod readiness;
mod shutdown;
mod startup;
mod task_monitor;
mod timers;

use asset_provisioner::AssetProvisioner;
use backend_api::{BackendApi, HttpBackend};
use commands::AppState;
use config::ShellConfig;
use login_session::{LoginSessionController, LoginTimings};
use process_supervisor::{LaunchPlan, ProcessSupervisor};
use shutdown::{ShutdownCoordinator, ShutdownReason};
use startup::BootSequence;
use std::sync::Arc;
use std::thread;
use task_monitor::{TaskMonitor, TaskTimings};
use tauri::{AppHandle, Manager};
use tauri_plugin_log::{Target, TargetKind};

/// Provisions, launches and health-gates the backend. Any failure here is
/// fatal: the operator gets a blocking dialog and the process exits.
fn boot_backend(
    app: AppHandle,
    config: ShellConfig,
    api: Arc<dyn BackendApi>,
    supervisor: Arc<ProcessSupervisor>,
    coordinator: Arc<ShutdownCoordinator>,
) {
    let resource_dir = app.path().resource_dir().ok();
    let outcome = LaunchPlan::for_mode(&config, resource_dir.as_deref()).and_then(|plan| {
        let provisioner = AssetProvisioner::from_config(&config, resource_dir.as_deref());
        BootSequence {
            supervisor: &supervisor,
            api: &*api,
            provisioner: Some(&provisioner),
            plan: &plan,
            settle_delay: config.settle_delay,
            health_attempts: config.health_attempts,
            health_interval: config.health_interval,
        }
        .run(&mut |progress| desktop::emit_asset_progress(&app, &progress))
    });

    match outcome {
        Ok(pid) => {
            log::info!("backend ready (pid {pid}, {} mode)", config.mode.as_str());
            desktop::emit_backend_ready(&app, pid);
        }
        Err(e) if coordinator.is_quitting() => {
            log::info!("backend boot abandoned during shutdown: {e}");
        }
        Err(e) => {
            log::error!("fatal startup error: {e}");
            let title = if e.is_fatal_startup() {
                "Backend failed to start"
            } else {
                "Startup failed"
            };
            desktop::show_fatal_error(&app, title, &e.to_string());
            coordinator.request_shutdown(ShutdownReason::StartupFailure);
            std::process::exit(1);
        }
    }
}

fn install_exit_handlers(coordinator: Arc<ShutdownCoordinator>) {
    let signal_coordinator = coordinator.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        log::info!("termination signal received");
        signal_coordinator.request_shutdown(ShutdownReason::Signal);
        std::process::exit(130);
    }) {
        log::warn!("failed to install termination signal handler: {e}");
    }

    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        log::error!("uncaught fault: {panic_info}");
        coordinator.request_shutdown(ShutdownReason::Fault);
        default_hook(panic_info);
        std::process::exit(101);
    }));
}

fn main() {
    let log_plugin = tauri_plugin_log::Builder::new()
        .level(log::LevelFilter::Info)
        .targets([
            Target::new(TargetKind::Stdout),
            Target::new(TargetKind::LogDir { file_name: None }),
            Target::new(TargetKind::Webview),
        ])
        .build();

    tauri::Builder::default()
        .plugin(log_plugin)
        .plugin(tauri_plugin_dialog::init())
        .plugin(tauri_plugin_notification::init())
        .setup(|app| {
            log::info!("GreetDesk is starting...");
            let handle = app.handle().clone();

            let config = ShellConfig::load().unwrap_or_else(|e| {
                log::warn!("ignoring invalid configuration ({e}); using defaults");
                ShellConfig::default()
            });
            log::info!(
                "backend at {} ({} mode)",
                config.base_url(),
                config.mode.as_str()
            );

            let api: Arc<dyn BackendApi> = Arc::new(HttpBackend::new(config.base_url()));
            let supervisor = Arc::new(ProcessSupervisor::from_config(&config));
            let coordinator = Arc::new(ShutdownCoordinator::new(supervisor.clone()));

            let login = LoginSessionController::with_observer(
                api.clone(),
                LoginTimings::default(),
                Some(desktop::login_observer(&handle)),
            );
            let tasks = TaskMonitor::with_observer(
                api.clone(),
                TaskTimings::default(),
                Some(desktop::task_observer(&handle)),
            );

            {
                let login = login.clone();
                let tasks = tasks.clone();
                coordinator.on_halt_pollers(move || {
                    login.halt();
                    tasks.halt();
                });
            }
            {
                let handle = handle.clone();
                coordinator.on_destroy_windows(move || desktop::destroy_windows(&handle));
            }
            install_exit_handlers(coordinator.clone());

            app.manage(AppState {
                api: api.clone(),
                supervisor: supervisor.clone(),
                login,
                tasks,
                shutdown: coordinator.clone(),
            });

            desktop::build_tray(app, coordinator.clone()).map_err(|e| e.to_string())?;
            desktop::show_main_window(&handle);

            thread::Builder::new()
                .name("backend-boot".into())
                .spawn(move || boot_backend(handle, config, api, supervisor, coordinator))
                .map_err(|e| e.to_string())?;

            Ok(())
        })
        .on_window_event(|window, event| {
            if let tauri::WindowEvent::CloseRequested { api, .. } = event {
                let app = window.app_handle();
                if let Some(state) = app.try_state::<AppState>() {
                    if !state.shutdown.is_quitting() {
                        api.prevent_close();
                        desktop::quit(app, state.shutdown.clone(), ShutdownReason::WindowClosed);
                    }
                }
            }
        })
        .invoke_handler(tauri::generate_handler![
            commands::login_start,
            commands::login_cancel,
            commands::login_retry,
            commands::login_snapshot,
            commands::task_start,
            commands::task_attach,
            commands::task_stop,
            commands::task_reset,
            commands::task_force_reset,
            commands::task_snapshot,
            commands::backend_health,
            commands::quit_app
        ])
        .build(tauri::generate_context!())
        .expect("error while building tauri application")
        .run(|app, event| match event {
            // Destroying the last window lands here while cleanup is still
            // running; the shutdown thread calls `app.exit` once it is done.
            tauri::RunEvent::ExitRequested { api, .. } => {
                if let Some(state) = app.try_state::<AppState>() {
                    if !state.shutdown.is_done() {
                        api.prevent_exit();
                        if !state.shutdown.is_quitting() {
                            desktop::quit(app, state.shutdown.clone(), ShutdownReason::AppExit);
                        }
                    }
                }
            }
            tauri::RunEvent::Exit => {
                if let Some(state) = app.try_state::<AppState>() {
                    state.shutdown.request_shutdown(ShutdownReason::AppExit);
                }
            }
            _ => {}
        });
}
