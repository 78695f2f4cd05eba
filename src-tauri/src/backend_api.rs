//! Client for the small HTTP surface the automation backend exposes.

use crate::config::HEALTH_PATH;
use crate::error::{Result, ShellError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

pub const QRCODE_PATH: &str = "/api/automation/qrcode";
pub const CHECK_LOGIN_PATH: &str = "/api/automation/check-login";
pub const REFRESH_QRCODE_PATH: &str = "/api/automation/refresh-qrcode";
pub const TASK_START_PATH: &str = "/api/greeting/start";
pub const TASK_STATUS_PATH: &str = "/api/greeting/status";
pub const TASK_LOGS_PATH: &str = "/api/greeting/logs";
pub const TASK_STOP_PATH: &str = "/api/greeting/stop";
pub const TASK_RESET_PATH: &str = "/api/greeting/reset";
pub const TASK_FORCE_RESET_PATH: &str = "/api/greeting/force-reset";

/// Message the backend sends instead of a QR code when the stored session is still valid.
const ALREADY_LOGGED_IN_MESSAGE: &str = "已登录，无需扫码";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QrCodeResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub qrcode: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub already_logged_in: bool,
    #[serde(default)]
    pub user_info: Option<Value>,
}

impl QrCodeResponse {
    pub fn is_already_authenticated(&self) -> bool {
        self.already_logged_in
            || (!self.success
                && self.qrcode.is_empty()
                && self.message.trim() == ALREADY_LOGGED_IN_MESSAGE)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoginCheckResponse {
    #[serde(default)]
    pub logged_in: bool,
    #[serde(default)]
    pub user_info: Option<Value>,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefreshQrResponse {
    #[serde(default)]
    pub need_refresh: bool,
    #[serde(default)]
    pub qrcode: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartTaskRequest {
    pub target_count: u32,
    #[serde(default)]
    pub expected_positions: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

/// Snapshot of one greeting run as reported by `/api/greeting/status`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub status: String,
    #[serde(default)]
    pub target_count: u32,
    #[serde(default)]
    pub current_index: u32,
    #[serde(default)]
    pub success_count: u32,
    #[serde(default)]
    pub failed_count: u32,
    #[serde(default)]
    pub skipped_count: u32,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub elapsed_time: Option<f64>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl TaskRun {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub level: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct LogsResponse {
    #[serde(default)]
    logs: Vec<LogEntry>,
}

/// Every call blocks the calling thread until a response or a transport error.
pub trait BackendApi: Send + Sync {
    fn health(&self) -> Result<()>;
    fn qrcode(&self) -> Result<QrCodeResponse>;
    fn check_login(&self) -> Result<LoginCheckResponse>;
    fn refresh_qrcode(&self) -> Result<RefreshQrResponse>;
    fn start_task(&self, request: &StartTaskRequest) -> Result<ControlResponse>;
    fn task_status(&self) -> Result<TaskRun>;
    fn task_logs(&self, last_n: usize) -> Result<Vec<LogEntry>>;
    fn stop_task(&self) -> Result<ControlResponse>;
    fn reset_task(&self) -> Result<ControlResponse>;
    fn force_reset_task(&self) -> Result<ControlResponse>;
}

pub struct HttpBackend {
    agent: ureq::Agent,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(2))
            .timeout(Duration::from_secs(5))
            .build();
        Self {
            agent,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.agent.get(&self.url(path)).call();
        decode(path, response)
    }

    fn post_json<T: DeserializeOwned>(&self, path: &str, body: Option<&impl Serialize>) -> Result<T> {
        let request = self.agent.post(&self.url(path));
        let response = match body {
            Some(body) => request.send_json(body),
            None => request.call(),
        };
        decode(path, response)
    }
}

fn decode<T: DeserializeOwned>(
    endpoint: &str,
    response: std::result::Result<ureq::Response, ureq::Error>,
) -> Result<T> {
    match response {
        Ok(resp) => resp.into_json::<T>().map_err(|e| ShellError::PollTransport {
            endpoint: endpoint.to_string(),
            reason: format!("invalid response body: {e}"),
        }),
        Err(ureq::Error::Status(status, resp)) => {
            let detail = resp
                .into_json::<Value>()
                .ok()
                .and_then(|body| body.get("detail").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_else(|| "request failed".to_string());
            Err(ShellError::BackendRejected {
                endpoint: endpoint.to_string(),
                status,
                detail,
            })
        }
        Err(ureq::Error::Transport(transport)) => Err(ShellError::PollTransport {
            endpoint: endpoint.to_string(),
            reason: transport.to_string(),
        }),
    }
}

impl BackendApi for HttpBackend {
    fn health(&self) -> Result<()> {
        match self.agent.get(&self.url(HEALTH_PATH)).call() {
            Ok(resp) if (200..300).contains(&resp.status()) => Ok(()),
            Ok(resp) => Err(ShellError::BackendRejected {
                endpoint: HEALTH_PATH.to_string(),
                status: resp.status(),
                detail: "not ready".to_string(),
            }),
            Err(err) => decode::<Value>(HEALTH_PATH, Err(err)).map(|_| ()),
        }
    }

    fn qrcode(&self) -> Result<QrCodeResponse> {
        self.get_json(QRCODE_PATH)
    }

    fn check_login(&self) -> Result<LoginCheckResponse> {
        self.get_json(CHECK_LOGIN_PATH)
    }

    fn refresh_qrcode(&self) -> Result<RefreshQrResponse> {
        self.get_json(REFRESH_QRCODE_PATH)
    }

    fn start_task(&self, request: &StartTaskRequest) -> Result<ControlResponse> {
        self.post_json(TASK_START_PATH, Some(request))
    }

    fn task_status(&self) -> Result<TaskRun> {
        self.get_json(TASK_STATUS_PATH)
    }

    fn task_logs(&self, last_n: usize) -> Result<Vec<LogEntry>> {
        let path = format!("{TASK_LOGS_PATH}?last_n={last_n}");
        self.get_json::<LogsResponse>(&path).map(|body| body.logs)
    }

    fn stop_task(&self) -> Result<ControlResponse> {
        self.post_json(TASK_STOP_PATH, None::<&Value>)
    }

    fn reset_task(&self) -> Result<ControlResponse> {
        self.post_json(TASK_RESET_PATH, None::<&Value>)
    }

    fn force_reset_task(&self) -> Result<ControlResponse> {
        self.post_json(TASK_FORCE_RESET_PATH, None::<&Value>)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_logged_in_is_recognised_from_flag_or_message() {
        let flagged = QrCodeResponse {
            success: true,
            already_logged_in: true,
            ..QrCodeResponse::default()
        };
        assert!(flagged.is_already_authenticated());

        let by_message = QrCodeResponse {
            success: false,
            message: "已登录，无需扫码".to_string(),
            ..QrCodeResponse::default()
        };
        assert!(by_message.is_already_authenticated());

        let failed = QrCodeResponse {
            success: false,
            message: "二维码加载失败".to_string(),
            ..QrCodeResponse::default()
        };
        assert!(!failed.is_already_authenticated());
    }

    #[test]
    fn task_run_tolerates_missing_optional_fields() {
        let run: TaskRun = serde_json::from_str(
            r#"{"status":"running","target_count":42,"current_index":3,"success_count":2,"failed_count":1,"progress":7.1}"#,
        )
        .unwrap();
        assert!(run.is_running());
        assert_eq!(run.target_count, 42);
        assert_eq!(run.skipped_count, 0);
        assert_eq!(run.error_message, None);
    }

    #[test]
    fn unreachable_backend_is_a_transport_error() {
        // Port 9 (discard) is closed on loopback in practice.
        let backend = HttpBackend::new("http://127.0.0.1:9/");
        match backend.health() {
            Err(ShellError::PollTransport { endpoint, .. }) => assert_eq!(endpoint, HEALTH_PATH),
            other => panic!("expected transport error, got {other:?}"),
        }
    }
}
