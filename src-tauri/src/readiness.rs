use crate::backend_api::BackendApi;
use crate::error::{Result, ShellError};
use std::thread;
use std::time::Duration;

/// Polls the health endpoint up to `max_attempts` times, `interval` apart.
pub fn wait_until_healthy(api: &dyn BackendApi, max_attempts: u32, interval: Duration) -> Result<()> {
    let max_attempts = max_attempts.max(1);
    for attempt in 1..=max_attempts {
        match api.health() {
            Ok(()) => {
                log::info!("backend healthy after {attempt} attempt(s)");
                return Ok(());
            }
            Err(e) => log::info!("waiting for backend... ({attempt}/{max_attempts}): {e}"),
        }
        if attempt < max_attempts {
            thread::sleep(interval);
        }
    }
    Err(ShellError::HealthCheckTimeout {
        attempts: max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend_api::fake::FakeBackend;

    #[test]
    fn returns_as_soon_as_backend_answers() {
        let backend = FakeBackend::new();
        *backend.healthy_from.lock().unwrap() = Some(3);
        wait_until_healthy(&backend, 10, Duration::from_millis(1)).unwrap();
        assert_eq!(backend.calls("health"), 3);
    }

    #[test]
    fn gives_up_after_exactly_max_attempts() {
        let backend = FakeBackend::new();
        let err = wait_until_healthy(&backend, 10, Duration::from_millis(1)).unwrap_err();
        assert!(matches!(err, ShellError::HealthCheckTimeout { attempts: 10 }));
        assert_eq!(backend.calls("health"), 10);
    }

    #[test]
    fn zero_attempts_still_probes_once() {
        let backend = FakeBackend::new();
        *backend.healthy_from.lock().unwrap() = Some(1);
        wait_until_healthy(&backend, 0, Duration::from_millis(1)).unwrap();
        assert_eq!(backend.calls("health"), 1);
    }
}
