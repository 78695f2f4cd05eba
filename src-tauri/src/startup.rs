use crate::asset_provisioner::{AssetProvisioner, ProvisionProgress};
use crate::backend_api::BackendApi;
use crate::error::Result;
use crate::process_supervisor::{LaunchPlan, ProcessSupervisor};
use crate::readiness::wait_until_healthy;
use std::thread;
use std::time::Duration;

/// Everything needed to bring the backend from nothing to healthy.
pub struct BootSequence<'a> {
    pub supervisor: &'a ProcessSupervisor,
    pub api: &'a dyn BackendApi,
    pub provisioner: Option<&'a AssetProvisioner>,
    pub plan: &'a LaunchPlan,
    pub settle_delay: Duration,
    pub health_attempts: u32,
    pub health_interval: Duration,
}

impl BootSequence<'_> {
    /// Provision, launch, settle, then gate on health. A backend that never
    /// becomes healthy is torn down before the error is returned.
    pub fn run(&self, report: &mut dyn FnMut(ProvisionProgress)) -> Result<u32> {
        if let Some(provisioner) = self.provisioner {
            provisioner.ensure_asset_installed(report)?;
        }

        let pid = self.supervisor.start(self.plan)?;
        if !self.settle_delay.is_zero() {
            log::info!("letting backend settle for {:?}", self.settle_delay);
            thread::sleep(self.settle_delay);
        }

        if let Err(e) = wait_until_healthy(self.api, self.health_attempts, self.health_interval) {
            log::error!("backend pid {pid} never became healthy; tearing it down");
            self.supervisor.terminate();
            return Err(e);
        }
        Ok(pid)
    }
}
