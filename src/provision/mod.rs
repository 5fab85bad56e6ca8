pub mod slots;
pub mod steps;

use std::time::Duration;

use async_trait::async_trait;
use tracing::{Instrument, debug, info_span, warn};
use uuid::Uuid;

use crate::{
    agent::Agent,
    error::{Error, Result},
    resources::machine::{ConfigPatch, MachineRequest, MachineState, MachineStatus, ProviderData},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    /// Nothing failed, but the pass has to start over later.
    RetryAfter(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionOutcome {
    Provisioned,
    RetryAfter(Duration),
}

/// Everything one pass works on. `data` is decoded once per pass.
pub struct ProvisionContext<'a> {
    pub request: &'a MachineRequest,
    pub data: ProviderData,
    pub state: &'a mut MachineState,
    pub status: &'a mut MachineStatus,
}

impl ProvisionContext<'_> {
    pub fn machine_id(&self) -> &str {
        &self.request.id
    }

    pub fn set_machine_uuid(&mut self, uuid: Uuid) {
        self.status.machine_uuid = Some(uuid);
    }

    /// Replaces a patch with the same id.
    pub fn add_config_patch(&mut self, patch: ConfigPatch) {
        match self
            .status
            .config_patches
            .iter_mut()
            .find(|p| p.id == patch.id)
        {
            Some(existing) => *existing = patch,
            None => self.status.config_patches.push(patch),
        }
    }
}

/// A provisioning step. A step skips its work when the state already holds
/// what it produces, and records what it produced before returning.
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &mut ProvisionContext<'_>) -> Result<StepOutcome>;
}

pub struct Pipeline {
    steps: Vec<Box<dyn Step>>,
}

impl Pipeline {
    pub fn new(agent: &Agent) -> Self {
        Self::with_steps(steps::all(agent))
    }

    pub fn with_steps(steps: Vec<Box<dyn Step>>) -> Self {
        Self { steps }
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Runs every step in order, stopping at the first that is not done.
    pub async fn run(
        &self,
        request: &MachineRequest,
        state: &mut MachineState,
        status: &mut MachineStatus,
    ) -> Result<ProvisionOutcome> {
        if request.id.trim().is_empty() {
            return Err(Error::config("machine id must be set"));
        }
        if request.talos_version.trim().is_empty() {
            return Err(Error::config("talos version must be set"));
        }

        let data = request.provider_data()?;
        let mut ctx = ProvisionContext {
            request,
            data,
            state,
            status,
        };

        for step in &self.steps {
            let span = info_span!("step", machine = %request.id, step = step.name());

            match step.run(&mut ctx).instrument(span).await {
                Ok(StepOutcome::Continue) => {}
                Ok(StepOutcome::RetryAfter(delay)) => {
                    debug!(machine = %request.id, step = step.name(), ?delay, "step asked for retry");
                    return Ok(ProvisionOutcome::RetryAfter(delay));
                }
                Err(e) => {
                    warn!(machine = %request.id, step = step.name(), "step failed: {e}");
                    return Err(e);
                }
            }
        }

        Ok(ProvisionOutcome::Provisioned)
    }
}
