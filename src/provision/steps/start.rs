use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use tracing::{debug, info};

use crate::{
    agent::{
        broker::ResourceBroker,
        hypervisor::{DomainState, HypervisorError},
    },
    error::{Error, Result},
    provision::{ProvisionContext, Step, StepOutcome},
};

pub struct StartDomain {
    broker: Arc<ResourceBroker>,
}

impl StartDomain {
    pub fn new(broker: Arc<ResourceBroker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl Step for StartDomain {
    fn name(&self) -> &'static str {
        "start-domain"
    }

    async fn run(&self, ctx: &mut ProvisionContext<'_>) -> Result<StepOutcome> {
        let Some(vm_name) = ctx.state.vm_name.as_deref() else {
            return Err(Error::transient(
                "waiting for domain definition",
                anyhow!("domain not defined yet"),
            ));
        };

        let domain = self
            .broker
            .domain(vm_name)
            .await
            .map_err(|e| Error::transient("VM lookup failed", e))?
            .ok_or_else(|| {
                Error::transient("VM lookup failed", anyhow!("domain {vm_name} not found"))
            })?;

        let hypervisor = self.broker.hypervisor();
        let state = hypervisor
            .domain_state(&domain)
            .await
            .map_err(|e| Error::transient("error fetching domain state", e))?;

        if state == DomainState::Running {
            debug!(domain = %vm_name, "domain already running");
            return Ok(StepOutcome::Continue);
        }

        match hypervisor.domain_create(&domain).await {
            Ok(()) => info!(domain = %vm_name, "started domain"),
            // lost a race with another start
            Err(HypervisorError::DomainAlreadyRunning(_)) => {
                debug!(domain = %vm_name, "domain started concurrently");
            }
            Err(e) => return Err(Error::transient("failed to start VM", e)),
        }

        Ok(StepOutcome::Continue)
    }
}
