use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    agent::broker::ResourceBroker,
    constants::UUID_COLLISION_RETRY_DELAY,
    error::{Error, Result},
    provision::{ProvisionContext, Step, StepOutcome},
};

/// Picks the machine UUID. It becomes the domain UUID and is what the
/// orchestration layer identifies the machine by.
pub struct GenerateUuid {
    broker: Arc<ResourceBroker>,
}

impl GenerateUuid {
    pub fn new(broker: Arc<ResourceBroker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl Step for GenerateUuid {
    fn name(&self) -> &'static str {
        "generate-uuid"
    }

    async fn run(&self, ctx: &mut ProvisionContext<'_>) -> Result<StepOutcome> {
        if let Some(uuid) = ctx.state.uuid {
            ctx.set_machine_uuid(uuid);
            return Ok(StepOutcome::Continue);
        }

        let candidate = Uuid::new_v4();

        let existing = self
            .broker
            .domain_by_uuid(candidate)
            .await
            .map_err(|e| Error::transient("error looking up domain by uuid", e))?;

        if let Some(domain) = existing {
            debug!(uuid = %candidate, domain = %domain.name, "uuid already taken");
            return Ok(StepOutcome::RetryAfter(UUID_COLLISION_RETRY_DELAY));
        }

        ctx.state.uuid = Some(candidate);
        ctx.set_machine_uuid(candidate);
        info!(uuid = %candidate, "assigned machine uuid");

        Ok(StepOutcome::Continue)
    }
}
