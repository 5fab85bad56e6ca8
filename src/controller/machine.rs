use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::{
    constants::DEFAULT_RETRY_DELAY,
    controller::{
        Controller, ReconcileNext,
        context::{ControllerContext, ControllerEvent, ControllerKey},
    },
    deprovision::TeardownOutcome,
    error::Error,
    provision::ProvisionOutcome,
    resources::machine::{MachinePhase, MachineRequest, MachineState, MachineStatus},
};

pub struct MachineController;

impl MachineController {
    pub fn new_boxed() -> Box<Self> {
        Box::new(Self)
    }
}

/// Records a failed pass on the status and picks the follow-up.
fn record_error(status: &mut MachineStatus, phase: MachinePhase, err: &Error) -> ReconcileNext {
    let message = err.to_string();
    status.last_error = Some(message.clone());

    match err.retry_after() {
        Some(delay) => {
            status.phase = phase;
            ReconcileNext::after(delay)
        }
        None => {
            status.phase = MachinePhase::Error { message };
            ReconcileNext::done()
        }
    }
}

async fn provision(
    ctx: &ControllerContext,
    request: MachineRequest,
    mut state: MachineState,
    mut status: MachineStatus,
) -> Result<ReconcileNext> {
    let id = request.id.clone();

    let result = ctx.pipeline.run(&request, &mut state, &mut status).await;
    let next = match result {
        Ok(ProvisionOutcome::Provisioned) => {
            if status.phase != MachinePhase::Provisioned {
                info!(machine = %id, "machine provisioned");
            }
            status.phase = MachinePhase::Provisioned;
            status.last_error = None;
            ReconcileNext::done()
        }
        Ok(ProvisionOutcome::RetryAfter(delay)) => {
            status.phase = MachinePhase::Provisioning;
            status.last_error = None;
            ReconcileNext::after(delay)
        }
        Err(e) => {
            if e.is_fatal() {
                error!(machine = %id, "provisioning failed: {e}");
            }
            record_error(&mut status, MachinePhase::Provisioning, &e)
        }
    };

    // progress made before a failure has to survive it
    ctx.repository.set_state(&id, &state).await?;
    ctx.repository.set_status(&id, &status).await?;

    Ok(next)
}

async fn deprovision(
    ctx: &ControllerContext,
    id: &str,
    state: MachineState,
    mut status: MachineStatus,
) -> Result<ReconcileNext> {
    status.phase = MachinePhase::Deprovisioning;

    let next = match ctx.teardown.run(id, &state).await {
        Ok(TeardownOutcome::Removed) => {
            ctx.repository.delete_records(id).await?;
            info!(machine = %id, "machine deprovisioned");
            return Ok(ReconcileNext::done());
        }
        Ok(TeardownOutcome::RetryAfter(delay)) => {
            status.last_error = None;
            ReconcileNext::after(delay)
        }
        Err(e) => {
            if e.is_fatal() {
                error!(machine = %id, "deprovisioning failed: {e}");
            }
            record_error(&mut status, MachinePhase::Deprovisioning, &e)
        }
    };

    ctx.repository.set_status(id, &status).await?;

    Ok(next)
}

#[async_trait]
impl Controller for MachineController {
    async fn schedule(
        &self,
        _ctx: ControllerContext,
        event: ControllerEvent,
    ) -> Result<Option<ControllerKey>> {
        debug!("scheduling machine controller for event: {:?}", event);
        let key = match event {
            ControllerEvent::BringUp(id) | ControllerEvent::ResourceChange(id) => {
                Some(ControllerKey::new(id))
            }
        };
        Ok(key)
    }

    async fn should_reconcile(&self, _ctx: ControllerContext, key: ControllerKey) -> bool {
        !key.machine_id.trim().is_empty()
    }

    async fn reconcile(&self, ctx: ControllerContext, key: ControllerKey) -> Result<ReconcileNext> {
        debug!("reconciling machine controller for key: {key}");

        let id = key.machine_id.as_str();
        let request = ctx.repository.get_request(id).await?;
        let state = ctx.repository.get_state(id).await?;
        let status = ctx.repository.get_status(id).await?;

        match (request, state) {
            (Some(request), state) => {
                provision(&ctx, request, state.unwrap_or_default(), status.unwrap_or_default())
                    .await
            }
            (None, Some(state)) => {
                deprovision(&ctx, id, state, status.unwrap_or_default()).await
            }
            (None, None) => {
                if status.is_some() {
                    ctx.repository.delete_records(id).await?;
                }
                debug!(machine = %id, "nothing to reconcile");
                Ok(ReconcileNext::done())
            }
        }
    }

    async fn handle_error(
        &self,
        _ctx: ControllerContext,
        key: ControllerKey,
        error: anyhow::Error,
    ) -> ReconcileNext {
        warn!("failed to reconcile {key}: {error:#}");
        ReconcileNext::after(DEFAULT_RETRY_DELAY)
    }
}
