use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::{
    agent::broker::ResourceBroker,
    constants::DISK_FORMAT_QCOW2,
    error::{Error, Result},
    provision::{ProvisionContext, Step, StepOutcome},
    resources::machine::{AdditionalDiskState, additional_volume_name},
};

/// Creates the extra data disks. The recorded names let teardown find
/// them even if the request is edited later.
pub struct ProvisionAdditionalDisks {
    broker: Arc<ResourceBroker>,
}

impl ProvisionAdditionalDisks {
    pub fn new(broker: Arc<ResourceBroker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl Step for ProvisionAdditionalDisks {
    fn name(&self) -> &'static str {
        "provision-additional-disks"
    }

    async fn run(&self, ctx: &mut ProvisionContext<'_>) -> Result<StepOutcome> {
        if ctx.state.additional_disks.is_some() {
            return Ok(StepOutcome::Continue);
        }

        let pool = ctx.data.storage_pool.clone();
        let machine_id = ctx.machine_id().to_string();
        let specs = ctx.data.additional_disks.clone();

        for (idx, spec) in specs.iter().enumerate() {
            let vol_name = additional_volume_name(&machine_id, idx, spec.disk_type);
            let capacity = spec.size_bytes()?;

            self.broker
                .volume_create(&pool, &vol_name, DISK_FORMAT_QCOW2, capacity)
                .await
                .map_err(|e| Error::transient(format!("error creating disk {vol_name}"), e))?;

            // recorded right away so teardown finds it if a later disk fails
            let partial = &mut ctx.state.partial_additional_disks;
            if !partial.iter().any(|disk| disk.vol_name == vol_name) {
                partial.push(AdditionalDiskState {
                    disk_type: spec.disk_type,
                    vol_name,
                });
            }
        }

        let disks = std::mem::take(&mut ctx.state.partial_additional_disks);
        info!(count = disks.len(), "provisioned additional disks");
        ctx.state.additional_disks = Some(disks);

        Ok(StepOutcome::Continue)
    }
}
