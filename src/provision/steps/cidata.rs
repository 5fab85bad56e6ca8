use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::{
    agent::{
        broker::ResourceBroker,
        cidata::{BootstrapEncoder, CidataPayload, hostname_patch},
    },
    constants::DISK_FORMAT_RAW,
    error::{Error, Result},
    provision::{ProvisionContext, Step, StepOutcome},
    resources::machine::cidata_volume_name,
};

/// nocloud seed ISO carrying hostname and network config for the first boot.
pub struct ProvisionCidata {
    broker: Arc<ResourceBroker>,
    encoder: Arc<dyn BootstrapEncoder>,
}

impl ProvisionCidata {
    pub fn new(broker: Arc<ResourceBroker>, encoder: Arc<dyn BootstrapEncoder>) -> Self {
        Self { broker, encoder }
    }
}

#[async_trait]
impl Step for ProvisionCidata {
    fn name(&self) -> &'static str {
        "provision-cidata"
    }

    async fn run(&self, ctx: &mut ProvisionContext<'_>) -> Result<StepOutcome> {
        let patch = hostname_patch(ctx.machine_id())
            .map_err(|e| Error::fatal("error rendering hostname patch", e))?;
        ctx.add_config_patch(patch);

        if ctx.state.cidata_vol_name.is_some() {
            return Ok(StepOutcome::Continue);
        }

        let pool = ctx.data.storage_pool.clone();
        let vol_name = cidata_volume_name(ctx.machine_id());

        let iso = self
            .encoder
            .encode(&CidataPayload::for_machine(ctx.machine_id()))
            .await
            .map_err(|e| Error::transient("error generating cidata ISO", e))?;

        // the content may differ from a previous attempt, replace it
        self.broker
            .volume_delete_if_exists(&pool, &vol_name)
            .await
            .map_err(|e| Error::transient(format!("error deleting old cidata volume {vol_name}"), e))?;

        let volume = self
            .broker
            .volume_create(&pool, &vol_name, DISK_FORMAT_RAW, iso.len() as u64)
            .await
            .map_err(|e| Error::transient("error creating cidata volume", e))?;

        let file = tempfile::Builder::new()
            .prefix("cidata-")
            .suffix(".iso")
            .tempfile()
            .map_err(|e| Error::transient("error staging cidata ISO", e))?;
        tokio::fs::write(file.path(), &iso)
            .await
            .map_err(|e| Error::transient("error staging cidata ISO", e))?;

        self.broker
            .hypervisor()
            .volume_upload(&volume, file.path())
            .await
            .map_err(|e| Error::transient("error uploading cidata ISO", e))?;

        info!(volume = %vol_name, "provisioned cidata ISO");
        ctx.state.cidata_vol_name = Some(vol_name);

        Ok(StepOutcome::Continue)
    }
}
