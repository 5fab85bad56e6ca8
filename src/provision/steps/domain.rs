use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    agent::{
        broker::ResourceBroker,
        hypervisor::descriptor::{DiskDevice, DomainDescriptor, DomainDisk, DomainInterface},
    },
    constants::{DISK_FORMAT_QCOW2, DISK_FORMAT_RAW},
    error::{Error, Result},
    provision::{
        ProvisionContext, Step, StepOutcome,
        slots::{CIDATA_DISK_BUS, CIDATA_DISK_DEV, PRIMARY_DISK_BUS, PRIMARY_DISK_DEV, SlotAllocator},
    },
};

pub struct DefineDomain {
    broker: Arc<ResourceBroker>,
}

impl DefineDomain {
    pub fn new(broker: Arc<ResourceBroker>) -> Self {
        Self { broker }
    }
}

fn waiting_for(what: &str) -> Error {
    Error::transient(format!("waiting for {what}"), anyhow!("{what} not provisioned yet"))
}

fn qcow2_disk(pool: &str, volume: &str, target_dev: String, target_bus: &str) -> DomainDisk {
    DomainDisk {
        device: DiskDevice::Disk,
        format: DISK_FORMAT_QCOW2.to_string(),
        pool: pool.to_string(),
        volume: volume.to_string(),
        target_dev,
        target_bus: target_bus.to_string(),
        serial: None,
        read_only: false,
    }
}

/// Assembles the domain from what earlier steps recorded.
pub fn build_descriptor(ctx: &ProvisionContext<'_>) -> Result<DomainDescriptor> {
    let uuid = ctx.state.uuid.ok_or_else(|| waiting_for("uuid"))?;
    let vm_vol_name = ctx
        .state
        .vm_vol_name
        .as_deref()
        .ok_or_else(|| waiting_for("image"))?;
    let additional = ctx
        .state
        .additional_disks
        .as_deref()
        .ok_or_else(|| waiting_for("additional disks"))?;

    let pool = ctx.data.storage_pool.as_str();

    let mut disks = vec![qcow2_disk(
        pool,
        vm_vol_name,
        PRIMARY_DISK_DEV.to_string(),
        PRIMARY_DISK_BUS,
    )];

    let mut slots = SlotAllocator::default();
    for disk in additional {
        let slot = slots.next(disk.disk_type);
        let mut domain_disk = qcow2_disk(pool, &disk.vol_name, slot.dev, slot.bus);
        domain_disk.serial = Some(Uuid::new_v4().to_string());
        disks.push(domain_disk);
    }

    if let Some(cidata) = &ctx.state.cidata_vol_name {
        disks.push(DomainDisk {
            device: DiskDevice::Cdrom,
            format: DISK_FORMAT_RAW.to_string(),
            pool: pool.to_string(),
            volume: cidata.clone(),
            target_dev: CIDATA_DISK_DEV.to_string(),
            target_bus: CIDATA_DISK_BUS.to_string(),
            serial: None,
            read_only: true,
        });
    }

    let interfaces = ctx
        .data
        .network_interfaces
        .iter()
        .map(|iface| DomainInterface {
            model: iface.driver.clone(),
            network: iface.network_name.clone(),
        })
        .collect();

    Ok(DomainDescriptor {
        name: ctx.machine_id().to_string(),
        uuid,
        memory_mib: ctx.data.memory,
        vcpus: ctx.data.cores,
        disks,
        interfaces,
    })
}

#[async_trait]
impl Step for DefineDomain {
    fn name(&self) -> &'static str {
        "define-domain"
    }

    async fn run(&self, ctx: &mut ProvisionContext<'_>) -> Result<StepOutcome> {
        if ctx.state.vm_name.is_some() {
            return Ok(StepOutcome::Continue);
        }

        let descriptor = build_descriptor(ctx)?;

        let pool = ctx.data.storage_pool.as_str();
        let primary = descriptor.disks[0].volume.as_str();
        let exists = self
            .broker
            .volume(pool, primary)
            .await
            .map_err(|e| Error::transient("error fetching volume", e))?;
        if exists.is_none() {
            return Err(waiting_for("primary volume"));
        }

        debug!(xml = %descriptor.to_xml(), "domain descriptor");

        self.broker
            .domain_define(&descriptor)
            .await
            .map_err(|e| Error::transient("creating domain", e))?;

        info!(domain = %descriptor.name, disks = descriptor.disks.len(), "defined domain");
        ctx.state.vm_name = Some(descriptor.name);

        Ok(StepOutcome::Continue)
    }
}
