use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::agent::hypervisor::{
    DomainHandle, Hypervisor, HypervisorResult, PoolHandle, VolumeHandle,
    descriptor::{DomainDescriptor, VolumeDescriptor},
};

/// Idempotent primitives over hypervisor volumes and domains.
///
/// Handles are resolved on every call; a missing object is `Ok(None)`,
/// anything else the hypervisor reports is passed through.
pub struct ResourceBroker {
    hypervisor: Arc<dyn Hypervisor>,
}

impl ResourceBroker {
    pub fn new(hypervisor: Arc<dyn Hypervisor>) -> Self {
        Self { hypervisor }
    }

    pub fn hypervisor(&self) -> Arc<dyn Hypervisor> {
        self.hypervisor.clone()
    }

    pub async fn pool(&self, pool: &str) -> HypervisorResult<Option<PoolHandle>> {
        not_found_as_none(self.hypervisor.pool_lookup(pool).await)
    }

    /// A missing pool means the volume cannot exist either.
    pub async fn volume(&self, pool: &str, name: &str) -> HypervisorResult<Option<VolumeHandle>> {
        let Some(pool) = self.pool(pool).await? else {
            return Ok(None);
        };

        not_found_as_none(self.hypervisor.volume_lookup(&pool, name).await)
    }

    /// Get-or-create. An existing volume is returned as is, whatever its
    /// format or capacity.
    pub async fn volume_create(
        &self,
        pool: &str,
        name: &str,
        format: &str,
        capacity_bytes: u64,
    ) -> HypervisorResult<VolumeHandle> {
        let pool = self.hypervisor.pool_lookup(pool).await?;

        if let Some(volume) = not_found_as_none(self.hypervisor.volume_lookup(&pool, name).await)? {
            debug!(volume = %name, "volume already exists");
            return Ok(volume);
        }

        let descriptor = VolumeDescriptor::new(name, format, capacity_bytes);
        let volume = self.hypervisor.volume_create(&pool, &descriptor).await?;
        info!(pool = %pool.name, volume = %name, capacity_bytes, "created volume");

        Ok(volume)
    }

    /// Returns whether a volume was actually removed.
    pub async fn volume_delete_if_exists(&self, pool: &str, name: &str) -> HypervisorResult<bool> {
        let Some(volume) = self.volume(pool, name).await? else {
            return Ok(false);
        };

        match self.hypervisor.volume_delete(&volume).await {
            Ok(()) => {
                info!(pool = %pool, volume = %name, "deleted volume");
                Ok(true)
            }
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn domain(&self, name: &str) -> HypervisorResult<Option<DomainHandle>> {
        not_found_as_none(self.hypervisor.domain_lookup_by_name(name).await)
    }

    pub async fn domain_by_uuid(&self, uuid: Uuid) -> HypervisorResult<Option<DomainHandle>> {
        not_found_as_none(self.hypervisor.domain_lookup_by_uuid(uuid).await)
    }

    /// Full overwrite of whatever is defined under the descriptor's name.
    pub async fn domain_define(&self, descriptor: &DomainDescriptor) -> HypervisorResult<DomainHandle> {
        let domain = self.hypervisor.domain_define(descriptor).await?;
        info!(domain = %domain.name, uuid = %domain.uuid, "defined domain");
        Ok(domain)
    }
}

fn not_found_as_none<T>(result: HypervisorResult<T>) -> HypervisorResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}
