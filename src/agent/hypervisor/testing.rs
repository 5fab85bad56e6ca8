use std::{
    collections::{BTreeMap, HashSet},
    path::Path,
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use uuid::Uuid;

use crate::agent::hypervisor::{
    DomainHandle, DomainState, Hypervisor, HypervisorError, HypervisorResult, ObjectKind,
    PoolHandle, VolumeHandle,
    descriptor::{DomainDescriptor, VolumeDescriptor},
};

#[derive(Debug, Clone)]
pub struct FakeDomain {
    pub descriptor: DomainDescriptor,
    pub state: DomainState,
}

#[derive(Debug, Clone)]
pub struct FakeVolume {
    pub descriptor: VolumeDescriptor,
    pub capacity_bytes: u64,
    pub content: Vec<u8>,
}

#[derive(Default)]
struct Inner {
    domains: BTreeMap<String, FakeDomain>,
    pools: HashSet<String>,
    volumes: BTreeMap<(String, String), FakeVolume>,
    calls: Vec<String>,
    mutations: usize,
    failures: HashSet<String>,
    failing_calls: HashSet<String>,
    state_after_destroy: Option<DomainState>,
    uuid_collisions: usize,
}

/// In-memory hypervisor recording every call it receives.
#[derive(Default)]
pub struct FakeHypervisor {
    inner: Mutex<Inner>,
}

impl FakeHypervisor {
    pub fn with_pool(pool: &str) -> Self {
        let fake = Self::default();
        fake.add_pool(pool);
        fake
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_pool(&self, pool: &str) {
        self.lock().pools.insert(pool.to_string());
    }

    pub fn add_volume(&self, pool: &str, name: &str) {
        self.lock().volumes.insert(
            (pool.to_string(), name.to_string()),
            FakeVolume {
                descriptor: VolumeDescriptor::new(name, "qcow2", 0),
                capacity_bytes: 0,
                content: Vec::new(),
            },
        );
    }

    pub fn add_domain(&self, name: &str, uuid: Uuid, state: DomainState) {
        self.lock().domains.insert(
            name.to_string(),
            FakeDomain {
                descriptor: DomainDescriptor {
                    name: name.to_string(),
                    uuid,
                    memory_mib: 0,
                    vcpus: 0,
                    disks: vec![],
                    interfaces: vec![],
                },
                state,
            },
        );
    }

    pub fn set_domain_state(&self, name: &str, state: DomainState) {
        if let Some(domain) = self.lock().domains.get_mut(name) {
            domain.state = state;
        }
    }

    /// State a domain lands in after `destroy`, `Shutoff` unless overridden.
    pub fn set_state_after_destroy(&self, state: DomainState) {
        self.lock().state_after_destroy = Some(state);
    }

    /// The next `count` lookups by uuid report a foreign domain.
    pub fn collide_uuids(&self, count: usize) {
        self.lock().uuid_collisions = count;
    }

    /// Makes every call to `op` fail with a command error.
    pub fn fail(&self, op: &str) {
        self.lock().failures.insert(op.to_string());
    }

    /// Fails only calls matching `"op arg"` exactly.
    pub fn fail_call(&self, call: &str) {
        self.lock().failing_calls.insert(call.to_string());
    }

    pub fn clear_failures(&self) {
        let mut inner = self.lock();
        inner.failures.clear();
        inner.failing_calls.clear();
    }

    pub fn domain(&self, name: &str) -> Option<FakeDomain> {
        self.lock().domains.get(name).cloned()
    }

    pub fn volume(&self, pool: &str, name: &str) -> Option<FakeVolume> {
        self.lock()
            .volumes
            .get(&(pool.to_string(), name.to_string()))
            .cloned()
    }

    pub fn volume_names(&self) -> Vec<String> {
        self.lock().volumes.keys().map(|(_, name)| name.clone()).collect()
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    pub fn clear_calls(&self) {
        let mut inner = self.lock();
        inner.calls.clear();
        inner.mutations = 0;
    }

    /// Number of calls that changed hypervisor state.
    pub fn mutations(&self) -> usize {
        self.lock().mutations
    }

    fn record(&self, op: &str, arg: &str, mutating: bool) -> HypervisorResult<std::sync::MutexGuard<'_, Inner>> {
        let mut inner = self.lock();
        let call = format!("{op} {arg}");
        let failing = inner.failures.contains(op) || inner.failing_calls.contains(&call);
        inner.calls.push(call);
        if failing {
            return Err(HypervisorError::Command {
                op: op.to_string(),
                message: "injected failure".to_string(),
            });
        }
        if mutating {
            inner.mutations += 1;
        }
        Ok(inner)
    }
}

fn not_found(kind: ObjectKind, name: &str) -> HypervisorError {
    HypervisorError::NotFound {
        kind,
        name: name.to_string(),
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn domain_lookup_by_name(&self, name: &str) -> HypervisorResult<DomainHandle> {
        let inner = self.record("domain_lookup_by_name", name, false)?;
        inner
            .domains
            .get(name)
            .map(|d| DomainHandle {
                name: name.to_string(),
                uuid: d.descriptor.uuid,
            })
            .ok_or_else(|| not_found(ObjectKind::Domain, name))
    }

    async fn domain_lookup_by_uuid(&self, uuid: Uuid) -> HypervisorResult<DomainHandle> {
        let mut inner = self.record("domain_lookup_by_uuid", &uuid.to_string(), false)?;
        if inner.uuid_collisions > 0 {
            inner.uuid_collisions -= 1;
            return Ok(DomainHandle {
                name: "foreign".to_string(),
                uuid,
            });
        }
        inner
            .domains
            .values()
            .find(|d| d.descriptor.uuid == uuid)
            .map(|d| DomainHandle {
                name: d.descriptor.name.clone(),
                uuid,
            })
            .ok_or_else(|| not_found(ObjectKind::Domain, &uuid.to_string()))
    }

    async fn domain_state(&self, domain: &DomainHandle) -> HypervisorResult<DomainState> {
        let inner = self.record("domain_state", &domain.name, false)?;
        inner
            .domains
            .get(&domain.name)
            .map(|d| d.state.clone())
            .ok_or_else(|| not_found(ObjectKind::Domain, &domain.name))
    }

    async fn domain_create(&self, domain: &DomainHandle) -> HypervisorResult<()> {
        let mut inner = self.record("domain_create", &domain.name, true)?;
        let entry = inner
            .domains
            .get_mut(&domain.name)
            .ok_or_else(|| not_found(ObjectKind::Domain, &domain.name))?;
        if entry.state.is_active() {
            return Err(HypervisorError::DomainAlreadyRunning(domain.name.clone()));
        }
        entry.state = DomainState::Running;
        Ok(())
    }

    async fn domain_destroy(&self, domain: &DomainHandle) -> HypervisorResult<()> {
        let mut inner = self.record("domain_destroy", &domain.name, true)?;
        let next = inner
            .state_after_destroy
            .clone()
            .unwrap_or(DomainState::Shutoff);
        let entry = inner
            .domains
            .get_mut(&domain.name)
            .ok_or_else(|| not_found(ObjectKind::Domain, &domain.name))?;
        entry.state = next;
        Ok(())
    }

    async fn domain_undefine(&self, domain: &DomainHandle) -> HypervisorResult<()> {
        let mut inner = self.record("domain_undefine", &domain.name, true)?;
        inner
            .domains
            .remove(&domain.name)
            .map(|_| ())
            .ok_or_else(|| not_found(ObjectKind::Domain, &domain.name))
    }

    async fn domain_define(&self, descriptor: &DomainDescriptor) -> HypervisorResult<DomainHandle> {
        let mut inner = self.record("domain_define", &descriptor.name, true)?;
        inner.domains.insert(
            descriptor.name.clone(),
            FakeDomain {
                descriptor: descriptor.clone(),
                state: DomainState::Shutoff,
            },
        );
        Ok(DomainHandle {
            name: descriptor.name.clone(),
            uuid: descriptor.uuid,
        })
    }

    async fn pool_lookup(&self, name: &str) -> HypervisorResult<PoolHandle> {
        let inner = self.record("pool_lookup", name, false)?;
        if inner.pools.contains(name) {
            Ok(PoolHandle {
                name: name.to_string(),
            })
        } else {
            Err(not_found(ObjectKind::Pool, name))
        }
    }

    async fn volume_lookup(&self, pool: &PoolHandle, name: &str) -> HypervisorResult<VolumeHandle> {
        let inner = self.record("volume_lookup", name, false)?;
        if inner
            .volumes
            .contains_key(&(pool.name.clone(), name.to_string()))
        {
            Ok(VolumeHandle {
                pool: pool.name.clone(),
                name: name.to_string(),
            })
        } else {
            Err(not_found(ObjectKind::Volume, name))
        }
    }

    async fn volume_create(
        &self,
        pool: &PoolHandle,
        descriptor: &VolumeDescriptor,
    ) -> HypervisorResult<VolumeHandle> {
        let mut inner = self.record("volume_create", &descriptor.name, true)?;
        let key = (pool.name.clone(), descriptor.name.clone());
        if inner.volumes.contains_key(&key) {
            return Err(HypervisorError::Command {
                op: "volume_create".to_string(),
                message: format!("storage volume '{}' exists already", descriptor.name),
            });
        }
        inner.volumes.insert(
            key,
            FakeVolume {
                descriptor: descriptor.clone(),
                capacity_bytes: descriptor.capacity_bytes,
                content: Vec::new(),
            },
        );
        Ok(VolumeHandle {
            pool: pool.name.clone(),
            name: descriptor.name.clone(),
        })
    }

    async fn volume_delete(&self, volume: &VolumeHandle) -> HypervisorResult<()> {
        let mut inner = self.record("volume_delete", &volume.name, true)?;
        inner
            .volumes
            .remove(&(volume.pool.clone(), volume.name.clone()))
            .map(|_| ())
            .ok_or_else(|| not_found(ObjectKind::Volume, &volume.name))
    }

    async fn volume_resize(&self, volume: &VolumeHandle, capacity_bytes: u64) -> HypervisorResult<()> {
        let mut inner = self.record("volume_resize", &volume.name, true)?;
        let entry = inner
            .volumes
            .get_mut(&(volume.pool.clone(), volume.name.clone()))
            .ok_or_else(|| not_found(ObjectKind::Volume, &volume.name))?;
        entry.capacity_bytes = capacity_bytes;
        Ok(())
    }

    async fn volume_upload(&self, volume: &VolumeHandle, source: &Path) -> HypervisorResult<()> {
        let content = std::fs::read(source).map_err(|source| HypervisorError::Io {
            op: "volume_upload".to_string(),
            source,
        })?;
        let mut inner = self.record("volume_upload", &volume.name, true)?;
        let entry = inner
            .volumes
            .get_mut(&(volume.pool.clone(), volume.name.clone()))
            .ok_or_else(|| not_found(ObjectKind::Volume, &volume.name))?;
        entry.content = content;
        Ok(())
    }
}
