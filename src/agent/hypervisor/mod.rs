pub mod descriptor;
pub mod virsh;

#[cfg(test)]
pub(crate) mod testing;

use std::{fmt, path::Path};

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::agent::hypervisor::descriptor::{DomainDescriptor, VolumeDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Domain,
    Pool,
    Volume,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectKind::Domain => f.write_str("domain"),
            ObjectKind::Pool => f.write_str("storage pool"),
            ObjectKind::Volume => f.write_str("storage volume"),
        }
    }
}

#[derive(Debug, Error)]
pub enum HypervisorError {
    #[error("{kind} {name} not found")]
    NotFound { kind: ObjectKind, name: String },

    #[error("domain {0} is already running")]
    DomainAlreadyRunning(String),

    #[error("{op} failed: {message}")]
    Command { op: String, message: String },

    #[error("{op}: {source}")]
    Io {
        op: String,
        #[source]
        source: std::io::Error,
    },
}

impl HypervisorError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, HypervisorError::NotFound { .. })
    }
}

pub type HypervisorResult<T> = std::result::Result<T, HypervisorError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainHandle {
    pub name: String,
    pub uuid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolHandle {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeHandle {
    pub pool: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainState {
    NoState,
    Running,
    Blocked,
    Paused,
    ShuttingDown,
    Shutoff,
    Crashed,
    PmSuspended,
    Other(String),
}

impl DomainState {
    /// Parses the state names printed by `virsh domstate`.
    pub fn parse(state: &str) -> Self {
        match state.trim() {
            "no state" | "nostate" => DomainState::NoState,
            "running" => DomainState::Running,
            "idle" | "blocked" => DomainState::Blocked,
            "paused" => DomainState::Paused,
            "in shutdown" | "shutdown" => DomainState::ShuttingDown,
            "shut off" | "shutoff" => DomainState::Shutoff,
            "crashed" => DomainState::Crashed,
            "pmsuspended" => DomainState::PmSuspended,
            other => DomainState::Other(other.to_string()),
        }
    }

    /// A qemu process exists for the domain and `destroy` will stop it.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            DomainState::Running | DomainState::Blocked | DomainState::Paused
        )
    }
}

impl fmt::Display for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DomainState::NoState => f.write_str("no state"),
            DomainState::Running => f.write_str("running"),
            DomainState::Blocked => f.write_str("blocked"),
            DomainState::Paused => f.write_str("paused"),
            DomainState::ShuttingDown => f.write_str("in shutdown"),
            DomainState::Shutoff => f.write_str("shut off"),
            DomainState::Crashed => f.write_str("crashed"),
            DomainState::PmSuspended => f.write_str("pmsuspended"),
            DomainState::Other(state) => f.write_str(state),
        }
    }
}

/// Control plane of the hypervisor. Every call goes to the hypervisor,
/// handles are plain names and are never cached by callers.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    async fn domain_lookup_by_name(&self, name: &str) -> HypervisorResult<DomainHandle>;

    async fn domain_lookup_by_uuid(&self, uuid: Uuid) -> HypervisorResult<DomainHandle>;

    async fn domain_state(&self, domain: &DomainHandle) -> HypervisorResult<DomainState>;

    /// Starts a defined domain.
    async fn domain_create(&self, domain: &DomainHandle) -> HypervisorResult<()>;

    /// Hard stop, the domain stays defined.
    async fn domain_destroy(&self, domain: &DomainHandle) -> HypervisorResult<()>;

    async fn domain_undefine(&self, domain: &DomainHandle) -> HypervisorResult<()>;

    /// Defines a new domain or replaces the definition with the same name.
    async fn domain_define(&self, descriptor: &DomainDescriptor) -> HypervisorResult<DomainHandle>;

    async fn pool_lookup(&self, name: &str) -> HypervisorResult<PoolHandle>;

    async fn volume_lookup(&self, pool: &PoolHandle, name: &str) -> HypervisorResult<VolumeHandle>;

    async fn volume_create(
        &self,
        pool: &PoolHandle,
        descriptor: &VolumeDescriptor,
    ) -> HypervisorResult<VolumeHandle>;

    async fn volume_delete(&self, volume: &VolumeHandle) -> HypervisorResult<()>;

    async fn volume_resize(&self, volume: &VolumeHandle, capacity_bytes: u64) -> HypervisorResult<()>;

    /// Replaces the volume content with the bytes of a local file.
    async fn volume_upload(&self, volume: &VolumeHandle, source: &Path) -> HypervisorResult<()>;
}
