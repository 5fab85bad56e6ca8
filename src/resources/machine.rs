use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    constants::{DEFAULT_NETWORK, DEFAULT_NIC_DRIVER, GIB},
    error::{Error, Result},
};

/// A declared machine as handed over by the orchestration layer. The
/// provider-specific part stays loosely typed until a pass decodes it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct MachineRequest {
    pub id: String,
    pub talos_version: String,
    #[serde(default)]
    pub schematic: SchematicCustomization,
    #[serde(default)]
    pub provider_data: serde_yaml::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct SchematicCustomization {
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub extra_kernel_args: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DiskType {
    Nvme,
    Sata,
    Scsi,
}

impl DiskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskType::Nvme => "nvme",
            DiskType::Sata => "sata",
            DiskType::Scsi => "scsi",
        }
    }
}

impl fmt::Display for DiskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdditionalDiskSpec {
    #[serde(rename = "type")]
    pub disk_type: DiskType,
    /// GiB
    pub size: u64,
}

impl AdditionalDiskSpec {
    pub fn size_bytes(&self) -> Result<u64> {
        gib_to_bytes(self.size)
            .ok_or_else(|| Error::config(format!("{} disk size {} GiB is too large", self.disk_type, self.size)))
    }
}

fn gib_to_bytes(gib: u64) -> Option<u64> {
    gib.checked_mul(GIB)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkInterfaceSpec {
    #[serde(default = "default_nic_driver")]
    pub driver: String,
    #[serde(alias = "network")]
    pub network_name: String,
}

fn default_nic_driver() -> String {
    DEFAULT_NIC_DRIVER.to_string()
}

fn default_network_interfaces() -> Vec<NetworkInterfaceSpec> {
    vec![NetworkInterfaceSpec {
        driver: default_nic_driver(),
        network_name: DEFAULT_NETWORK.to_string(),
    }]
}

/// Strongly typed provider data, decoded once per pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderData {
    pub cores: u32,
    /// MiB
    pub memory: u64,
    /// GiB
    pub disk_size: u64,
    pub storage_pool: String,
    #[serde(default)]
    pub additional_disks: Vec<AdditionalDiskSpec>,
    #[serde(default = "default_network_interfaces")]
    pub network_interfaces: Vec<NetworkInterfaceSpec>,
}

impl ProviderData {
    pub fn decode(value: &serde_yaml::Value) -> Result<Self> {
        let data: ProviderData = serde_yaml::from_value(value.clone())
            .map_err(|e| Error::config(format!("failed to decode provider data: {e}")))?;
        data.validate()?;
        Ok(data)
    }

    pub fn disk_size_bytes(&self) -> Result<u64> {
        gib_to_bytes(self.disk_size)
            .ok_or_else(|| Error::config(format!("disk_size {} GiB is too large", self.disk_size)))
    }

    fn validate(&self) -> Result<()> {
        if self.cores == 0 {
            return Err(Error::config("cores must be greater than zero"));
        }
        if self.memory == 0 {
            return Err(Error::config("memory must be greater than zero"));
        }
        if self.disk_size == 0 {
            return Err(Error::config("disk_size must be greater than zero"));
        }
        self.disk_size_bytes()?;
        if self.storage_pool.trim().is_empty() {
            return Err(Error::config("storage_pool must be set"));
        }

        for (idx, disk) in self.additional_disks.iter().enumerate() {
            if disk.size == 0 {
                return Err(Error::config(format!(
                    "additional disk {idx} ({}) must have a size greater than zero",
                    disk.disk_type
                )));
            }
            disk.size_bytes()?;
        }

        for (idx, iface) in self.network_interfaces.iter().enumerate() {
            if iface.network_name.trim().is_empty() {
                return Err(Error::config(format!(
                    "network interface {idx} has no network name"
                )));
            }
        }

        Ok(())
    }
}

impl MachineRequest {
    pub fn provider_data(&self) -> Result<ProviderData> {
        ProviderData::decode(&self.provider_data)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdditionalDiskState {
    #[serde(rename = "type")]
    pub disk_type: DiskType,
    pub vol_name: String,
}

/// What earlier passes accomplished. A field is only ever written by the
/// step that produced it, after the step's side effects succeeded.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MachineState {
    pub schematic_id: Option<String>,
    pub uuid: Option<Uuid>,
    pub pool_name: Option<String>,
    pub vm_vol_name: Option<String>,
    /// `Some(vec![])` once the step ran for a machine without extra disks.
    pub additional_disks: Option<Vec<AdditionalDiskState>>,
    /// Extra disks created by a pass that did not finish the step yet.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub partial_additional_disks: Vec<AdditionalDiskState>,
    pub cidata_vol_name: Option<String>,
    pub vm_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigPatch {
    pub id: String,
    pub data: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum MachinePhase {
    #[default]
    Provisioning,
    Provisioned,
    Deprovisioning,
    Error {
        message: String,
    },
}

/// Values reported back to the orchestration layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MachineStatus {
    pub phase: MachinePhase,
    pub machine_uuid: Option<Uuid>,
    #[serde(default)]
    pub config_patches: Vec<ConfigPatch>,
    pub last_error: Option<String>,
}

pub fn primary_volume_name(machine_id: &str) -> String {
    format!("{machine_id}.qcow2")
}

pub fn additional_volume_name(machine_id: &str, idx: usize, disk_type: DiskType) -> String {
    format!("{machine_id}-{idx}-{disk_type}.qcow2")
}

pub fn cidata_volume_name(machine_id: &str) -> String {
    format!("{machine_id}-cidata.iso")
}
