use std::{path::Path, str::FromStr};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;
use uuid::Uuid;

use crate::agent::hypervisor::{
    DomainHandle, DomainState, Hypervisor, HypervisorError, HypervisorResult, ObjectKind,
    PoolHandle, VolumeHandle,
    descriptor::{DomainDescriptor, VolumeDescriptor},
};

#[derive(Debug, Clone)]
pub struct VirshConfig {
    pub program: String,
    pub uri: Option<String>,
}

/// Hypervisor adapter driving libvirt through the `virsh` client.
pub struct VirshHypervisor {
    config: VirshConfig,
}

/// What a command operates on, used to turn libvirt's error text into
/// `NotFound`.
#[derive(Debug, Clone, Copy)]
enum Target<'a> {
    Domain(&'a str),
    Pool(&'a str),
    Volume(&'a str),
}

impl VirshHypervisor {
    pub fn new(config: VirshConfig) -> Self {
        Self { config }
    }

    /// Returns the URI of the connection virsh ends up using.
    pub async fn check_connection(&self) -> HypervisorResult<String> {
        self.run("connect", None, &["uri"]).await
    }

    async fn run(&self, op: &str, target: Option<Target<'_>>, args: &[&str]) -> HypervisorResult<String> {
        let mut cmd = Command::new(&self.config.program);
        // a reconcile that is cancelled or times out must not leave virsh running
        cmd.kill_on_drop(true);
        if let Some(uri) = &self.config.uri {
            cmd.arg("-c").arg(uri);
        }
        cmd.args(args);

        debug!("running virsh {:?}", args);

        let output = cmd.output().await.map_err(|source| HypervisorError::Io {
            op: op.to_string(),
            source,
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(classify(op, target, stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn write_descriptor(&self, op: &str, xml: &str) -> HypervisorResult<tempfile::NamedTempFile> {
        let file = tempfile::Builder::new()
            .prefix("virsh-")
            .suffix(".xml")
            .tempfile()
            .map_err(|source| HypervisorError::Io {
                op: op.to_string(),
                source,
            })?;

        tokio::fs::write(file.path(), xml)
            .await
            .map_err(|source| HypervisorError::Io {
                op: op.to_string(),
                source,
            })?;

        Ok(file)
    }
}

fn classify(op: &str, target: Option<Target<'_>>, stderr: String) -> HypervisorError {
    let message = stderr.to_lowercase();

    match target {
        Some(Target::Domain(name))
            if message.contains("domain not found")
                || message.contains("no domain with matching") =>
        {
            return HypervisorError::NotFound {
                kind: ObjectKind::Domain,
                name: name.to_string(),
            };
        }
        Some(Target::Domain(name))
            if message.contains("already running") || message.contains("already active") =>
        {
            return HypervisorError::DomainAlreadyRunning(name.to_string());
        }
        Some(Target::Pool(name) | Target::Volume(name))
            if message.contains("storage pool not found")
                || message.contains("no storage pool with matching") =>
        {
            return HypervisorError::NotFound {
                kind: ObjectKind::Pool,
                name: name.to_string(),
            };
        }
        Some(Target::Volume(name))
            if message.contains("storage volume not found")
                || message.contains("no storage vol with matching")
                || message.contains("failed to get vol") =>
        {
            return HypervisorError::NotFound {
                kind: ObjectKind::Volume,
                name: name.to_string(),
            };
        }
        _ => {}
    }

    HypervisorError::Command {
        op: op.to_string(),
        message: stderr,
    }
}

#[async_trait]
impl Hypervisor for VirshHypervisor {
    async fn domain_lookup_by_name(&self, name: &str) -> HypervisorResult<DomainHandle> {
        let out = self
            .run("domain lookup", Some(Target::Domain(name)), &["domuuid", name])
            .await?;
        let uuid = Uuid::from_str(out.trim()).map_err(|e| HypervisorError::Command {
            op: "domain lookup".to_string(),
            message: format!("unexpected uuid {out:?}: {e}"),
        })?;

        Ok(DomainHandle {
            name: name.to_string(),
            uuid,
        })
    }

    async fn domain_lookup_by_uuid(&self, uuid: Uuid) -> HypervisorResult<DomainHandle> {
        let uuid_str = uuid.to_string();
        let name = self
            .run(
                "domain lookup",
                Some(Target::Domain(&uuid_str)),
                &["domname", &uuid_str],
            )
            .await?;

        Ok(DomainHandle { name, uuid })
    }

    async fn domain_state(&self, domain: &DomainHandle) -> HypervisorResult<DomainState> {
        let out = self
            .run(
                "domain state",
                Some(Target::Domain(&domain.name)),
                &["domstate", &domain.name],
            )
            .await?;

        Ok(DomainState::parse(&out))
    }

    async fn domain_create(&self, domain: &DomainHandle) -> HypervisorResult<()> {
        self.run(
            "domain start",
            Some(Target::Domain(&domain.name)),
            &["start", &domain.name],
        )
        .await?;
        Ok(())
    }

    async fn domain_destroy(&self, domain: &DomainHandle) -> HypervisorResult<()> {
        self.run(
            "domain destroy",
            Some(Target::Domain(&domain.name)),
            &["destroy", &domain.name],
        )
        .await?;
        Ok(())
    }

    async fn domain_undefine(&self, domain: &DomainHandle) -> HypervisorResult<()> {
        self.run(
            "domain undefine",
            Some(Target::Domain(&domain.name)),
            &["undefine", &domain.name],
        )
        .await?;
        Ok(())
    }

    async fn domain_define(&self, descriptor: &DomainDescriptor) -> HypervisorResult<DomainHandle> {
        let file = self
            .write_descriptor("domain define", &descriptor.to_xml())
            .await?;
        let path = file.path().to_string_lossy().to_string();

        self.run(
            "domain define",
            Some(Target::Domain(&descriptor.name)),
            &["define", &path],
        )
        .await?;

        Ok(DomainHandle {
            name: descriptor.name.clone(),
            uuid: descriptor.uuid,
        })
    }

    async fn pool_lookup(&self, name: &str) -> HypervisorResult<PoolHandle> {
        self.run("pool lookup", Some(Target::Pool(name)), &["pool-uuid", name])
            .await?;

        Ok(PoolHandle {
            name: name.to_string(),
        })
    }

    async fn volume_lookup(&self, pool: &PoolHandle, name: &str) -> HypervisorResult<VolumeHandle> {
        self.run(
            "volume lookup",
            Some(Target::Volume(name)),
            &["vol-key", "--pool", &pool.name, name],
        )
        .await?;

        Ok(VolumeHandle {
            pool: pool.name.clone(),
            name: name.to_string(),
        })
    }

    async fn volume_create(
        &self,
        pool: &PoolHandle,
        descriptor: &VolumeDescriptor,
    ) -> HypervisorResult<VolumeHandle> {
        let file = self
            .write_descriptor("volume create", &descriptor.to_xml())
            .await?;
        let path = file.path().to_string_lossy().to_string();

        self.run(
            "volume create",
            Some(Target::Pool(&pool.name)),
            &["vol-create", &pool.name, &path],
        )
        .await?;

        Ok(VolumeHandle {
            pool: pool.name.clone(),
            name: descriptor.name.clone(),
        })
    }

    async fn volume_delete(&self, volume: &VolumeHandle) -> HypervisorResult<()> {
        self.run(
            "volume delete",
            Some(Target::Volume(&volume.name)),
            &["vol-delete", "--pool", &volume.pool, &volume.name],
        )
        .await?;
        Ok(())
    }

    async fn volume_resize(&self, volume: &VolumeHandle, capacity_bytes: u64) -> HypervisorResult<()> {
        let capacity = capacity_bytes.to_string();
        self.run(
            "volume resize",
            Some(Target::Volume(&volume.name)),
            &["vol-resize", "--pool", &volume.pool, &volume.name, &capacity],
        )
        .await?;
        Ok(())
    }

    async fn volume_upload(&self, volume: &VolumeHandle, source: &Path) -> HypervisorResult<()> {
        let source = source.to_string_lossy().to_string();
        self.run(
            "volume upload",
            Some(Target::Volume(&volume.name)),
            &["vol-upload", "--pool", &volume.pool, &volume.name, &source],
        )
        .await?;
        Ok(())
    }
}
