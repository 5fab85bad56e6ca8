use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use async_trait::async_trait;
use flate2::bufread::GzDecoder;
use tempfile::NamedTempFile;
use tokio::task::spawn_blocking;
use tracing::info;

use crate::{
    agent::{
        broker::ResourceBroker,
        image::{CacheKey, ImageCache},
    },
    constants::{DISK_FORMAT_QCOW2, STAGING_TEMP_PREFIX},
    error::{Error, Result},
    provision::{ProvisionContext, Step, StepOutcome},
    resources::machine::primary_volume_name,
};

/// Boot disk: the cached image, decompressed, uploaded and grown to the
/// requested size.
pub struct ProvisionPrimaryDisk {
    broker: Arc<ResourceBroker>,
    image_cache: Arc<ImageCache>,
}

impl ProvisionPrimaryDisk {
    pub fn new(broker: Arc<ResourceBroker>, image_cache: Arc<ImageCache>) -> Self {
        Self {
            broker,
            image_cache,
        }
    }
}

#[async_trait]
impl Step for ProvisionPrimaryDisk {
    fn name(&self) -> &'static str {
        "provision-primary-disk"
    }

    async fn run(&self, ctx: &mut ProvisionContext<'_>) -> Result<StepOutcome> {
        if ctx.state.vm_vol_name.is_some() {
            return Ok(StepOutcome::Continue);
        }

        let Some(schematic_id) = ctx.state.schematic_id.clone() else {
            return Err(Error::transient(
                "waiting for schematic",
                anyhow::anyhow!("schematic id not set"),
            ));
        };

        let pool = ctx.data.storage_pool.clone();
        // recorded up front so teardown can find a half-built volume
        ctx.state.pool_name = Some(pool.clone());

        let key = CacheKey::new(schematic_id, ctx.request.talos_version.clone());
        // released on every exit from this function
        let lease = self
            .image_cache
            .lease(&key)
            .await
            .map_err(|e| Error::transient("error fetching image", e))?;

        let vol_name = primary_volume_name(ctx.machine_id());
        let capacity = ctx.data.disk_size_bytes()?;

        let volume = self
            .broker
            .volume_create(&pool, &vol_name, DISK_FORMAT_QCOW2, capacity)
            .await
            .map_err(|e| Error::transient(format!("error creating disk {vol_name}"), e))?;

        // staged next to the cache so the system temp dir never holds a full disk image
        let staging_dir = self.image_cache.config().path.clone();
        let image = decompress(lease.path().to_path_buf(), staging_dir)
            .await
            .map_err(|e| Error::transient("error decompressing image", e))?;

        let hypervisor = self.broker.hypervisor();
        hypervisor
            .volume_upload(&volume, image.path())
            .await
            .map_err(|e| Error::transient(format!("error uploading image to {vol_name}"), e))?;

        // the image is usually smaller than the requested disk
        hypervisor
            .volume_resize(&volume, capacity)
            .await
            .map_err(|e| {
                Error::transient(
                    format!("expanding volume {vol_name} to size {capacity} failed"),
                    e,
                )
            })?;

        drop(lease);

        info!(volume = %vol_name, %pool, capacity, "provisioned primary disk");
        ctx.state.vm_vol_name = Some(vol_name);

        Ok(StepOutcome::Continue)
    }
}

async fn decompress(path: PathBuf, staging_dir: PathBuf) -> anyhow::Result<NamedTempFile> {
    spawn_blocking(move || -> anyhow::Result<NamedTempFile> {
        let file = File::open(&path)
            .with_context(|| format!("error opening cached image {}", path.display()))?;
        let mut decoder = GzDecoder::new(BufReader::new(file));

        let mut out = tempfile::Builder::new()
            .prefix(STAGING_TEMP_PREFIX)
            .suffix(".qcow2")
            .tempfile_in(&staging_dir)
            .with_context(|| format!("error creating staging file in {}", staging_dir.display()))?;
        std::io::copy(&mut decoder, out.as_file_mut()).context("error reading gzip image")?;
        out.as_file_mut().sync_all()?;

        Ok(out)
    })
    .await?
}
