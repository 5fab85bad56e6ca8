pub mod broker;
pub mod cidata;
pub mod hypervisor;
pub mod image;
pub mod schematic;

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use tracing::info;

use crate::agent::{
    broker::ResourceBroker,
    cidata::{BootstrapEncoder, IsoToolEncoder},
    hypervisor::{
        Hypervisor,
        virsh::{VirshConfig, VirshHypervisor},
    },
    image::{HttpImageSource, ImageCache, ImageCacheConfig},
    schematic::{ImageFactoryClient, SchematicResolver},
};

#[derive(Debug, Clone)]
pub struct ImageFactoryConfig {
    pub base_url: String,
    pub asset: String,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub libvirt: VirshConfig,
    pub image_cache: ImageCacheConfig,
    pub image_factory: ImageFactoryConfig,
    pub iso_tool: String,
}

/// The collaborators a provisioning pass talks to.
pub struct Agent {
    broker: Arc<ResourceBroker>,
    image_cache: Arc<ImageCache>,
    schematic: Arc<dyn SchematicResolver>,
    bootstrap: Arc<dyn BootstrapEncoder>,
}

impl Agent {
    pub async fn new(config: AgentConfig) -> Result<Self> {
        let virsh = VirshHypervisor::new(config.libvirt.clone());
        let uri = virsh.check_connection().await?;
        info!(%uri, "connected to libvirt");

        let source = HttpImageSource::new(
            &config.image_factory.base_url,
            &config.image_factory.asset,
        )?;
        let image_cache =
            ImageCache::new(config.image_cache.clone(), Arc::new(source)).await?;

        let schematic = ImageFactoryClient::new(
            &config.image_factory.base_url,
            config.image_factory.request_timeout,
        )?;

        Ok(Self::from_parts(
            Arc::new(virsh),
            Arc::new(image_cache),
            Arc::new(schematic),
            Arc::new(IsoToolEncoder::new(config.iso_tool.clone())),
        ))
    }

    pub fn from_parts(
        hypervisor: Arc<dyn Hypervisor>,
        image_cache: Arc<ImageCache>,
        schematic: Arc<dyn SchematicResolver>,
        bootstrap: Arc<dyn BootstrapEncoder>,
    ) -> Self {
        Self {
            broker: Arc::new(ResourceBroker::new(hypervisor)),
            image_cache,
            schematic,
            bootstrap,
        }
    }

    pub fn broker(&self) -> Arc<ResourceBroker> {
        self.broker.clone()
    }

    pub fn hypervisor(&self) -> Arc<dyn Hypervisor> {
        self.broker.hypervisor()
    }

    pub fn image_cache(&self) -> Arc<ImageCache> {
        self.image_cache.clone()
    }

    pub fn schematic(&self) -> Arc<dyn SchematicResolver> {
        self.schematic.clone()
    }

    pub fn bootstrap(&self) -> Arc<dyn BootstrapEncoder> {
        self.bootstrap.clone()
    }
}
