use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Result, bail};
use libvirt_provider::{
    agent::{AgentConfig, ImageFactoryConfig, hypervisor::virsh::VirshConfig, image::ImageCacheConfig},
    constants::{
        DEFAULT_CACHE_PATH, DEFAULT_CLEANUP_INTERVAL, DEFAULT_DOWNLOAD_TIMEOUT,
        DEFAULT_FACTORY_REQUEST_TIMEOUT, DEFAULT_IMAGE_ASSET,
        DEFAULT_IMAGE_FACTORY_URL, DEFAULT_MAX_AGE,
    },
};
use serde::{Deserialize, Serialize};
use tokio::fs::read_to_string;
use tracing::warn;

const CONFIG_ENV: &str = "LIBVIRT_PROVIDER_CONFIG";

mod duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let value = String::deserialize(deserializer)?;
        humantime::parse_duration(&value).map_err(D::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(skip_serializing, skip_deserializing)]
    pub config_path: PathBuf,
    #[serde(skip_serializing, skip_deserializing)]
    pub config_dir: PathBuf,

    #[serde(rename = "data-dir")]
    pub data_dir: PathBuf,

    #[serde(rename = "libvirt", default)]
    pub libvirt_config: LibvirtConfig,

    #[serde(rename = "image-cache", default)]
    pub image_cache_config: ImageCacheSection,

    #[serde(rename = "image-factory", default)]
    pub image_factory_config: ImageFactorySection,

    #[serde(rename = "bootstrap", default)]
    pub bootstrap_config: BootstrapConfig,

    #[serde(rename = "provider")]
    pub provider_config: ProviderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LibvirtConfig {
    #[serde(rename = "uri")]
    pub uri: Option<String>,
    #[serde(rename = "virsh-path", default = "default_virsh_path")]
    pub virsh_path: String,
}

impl Default for LibvirtConfig {
    fn default() -> Self {
        Self {
            uri: None,
            virsh_path: default_virsh_path(),
        }
    }
}

fn default_virsh_path() -> String {
    "virsh".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageCacheSection {
    #[serde(rename = "path", default = "default_cache_path")]
    pub path: PathBuf,
    #[serde(rename = "cleanup-interval", with = "duration", default = "default_cleanup_interval")]
    pub cleanup_interval: Duration,
    #[serde(rename = "max-age", with = "duration", default = "default_max_age")]
    pub max_age: Duration,
    #[serde(rename = "download-timeout", with = "duration", default = "default_download_timeout")]
    pub download_timeout: Duration,
}

impl Default for ImageCacheSection {
    fn default() -> Self {
        Self {
            path: default_cache_path(),
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            max_age: DEFAULT_MAX_AGE,
            download_timeout: DEFAULT_DOWNLOAD_TIMEOUT,
        }
    }
}

fn default_cache_path() -> PathBuf {
    PathBuf::from(DEFAULT_CACHE_PATH)
}

fn default_cleanup_interval() -> Duration {
    DEFAULT_CLEANUP_INTERVAL
}

fn default_max_age() -> Duration {
    DEFAULT_MAX_AGE
}

fn default_download_timeout() -> Duration {
    DEFAULT_DOWNLOAD_TIMEOUT
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageFactorySection {
    #[serde(rename = "base-url", default = "default_factory_url")]
    pub base_url: String,
    #[serde(rename = "asset", default = "default_asset")]
    pub asset: String,
    #[serde(rename = "request-timeout", with = "duration", default = "default_request_timeout")]
    pub request_timeout: Duration,
}

impl Default for ImageFactorySection {
    fn default() -> Self {
        Self {
            base_url: default_factory_url(),
            asset: default_asset(),
            request_timeout: DEFAULT_FACTORY_REQUEST_TIMEOUT,
        }
    }
}

fn default_factory_url() -> String {
    DEFAULT_IMAGE_FACTORY_URL.to_string()
}

fn default_asset() -> String {
    DEFAULT_IMAGE_ASSET.to_string()
}

fn default_request_timeout() -> Duration {
    DEFAULT_FACTORY_REQUEST_TIMEOUT
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BootstrapConfig {
    #[serde(rename = "iso-tool", default = "default_iso_tool")]
    pub iso_tool: String,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            iso_tool: default_iso_tool(),
        }
    }
}

fn default_iso_tool() -> String {
    "genisoimage".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    #[serde(rename = "machines-dir")]
    pub machines_dir: PathBuf,
    #[serde(rename = "poll-interval", with = "duration", default = "default_poll_interval")]
    pub poll_interval: Duration,
    #[serde(rename = "worker-count", default = "default_worker_count")]
    pub worker_count: usize,
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_worker_count() -> usize {
    2
}

async fn resolve_config_path(path_override: Option<PathBuf>) -> Result<PathBuf> {
    let config_path =
        path_override.or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from));

    if let Some(path) = config_path {
        return Ok(path);
    }

    warn!("No config path override found, looking for config in default locations");

    let cwd = std::env::current_dir()?;

    let path = cwd.join("libvirt-provider.toml");
    if path.exists() {
        return Ok(path);
    }
    warn!("No config found in current directory ({})", path.display());

    let Some(project_dirs) = directories::ProjectDirs::from("", "", "libvirt-provider") else {
        bail!("Failed to get config dir");
    };

    let path = project_dirs.config_dir().join("config.toml");
    if path.exists() {
        return Ok(path);
    }
    warn!("No config found in home config dir ({})", path.display());

    let path = PathBuf::from("/etc/libvirt-provider/config.toml");
    if path.exists() {
        return Ok(path);
    }
    warn!("No config found in global config dir ({})", path.display());

    bail!("Couldn't load config file.");
}

impl Config {
    pub async fn load(path_override: Option<PathBuf>) -> Result<Self> {
        let config_path = resolve_config_path(path_override).await?;
        let config_str = read_to_string(&config_path).await?;

        Self::parse(&config_str, &config_path)
    }

    pub fn parse(config_str: &str, config_path: &Path) -> Result<Self> {
        let mut config: Self = toml::from_str(config_str)?;
        config.config_path = config_path.to_path_buf();

        let Some(config_dir) = config_path.parent().map(|p| p.to_path_buf()) else {
            bail!("Couldn't determine config dir");
        };
        config.config_dir = config_dir;

        if config.provider_config.worker_count == 0 {
            bail!("provider.worker-count must be at least 1");
        }
        if config.provider_config.poll_interval.is_zero() {
            bail!("provider.poll-interval must not be zero");
        }
        if config.image_factory_config.request_timeout.is_zero() {
            bail!("image-factory.request-timeout must not be zero");
        }
        if config.image_cache_config.cleanup_interval.is_zero() {
            bail!("image-cache.cleanup-interval must not be zero");
        }

        Ok(config)
    }

    pub fn absolute_data_dir(&self) -> PathBuf {
        self.config_dir.join(&self.data_dir)
    }

    pub fn absolute_machines_dir(&self) -> PathBuf {
        self.config_dir.join(&self.provider_config.machines_dir)
    }

    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            libvirt: VirshConfig {
                program: self.libvirt_config.virsh_path.clone(),
                uri: self.libvirt_config.uri.clone(),
            },
            image_cache: ImageCacheConfig {
                path: self.image_cache_config.path.clone(),
                cleanup_interval: self.image_cache_config.cleanup_interval,
                max_age: self.image_cache_config.max_age,
                download_timeout: self.image_cache_config.download_timeout,
            },
            image_factory: ImageFactoryConfig {
                base_url: self.image_factory_config.base_url.clone(),
                asset: self.image_factory_config.asset.clone(),
                request_timeout: self.image_factory_config.request_timeout,
            },
            iso_tool: self.bootstrap_config.iso_tool.clone(),
        }
    }
}
