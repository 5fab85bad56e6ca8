use std::time::Duration;

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = MIB * 1024;

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(10);
pub const UUID_COLLISION_RETRY_DELAY: Duration = Duration::from_secs(1);
pub const DOMAIN_STOP_RETRY_DELAY: Duration = Duration::from_secs(3);
pub const DOMAIN_SHUTDOWN_RETRY_DELAY: Duration = Duration::from_secs(10);

pub const DEFAULT_CACHE_PATH: &str = "/tmp/omni-libvirt-cache";
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

pub const DEFAULT_FACTORY_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_IMAGE_FACTORY_URL: &str = "https://factory.talos.dev";
pub const DEFAULT_IMAGE_ASSET: &str = "metal-amd64.qcow2.gz";
pub const IMAGE_FILE_EXTENSION: &str = "qcow2.gz";
pub const DOWNLOAD_TEMP_PREFIX: &str = "download-";
pub const STAGING_TEMP_PREFIX: &str = "staging-";

pub const DISK_FORMAT_QCOW2: &str = "qcow2";
pub const DISK_FORMAT_RAW: &str = "raw";

pub const CIDATA_VOLUME_LABEL: &str = "cidata";
pub const DEFAULT_NETWORK: &str = "default";
pub const DEFAULT_NIC_DRIVER: &str = "virtio";
