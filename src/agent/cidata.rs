use std::path::Path;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::json;
use tokio::process::Command;

use crate::{constants::CIDATA_VOLUME_LABEL, resources::machine::ConfigPatch};

pub const HOSTNAME_PATCH_ID: &str = "hostname";

const USER_DATA: &str = "#cloud-config\n";

const NETWORK_CONFIG: &str = r#"version: 2
ethernets:
  all-en:
    match:
      name: "en*"
    dhcp4: true
    dhcp6: true
  all-eth:
    match:
      name: "eth*"
    dhcp4: true
    dhcp6: true
"#;

/// The three nocloud documents the guest reads from the `cidata` volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CidataPayload {
    pub meta_data: String,
    pub user_data: String,
    pub network_config: String,
}

impl CidataPayload {
    pub fn for_machine(hostname: &str) -> Self {
        Self {
            meta_data: format!("local-hostname: {hostname}\n"),
            user_data: USER_DATA.to_string(),
            network_config: NETWORK_CONFIG.to_string(),
        }
    }

    fn files(&self) -> [(&'static str, &str); 3] {
        [
            ("meta-data", &self.meta_data),
            ("user-data", &self.user_data),
            ("network-config", &self.network_config),
        ]
    }
}

/// Turns a payload into a bootable image blob.
#[async_trait]
pub trait BootstrapEncoder: Send + Sync {
    async fn encode(&self, payload: &CidataPayload) -> Result<Vec<u8>>;
}

/// Builds the ISO with an external mastering tool (`genisoimage` or a
/// compatible `mkisofs`).
pub struct IsoToolEncoder {
    program: String,
}

impl IsoToolEncoder {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl BootstrapEncoder for IsoToolEncoder {
    async fn encode(&self, payload: &CidataPayload) -> Result<Vec<u8>> {
        let work_dir = tempfile::tempdir()?;
        let source_dir = work_dir.path().join("cidata");
        tokio::fs::create_dir_all(&source_dir).await?;

        for (name, content) in payload.files() {
            tokio::fs::write(source_dir.join(name), content).await?;
        }

        let iso_path = work_dir.path().join("cidata.iso");
        run_iso_tool(&self.program, &iso_path, &source_dir).await?;

        let iso = tokio::fs::read(&iso_path)
            .await
            .context("failed to read generated ISO")?;
        Ok(iso)
    }
}

async fn run_iso_tool(program: &str, output: &Path, source_dir: &Path) -> Result<()> {
    let result = Command::new(program)
        .arg("-output")
        .arg(output)
        .arg("-volid")
        .arg(CIDATA_VOLUME_LABEL)
        .arg("-joliet")
        .arg("-rock")
        .arg(source_dir)
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("failed to run {program}"))?;

    if !result.status.success() {
        bail!(
            "failed to generate cidata ISO: {}",
            String::from_utf8_lossy(&result.stderr)
        );
    }

    Ok(())
}

/// Machine config patch pinning the hostname to the machine id.
pub fn hostname_patch(hostname: &str) -> Result<ConfigPatch> {
    let patch = json!({
        "machine": {
            "network": {
                "hostname": hostname,
            }
        }
    });

    Ok(ConfigPatch {
        id: HOSTNAME_PATCH_ID.to_string(),
        data: serde_yaml::to_string(&patch)?,
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{
        Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    };

    use super::*;

    /// Encoder that concatenates the documents and remembers what it saw.
    #[derive(Default)]
    pub struct RecordingEncoder {
        pub payloads: Mutex<Vec<CidataPayload>>,
        pub fail: AtomicBool,
    }

    impl RecordingEncoder {
        pub fn payloads(&self) -> Vec<CidataPayload> {
            self.payloads
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }
    }

    #[async_trait]
    impl BootstrapEncoder for RecordingEncoder {
        async fn encode(&self, payload: &CidataPayload) -> Result<Vec<u8>> {
            if self.fail.load(Ordering::SeqCst) {
                bail!("encoder unavailable");
            }

            self.payloads
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(payload.clone());

            Ok(payload
                .files()
                .iter()
                .flat_map(|(_, content)| content.bytes())
                .collect())
        }
    }
}
