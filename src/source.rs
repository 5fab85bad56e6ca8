use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, bail};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::{repository::Repository, resources::machine::MachineRequest};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub changed: Vec<String>,
    pub removed: Vec<String>,
}

/// Machine requests declared as `<id>.yaml` files in a directory.
pub struct ManifestSource {
    dir: PathBuf,
    poll_interval: Duration,
    repository: Arc<Repository>,
}

fn manifest_id(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?;
    if ext != "yaml" && ext != "yml" {
        return None;
    }

    path.file_stem()?.to_str().map(str::to_string)
}

fn parse_manifest(id: &str, text: &str) -> Result<MachineRequest> {
    let mut value: serde_yaml::Value = serde_yaml::from_str(text)?;
    if let Some(map) = value.as_mapping_mut() {
        if !map.contains_key("id") {
            map.insert("id".into(), id.into());
        }
    }

    let request: MachineRequest = serde_yaml::from_value(value)?;
    if request.id != id {
        bail!("manifest declares id {} but is named {id}", request.id);
    }

    Ok(request)
}

impl ManifestSource {
    pub fn new(dir: impl Into<PathBuf>, poll_interval: Duration, repository: Arc<Repository>) -> Self {
        Self {
            dir: dir.into(),
            poll_interval,
            repository,
        }
    }

    /// `None` for manifests that exist but could not be read, so a typo
    /// never tears a machine down.
    async fn load(&self) -> Result<BTreeMap<String, Option<MachineRequest>>> {
        let mut entries = fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("failed to read machines dir {}", self.dir.display()))?;

        let mut manifests = BTreeMap::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(id) = manifest_id(&path) else {
                continue;
            };

            let request = match fs::read_to_string(&path).await {
                Ok(text) => match parse_manifest(&id, &text) {
                    Ok(request) => Some(request),
                    Err(e) => {
                        warn!(path = %path.display(), "skipping invalid manifest: {e:#}");
                        None
                    }
                },
                Err(e) => {
                    warn!(path = %path.display(), "failed to read manifest: {e}");
                    None
                }
            };

            manifests.insert(id, request);
        }

        Ok(manifests)
    }

    /// Brings the stored requests in line with the manifests on disk.
    pub async fn sync(&self) -> Result<SyncReport> {
        let manifests = self.load().await?;
        let mut report = SyncReport::default();

        for (id, request) in &manifests {
            let Some(request) = request else {
                continue;
            };

            if self.repository.get_request(id).await?.as_ref() != Some(request) {
                self.repository.set_request(request).await?;
                report.changed.push(id.clone());
            }
        }

        for id in self.repository.list_request_ids().await? {
            if !manifests.contains_key(&id) {
                self.repository.delete_request(&id).await?;
                report.removed.push(id);
            }
        }

        if !report.changed.is_empty() || !report.removed.is_empty() {
            info!(changed = ?report.changed, removed = ?report.removed, "machine requests updated");
        }

        Ok(report)
    }

    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            interval.tick().await;
            debug!(dir = %self.dir.display(), "polling machine manifests");

            if let Err(e) = self.sync().await {
                warn!("failed to sync machine manifests: {e:#}");
            }
        }
    }
}
