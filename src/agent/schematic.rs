use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

use crate::resources::machine::SchematicCustomization;

/// Derives the id of the customized OS image for a machine.
#[async_trait]
pub trait SchematicResolver: Send + Sync {
    async fn resolve(&self, customization: &SchematicCustomization) -> Result<String>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Schematic<'a> {
    customization: Customization<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Customization<'a> {
    #[serde(skip_serializing_if = "is_empty")]
    extra_kernel_args: &'a [String],
    system_extensions: SystemExtensions<'a>,
}

fn is_empty(values: &&[String]) -> bool {
    values.is_empty()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SystemExtensions<'a> {
    official_extensions: &'a [String],
}

#[derive(Debug, Deserialize)]
struct SchematicResponse {
    id: String,
}

fn schematic_body(customization: &SchematicCustomization) -> Result<String> {
    let schematic = Schematic {
        customization: Customization {
            extra_kernel_args: &customization.extra_kernel_args,
            system_extensions: SystemExtensions {
                official_extensions: &customization.extensions,
            },
        },
    };

    Ok(serde_yaml::to_string(&schematic)?)
}

/// Image factory client; schematics are content addressed, so posting the
/// same customization twice yields the same id.
pub struct ImageFactoryClient {
    client: reqwest::Client,
    base_url: Url,
}

impl ImageFactoryClient {
    /// `timeout` bounds each request, from connect to the last body byte.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url).context("invalid image factory url")?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build image factory client")?;

        Ok(Self { client, base_url })
    }

    fn schematics_url(&self) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("image factory url cannot be a base url"))?
            .pop_if_empty()
            .push("schematics");
        Ok(url)
    }
}

#[async_trait]
impl SchematicResolver for ImageFactoryClient {
    async fn resolve(&self, customization: &SchematicCustomization) -> Result<String> {
        let url = self.schematics_url()?;
        let body = schematic_body(customization)?;

        let res = self
            .client
            .post(url.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/yaml")
            .body(body)
            .send()
            .await
            .with_context(|| format!("error posting schematic to {url}"))?;

        let status = res.status();
        let text = res.text().await?;
        if !status.is_success() {
            bail!("image factory returned {status}: {text}");
        }

        let response: SchematicResponse =
            serde_json::from_str(&text).context("unexpected image factory response")?;

        info!(schematic_id = %response.id, "resolved schematic");
        Ok(response.id)
    }
}
