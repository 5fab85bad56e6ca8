use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::{
    agent::schematic::SchematicResolver,
    error::{Error, Result},
    provision::{ProvisionContext, Step, StepOutcome},
};

pub struct ResolveSchematic {
    resolver: Arc<dyn SchematicResolver>,
}

impl ResolveSchematic {
    pub fn new(resolver: Arc<dyn SchematicResolver>) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl Step for ResolveSchematic {
    fn name(&self) -> &'static str {
        "resolve-schematic"
    }

    async fn run(&self, ctx: &mut ProvisionContext<'_>) -> Result<StepOutcome> {
        if ctx.state.schematic_id.is_some() {
            return Ok(StepOutcome::Continue);
        }

        let schematic_id = self
            .resolver
            .resolve(&ctx.request.schematic)
            .await
            .map_err(|e| Error::transient("error generating schematic id", e))?;

        info!(%schematic_id, "created schematic");
        ctx.state.schematic_id = Some(schematic_id);

        Ok(StepOutcome::Continue)
    }
}
