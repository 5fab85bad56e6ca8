mod cmd;
mod config;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use libvirt_provider::{
    agent::Agent,
    controller::{
        machine::MachineController,
        scheduler::{Scheduler, SchedulerConfig},
    },
    machinery::store::Store,
    repository::Repository,
    source::ManifestSource,
    utils::tracing::init_tracing,
};
use tracing::info;

use crate::{cmd::Cli, config::Config};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    let cli = Cli::parse();
    let config = Config::load(cli.config_path).await?;
    info!(path = %config.config_path.display(), "loaded config");

    let store = Arc::new(Store::new(config.absolute_data_dir()).await?);
    let agent = Arc::new(Agent::new(config.agent_config()).await?);

    let scheduler = Arc::new_cyclic(|scheduler_weak| {
        let repository = Arc::new(Repository::new(store.clone(), scheduler_weak.clone()));

        Scheduler::new(
            repository,
            agent.clone(),
            SchedulerConfig {
                worker_count: config.provider_config.worker_count,
            },
            vec![MachineController::new_boxed()],
        )
    });

    tokio::spawn(agent.image_cache().run());

    scheduler.start_workers();
    scheduler.schedule_bringup().await?;

    let source = Arc::new(ManifestSource::new(
        config.absolute_machines_dir(),
        config.provider_config.poll_interval,
        scheduler.repository.clone(),
    ));
    tokio::spawn(source.run());

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    Ok(())
}
