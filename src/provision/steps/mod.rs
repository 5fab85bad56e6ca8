mod additional_disks;
mod cidata;
mod domain;
mod machine_uuid;
mod primary_disk;
mod schematic;
mod start;

pub use additional_disks::ProvisionAdditionalDisks;
pub use cidata::ProvisionCidata;
pub use domain::DefineDomain;
pub use machine_uuid::GenerateUuid;
pub use primary_disk::ProvisionPrimaryDisk;
pub use schematic::ResolveSchematic;
pub use start::StartDomain;

use crate::{agent::Agent, provision::Step};

pub fn all(agent: &Agent) -> Vec<Box<dyn Step>> {
    vec![
        Box::new(GenerateUuid::new(agent.broker())),
        Box::new(ResolveSchematic::new(agent.schematic())),
        Box::new(ProvisionPrimaryDisk::new(agent.broker(), agent.image_cache())),
        Box::new(ProvisionAdditionalDisks::new(agent.broker())),
        Box::new(ProvisionCidata::new(agent.broker(), agent.bootstrap())),
        Box::new(DefineDomain::new(agent.broker())),
        Box::new(StartDomain::new(agent.broker())),
    ]
}
