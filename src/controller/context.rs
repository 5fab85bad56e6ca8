use std::{fmt, sync::Arc};

use crate::{agent::Agent, deprovision::Teardown, provision::Pipeline, repository::Repository};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ControllerKey {
    pub machine_id: String,
}

impl ControllerKey {
    pub fn new(machine_id: impl AsRef<str>) -> Self {
        Self {
            machine_id: machine_id.as_ref().to_string(),
        }
    }
}

impl fmt::Display for ControllerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "machine.{}", self.machine_id)
    }
}

#[derive(Clone)]
pub struct ControllerContext {
    pub repository: Arc<Repository>,
    pub agent: Arc<Agent>,
    pub pipeline: Arc<Pipeline>,
    pub teardown: Arc<Teardown>,
}

impl ControllerContext {
    pub fn new(repository: Arc<Repository>, agent: Arc<Agent>) -> Self {
        let pipeline = Arc::new(Pipeline::new(&agent));
        let teardown = Arc::new(Teardown::new(&agent));

        Self {
            repository,
            agent,
            pipeline,
            teardown,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ControllerEvent {
    /// Picks up whatever was left over by a previous run of the daemon.
    BringUp(String),
    /// A request was added, changed or removed.
    ResourceChange(String),
}
