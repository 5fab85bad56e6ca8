use std::{
    collections::BTreeSet,
    sync::{Arc, Weak},
};

use anyhow::Result;
use tracing::warn;

use crate::{
    controller::{context::ControllerEvent, scheduler::Scheduler},
    machinery::store::{Collection, Key, PartialKey, Store},
    resources::machine::{MachineRequest, MachineState, MachineStatus},
};

/// Typed access to what the driver persists per machine id.
pub struct Repository {
    store: Arc<Store>,
    scheduler: Weak<Scheduler>,
}

fn request_key(id: &str) -> Key<MachineRequest> {
    Key::new(Collection::MachineRequest, id)
}

fn state_key(id: &str) -> Key<MachineState> {
    Key::new(Collection::MachineState, id)
}

fn status_key(id: &str) -> Key<MachineStatus> {
    Key::new(Collection::MachineStatus, id)
}

impl Repository {
    pub fn new(store: Arc<Store>, scheduler: Weak<Scheduler>) -> Self {
        Self { store, scheduler }
    }

    fn get_scheduler(&self) -> Option<Arc<Scheduler>> {
        self.scheduler.upgrade()
    }

    async fn notify(&self, id: &str) {
        if let Some(scheduler) = self.get_scheduler() {
            let event = ControllerEvent::ResourceChange(id.to_string());
            if let Err(e) = scheduler.push(event).await {
                warn!(machine = %id, "failed to notify scheduler of request change: {e}");
            }
        }
    }

    pub async fn get_request(&self, id: &str) -> Result<Option<MachineRequest>> {
        self.store.get(request_key(id)).await
    }

    pub async fn set_request(&self, request: &MachineRequest) -> Result<()> {
        self.store.put(request_key(&request.id), request).await?;
        self.notify(&request.id).await;

        Ok(())
    }

    pub async fn delete_request(&self, id: &str) -> Result<()> {
        self.store.delete(request_key(id)).await?;
        self.notify(id).await;

        Ok(())
    }

    pub async fn list_request_ids(&self) -> Result<Vec<String>> {
        self.store
            .list_keys(PartialKey::<MachineRequest>::new(Collection::MachineRequest))
            .await
    }

    pub async fn get_state(&self, id: &str) -> Result<Option<MachineState>> {
        self.store.get(state_key(id)).await
    }

    pub async fn set_state(&self, id: &str, state: &MachineState) -> Result<()> {
        self.store.put(state_key(id), state).await
    }

    pub async fn get_status(&self, id: &str) -> Result<Option<MachineStatus>> {
        self.store.get(status_key(id)).await
    }

    pub async fn set_status(&self, id: &str, status: &MachineStatus) -> Result<()> {
        self.store.put(status_key(id), status).await
    }

    /// Forgets a machine once its resources are gone.
    pub async fn delete_records(&self, id: &str) -> Result<()> {
        self.store.delete(state_key(id)).await?;
        self.store.delete(status_key(id)).await?;

        Ok(())
    }

    /// Every id that still has a request or leftovers to clean up.
    pub async fn list_known_ids(&self) -> Result<Vec<String>> {
        let mut ids: BTreeSet<String> = self.list_request_ids().await?.into_iter().collect();
        ids.extend(
            self.store
                .list_keys(PartialKey::<MachineState>::new(Collection::MachineState))
                .await?,
        );

        Ok(ids.into_iter().collect())
    }
}
