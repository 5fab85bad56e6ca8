use std::{sync::Arc, time::Duration};

use tracing::{info, warn};

use crate::{
    agent::{Agent, broker::ResourceBroker, hypervisor::DomainState},
    constants::{DEFAULT_RETRY_DELAY, DOMAIN_SHUTDOWN_RETRY_DELAY, DOMAIN_STOP_RETRY_DELAY},
    error::{Error, Result},
    resources::machine::{MachineState, cidata_volume_name, primary_volume_name},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownOutcome {
    Removed,
    RetryAfter(Duration),
}

/// Drives a machine's domain and volumes to removed. Every pass looks at
/// what the hypervisor reports now, so it can pick up after any earlier
/// interrupted pass.
pub struct Teardown {
    broker: Arc<ResourceBroker>,
}

impl Teardown {
    pub fn new(agent: &Agent) -> Self {
        Self::with_broker(agent.broker())
    }

    pub fn with_broker(broker: Arc<ResourceBroker>) -> Self {
        Self { broker }
    }

    pub async fn run(&self, machine_id: &str, state: &MachineState) -> Result<TeardownOutcome> {
        if machine_id.trim().is_empty() {
            return Err(Error::config("machine id must be set"));
        }

        let vm_name = state.vm_name.as_deref().unwrap_or(machine_id);

        if let Some(delay) = self.remove_domain(vm_name).await? {
            return Ok(TeardownOutcome::RetryAfter(delay));
        }

        self.remove_volumes(machine_id, state).await?;

        Ok(TeardownOutcome::Removed)
    }

    /// `Some(delay)` while the domain is still on its way down.
    async fn remove_domain(&self, vm_name: &str) -> Result<Option<Duration>> {
        let Some(domain) = self
            .broker
            .domain(vm_name)
            .await
            .map_err(|e| Error::transient("fetching domain", e))?
        else {
            info!(domain = %vm_name, "domain was already removed");
            return Ok(None);
        };

        let hypervisor = self.broker.hypervisor();
        let state = hypervisor
            .domain_state(&domain)
            .await
            .map_err(|e| Error::transient("fetching domain state", e))?;

        match state {
            state if state.is_active() => {
                // destroy may finish asynchronously, look again either way
                match hypervisor.domain_destroy(&domain).await {
                    Ok(()) => info!(domain = %vm_name, "destroyed domain"),
                    Err(e) => warn!(domain = %vm_name, "destroy domain: {e}"),
                }
                Ok(Some(DOMAIN_STOP_RETRY_DELAY))
            }
            DomainState::ShuttingDown => {
                info!(domain = %vm_name, "domain is shutting down");
                Ok(Some(DOMAIN_SHUTDOWN_RETRY_DELAY))
            }
            DomainState::Shutoff | DomainState::Crashed => {
                match hypervisor.domain_undefine(&domain).await {
                    Ok(()) => info!(domain = %vm_name, "undefined domain"),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(Error::transient("undefine VM", e)),
                }
                Ok(None)
            }
            other => Err(Error::UnknownState {
                domain: vm_name.to_string(),
                state: other.to_string(),
                delay: DEFAULT_RETRY_DELAY,
            }),
        }
    }

    async fn remove_volumes(&self, machine_id: &str, state: &MachineState) -> Result<()> {
        let Some(pool) = state.pool_name.as_deref() else {
            info!(machine = %machine_id, "no storage pool recorded, no volumes to remove");
            return Ok(());
        };

        for name in volume_names(machine_id, state) {
            let deleted = self
                .broker
                .volume_delete_if_exists(pool, &name)
                .await
                .map_err(|e| Error::transient(format!("error deleting volume {name}"), e))?;

            if !deleted {
                info!(volume = %name, "volume was removed already");
            }
        }

        Ok(())
    }
}

/// Recorded names first, including extra disks of an unfinished pass.
/// Primary and cidata names are deterministic, so they are also tried when a
/// pass died before recording them.
fn volume_names(machine_id: &str, state: &MachineState) -> Vec<String> {
    let mut names = vec![
        state
            .vm_vol_name
            .clone()
            .unwrap_or_else(|| primary_volume_name(machine_id)),
    ];

    names.extend(
        state
            .additional_disks
            .iter()
            .flatten()
            .chain(&state.partial_additional_disks)
            .map(|disk| disk.vol_name.clone()),
    );

    names.push(
        state
            .cidata_vol_name
            .clone()
            .unwrap_or_else(|| cidata_volume_name(machine_id)),
    );

    let mut seen = std::collections::HashSet::new();
    names.retain(|name| seen.insert(name.clone()));
    names
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::{
        agent::hypervisor::testing::FakeHypervisor,
        resources::machine::{AdditionalDiskState, DiskType},
    };

    const POOL: &str = "default";

    fn provisioned_state() -> MachineState {
        MachineState {
            schematic_id: Some("s1".to_string()),
            uuid: Some(Uuid::new_v4()),
            pool_name: Some(POOL.to_string()),
            vm_vol_name: Some("m1.qcow2".to_string()),
            additional_disks: Some(vec![AdditionalDiskState {
                disk_type: DiskType::Sata,
                vol_name: "m1-0-sata.qcow2".to_string(),
            }]),
            partial_additional_disks: vec![],
            cidata_vol_name: Some("m1-cidata.iso".to_string()),
            vm_name: Some("m1".to_string()),
        }
    }

    fn setup(domain_state: Option<DomainState>) -> (Arc<FakeHypervisor>, Teardown, MachineState) {
        let fake = Arc::new(FakeHypervisor::with_pool(POOL));
        let state = provisioned_state();

        if let Some(domain_state) = domain_state {
            fake.add_domain("m1", state.uuid.unwrap(), domain_state);
        }
        for name in ["m1.qcow2", "m1-0-sata.qcow2", "m1-cidata.iso"] {
            fake.add_volume(POOL, name);
        }

        let teardown = Teardown::with_broker(Arc::new(ResourceBroker::new(fake.clone())));
        (fake, teardown, state)
    }

    async fn converge(teardown: &Teardown, state: &MachineState) -> usize {
        for pass in 1..=10 {
            if teardown.run("m1", state).await.unwrap() == TeardownOutcome::Removed {
                return pass;
            }
        }
        panic!("teardown did not converge");
    }

    fn assert_clean(fake: &FakeHypervisor) {
        assert!(fake.domain("m1").is_none());
        assert!(fake.volume_names().is_empty());
        for name in ["m1.qcow2", "m1-0-sata.qcow2", "m1-cidata.iso"] {
            assert_eq!(fake.count_calls(&format!("volume_delete {name}")), 1);
        }
    }

    #[tokio::test]
    async fn test_running_domain() {
        let (fake, teardown, state) = setup(Some(DomainState::Running));

        let outcome = teardown.run("m1", &state).await.unwrap();
        assert_eq!(outcome, TeardownOutcome::RetryAfter(DOMAIN_STOP_RETRY_DELAY));
        assert_eq!(fake.count_calls("domain_destroy"), 1);
        assert_eq!(fake.volume_names().len(), 3);

        assert_eq!(converge(&teardown, &state).await, 1);
        assert_clean(&fake);
    }

    #[tokio::test]
    async fn test_destroy_failure_still_retries_soon() {
        let (fake, teardown, state) = setup(Some(DomainState::Running));
        fake.fail("domain_destroy");

        let outcome = teardown.run("m1", &state).await.unwrap();
        assert_eq!(outcome, TeardownOutcome::RetryAfter(DOMAIN_STOP_RETRY_DELAY));

        fake.clear_failures();
        converge(&teardown, &state).await;
        assert_clean(&fake);
    }

    #[tokio::test]
    async fn test_shutting_down_domain() {
        let (fake, teardown, state) = setup(Some(DomainState::Running));
        fake.set_state_after_destroy(DomainState::ShuttingDown);

        assert_eq!(
            teardown.run("m1", &state).await.unwrap(),
            TeardownOutcome::RetryAfter(DOMAIN_STOP_RETRY_DELAY)
        );

        fake.clear_calls();
        assert_eq!(
            teardown.run("m1", &state).await.unwrap(),
            TeardownOutcome::RetryAfter(DOMAIN_SHUTDOWN_RETRY_DELAY)
        );
        assert_eq!(fake.mutations(), 0);

        fake.set_domain_state("m1", DomainState::Shutoff);
        assert_eq!(converge(&teardown, &state).await, 1);
        assert_clean(&fake);
    }

    #[tokio::test]
    async fn test_stopped_domain() {
        let (fake, teardown, state) = setup(Some(DomainState::Shutoff));

        assert_eq!(
            teardown.run("m1", &state).await.unwrap(),
            TeardownOutcome::Removed
        );
        assert_clean(&fake);
    }

    #[tokio::test]
    async fn test_crashed_domain_is_undefined() {
        let (fake, teardown, state) = setup(Some(DomainState::Crashed));

        assert_eq!(converge(&teardown, &state).await, 1);
        assert_clean(&fake);
    }

    #[tokio::test]
    async fn test_repeated_runs_after_removal() {
        let (fake, teardown, state) = setup(Some(DomainState::Running));
        converge(&teardown, &state).await;

        fake.clear_calls();
        for _ in 0..3 {
            assert_eq!(
                teardown.run("m1", &state).await.unwrap(),
                TeardownOutcome::Removed
            );
        }
        assert_eq!(fake.mutations(), 0);
    }

    #[tokio::test]
    async fn test_absent_domain_and_volumes() {
        let fake = Arc::new(FakeHypervisor::with_pool(POOL));
        let teardown = Teardown::with_broker(Arc::new(ResourceBroker::new(fake.clone())));

        assert_eq!(
            teardown.run("m1", &provisioned_state()).await.unwrap(),
            TeardownOutcome::Removed
        );

        assert_eq!(fake.mutations(), 0);
        for call in fake.calls() {
            assert!(
                call.starts_with("domain_lookup")
                    || call.starts_with("pool_lookup")
                    || call.starts_with("volume_lookup"),
                "unexpected call {call}"
            );
        }
    }

    #[tokio::test]
    async fn test_unknown_state_is_retryable() {
        let (fake, teardown, state) = setup(Some(DomainState::PmSuspended));

        let err = teardown.run("m1", &state).await.unwrap_err();
        assert!(matches!(err, Error::UnknownState { .. }));
        assert_eq!(err.retry_after(), Some(DEFAULT_RETRY_DELAY));
        assert_eq!(fake.mutations(), 0);
    }

    #[tokio::test]
    async fn test_volume_delete_failure_aborts_pass() {
        let (fake, teardown, state) = setup(Some(DomainState::Shutoff));
        fake.fail("volume_delete");

        let err = teardown.run("m1", &state).await.unwrap_err();
        assert!(!err.is_fatal());
        assert!(fake.domain("m1").is_none());
        assert_eq!(fake.count_calls("volume_delete"), 1);

        fake.clear_failures();
        assert_eq!(
            teardown.run("m1", &state).await.unwrap(),
            TeardownOutcome::Removed
        );
        assert!(fake.volume_names().is_empty());
    }

    #[tokio::test]
    async fn test_unrecorded_volumes_fall_back_to_names() {
        let (fake, teardown, _) = setup(None);
        // the primary disk pass died before recording the volume
        let state = MachineState {
            pool_name: Some(POOL.to_string()),
            ..Default::default()
        };

        assert_eq!(
            teardown.run("m1", &state).await.unwrap(),
            TeardownOutcome::Removed
        );
        assert!(fake.volume("default", "m1.qcow2").is_none());
        assert!(fake.volume("default", "m1-cidata.iso").is_none());
    }

    #[tokio::test]
    async fn test_partially_recorded_disks_are_removed() {
        let (fake, teardown, _) = setup(None);
        let state = MachineState {
            pool_name: Some(POOL.to_string()),
            partial_additional_disks: vec![AdditionalDiskState {
                disk_type: DiskType::Sata,
                vol_name: "m1-0-sata.qcow2".to_string(),
            }],
            ..Default::default()
        };

        assert_eq!(
            teardown.run("m1", &state).await.unwrap(),
            TeardownOutcome::Removed
        );
        assert!(fake.volume_names().is_empty());
    }

    #[tokio::test]
    async fn test_nothing_recorded() {
        let (fake, teardown, _) = setup(None);

        assert_eq!(
            teardown.run("m1", &MachineState::default()).await.unwrap(),
            TeardownOutcome::Removed
        );
        assert_eq!(fake.count_calls("volume_lookup"), 0);
        assert_eq!(fake.mutations(), 0);
    }

    #[tokio::test]
    async fn test_empty_machine_id() {
        let (_, teardown, state) = setup(None);
        assert!(teardown.run("", &state).await.unwrap_err().is_fatal());
    }

    #[test]
    fn test_volume_names_dedup() {
        let state = provisioned_state();
        assert_eq!(
            volume_names("m1", &state),
            vec!["m1.qcow2", "m1-0-sata.qcow2", "m1-cidata.iso"]
        );
    }
}
