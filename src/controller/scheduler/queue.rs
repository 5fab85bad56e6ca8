use std::{sync::Arc, time::Duration};

use async_channel::{Receiver, Sender};
use papaya::{Compute, HashMap, Operation};
use tracing::{error, warn};

use crate::controller::context::ControllerKey;

#[derive(Clone, Debug)]
enum KeyStatus {
    InFlight,
    Pending,
}

/// Keys are handed to at most one worker at a time. A key pushed while it is
/// in flight is parked and sent again once the worker is done with it.
#[derive(Clone)]
pub struct WorkQueue {
    keys: Arc<HashMap<ControllerKey, KeyStatus>>,
    tx: Sender<ControllerKey>,
}

impl WorkQueue {
    pub fn new() -> (Self, Receiver<ControllerKey>) {
        let (tx, rx) = async_channel::unbounded();

        (
            Self {
                keys: Arc::new(HashMap::new()),
                tx,
            },
            rx,
        )
    }

    pub async fn push(&self, key: &ControllerKey) {
        let admitted = {
            let keys = self.keys.pin();
            let result = keys.compute(key.clone(), |entry| match entry {
                None => Operation::Insert(KeyStatus::InFlight),
                Some((_, KeyStatus::InFlight)) => Operation::Insert(KeyStatus::Pending),
                Some((_, KeyStatus::Pending)) => Operation::Abort(()),
            });

            match result {
                Compute::Inserted(..) => true,
                Compute::Aborted(()) => {
                    warn!("key {key} is already pending");
                    false
                }
                _ => false,
            }
        };

        if admitted {
            self.send(key).await;
        }
    }

    pub fn push_after(&self, key: &ControllerKey, delay: Duration) {
        let this = self.clone();
        let key = key.clone();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.push(&key).await;
        });
    }

    /// Releases a key. A parked push hands it straight back to the workers
    /// without the key ever leaving the map.
    pub async fn done(&self, key: &ControllerKey) {
        let resend = {
            let keys = self.keys.pin();
            let result = keys.compute(key.clone(), |entry| match entry {
                Some((_, KeyStatus::Pending)) => Operation::Insert(KeyStatus::InFlight),
                Some((_, KeyStatus::InFlight)) => Operation::Remove,
                None => Operation::Abort(()),
            });

            matches!(result, Compute::Updated { .. })
        };

        if resend {
            self.send(key).await;
        }
    }

    async fn send(&self, key: &ControllerKey) {
        if let Err(e) = self.tx.send(key.clone()).await {
            self.keys.pin().remove(key);
            error!("failed to send key {key} to queue: {e}");
        }
    }
}
