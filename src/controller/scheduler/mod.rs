pub mod queue;

use std::sync::Arc;

use anyhow::Result;
use async_channel::Receiver;
use tracing::{error, info};

use crate::{
    agent::Agent,
    controller::{
        Controller, ReconcileNext,
        context::{ControllerContext, ControllerEvent, ControllerKey},
        scheduler::queue::WorkQueue,
    },
    repository::Repository,
};

pub struct SchedulerConfig {
    pub worker_count: usize,
}

pub struct Scheduler {
    pub repository: Arc<Repository>,
    pub agent: Arc<Agent>,
    config: SchedulerConfig,
    ctx: ControllerContext,
    queue: WorkQueue,
    rx: Receiver<ControllerKey>,
    ctrl: Arc<Vec<Box<dyn Controller>>>,
}

impl Scheduler {
    pub fn new(
        repository: Arc<Repository>,
        agent: Arc<Agent>,
        config: SchedulerConfig,
        ctrls: Vec<Box<dyn Controller>>,
    ) -> Self {
        let (queue, rx) = WorkQueue::new();
        let ctx = ControllerContext::new(repository.clone(), agent.clone());

        Self {
            repository,
            agent,
            config,
            ctx,
            queue,
            rx,
            ctrl: Arc::new(ctrls),
        }
    }

    pub fn start_workers(&self) {
        info!("starting {} workers", self.config.worker_count);
        for _ in 0..self.config.worker_count {
            let queue = self.queue.clone();
            let ctx = self.ctx.clone();
            let ctrl = self.ctrl.clone();
            let rx = self.rx.clone();

            tokio::spawn(async move {
                while let Ok(key) = rx.recv().await {
                    for ctrl in ctrl.iter() {
                        if !ctrl.should_reconcile(ctx.clone(), key.clone()).await {
                            continue;
                        }

                        let reconcile = ctrl.reconcile(ctx.clone(), key.clone()).await;

                        let next = match reconcile {
                            Ok(next) => next,
                            Err(e) => ctrl.handle_error(ctx.clone(), key.clone(), e).await,
                        };

                        match next {
                            ReconcileNext::Done => {}
                            ReconcileNext::Immediate => {
                                queue.push(&key).await;
                            }
                            ReconcileNext::After(duration) => {
                                queue.push_after(&key, duration);
                            }
                        }
                    }

                    queue.done(&key).await;
                }
            });
        }
    }

    pub async fn push(&self, ev: ControllerEvent) -> Result<()> {
        for ctrl in self.ctrl.iter() {
            let result = ctrl.schedule(self.ctx.clone(), ev.clone()).await;
            match result {
                Ok(Some(key)) => {
                    self.queue.push(&key).await;
                }
                Ok(None) => {}
                Err(e) => {
                    error!("failed to schedule event for controller: {}", e);
                }
            }
        }

        Ok(())
    }

    pub async fn schedule_bringup(&self) -> Result<()> {
        for id in self.repository.list_known_ids().await? {
            info!(machine = %id, "scheduled bringup");
            self.push(ControllerEvent::BringUp(id)).await?;
        }

        Ok(())
    }
}
