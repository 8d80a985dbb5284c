//! Cycle Runner
//!
//! A single consumer task owns the cycle engine; triggers from timers and
//! the CLI queue behind it. Two triggers can arrive in the same second and
//! both cycles run, one after the other, never interleaved.

use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::types::CycleTrigger;

use super::cycle::CycleEngine;

pub struct CycleRunner {
    tx: UnboundedSender<CycleTrigger>,
    handle: JoinHandle<()>,
}

impl CycleRunner {
    /// Queue a trigger. Returns false if the runner has shut down.
    pub fn trigger(&self, trigger: CycleTrigger) -> bool {
        self.tx.send(trigger).is_ok()
    }

    pub fn sender(&self) -> UnboundedSender<CycleTrigger> {
        self.tx.clone()
    }

    /// Close the queue and wait for the in-flight cycle to finish.
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.handle.await {
            error!("Cycle runner task panicked: {}", e);
        }
    }
}

/// Spawn the consumer task. Cycles run strictly sequentially in queue
/// order; a cycle failure is logged and the runner moves to the next
/// trigger.
pub fn spawn_cycle_runner(engine: Arc<CycleEngine>) -> CycleRunner {
    let (tx, mut rx) = mpsc::unbounded_channel::<CycleTrigger>();

    let handle = tokio::spawn(async move {
        while let Some(trigger) = rx.recv().await {
            match engine.run(trigger).await {
                Ok(record) => {
                    info!("Cycle {} recorded ({:?})", record.id, record.status);
                }
                Err(e) => {
                    error!("Cycle failed to persist: {}", e);
                }
            }
        }
        info!("Cycle runner draining complete, shutting down");
    });

    CycleRunner { tx, handle }
}
