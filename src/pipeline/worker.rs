//! Worker pool consuming the request queue
//!
//! Request ids are sent through a bounded `mpsc` channel. The pool takes one
//! semaphore permit per request, so at most `max_concurrent` requests run at
//! once, each in its own task.

use anyhow::{Result, anyhow};
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};

use super::Pipeline;
use crate::constants::REQUEST_QUEUE_CAPACITY;
use crate::request::StateKind;

/// Sending half of the request queue.
#[derive(Debug, Clone)]
pub struct WorkQueue {
    sender: mpsc::Sender<u64>,
}

impl WorkQueue {
    /// Queue request `id` for processing.
    pub async fn enqueue(&self, id: u64) -> Result<()> {
        self.sender.send(id).await.map_err(|_| anyhow!("The worker pool has shut down, request {id} was not queued"))
    }
}

/// Background workers draining a [`WorkQueue`].
pub struct WorkerPool {
    handle: JoinHandle<Vec<(u64, Option<StateKind>)>>,
}

impl WorkerPool {
    /// Start the pool. Dropping every [`WorkQueue`] clone lets it finish.
    pub fn spawn(pipeline: Arc<Pipeline>, max_concurrent: usize) -> (WorkQueue, Self) {
        let (sender, receiver) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
        let handle = tokio::spawn(run(pipeline, receiver, semaphore));
        (
            WorkQueue {
                sender,
            },
            Self {
                handle,
            },
        )
    }

    /// Wait for every queued request to be processed.
    ///
    /// Returns the final state of each request in completion order.
    pub async fn join(self) -> Result<Vec<(u64, Option<StateKind>)>> {
        self.handle.await.map_err(|e| anyhow!("The worker pool panicked: {e}"))
    }
}

async fn run(
    pipeline: Arc<Pipeline>,
    mut receiver: mpsc::Receiver<u64>,
    semaphore: Arc<Semaphore>,
) -> Vec<(u64, Option<StateKind>)> {
    let mut tasks = JoinSet::new();
    while let Some(id) = receiver.recv().await {
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };
        let pipeline = pipeline.clone();
        tasks.spawn(async move {
            let _permit = permit;
            tracing::debug!(target: "pipeline::worker", "Picked up request {}", id);
            match pipeline.process(id).await {
                Ok(state) => (id, state),
                Err(e) => {
                    tracing::error!(target: "pipeline::worker", "Could not record the outcome of request {}: {:#}", id, e);
                    (id, None)
                }
            }
        });
    }

    let mut finished = Vec::new();
    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(outcome) => finished.push(outcome),
            Err(e) => tracing::error!(target: "pipeline::worker", "A worker task panicked: {}", e),
        }
    }
    finished
}
