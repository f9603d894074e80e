//! Background queue worker
//!
//! Polls the queue on an interval and runs claimed entries through the
//! transport handler. Commands arrive over a channel; `Stop` drains the
//! queue before exiting so nothing is left in flight.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::interval;

use super::{SyncHandler, SyncQueue};
use crate::error::{Result, StrataError};

/// Commands for the queue worker
#[derive(Debug)]
pub enum WorkerCommand {
    /// Process runnable entries now
    Drain,
    /// Drain, then stop the worker
    Stop,
}

/// Background worker driving the sync queue
pub struct QueueWorker {
    sender: mpsc::Sender<WorkerCommand>,
}

impl QueueWorker {
    /// Start the worker
    pub fn start(
        queue: Arc<SyncQueue>,
        handler: Arc<dyn SyncHandler>,
        poll_interval_ms: u64,
    ) -> Self {
        let (sender, mut receiver) = mpsc::channel::<WorkerCommand>(100);

        tokio::spawn(async move {
            let mut tick = interval(Duration::from_millis(poll_interval_ms.max(1)));

            loop {
                tokio::select! {
                    Some(cmd) = receiver.recv() => {
                        match cmd {
                            WorkerCommand::Drain => {
                                Self::drain(&queue, handler.as_ref());
                            }
                            WorkerCommand::Stop => {
                                // Final drain so no entry stays in flight
                                Self::drain(&queue, handler.as_ref());
                                break;
                            }
                        }
                    }
                    _ = tick.tick() => {
                        Self::drain(&queue, handler.as_ref());
                    }
                }
            }

            tracing::info!("sync worker stopped");
        });

        Self { sender }
    }

    /// Claim and process entries until none are runnable
    fn drain(queue: &SyncQueue, handler: &dyn SyncHandler) {
        loop {
            match queue.dequeue_next() {
                Ok(Some(entry)) => {
                    if let Err(e) = queue.process_claimed(&entry, handler) {
                        tracing::error!(entry = entry.id, "processing failed: {}", e);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("dequeue failed: {}", e);
                    break;
                }
            }
        }
    }

    /// Ask the worker to process runnable entries now
    pub async fn drain_now(&self) -> Result<()> {
        self.sender
            .send(WorkerCommand::Drain)
            .await
            .map_err(|_| StrataError::Sync("worker channel closed".to_string()))
    }

    /// Stop the worker after a final drain
    pub async fn stop(&self) -> Result<()> {
        self.sender
            .send(WorkerCommand::Stop)
            .await
            .map_err(|_| StrataError::Sync("worker channel closed".to_string()))
    }
}
