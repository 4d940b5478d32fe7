//! Sequential Dispatch Queue.
//!
//! One worker task drains an unbounded channel and hands each item to an
//! [`ItemProcessor`] strictly in submission order. The processor is owned by
//! the worker, so the state it mutates needs no lock. A failing or panicking
//! item is reported through `on_exception` and the worker moves on.

use crate::error::{GmsError, GmsResult};
use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Handles the items of one queue.
pub trait ItemProcessor<T>: Send + 'static {
    fn process(&mut self, item: T) -> impl Future<Output = GmsResult<()>> + Send;

    /// Called with the error of an item that failed or panicked.
    fn on_exception(&mut self, error: GmsError) {
        warn!(error = %error, "dispatch item failed");
    }
}

enum Command<T> {
    Item(T),
    Stop,
}

/// Cheap handle for submitting items from any task.
pub struct QueueSender<T> {
    tx: mpsc::UnboundedSender<Command<T>>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> QueueSender<T> {
    /// Submit one item without waiting. Fails once the worker has stopped.
    pub fn enqueue(&self, item: T) -> GmsResult<()> {
        self.tx
            .send(Command::Item(item))
            .map_err(|_| GmsError::Disposed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct SequentialQueue<T> {
    sender: QueueSender<T>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> SequentialQueue<T> {
    /// Start the worker task with `processor`.
    pub fn spawn<P: ItemProcessor<T>>(processor: P) -> Self {
        Self::spawn_with(|_| processor)
    }

    /// Start the worker task with a processor that can itself submit items.
    pub fn spawn_with<P, B>(build: B) -> Self
    where
        P: ItemProcessor<T>,
        B: FnOnce(QueueSender<T>) -> P,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command<T>>();
        let sender = QueueSender { tx };
        let mut processor = build(sender.clone());

        let worker = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                let item = match command {
                    Command::Item(item) => item,
                    Command::Stop => break,
                };
                let outcome = AssertUnwindSafe(processor.process(item))
                    .catch_unwind()
                    .await;
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => processor.on_exception(e),
                    Err(panic) => {
                        let what = panic
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "unknown panic".to_string());
                        processor.on_exception(GmsError::InvalidState(format!(
                            "dispatch item panicked: {what}"
                        )));
                    }
                }
            }
            rx.close();
            debug!("dispatch worker stopped");
        });

        Self {
            sender,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn sender(&self) -> QueueSender<T> {
        self.sender.clone()
    }

    pub fn enqueue(&self, item: T) -> GmsResult<()> {
        self.sender.enqueue(item)
    }

    /// Process everything already enqueued, then stop and join the worker.
    /// Idempotent.
    pub async fn shutdown(&self) {
        let _ = self.sender.tx.send(Command::Stop);
        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(e) = worker.await {
                warn!(error = %e, "dispatch worker ended abnormally");
            }
        }
    }
}
