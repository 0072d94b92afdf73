//! Engine event queue (§4.5): a bounded, single-consumer queue delivering
//! partition-scope events to a caller-supplied handler in batches.
//!
//! Grounded on the teacher's use of bounded channels for cross-task delivery
//! (`tokio::sync::mpsc`); the batch-drain-then-handle loop, bounded retry
//! with fixed delay, and panic recovery via a `JoinHandle` are this crate's
//! own addition since the teacher has no equivalent batched dispatch queue.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::events::PartitionEvent;

#[derive(Debug, Error)]
pub enum EventQueueError {
    #[error("handler panicked: {0}")]
    HandlerPanicked(String),
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

/// A batch handler: takes ownership of the batch, returns an error message
/// on failure.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, batch: Vec<PartitionEvent>) -> HandlerFuture;
}

impl<F, Fut> Handler for F
where
    F: Fn(Vec<PartitionEvent>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    fn handle(&self, batch: Vec<PartitionEvent>) -> HandlerFuture {
        Box::pin(self(batch))
    }
}

/// A bounded engine event queue. `Start`, `Flush`, `Cancel` and the internal
/// `close` are each idempotent.
pub struct EngineEventQueue {
    sender: mpsc::Sender<PartitionEvent>,
    receiver: Mutex<Option<mpsc::Receiver<PartitionEvent>>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
    batch_size: usize,
    max_retries: u32,
    retry_delay: Duration,
}

impl EngineEventQueue {
    #[must_use]
    pub fn new(capacity: usize, batch_size: usize, max_retries: u32, retry_delay: Duration) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            loop_handle: Mutex::new(None),
            closed: Arc::new(AtomicBool::new(false)),
            batch_size,
            max_retries,
            retry_delay,
        }
    }

    /// Enqueue one event. May block under backpressure once the channel is
    /// full (bounded, per §5).
    pub async fn enqueue(&self, event: PartitionEvent) {
        let _ = self.sender.send(event).await;
    }

    /// Start the consumer loop against `handler`. Idempotent.
    pub async fn start(&self, handler: Arc<dyn Handler>) {
        let mut guard = self.loop_handle.lock().await;
        if guard.is_some() {
            return;
        }
        let mut receiver = self.receiver.lock().await.take().expect("receiver taken twice");
        let batch_size = self.batch_size;
        let max_retries = self.max_retries;
        let retry_delay = self.retry_delay;

        *guard = Some(tokio::spawn(async move {
            while let Some(first) = receiver.recv().await {
                let mut batch = vec![first];
                while batch.len() < batch_size {
                    match receiver.try_recv() {
                        Ok(event) => batch.push(event),
                        Err(_) => break,
                    }
                }
                Self::handle_batch(handler.as_ref(), batch, max_retries, retry_delay).await;
            }
        }));
    }

    async fn handle_batch(handler: &dyn Handler, batch: Vec<PartitionEvent>, max_retries: u32, retry_delay: Duration) {
        let mut attempt = 0;
        loop {
            let result = AssertUnwindSafeFuture(handler.handle(batch.clone())).await;
            match result {
                Ok(Ok(())) => return,
                Ok(Err(err)) => {
                    attempt += 1;
                    if attempt > max_retries {
                        warn!(error = %err, "engine event batch dropped after exhausting retries");
                        return;
                    }
                    tokio::time::sleep(retry_delay).await;
                }
                Err(panic_msg) => {
                    warn!(error = %panic_msg, "engine event handler panicked");
                    return;
                }
            }
        }
    }

    /// `Flush`: stop accepting new batches after draining in-flight work.
    pub async fn flush(&self, handler: Arc<dyn Handler>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.loop_handle.lock().await.take() {
            drop(handle);
        }
        let mut receiver = self.receiver.lock().await;
        if let Some(receiver) = receiver.as_mut() {
            let mut residue = Vec::new();
            while let Ok(event) = receiver.try_recv() {
                residue.push(event);
            }
            for chunk in residue.chunks(self.batch_size) {
                Self::handle_batch(handler.as_ref(), chunk.to_vec(), self.max_retries, self.retry_delay).await;
            }
        }
    }

    /// `Cancel`: stop the loop without draining.
    pub async fn cancel(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.loop_handle.lock().await.take() {
            handle.abort();
        }
    }
}

/// Runs a handler future with `catch_unwind`-style panic recovery, surfaced
/// as `Err(message)` instead of unwinding the consumer task.
struct AssertUnwindSafeFuture<F>(F);

impl<F: Future<Output = Result<(), String>>> Future for AssertUnwindSafeFuture<F> {
    type Output = Result<Result<(), String>, String>;

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<Self::Output> {
        // SAFETY: we only project the inner future, never move out of `self`.
        let inner = unsafe { self.map_unchecked_mut(|s| &mut s.0) };
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| inner.poll(cx)));
        match result {
            Ok(std::task::Poll::Ready(out)) => std::task::Poll::Ready(Ok(out)),
            Ok(std::task::Poll::Pending) => std::task::Poll::Pending,
            Err(payload) => {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                std::task::Poll::Ready(Err(msg))
            }
        }
    }
}
