//! Tracked concurrent deliveries

use super::{deliver, SecureChannel};
use crate::{Address, Message, MessageKind, RetryPolicy};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::error;

/// A delivery whose retry budget ran out
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Delivery of {kind} to {to} failed after {attempts} attempts: {last_error}")]
pub struct DeliveryFailure {
    /// Destination
    pub to: Address,
    /// What was being delivered
    pub kind: MessageKind,
    /// Attempts made
    pub attempts: u32,
    /// Error of the final attempt
    pub last_error: String,
}

/// Final result of one tracked delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub to: Address,
    pub kind: MessageKind,
    pub result: Result<(), DeliveryFailure>,
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        self.result.is_ok()
    }
}

/// Handles of in-flight deliveries spawned by a session
#[derive(Default)]
pub struct DeliveryTracker {
    handles: Mutex<Vec<JoinHandle<DeliveryOutcome>>>,
    finished: Mutex<Vec<DeliveryOutcome>>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a delivery task and keep its handle
    ///
    /// The caller does not wait for the delivery; failures are logged and
    /// surface through [`join`](Self::join).
    pub async fn dispatch<C: SecureChannel>(
        &self,
        channel: Arc<C>,
        to: Address,
        message: Message,
        policy: RetryPolicy,
    ) {
        self.spawn(async move {
            let result = deliver(channel.as_ref(), &to, &message, &policy).await;
            if let Err(failure) = &result {
                error!(from = %channel.local_address(), "{}", failure);
            }
            DeliveryOutcome {
                to,
                kind: message.kind(),
                result,
            }
        })
        .await;
    }

    /// Spawn a task producing a delivery outcome and keep its handle
    ///
    /// The handle is stored before the task can run far enough to signal
    /// anything, so a [`join`](Self::join) issued after such a signal always
    /// waits for this task.
    pub async fn spawn<F>(&self, task: F)
    where
        F: Future<Output = DeliveryOutcome> + Send + 'static,
    {
        let mut handles = self.handles.lock().await;
        handles.push(tokio::spawn(task));
    }

    /// Wait for every delivery dispatched so far and return all outcomes
    pub async fn join(&self) -> Vec<DeliveryOutcome> {
        let handles = std::mem::take(&mut *self.handles.lock().await);
        let results = futures_util::future::join_all(handles).await;

        let mut finished = self.finished.lock().await;
        for result in results {
            match result {
                Ok(outcome) => finished.push(outcome),
                Err(e) => error!("Delivery task did not finish: {}", e),
            }
        }

        finished.clone()
    }
}
