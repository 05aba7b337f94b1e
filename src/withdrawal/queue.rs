//! Saga Step Queue
//!
//! Message `{withdrawal_id, step}` with at-least-once delivery. Handlers are
//! idempotent, so duplicates are harmless. [`ChannelQueue`] is the in-process
//! implementation; a broker-backed queue only has to implement [`SagaQueue`].

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use super::types::WithdrawalId;

/// Saga step carried by a queue message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SagaStep {
    /// Move to PROCESSING, debit the ledger, then initiate the transfer
    Debit,
    /// Initiate the off-ramp transfer (redelivery after a crash mid-saga)
    Transfer,
    /// Poll the provider until a terminal status
    Monitor,
}

impl SagaStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStep::Debit => "debit",
            SagaStep::Transfer => "transfer",
            SagaStep::Monitor => "monitor",
        }
    }
}

impl fmt::Display for SagaStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaMessage {
    pub withdrawal_id: WithdrawalId,
    pub step: SagaStep,
}

impl SagaMessage {
    pub fn new(withdrawal_id: WithdrawalId, step: SagaStep) -> Self {
        Self {
            withdrawal_id,
            step,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queue closed")]
    Closed,

    #[error("Queue full")]
    Full,
}

#[async_trait]
pub trait SagaQueue: Send + Sync {
    async fn enqueue(&self, msg: SagaMessage) -> Result<(), QueueError>;
}

/// Producer side of the in-process queue
#[derive(Clone)]
pub struct ChannelQueue {
    tx: mpsc::Sender<SagaMessage>,
}

#[async_trait]
impl SagaQueue for ChannelQueue {
    /// Non-blocking: intake must never wait on saga throughput
    async fn enqueue(&self, msg: SagaMessage) -> Result<(), QueueError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => QueueError::Full,
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
        })
    }
}

/// Consumer side of the in-process queue
pub struct SagaReceiver {
    rx: mpsc::Receiver<SagaMessage>,
}

impl SagaReceiver {
    /// Next message, or `None` once every producer is dropped
    pub async fn recv(&mut self) -> Option<SagaMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SagaMessage> {
        self.rx.try_recv().ok()
    }

    /// Stop accepting new messages; buffered ones are still delivered
    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// Create a bounded queue pair
pub fn saga_channel(capacity: usize) -> (ChannelQueue, SagaReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ChannelQueue { tx }, SagaReceiver { rx })
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_wire_format() {
        let id = WithdrawalId::new();
        let msg = SagaMessage::new(id, SagaStep::Debit);
        let json = serde_json::to_value(msg).unwrap();
        assert_eq!(json["step"], "debit");
        assert_eq!(json["withdrawal_id"], id.to_string());

        let back: SagaMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[tokio::test]
    async fn test_channel_queue_delivers_in_order() {
        let (queue, mut rx) = saga_channel(4);
        let id = WithdrawalId::new();
        queue.enqueue(SagaMessage::new(id, SagaStep::Debit)).await.unwrap();
        queue
            .enqueue(SagaMessage::new(id, SagaStep::Monitor))
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().step, SagaStep::Debit);
        assert_eq!(rx.recv().await.unwrap().step, SagaStep::Monitor);
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_full_and_closed() {
        let (queue, mut rx) = saga_channel(1);
        let msg = SagaMessage::new(WithdrawalId::new(), SagaStep::Debit);
        queue.enqueue(msg).await.unwrap();
        assert_eq!(queue.enqueue(msg).await, Err(QueueError::Full));

        rx.close();
        assert_eq!(queue.enqueue(msg).await, Err(QueueError::Closed));
        // Buffered message survives close
        assert_eq!(rx.recv().await, Some(msg));
    }
}
