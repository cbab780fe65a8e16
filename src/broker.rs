use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

use crate::ack::AcknowledgmentToken;
use crate::error::BrokerError;
use crate::record::{Record, SendResult, TopicPartition};

/// Trait for broker client implementations to enable testing with mocks
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Hand a record to the broker. The record is enqueued before this
    /// returns; the future only reports the outcome, so dropping it does not
    /// cancel the send.
    fn send(&self, topic: &str, key: Option<String>, value: String) -> DeliveryFuture;

    /// Join `group_id` as a new member consuming `topics`
    async fn subscribe(&self, topics: &[String], group_id: &str) -> Result<Box<dyn Subscription>, BrokerError>;

    /// Broker name for logging
    fn broker_type(&self) -> &'static str;
}

/// One consumer-group membership. Owned by exactly one listener container.
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next record. `None` once the subscription is closed.
    async fn next(&mut self) -> Option<(Record, AcknowledgmentToken)>;

    /// Stop fetching while keeping the partition assignment
    fn pause(&mut self);

    fn resume(&mut self);

    /// Rewind the fetch position of one partition to the group's committed
    /// offset so uncommitted records are delivered again
    fn seek_to_committed(&mut self, partition: &TopicPartition);

    /// Partitions currently assigned to this member
    fn assignment(&self) -> Vec<TopicPartition>;

    /// Leave the group, releasing the assignment
    fn close(&mut self);

    fn group_id(&self) -> &str;
}

/// Outcome of a send, resolved by the broker's completion path
#[must_use = "drop the future explicitly to fire and forget"]
pub struct DeliveryFuture {
    rx: oneshot::Receiver<Result<SendResult, BrokerError>>,
}

/// Completion side of a [`DeliveryFuture`]
pub struct DeliverySender {
    tx: oneshot::Sender<Result<SendResult, BrokerError>>,
}

impl DeliveryFuture {
    pub fn channel() -> (DeliverySender, DeliveryFuture) {
        let (tx, rx) = oneshot::channel();
        (DeliverySender { tx }, DeliveryFuture { rx })
    }

    /// A future that is already resolved
    pub fn ready(result: Result<SendResult, BrokerError>) -> Self {
        let (tx, fut) = Self::channel();
        tx.complete(result);
        fut
    }
}

impl DeliverySender {
    pub fn complete(self, result: Result<SendResult, BrokerError>) {
        // Nobody listening is fine: fire-and-forget callers drop the future
        let _ = self.tx.send(result);
    }
}

impl Future for DeliveryFuture {
    type Output = Result<SendResult, BrokerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(BrokerError::Canceled)))
    }
}
