//! Broker client interface.
//!
//! The broker-side pipeline needs a small slice of an AMQP-style client:
//! topic exchanges, named queues bound by routing key, per-queue consumers
//! that can be started and stopped, a publisher, explicit settlement of each
//! delivery, and a bounded event pump.

pub mod memory;
pub mod pipeline;

#[cfg(feature = "amqp")]
pub mod amqp;

use async_trait::async_trait;
use tokio::time::Duration;

/// Broker-assigned identifier of one delivery, used to settle it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryTag(pub u64);

impl std::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A consumed message awaiting settlement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub queue: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    /// Negative-ack with requeue; the message is redelivered untouched.
    Requeue,
    /// Negative-ack without requeue (poison message).
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("not connected")]
    NotConnected,
    #[error("channel error: {0}")]
    Channel(String),
    #[error("unknown delivery tag {0}")]
    UnknownDelivery(DeliveryTag),
}

impl BrokerError {
    /// Errors that invalidate the connection and call for a reconnect.
    pub fn is_connection(&self) -> bool {
        !matches!(self, BrokerError::UnknownDelivery(_))
    }
}

#[async_trait]
pub trait BrokerClient: Send {
    /// Human-readable endpoint for logs (no credentials).
    fn describe(&self) -> String;

    /// Open a fresh connection, discarding any previous one.
    async fn connect(&mut self) -> Result<(), BrokerError>;

    async fn declare_exchange(&mut self, exchange: &str) -> Result<(), BrokerError>;

    /// Declare `queue` and bind it to `exchange` under `routing_key`.
    async fn declare_queue(
        &mut self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    async fn start_consuming(&mut self, queue: &str) -> Result<(), BrokerError>;

    async fn stop_consuming(&mut self, queue: &str) -> Result<(), BrokerError>;

    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError>;

    async fn settle(&mut self, tag: DeliveryTag, settlement: Settlement)
    -> Result<(), BrokerError>;

    /// Collect deliveries from active consumers, waiting at most `timeout`.
    /// An empty result is a benign timeout.
    async fn pump(&mut self, timeout: Duration) -> Result<Vec<Delivery>, BrokerError>;

    /// Close the connection.  Unsettled deliveries return to their queues.
    async fn close(&mut self);
}
