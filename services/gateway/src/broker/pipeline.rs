//! Broker-side pipeline.
//!
//! Owns the broker connection.  Each iteration:
//! 1. connect and attach exchanges, queues and the always-on consumers
//! 2. start or stop the outgoing consumer to follow the Active flag
//! 3. settle the held outgoing message once the device side has taken it
//! 4. publish the incoming mailbox item, if any
//! 5. pump the client for one slice and admit each delivery
//!
//! Admission keeps at most one outgoing message in flight: a new `message`
//! delivery is only accepted into an empty outgoing mailbox while Active, and
//! stays unacknowledged ("held") until the device side has drained it.  A
//! held message is acknowledged only if no pause happened while it was
//! queued; otherwise it is requeued.

use super::{BrokerClient, BrokerError, Delivery, DeliveryTag, Settlement};
use crate::mailbox::Links;
use crate::pacing::{Pace, sleep_or_shutdown};
use sms_protocol::{BrokerMessage, MessageType, Routes, exchanges};
use tokio::sync::watch;
use tokio::time::Duration;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerTiming {
    pub reconnect: Duration,
    pub pump: Duration,
    pub idle: Duration,
}

impl Default for BrokerTiming {
    fn default() -> Self {
        Self {
            reconnect: Duration::from_secs(5),
            pump: Duration::from_millis(100),
            idle: Duration::from_millis(100),
        }
    }
}

/// An outgoing delivery placed in the mailbox but not yet acknowledged.
#[derive(Debug, Clone)]
struct Held {
    tag: DeliveryTag,
    message: BrokerMessage,
    /// Pause count when the message was queued.
    pauses: u64,
}

pub struct BrokerPipeline {
    name: String,
    client: Box<dyn BrokerClient>,
    routes: Routes,
    links: Links,
    shutdown_rx: watch::Receiver<bool>,
    timing: BrokerTiming,
    connected: bool,
    consuming_outgoing: bool,
    held: Option<Held>,
}

impl BrokerPipeline {
    pub fn new(
        name: &str,
        client: Box<dyn BrokerClient>,
        links: Links,
        shutdown_rx: watch::Receiver<bool>,
        timing: BrokerTiming,
    ) -> Self {
        Self {
            name: name.to_owned(),
            client,
            routes: Routes::for_name(name),
            links,
            shutdown_rx,
            timing,
            connected: false,
            consuming_outgoing: false,
            held: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_consuming_outgoing(&self) -> bool {
        self.consuming_outgoing
    }

    /// Whether an outgoing delivery is awaiting acknowledgement.
    pub fn has_held(&self) -> bool {
        self.held.is_some()
    }

    /// Run until shutdown, then release anything still in flight.
    pub async fn run(mut self) {
        info!(name = %self.name, broker = %self.client.describe(), "broker pipeline starting");
        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }
            let delay = match self.run_once().await {
                Pace::Immediately => Duration::ZERO,
                Pace::Backoff => self.timing.reconnect,
                Pace::Idle | Pace::Poll => self.timing.idle,
            };
            if sleep_or_shutdown(&mut self.shutdown_rx, delay).await {
                break;
            }
        }
        self.shutdown().await;
        info!(name = %self.name, "broker pipeline stopped");
    }

    /// One loop iteration.
    pub async fn run_once(&mut self) -> Pace {
        if !self.connected {
            match self.connect_and_attach().await {
                Ok(()) => {
                    info!(broker = %self.client.describe(), "broker connected");
                    self.connected = true;
                }
                Err(e) => {
                    warn!(
                        broker = %self.client.describe(),
                        error = %e,
                        retry_in = self.timing.reconnect.as_secs_f32(),
                        "broker connect failed"
                    );
                    return Pace::Backoff;
                }
            }
        }

        match self.step().await {
            Ok(()) => Pace::Idle,
            Err(e) if e.is_connection() => {
                self.lose_connection(&e);
                Pace::Immediately
            }
            Err(e) => {
                warn!(error = %e, "broker operation failed");
                Pace::Idle
            }
        }
    }

    async fn step(&mut self) -> Result<(), BrokerError> {
        self.reconcile_consumer().await?;
        self.settle_held().await?;
        self.publish_incoming().await?;
        let deliveries = self.client.pump(self.timing.pump).await?;
        for delivery in deliveries {
            self.admit(delivery).await?;
        }
        Ok(())
    }

    async fn connect_and_attach(&mut self) -> Result<(), BrokerError> {
        self.client.connect().await?;
        for exchange in exchanges::ALL {
            self.client.declare_exchange(exchange).await?;
        }
        for (exchange, queue) in self.routes.consumed() {
            self.client.declare_queue(queue, exchange, queue).await?;
        }
        self.client.start_consuming(&self.routes.command).await?;
        self.client.start_consuming(&self.routes.request).await?;
        self.consuming_outgoing = false;
        self.held = None;
        Ok(())
    }

    fn lose_connection(&mut self, error: &BrokerError) {
        warn!(broker = %self.client.describe(), error = %error, "broker connection lost");
        self.connected = false;
        self.consuming_outgoing = false;
        // Unacknowledged deliveries die with the connection and are
        // redelivered; the local copy must not be sent as well.
        if let Some(held) = self.held.take() {
            self.links.outgoing.take_if_eq(&held.message);
        }
    }

    /// Start or stop the outgoing consumer to match the Active flag.
    async fn reconcile_consumer(&mut self) -> Result<(), BrokerError> {
        let active = self.links.active.is_active();
        if active && !self.consuming_outgoing {
            self.client.start_consuming(&self.routes.outgoing).await?;
            self.consuming_outgoing = true;
            debug!(queue = %self.routes.outgoing, "outgoing consumer started");
        } else if !active && self.consuming_outgoing {
            self.abort_outbound().await?;
            self.client.stop_consuming(&self.routes.outgoing).await?;
            self.consuming_outgoing = false;
            debug!(queue = %self.routes.outgoing, "outgoing consumer stopped");
        }
        Ok(())
    }

    /// Return the held message to the broker if it was never sent, and drop
    /// the local copy.
    async fn abort_outbound(&mut self) -> Result<(), BrokerError> {
        let Some(held) = self.held.take() else {
            return Ok(());
        };
        if self.links.outgoing.take_if_eq(&held.message) {
            self.client.settle(held.tag, Settlement::Requeue).await?;
            debug!(tag = %held.tag, "in-flight outgoing message requeued");
            return Ok(());
        }
        self.settle_drained(held).await
    }

    /// Settle the held message once the device side has drained the mailbox.
    async fn settle_held(&mut self) -> Result<(), BrokerError> {
        if self.links.outgoing.is_occupied() {
            return Ok(());
        }
        match self.held.take() {
            Some(held) => self.settle_drained(held).await,
            None => Ok(()),
        }
    }

    /// The device side drains the outgoing mailbox either by sending or by
    /// dropping the item on a pause.  Any pause since the message was queued,
    /// however brief, means it may not have been sent, so it goes back to
    /// the broker.
    async fn settle_drained(&mut self, held: Held) -> Result<(), BrokerError> {
        let active = &self.links.active;
        if active.is_active() && active.pauses() == held.pauses {
            self.client.settle(held.tag, Settlement::Ack).await?;
            debug!(tag = %held.tag, "outgoing message acknowledged");
        } else {
            self.client.settle(held.tag, Settlement::Requeue).await?;
            debug!(tag = %held.tag, "paused since queued; outgoing message requeued");
        }
        Ok(())
    }

    async fn publish_incoming(&mut self) -> Result<(), BrokerError> {
        if !self.links.active.is_active() {
            return Ok(());
        }
        let Some(envelope) = self.links.incoming.peek() else {
            return Ok(());
        };
        let payload = match envelope.to_json_bytes() {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "incoming envelope not serialisable; dropped");
                self.links.incoming.take_if_eq(&envelope);
                return Ok(());
            }
        };
        self.client
            .publish(exchanges::MESSAGES, &self.routes.incoming, &payload)
            .await?;
        if self.links.incoming.take_if_eq(&envelope) {
            info!(routing_key = %self.routes.incoming, identity = %envelope.identity, "SMS published");
        } else {
            // Withdrawn by the device side during the publish.
            warn!(identity = %envelope.identity, "SMS published after withdrawal; may be repeated");
        }
        Ok(())
    }

    /// Admission control for one delivery.
    async fn admit(&mut self, delivery: Delivery) -> Result<(), BrokerError> {
        let message = match BrokerMessage::classify(&delivery.payload) {
            Ok(m) => m,
            Err(e) => {
                warn!(queue = %delivery.queue, error = %e, "unclassifiable broker message rejected");
                return self.client.settle(delivery.tag, Settlement::Reject).await;
            }
        };
        match message.kind {
            MessageType::Message => self.admit_outgoing(delivery.tag, message).await,
            MessageType::Command | MessageType::Request => {
                let kind = message.kind;
                if self.links.command.try_put(message).is_ok() {
                    debug!(%kind, "command queued for device side");
                    self.client.settle(delivery.tag, Settlement::Ack).await
                } else {
                    trace!(%kind, "command mailbox busy; requeued");
                    self.client.settle(delivery.tag, Settlement::Requeue).await
                }
            }
        }
    }

    async fn admit_outgoing(
        &mut self,
        tag: DeliveryTag,
        message: BrokerMessage,
    ) -> Result<(), BrokerError> {
        if self.links.outgoing.is_occupied() || !self.links.active.is_active() {
            trace!(tag = %tag, "outgoing slot busy; requeued");
            return self.client.settle(tag, Settlement::Requeue).await;
        }
        if let Some(previous) = self.held.take() {
            self.settle_drained(previous).await?;
        }
        let pauses = self.links.active.pauses();
        match self.links.outgoing.try_put(message.clone()) {
            Ok(()) => {
                debug!(tag = %tag, "outgoing message queued for device side");
                self.held = Some(Held {
                    tag,
                    message,
                    pauses,
                });
                Ok(())
            }
            Err(_) => self.client.settle(tag, Settlement::Requeue).await,
        }
    }

    async fn shutdown(&mut self) {
        if !self.connected {
            return;
        }
        if let Err(e) = self.abort_outbound().await {
            warn!(error = %e, "in-flight cleanup failed at shutdown");
        }
        self.client.close().await;
        self.connected = false;
        self.consuming_outgoing = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;

    fn pipeline(broker: &MemoryBroker, links: &Links) -> BrokerPipeline {
        let (_tx, rx) = watch::channel(false);
        BrokerPipeline::new(
            "m1",
            Box::new(broker.client()),
            links.clone(),
            rx,
            BrokerTiming {
                pump: Duration::ZERO,
                ..BrokerTiming::default()
            },
        )
    }

    #[tokio::test]
    async fn attach_declares_exchanges_and_consumes_outgoing_when_active() {
        let broker = MemoryBroker::new();
        let links = Links::new();
        let mut p = pipeline(&broker, &links);
        assert_eq!(p.run_once().await, Pace::Idle);
        assert!(p.is_connected());
        assert!(p.is_consuming_outgoing());
        for exchange in exchanges::ALL {
            assert!(broker.has_exchange(exchange));
        }
    }

    #[tokio::test]
    async fn offline_broker_backs_off() {
        let broker = MemoryBroker::new();
        broker.set_online(false);
        let links = Links::new();
        let mut p = pipeline(&broker, &links);
        assert_eq!(p.run_once().await, Pace::Backoff);
        assert!(!p.is_connected());
    }

    #[tokio::test]
    async fn command_is_queued_and_acknowledged() {
        let broker = MemoryBroker::new();
        let links = Links::new();
        let mut p = pipeline(&broker, &links);
        p.run_once().await;
        broker.publish("commands", "m1.command", br#"{"type":"command"}"#);
        p.run_once().await;
        assert_eq!(links.command.peek().unwrap().kind, MessageType::Command);
        assert_eq!(broker.acked().len(), 1);
    }

    #[tokio::test]
    async fn busy_command_mailbox_requeues() {
        let broker = MemoryBroker::new();
        let links = Links::new();
        let mut p = pipeline(&broker, &links);
        p.run_once().await;
        links
            .command
            .try_put(BrokerMessage::classify(br#"{"type":"request"}"#).unwrap())
            .unwrap();
        broker.publish("requests", "m1.request", br#"{"type":"request"}"#);
        p.run_once().await;
        assert_eq!(broker.requeue_count(), 1);
        assert_eq!(broker.queue_len("m1.request"), 1);
    }

    #[tokio::test]
    async fn held_message_acknowledged_after_device_drains() {
        let broker = MemoryBroker::new();
        let links = Links::new();
        let mut p = pipeline(&broker, &links);
        p.run_once().await;
        broker.publish("messages", "m1.outgoing", br#"{"type":"message","text":"x"}"#);
        p.run_once().await;
        assert!(p.has_held());
        assert!(links.outgoing.is_occupied());
        assert!(broker.acked().is_empty());

        links.outgoing.take();
        p.run_once().await;
        assert!(!p.has_held());
        assert_eq!(broker.acked().len(), 1);
    }

    #[tokio::test]
    async fn pause_and_resume_between_cycles_requeues_drained_message() {
        let broker = MemoryBroker::new();
        let links = Links::new();
        let mut p = pipeline(&broker, &links);
        p.run_once().await;
        broker.publish("messages", "m1.outgoing", br#"{"type":"message","text":"x"}"#);
        p.run_once().await;
        assert!(p.has_held());

        // Drained by send or by a pause: a pause in between makes it unknowable.
        links.active.set(false);
        links.outgoing.take();
        links.active.set(true);
        p.run_once().await;

        assert!(broker.acked().is_empty());
        assert_eq!(broker.requeue_count(), 1);
        // Redelivered and queued again within the same cycle.
        assert!(p.has_held());
        assert!(links.outgoing.is_occupied());

        links.outgoing.take();
        p.run_once().await;
        assert_eq!(broker.acked().len(), 1);
        assert!(!p.has_held());
    }

    #[tokio::test]
    async fn lost_connection_drops_local_copy_of_held_message() {
        let broker = MemoryBroker::new();
        let links = Links::new();
        let mut p = pipeline(&broker, &links);
        p.run_once().await;
        broker.publish("messages", "m1.outgoing", br#"{"type":"message"}"#);
        p.run_once().await;
        assert!(links.outgoing.is_occupied());

        broker.set_online(false);
        assert_eq!(p.run_once().await, Pace::Immediately);
        assert!(!p.is_connected());
        assert!(!p.has_held());
        assert!(links.outgoing.is_empty());
        assert_eq!(broker.queue_len("m1.outgoing"), 1);
    }
}
