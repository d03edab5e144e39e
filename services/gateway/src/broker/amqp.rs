//! AMQP 0-9-1 engine backed by `lapin`.
//!
//! One connection and one channel with a prefetch of 1.  Deliveries are
//! pulled from each consumer stream without blocking until the pump slice
//! expires; their ackers are kept by tag until settled.

use super::{BrokerClient, BrokerError, Delivery, DeliveryTag, Settlement};
use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use std::collections::{BTreeMap, HashMap};
use tokio::time::{Duration, Instant, sleep};
use tracing::debug;

const POLL_STEP: Duration = Duration::from_millis(10);

pub struct AmqpBroker {
    uri: String,
    endpoint: String,
    connection: Option<Connection>,
    channel: Option<Channel>,
    consumers: BTreeMap<String, Consumer>,
    ackers: HashMap<DeliveryTag, Acker>,
}

impl AmqpBroker {
    /// `uri` carries credentials; `endpoint` is what gets logged.
    pub fn new(uri: String, endpoint: String) -> Self {
        Self {
            uri,
            endpoint,
            connection: None,
            channel: None,
            consumers: BTreeMap::new(),
            ackers: HashMap::new(),
        }
    }

    fn channel(&self) -> Result<&Channel, BrokerError> {
        self.channel.as_ref().ok_or(BrokerError::NotConnected)
    }

    fn reset(&mut self) {
        self.consumers.clear();
        self.ackers.clear();
        self.channel = None;
        self.connection = None;
    }
}

fn lost(e: lapin::Error) -> BrokerError {
    BrokerError::ConnectionLost(e.to_string())
}

fn consumer_tag(queue: &str) -> String {
    format!("sms-gateway.{}", queue)
}

#[async_trait]
impl BrokerClient for AmqpBroker {
    fn describe(&self) -> String {
        self.endpoint.clone()
    }

    async fn connect(&mut self) -> Result<(), BrokerError> {
        self.close().await;
        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;
        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;
        self.connection = Some(connection);
        self.channel = Some(channel);
        Ok(())
    }

    async fn declare_exchange(&mut self, exchange: &str) -> Result<(), BrokerError> {
        self.channel()?
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(lost)
    }

    async fn declare_queue(
        &mut self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let channel = self.channel()?;
        channel
            .queue_declare(queue, QueueDeclareOptions::default(), FieldTable::default())
            .await
            .map_err(lost)?;
        channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(lost)
    }

    async fn start_consuming(&mut self, queue: &str) -> Result<(), BrokerError> {
        if self.consumers.contains_key(queue) {
            return Ok(());
        }
        let consumer = self
            .channel()?
            .basic_consume(
                queue,
                &consumer_tag(queue),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(lost)?;
        self.consumers.insert(queue.to_owned(), consumer);
        Ok(())
    }

    async fn stop_consuming(&mut self, queue: &str) -> Result<(), BrokerError> {
        let Some(mut consumer) = self.consumers.remove(queue) else {
            return Ok(());
        };
        self.channel()?
            .basic_cancel(&consumer_tag(queue), BasicCancelOptions::default())
            .await
            .map_err(lost)?;
        // Deliveries pushed before the cancel-ok sit in the stream buffer and
        // would stay unacked until the connection closes.
        let mut returned = 0usize;
        while let Some(Some(item)) = consumer.next().now_or_never() {
            let delivery = item.map_err(lost)?;
            delivery
                .acker
                .nack(BasicNackOptions {
                    multiple: false,
                    requeue: true,
                })
                .await
                .map_err(lost)?;
            returned += 1;
        }
        if returned > 0 {
            debug!(queue, returned, "buffered deliveries requeued on cancel");
        }
        Ok(())
    }

    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError> {
        self.channel()?
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default().with_content_type("application/json".into()),
            )
            .await
            .map_err(lost)?
            .await
            .map_err(lost)?;
        Ok(())
    }

    async fn settle(
        &mut self,
        tag: DeliveryTag,
        settlement: Settlement,
    ) -> Result<(), BrokerError> {
        let acker = self
            .ackers
            .remove(&tag)
            .ok_or(BrokerError::UnknownDelivery(tag))?;
        let result = match settlement {
            Settlement::Ack => acker.ack(BasicAckOptions::default()).await,
            Settlement::Requeue => {
                acker
                    .nack(BasicNackOptions {
                        multiple: false,
                        requeue: true,
                    })
                    .await
            }
            Settlement::Reject => acker.reject(BasicRejectOptions { requeue: false }).await,
        };
        result.map(|_| ()).map_err(lost)
    }

    async fn pump(&mut self, timeout: Duration) -> Result<Vec<Delivery>, BrokerError> {
        self.channel()?;
        let deadline = Instant::now() + timeout;
        loop {
            let mut deliveries = Vec::new();
            for (queue, consumer) in self.consumers.iter_mut() {
                match consumer.next().now_or_never() {
                    None => {}
                    Some(Some(Ok(delivery))) => {
                        let tag = DeliveryTag(delivery.delivery_tag);
                        self.ackers.insert(tag, delivery.acker);
                        deliveries.push(Delivery {
                            tag,
                            queue: queue.clone(),
                            payload: delivery.data,
                        });
                    }
                    Some(Some(Err(e))) => return Err(lost(e)),
                    Some(None) => {
                        return Err(BrokerError::ConnectionLost(format!(
                            "consumer for {} cancelled",
                            queue
                        )));
                    }
                }
            }
            let now = Instant::now();
            if !deliveries.is_empty() || now >= deadline {
                return Ok(deliveries);
            }
            sleep(POLL_STEP.min(deadline - now)).await;
        }
    }

    async fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            if let Err(e) = connection.close(200, "shutdown").await {
                debug!(error = %e, "AMQP close failed");
            }
        }
        self.reset();
    }
}
