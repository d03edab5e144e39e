//! In-process topic broker.
//!
//! [`MemoryBroker`] is the shared broker state (exchanges, bindings, queues,
//! unsettled deliveries and settlement accounting).  Each
//! [`MemoryBrokerClient`] is one connection to it and implements
//! [`BrokerClient`].
//!
//! Routing follows AMQP topic rules: `*` matches one dot-separated word, `#`
//! matches zero or more.  Taking the broker offline drops every connection
//! and returns unsettled deliveries to the front of their queues.

use super::{BrokerClient, BrokerError, Delivery, DeliveryTag, Settlement};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::{Duration, sleep};
use tracing::debug;

/// One message accepted by an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
struct Binding {
    exchange: String,
    pattern: String,
    queue: String,
}

#[derive(Debug)]
struct Unsettled {
    owner: u64,
    queue: String,
    payload: Vec<u8>,
}

struct BrokerState {
    online: bool,
    // Bumped whenever the broker goes offline; older sessions are dead.
    generation: u64,
    exchanges: HashSet<String>,
    bindings: Vec<Binding>,
    queues: HashMap<String, VecDeque<Vec<u8>>>,
    unsettled: HashMap<DeliveryTag, Unsettled>,
    next_tag: u64,
    next_client: u64,
    published: Vec<Published>,
    acked: Vec<Vec<u8>>,
    rejected: Vec<Vec<u8>>,
    requeued: usize,
    connects: usize,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            online: true,
            generation: 0,
            exchanges: HashSet::new(),
            bindings: Vec::new(),
            queues: HashMap::new(),
            unsettled: HashMap::new(),
            next_tag: 0,
            next_client: 0,
            published: Vec::new(),
            acked: Vec::new(),
            rejected: Vec::new(),
            requeued: 0,
            connects: 0,
        }
    }
}

impl BrokerState {
    fn route(&mut self, exchange: &str, routing_key: &str, payload: &[u8]) {
        let targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && topic_matches(&b.pattern, routing_key))
            .map(|b| b.queue.clone())
            .collect();
        for queue in targets {
            self.queues
                .entry(queue)
                .or_default()
                .push_back(payload.to_vec());
        }
        self.published.push(Published {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            payload: payload.to_vec(),
        });
    }

    /// Put unsettled deliveries matching `owned` back at the head of their
    /// queues, oldest delivery first.
    fn return_unsettled(&mut self, owned: impl Fn(&Unsettled) -> bool) {
        let mut tags: Vec<DeliveryTag> = self
            .unsettled
            .iter()
            .filter(|(_, u)| owned(u))
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_by_key(|t| std::cmp::Reverse(t.0));
        for tag in tags {
            if let Some(u) = self.unsettled.remove(&tag) {
                self.queues.entry(u.queue).or_default().push_front(u.payload);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryBroker
// ---------------------------------------------------------------------------

/// Shared handle to the in-process broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a new (not yet connected) client on this broker.
    pub fn client(&self) -> MemoryBrokerClient {
        let id = {
            let mut state = self.lock();
            state.next_client += 1;
            state.next_client
        };
        MemoryBrokerClient {
            broker: self.clone(),
            id,
            session: None,
            consuming: BTreeSet::new(),
        }
    }

    /// Append `payload` directly to `queue`, creating the queue if needed.
    pub fn enqueue(&self, queue: &str, payload: &[u8]) {
        self.lock()
            .queues
            .entry(queue.to_owned())
            .or_default()
            .push_back(payload.to_vec());
    }

    /// Publish as an external producer would.
    pub fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) {
        self.lock().route(exchange, routing_key, payload);
    }

    /// Every message published so far, by any producer.
    pub fn published(&self) -> Vec<Published> {
        self.lock().published.clone()
    }

    /// Published messages whose routing key equals `routing_key`.
    pub fn published_to(&self, routing_key: &str) -> Vec<Published> {
        self.lock()
            .published
            .iter()
            .filter(|p| p.routing_key == routing_key)
            .cloned()
            .collect()
    }

    pub fn acked(&self) -> Vec<Vec<u8>> {
        self.lock().acked.clone()
    }

    pub fn rejected(&self) -> Vec<Vec<u8>> {
        self.lock().rejected.clone()
    }

    pub fn requeue_count(&self) -> usize {
        self.lock().requeued
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.lock().exchanges.contains(exchange)
    }

    pub fn unsettled_count(&self) -> usize {
        self.lock().unsettled.len()
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    /// Going offline drops every live connection.
    pub fn set_online(&self, online: bool) {
        let mut state = self.lock();
        if state.online && !online {
            state.generation += 1;
            state.return_unsettled(|_| true);
            debug!("memory broker offline");
        }
        state.online = online;
    }
}

// ---------------------------------------------------------------------------
// MemoryBrokerClient
// ---------------------------------------------------------------------------

pub struct MemoryBrokerClient {
    broker: MemoryBroker,
    id: u64,
    session: Option<u64>,
    consuming: BTreeSet<String>,
}

impl MemoryBrokerClient {
    /// Lock broker state after checking this client's session is still live.
    fn live_state(&self) -> Result<MutexGuard<'_, BrokerState>, BrokerError> {
        let state = self.broker.lock();
        match self.session {
            None => Err(BrokerError::NotConnected),
            Some(g) if state.online && g == state.generation => Ok(state),
            Some(_) => Err(BrokerError::ConnectionLost("memory broker went away".to_owned())),
        }
    }

    /// Take at most one message from each consumed queue.
    fn collect(&self) -> Result<Vec<Delivery>, BrokerError> {
        let mut state = self.live_state()?;
        let mut deliveries = Vec::new();
        for queue in &self.consuming {
            let Some(payload) = state.queues.get_mut(queue).and_then(VecDeque::pop_front) else {
                continue;
            };
            state.next_tag += 1;
            let tag = DeliveryTag(state.next_tag);
            state.unsettled.insert(
                tag,
                Unsettled {
                    owner: self.id,
                    queue: queue.clone(),
                    payload: payload.clone(),
                },
            );
            deliveries.push(Delivery {
                tag,
                queue: queue.clone(),
                payload,
            });
        }
        Ok(deliveries)
    }
}

#[async_trait]
impl BrokerClient for MemoryBrokerClient {
    fn describe(&self) -> String {
        format!("memory broker (client {})", self.id)
    }

    async fn connect(&mut self) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        state.connects += 1;
        if !state.online {
            return Err(BrokerError::Connect("memory broker offline".to_owned()));
        }
        let id = self.id;
        state.return_unsettled(|u| u.owner == id);
        self.session = Some(state.generation);
        self.consuming.clear();
        Ok(())
    }

    async fn declare_exchange(&mut self, exchange: &str) -> Result<(), BrokerError> {
        self.live_state()?.exchanges.insert(exchange.to_owned());
        Ok(())
    }

    async fn declare_queue(
        &mut self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.live_state()?;
        if !state.exchanges.contains(exchange) {
            return Err(BrokerError::Channel(format!("no exchange '{}'", exchange)));
        }
        state.queues.entry(queue.to_owned()).or_default();
        let bound = state
            .bindings
            .iter()
            .any(|b| b.exchange == exchange && b.pattern == routing_key && b.queue == queue);
        if !bound {
            state.bindings.push(Binding {
                exchange: exchange.to_owned(),
                pattern: routing_key.to_owned(),
                queue: queue.to_owned(),
            });
        }
        Ok(())
    }

    async fn start_consuming(&mut self, queue: &str) -> Result<(), BrokerError> {
        let state = self.live_state()?;
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::Channel(format!("no queue '{}'", queue)));
        }
        drop(state);
        self.consuming.insert(queue.to_owned());
        Ok(())
    }

    async fn stop_consuming(&mut self, queue: &str) -> Result<(), BrokerError> {
        drop(self.live_state()?);
        self.consuming.remove(queue);
        Ok(())
    }

    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError> {
        let mut state = self.live_state()?;
        if !state.exchanges.contains(exchange) {
            return Err(BrokerError::Channel(format!("no exchange '{}'", exchange)));
        }
        state.route(exchange, routing_key, payload);
        Ok(())
    }

    async fn settle(
        &mut self,
        tag: DeliveryTag,
        settlement: Settlement,
    ) -> Result<(), BrokerError> {
        let mut state = self.live_state()?;
        let Some(delivery) = state.unsettled.remove(&tag) else {
            return Err(BrokerError::UnknownDelivery(tag));
        };
        match settlement {
            Settlement::Ack => state.acked.push(delivery.payload),
            Settlement::Reject => state.rejected.push(delivery.payload),
            Settlement::Requeue => {
                state.requeued += 1;
                state
                    .queues
                    .entry(delivery.queue)
                    .or_default()
                    .push_front(delivery.payload);
            }
        }
        Ok(())
    }

    async fn pump(&mut self, timeout: Duration) -> Result<Vec<Delivery>, BrokerError> {
        let deliveries = self.collect()?;
        if !deliveries.is_empty() {
            return Ok(deliveries);
        }
        sleep(timeout).await;
        self.collect()
    }

    async fn close(&mut self) {
        let mut state = self.broker.lock();
        if self.session == Some(state.generation) {
            let id = self.id;
            state.return_unsettled(|u| u.owner == id);
        }
        self.session = None;
        self.consuming.clear();
    }
}

/// AMQP topic match of `routing_key` against binding `pattern`.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&k, key_rest)) if word == "*" || word == k => match_words(rest, key_rest),
            _ => false,
        },
    }
}
