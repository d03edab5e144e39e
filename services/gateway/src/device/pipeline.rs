//! Device-side pipeline.
//!
//! Owns the modem connection.  Each iteration:
//! 1. connect if disconnected (warn + backoff on failure)
//! 2. drain the command mailbox
//! 3. hand the next complete SMS to the incoming mailbox, first evicting the
//!    previous one from modem storage once the mailbox is seen empty again
//! 4. when paused: drop outbound work, withdraw the unpublished hand-off, idle
//! 5. otherwise: run the send hook, poll modem storage, feed the cache
//!
//! A message leaves modem storage only after the broker side has taken it out
//! of the incoming mailbox.  That emptiness is the only acknowledgement the
//! device side ever sees.

use super::{DeviceError, ErrorClass, SmsDevice, read_all};
use crate::mailbox::Links;
use crate::pacing::{Pace, sleep_or_shutdown};
use crate::reassembly::{Fingerprint, IngestOutcome, ReassemblyCache};
use tokio::sync::watch;
use tokio::time::Duration;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceTiming {
    pub reconnect: Duration,
    pub poll: Duration,
    pub idle: Duration,
}

impl Default for DeviceTiming {
    fn default() -> Self {
        Self {
            reconnect: Duration::from_secs(3),
            poll: Duration::from_secs(1),
            idle: Duration::from_millis(100),
        }
    }
}

pub struct DevicePipeline {
    name: String,
    device: Box<dyn SmsDevice>,
    cache: ReassemblyCache,
    links: Links,
    shutdown_rx: watch::Receiver<bool>,
    timing: DeviceTiming,
    connected: bool,
    handed_off: Option<Fingerprint>,
}

impl DevicePipeline {
    pub fn new(
        name: &str,
        device: Box<dyn SmsDevice>,
        links: Links,
        shutdown_rx: watch::Receiver<bool>,
        timing: DeviceTiming,
    ) -> Self {
        Self {
            name: name.to_owned(),
            device,
            cache: ReassemblyCache::new(),
            links,
            shutdown_rx,
            timing,
            connected: false,
            handed_off: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn cache(&self) -> &ReassemblyCache {
        &self.cache
    }

    /// Fingerprint of the message currently handed to the broker side.
    pub fn handed_off(&self) -> Option<&Fingerprint> {
        self.handed_off.as_ref()
    }

    /// Run until shutdown.
    pub async fn run(mut self) {
        info!(name = %self.name, device = %self.device.describe(), "device pipeline starting");
        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }
            let delay = match self.run_once().await {
                Pace::Immediately => Duration::ZERO,
                Pace::Backoff => self.timing.reconnect,
                Pace::Idle => self.timing.idle,
                Pace::Poll => self.timing.poll,
            };
            if sleep_or_shutdown(&mut self.shutdown_rx, delay).await {
                break;
            }
        }
        info!(name = %self.name, "device pipeline stopped");
    }

    /// One loop iteration.
    pub async fn run_once(&mut self) -> Pace {
        if !self.connected && !self.connect().await {
            return Pace::Backoff;
        }

        self.drain_commands();

        if let Err(e) = self.hand_off().await {
            self.lose_connection(&e);
            return Pace::Immediately;
        }

        if !self.links.active.is_active() {
            self.pause();
            return Pace::Idle;
        }

        if let Err(e) = self.send_outgoing().await {
            self.lose_connection(&e);
            return Pace::Immediately;
        }

        match read_all(self.device.as_mut()).await {
            Ok(records) => {
                trace!(count = records.len(), "device storage polled");
                for record in records {
                    let location = record.location;
                    match self.cache.ingest(record) {
                        IngestOutcome::Inserted(fp) => {
                            debug!(location = %location, fingerprint = %fp, "new SMS cached")
                        }
                        IngestOutcome::PartAdded(fp) => {
                            debug!(location = %location, fingerprint = %fp, "SMS part cached")
                        }
                        IngestOutcome::Duplicate(_) => {}
                        IngestOutcome::Ignored(reason) => {
                            trace!(location = %location, reason, "record ignored")
                        }
                    }
                }
            }
            Err(e) => {
                self.lose_connection(&e);
                return Pace::Immediately;
            }
        }

        Pace::Poll
    }

    async fn connect(&mut self) -> bool {
        match self.device.connect().await {
            Ok(()) => {
                info!(device = %self.device.describe(), "device connected");
                self.connected = true;
                true
            }
            Err(e) => {
                let retry_in = self.timing.reconnect.as_secs_f32();
                match e.class() {
                    ErrorClass::ConnectConfig => warn!(
                        device = %self.device.describe(),
                        error = %e,
                        retry_in,
                        "device unavailable"
                    ),
                    ErrorClass::ConnectionLost | ErrorClass::EndOfData => warn!(
                        device = %self.device.describe(),
                        error = %e,
                        retry_in,
                        "device connect failed"
                    ),
                }
                false
            }
        }
    }

    fn lose_connection(&mut self, error: &DeviceError) {
        warn!(device = %self.device.describe(), error = %error, "device connection lost");
        self.connected = false;
    }

    // Hook: commands and requests have no device-side handler yet.
    fn drain_commands(&mut self) {
        if let Some(command) = self.links.command.take() {
            info!(kind = %command.kind, "command received; no handler, discarded");
        }
    }

    /// Evict the previous hand-off once drained, then queue the next message.
    async fn hand_off(&mut self) -> Result<(), DeviceError> {
        if self.links.incoming.is_occupied() {
            return Ok(());
        }
        if let Some(fp) = self.handed_off.clone() {
            self.cache.evict(&fp, self.device.as_mut()).await?;
            debug!(fingerprint = %fp, "handed-off SMS evicted");
            self.handed_off = None;
        }
        let Some(message) = self.cache.next_ready() else {
            return Ok(());
        };
        let fingerprint = message.fingerprint().clone();
        let envelope = message.envelope();
        let identity = envelope.identity.clone();
        if self.links.incoming.try_put(envelope).is_ok() {
            self.cache.mark_handed_off(&fingerprint);
            info!(fingerprint = %fingerprint, identity = %identity, "SMS handed to broker side");
            self.handed_off = Some(fingerprint);
        }
        Ok(())
    }

    /// Paused: nothing is sent and nothing new is forwarded.
    fn pause(&mut self) {
        if let Some(message) = self.links.outgoing.take() {
            debug!(kind = %message.kind, "paused; outbound message dropped");
        }
        // If the broker side already took the envelope, keep the fingerprint
        // so the next hand-off step evicts it.
        if let Some(fp) = &self.handed_off {
            if self.links.incoming.take().is_some() {
                self.cache.release(fp);
                debug!(fingerprint = %fp, "paused; hand-off withdrawn");
                self.handed_off = None;
            }
        }
    }

    /// Outbound hook: give the queued message to the driver.
    ///
    /// The mailbox is emptied once the driver has answered, whether or not it
    /// can transmit.  On a connection error the item stays queued for the
    /// next connection.
    async fn send_outgoing(&mut self) -> Result<(), DeviceError> {
        let Some(message) = self.links.outgoing.peek() else {
            return Ok(());
        };
        match self.device.send_sms(&message).await {
            Ok(()) => {
                self.links.outgoing.take_if_eq(&message);
                info!(identity = ?message.identity(), "outbound SMS handed to device");
                Ok(())
            }
            Err(e) if e.class() == ErrorClass::ConnectionLost => Err(e),
            Err(e) => {
                self.links.outgoing.take_if_eq(&message);
                info!(identity = ?message.identity(), error = %e, "outbound SMS not sent; discarded");
                Ok(())
            }
        }
    }
}
