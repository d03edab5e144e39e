//! Lifecycle controller.
//!
//! [`Gateway::start`] spawns the device pipeline task, which in turn spawns
//! the broker pipeline as its child.  Both watch the same kill signal and
//! stop independently; once the device pipeline has returned, the parent
//! clears the Active flag and joins the broker pipeline.  The broker side
//! releases in-flight work without relying on the flag's value at that
//! point.

use crate::broker::BrokerClient;
use crate::broker::pipeline::{BrokerPipeline, BrokerTiming};
use crate::device::SmsDevice;
use crate::device::pipeline::{DevicePipeline, DeviceTiming};
use crate::mailbox::Links;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub struct Gateway {
    name: String,
    device: Box<dyn SmsDevice>,
    broker: Box<dyn BrokerClient>,
    device_timing: DeviceTiming,
    broker_timing: BrokerTiming,
}

impl Gateway {
    pub fn new(name: &str, device: Box<dyn SmsDevice>, broker: Box<dyn BrokerClient>) -> Self {
        Self {
            name: name.to_owned(),
            device,
            broker,
            device_timing: DeviceTiming::default(),
            broker_timing: BrokerTiming::default(),
        }
    }

    pub fn with_timing(mut self, device: DeviceTiming, broker: BrokerTiming) -> Self {
        self.device_timing = device;
        self.broker_timing = broker;
        self
    }

    /// Spawn both pipelines.  Must be called inside a tokio runtime.
    pub fn start(self) -> GatewayHandle {
        let links = Links::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let device = DevicePipeline::new(
            &self.name,
            self.device,
            links.clone(),
            shutdown_rx.clone(),
            self.device_timing,
        );
        let broker = BrokerPipeline::new(
            &self.name,
            self.broker,
            links.clone(),
            shutdown_rx,
            self.broker_timing,
        );

        let active = links.active.clone();
        let name = self.name;
        let task = tokio::spawn(async move {
            let broker_task = tokio::spawn(broker.run());
            device.run().await;
            active.set(false);
            if let Err(e) = broker_task.await {
                error!(error = %e, "broker pipeline task failed");
            }
            info!(name = %name, "gateway stopped");
        });

        GatewayHandle {
            links,
            shutdown_tx,
            task,
        }
    }
}

/// Control handle for a running gateway.
pub struct GatewayHandle {
    links: Links,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl GatewayHandle {
    /// Shared mailboxes and flags, for observation.
    pub fn links(&self) -> &Links {
        &self.links
    }

    pub fn pause(&self) {
        info!("gateway paused");
        self.links.active.set(false);
    }

    pub fn resume(&self) {
        info!("gateway resumed");
        self.links.active.set(true);
    }

    pub fn is_active(&self) -> bool {
        self.links.active.is_active()
    }

    /// Request shutdown and wait for both pipelines to stop.
    pub async fn shutdown(self) {
        self.shutdown_tx.send(true).ok();
        if let Err(e) = self.task.await {
            error!(error = %e, "gateway task failed");
        }
    }
}
