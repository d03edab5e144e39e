//! Engine selection: one device engine and one broker engine, chosen by
//! configuration at startup.

use crate::broker::BrokerClient;
use crate::broker::memory::MemoryBroker;
use crate::config::{BrokerConfig, BrokerEngine, ConfigError, DeviceConfig, DeviceEngine};
use crate::device::SmsDevice;
use crate::device::emulator::{EmulatedModem, ModemStorage};
use tracing::info;

pub fn build_device(cfg: &DeviceConfig) -> Result<Box<dyn SmsDevice>, ConfigError> {
    match cfg.engine {
        DeviceEngine::Emulator => {
            info!(port = %cfg.port, "using emulated modem; storage starts empty");
            Ok(Box::new(EmulatedModem::new(
                &cfg.connection,
                &cfg.port,
                ModemStorage::new(),
            )))
        }
    }
}

pub fn build_broker(cfg: &BrokerConfig) -> Result<Box<dyn BrokerClient>, ConfigError> {
    match cfg.engine {
        BrokerEngine::Memory => {
            info!("using in-process memory broker");
            Ok(Box::new(MemoryBroker::new().client()))
        }
        BrokerEngine::Amqp => build_amqp(cfg),
    }
}

#[cfg(feature = "amqp")]
fn build_amqp(cfg: &BrokerConfig) -> Result<Box<dyn BrokerClient>, ConfigError> {
    Ok(Box::new(crate::broker::amqp::AmqpBroker::new(
        cfg.amqp_uri(),
        cfg.endpoint(),
    )))
}

#[cfg(not(feature = "amqp"))]
fn build_amqp(_cfg: &BrokerConfig) -> Result<Box<dyn BrokerClient>, ConfigError> {
    Err(ConfigError::InvalidValue(
        "broker.engine 'amqp' requires building with the 'amqp' feature".to_owned(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_from_str;

    #[test]
    fn memory_and_emulator_engines_build() {
        let cfg = load_config_from_str(
            "schema_version = 1\nname = \"m1\"\n[broker]\nengine = \"memory\"\n",
        )
        .unwrap();
        let device = build_device(&cfg.device).unwrap();
        assert!(device.describe().contains("/dev/ttyUSB0"));
        let broker = build_broker(&cfg.broker).unwrap();
        assert!(broker.describe().starts_with("memory broker"));
    }

    #[cfg(not(feature = "amqp"))]
    #[test]
    fn amqp_engine_needs_feature() {
        let cfg = load_config_from_str("schema_version = 1\nname = \"m1\"\n").unwrap();
        let err = build_broker(&cfg.broker).err().unwrap();
        assert!(err.to_string().contains("'amqp' feature"));
    }
}
