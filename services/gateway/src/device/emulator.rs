//! In-memory modem emulator.
//!
//! Implements [`SmsDevice`] over a shared [`ModemStorage`] so tests and bench
//! setups can seed inbound SMS, inject connection faults and observe what the
//! gateway deleted or transmitted.
//!
//! # Faults
//! - `fail_connect`: every connect attempt fails with the given error until
//!   cleared.
//! - `drop_connection_after`: after N more successful reads the connection
//!   breaks with a device I/O error (one-shot).

use super::{DeviceError, RawSmsRecord, SmsDevice, StorageLocation};
use async_trait::async_trait;
use sms_protocol::BrokerMessage;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Folder the emulator stores inbound records in.
pub const INBOX_FOLDER: u32 = 0;

// ---------------------------------------------------------------------------
// ModemStorage
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StorageState {
    records: BTreeMap<StorageLocation, RawSmsRecord>,
    next_location: u32,
    deleted: Vec<StorageLocation>,
    sent: Vec<BrokerMessage>,
    connect_fault: Option<DeviceError>,
    reads_until_drop: Option<usize>,
    connect_attempts: usize,
    // Bumped on every forced disconnect; stale connections see a mismatch.
    generation: u64,
}

/// Shared handle to the emulated SIM storage and fault switches.
#[derive(Clone, Default)]
pub struct ModemStorage {
    inner: Arc<Mutex<StorageState>>,
}

impl ModemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StorageState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a record at the next free inbox location and return it.
    pub fn store(&self, mut record: RawSmsRecord) -> StorageLocation {
        let mut state = self.lock();
        state.next_location += 1;
        let location = StorageLocation {
            folder: INBOX_FOLDER,
            location: state.next_location,
        };
        record.location = location;
        state.records.insert(location, record);
        location
    }

    pub fn stored_count(&self) -> usize {
        self.lock().records.len()
    }

    pub fn contains(&self, location: StorageLocation) -> bool {
        self.lock().records.contains_key(&location)
    }

    /// Locations deleted so far, in deletion order.
    pub fn deleted(&self) -> Vec<StorageLocation> {
        self.lock().deleted.clone()
    }

    /// Outbound messages accepted by the emulated send path.
    pub fn sent(&self) -> Vec<BrokerMessage> {
        self.lock().sent.clone()
    }

    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }

    pub fn fail_connect(&self, fault: Option<DeviceError>) {
        self.lock().connect_fault = fault;
    }

    pub fn drop_connection_after(&self, reads: usize) {
        self.lock().reads_until_drop = Some(reads);
    }
}

// ---------------------------------------------------------------------------
// EmulatedModem
// ---------------------------------------------------------------------------

pub struct EmulatedModem {
    connection: String,
    port: String,
    storage: ModemStorage,
    session: Option<u64>,
}

impl EmulatedModem {
    pub fn new(connection: &str, port: &str, storage: ModemStorage) -> Self {
        Self {
            connection: connection.to_owned(),
            port: port.to_owned(),
            storage,
            session: None,
        }
    }

    /// Lock storage after checking this handle still holds a live connection.
    fn connected_state(&self) -> Result<MutexGuard<'_, StorageState>, DeviceError> {
        let state = self.storage.lock();
        match self.session {
            Some(generation) if generation == state.generation => Ok(state),
            _ => Err(DeviceError::NotConnected),
        }
    }

    fn count_read(state: &mut StorageState) -> Result<(), DeviceError> {
        match state.reads_until_drop {
            Some(0) => {
                state.reads_until_drop = None;
                state.generation += 1;
                Err(DeviceError::DeviceIo("emulated connection drop".to_owned()))
            }
            Some(n) => {
                state.reads_until_drop = Some(n - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SmsDevice for EmulatedModem {
    fn describe(&self) -> String {
        format!("{}:{} (emulated)", self.connection, self.port)
    }

    async fn connect(&mut self) -> Result<(), DeviceError> {
        let mut state = self.storage.lock();
        state.connect_attempts += 1;
        if let Some(fault) = state.connect_fault.clone() {
            return Err(fault);
        }
        self.session = Some(state.generation);
        debug!(port = %self.port, "emulated modem opened");
        Ok(())
    }

    async fn read_first(&mut self) -> Result<RawSmsRecord, DeviceError> {
        let mut state = self.connected_state()?;
        Self::count_read(&mut state)?;
        state
            .records
            .values()
            .next()
            .cloned()
            .ok_or(DeviceError::Empty)
    }

    async fn read_next(&mut self, after: StorageLocation) -> Result<RawSmsRecord, DeviceError> {
        let mut state = self.connected_state()?;
        Self::count_read(&mut state)?;
        state
            .records
            .range((std::ops::Bound::Excluded(after), std::ops::Bound::Unbounded))
            .next()
            .map(|(_, r)| r.clone())
            .ok_or(DeviceError::Empty)
    }

    async fn delete_record(&mut self, location: StorageLocation) -> Result<(), DeviceError> {
        let mut state = self.connected_state()?;
        match state.records.remove(&location) {
            Some(_) => {
                state.deleted.push(location);
                Ok(())
            }
            None => Err(DeviceError::InvalidLocation),
        }
    }

    async fn send_sms(&mut self, message: &BrokerMessage) -> Result<(), DeviceError> {
        let mut state = self.connected_state()?;
        state.sent.push(message.clone());
        Ok(())
    }
}
