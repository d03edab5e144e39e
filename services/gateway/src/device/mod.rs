//! Device driver interface.
//!
//! A driver exposes the modem's SMS storage as a cursor: `read_first`, then
//! `read_next(after)` until an end-of-data error.  Records are deleted one
//! location at a time, and deletion of an absent record is benign.
//!
//! # Error classes
//! - connect-time configuration: device missing, open failure, no SIM,
//!   permission denied.  Warned and retried with the reconnect backoff.
//! - connection-lost: not connected, device I/O, timeout, unknown.  The
//!   pipeline drops to Disconnected and reconnects.
//! - end-of-data: invalid location, empty, unsupported.  Ends a read cursor.

pub mod emulator;
pub mod pipeline;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use sms_protocol::BrokerMessage;

// ---------------------------------------------------------------------------
// Record types
// ---------------------------------------------------------------------------

/// Where a record lives in modem storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageLocation {
    pub folder: u32,
    pub location: u32,
}

impl std::fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.folder, self.location)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Deliver,
    StatusReport,
}

/// Concatenation metadata from the user-data header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartInfo {
    /// 8- or 16-bit concatenation reference; `None` when the header carried
    /// neither.
    pub reference: Option<u16>,
    pub part_number: u8,
    pub total_parts: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserDataHeader {
    None,
    Concatenated(PartInfo),
    /// Any other header type (port addressing, WAP push, ...).
    Other,
}

/// One stored SMS as returned by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSmsRecord {
    pub location: StorageLocation,
    pub kind: RecordKind,
    pub text: String,
    pub identity: String,
    pub received_at: DateTime<FixedOffset>,
    pub smsc_at: DateTime<FixedOffset>,
    pub udh: UserDataHeader,
}

impl RawSmsRecord {
    /// A single-part deliver record with no user-data header.
    ///
    /// The storage location is assigned when the record is stored.
    pub fn single(identity: &str, text: &str, received_at: DateTime<FixedOffset>) -> Self {
        RawSmsRecord {
            location: StorageLocation {
                folder: 0,
                location: 0,
            },
            kind: RecordKind::Deliver,
            text: text.to_owned(),
            identity: identity.to_owned(),
            received_at,
            smsc_at: received_at,
            udh: UserDataHeader::None,
        }
    }

    /// One segment of a concatenated deliver record.
    pub fn part(
        identity: &str,
        text: &str,
        received_at: DateTime<FixedOffset>,
        reference: u16,
        part_number: u8,
        total_parts: u8,
    ) -> Self {
        RawSmsRecord {
            udh: UserDataHeader::Concatenated(PartInfo {
                reference: Some(reference),
                part_number,
                total_parts,
            }),
            ..RawSmsRecord::single(identity, text, received_at)
        }
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("device {0} does not exist")]
    DeviceMissing(String),
    #[error("failed to open device: {0}")]
    OpenFailed(String),
    #[error("no SIM card in modem")]
    NoSim,
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("device not connected")]
    NotConnected,
    #[error("device I/O error: {0}")]
    DeviceIo(String),
    #[error("timeout waiting for device")]
    Timeout,
    #[error("unknown device error: {0}")]
    Unknown(String),
    #[error("invalid storage location")]
    InvalidLocation,
    #[error("storage empty")]
    Empty,
    #[error("operation not supported by device")]
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    ConnectConfig,
    ConnectionLost,
    EndOfData,
}

impl DeviceError {
    pub fn class(&self) -> ErrorClass {
        match self {
            DeviceError::DeviceMissing(_)
            | DeviceError::OpenFailed(_)
            | DeviceError::NoSim
            | DeviceError::PermissionDenied(_) => ErrorClass::ConnectConfig,
            DeviceError::NotConnected
            | DeviceError::DeviceIo(_)
            | DeviceError::Timeout
            | DeviceError::Unknown(_) => ErrorClass::ConnectionLost,
            DeviceError::InvalidLocation | DeviceError::Empty | DeviceError::Unsupported => {
                ErrorClass::EndOfData
            }
        }
    }

    pub fn is_end_of_data(&self) -> bool {
        self.class() == ErrorClass::EndOfData
    }
}

// ---------------------------------------------------------------------------
// Driver trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait SmsDevice: Send {
    /// Human-readable device description for logs, e.g. `at:/dev/ttyUSB0`.
    fn describe(&self) -> String;

    /// Open (or re-open) the device.
    async fn connect(&mut self) -> Result<(), DeviceError>;

    async fn read_first(&mut self) -> Result<RawSmsRecord, DeviceError>;

    async fn read_next(&mut self, after: StorageLocation) -> Result<RawSmsRecord, DeviceError>;

    /// Delete one stored record.  Deleting an absent record must be an
    /// end-of-data error or `Ok`.
    async fn delete_record(&mut self, location: StorageLocation) -> Result<(), DeviceError>;

    /// Transmit an outbound SMS.  Drivers without a send path keep the
    /// default; the pipeline then logs the message and discards it.
    async fn send_sms(&mut self, _message: &BrokerMessage) -> Result<(), DeviceError> {
        Err(DeviceError::Unsupported)
    }
}

/// Read every stored record, first to last.
///
/// End-of-data errors terminate the cursor.  Any other error aborts the whole
/// read so that a half-finished poll never reaches the reassembly cache.
pub async fn read_all<D: SmsDevice + ?Sized>(
    device: &mut D,
) -> Result<Vec<RawSmsRecord>, DeviceError> {
    let mut records = Vec::new();
    let mut last = match device.read_first().await {
        Ok(record) => record,
        Err(e) if e.is_end_of_data() => return Ok(records),
        Err(e) => return Err(e),
    };
    loop {
        let after = last.location;
        records.push(last);
        last = match device.read_next(after).await {
            Ok(record) => record,
            Err(e) if e.is_end_of_data() => return Ok(records),
            Err(e) => return Err(e),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classes_follow_driver_taxonomy() {
        assert_eq!(DeviceError::NoSim.class(), ErrorClass::ConnectConfig);
        assert_eq!(
            DeviceError::DeviceMissing("/dev/ttyUSB0".into()).class(),
            ErrorClass::ConnectConfig
        );
        assert_eq!(DeviceError::Timeout.class(), ErrorClass::ConnectionLost);
        assert_eq!(
            DeviceError::DeviceIo("write".into()).class(),
            ErrorClass::ConnectionLost
        );
        assert!(DeviceError::Empty.is_end_of_data());
        assert!(DeviceError::InvalidLocation.is_end_of_data());
        assert!(DeviceError::Unsupported.is_end_of_data());
        assert!(!DeviceError::NotConnected.is_end_of_data());
    }

    #[test]
    fn storage_locations_order_by_folder_then_location() {
        let a = StorageLocation {
            folder: 0,
            location: 9,
        };
        let b = StorageLocation {
            folder: 1,
            location: 1,
        };
        assert!(a < b);
        assert_eq!(b.to_string(), "1/1");
    }
}
