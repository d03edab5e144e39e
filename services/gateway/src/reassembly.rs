//! Reassembly and deduplication of raw SMS records.
//!
//! Every poll re-reads the whole modem storage, so the same record is seen
//! many times.  The cache keys logical messages by fingerprint:
//! - single-part: hash of (identity, received timestamp, text)
//! - concatenated: hash of (reference, identity)
//!
//! A repeated single or an already-seen part number is dropped.  Entries are
//! kept in insertion order so hand-off order is reproducible.
//!
//! A concatenated message whose missing parts never arrive stays cached
//! forever; there is no expiry.

use crate::device::{
    DeviceError, PartInfo, RawSmsRecord, RecordKind, SmsDevice, StorageLocation, UserDataHeader,
};
use sha2::{Digest, Sha256};
use sms_protocol::{Envelope, MessageType};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Fingerprint
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn single(record: &RawSmsRecord) -> Self {
        Self::digest(
            "single",
            &[
                record.identity.as_str(),
                record.received_at.to_rfc3339().as_str(),
                record.text.as_str(),
            ],
        )
    }

    pub fn multipart(reference: u16, identity: &str) -> Self {
        Self::digest("multipart", &[reference.to_string().as_str(), identity])
    }

    /// SHA-256 over length-prefixed fields, first 16 hex chars.
    fn digest(scope: &str, fields: &[&str]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(scope.as_bytes());
        for field in fields {
            hasher.update((field.len() as u64).to_be_bytes());
            hasher.update(field.as_bytes());
        }
        let hex = format!("{:x}", hasher.finalize());
        Fingerprint(hex[..16].to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// LogicalMessage
// ---------------------------------------------------------------------------

/// Constituent parts of a concatenated message, unique by part number.
#[derive(Debug, Clone, Default)]
pub struct PartSet {
    total: u8,
    parts: BTreeMap<u8, RawSmsRecord>,
    latest: u8,
}

impl PartSet {
    fn new(info: PartInfo, record: RawSmsRecord) -> Self {
        let mut parts = BTreeMap::new();
        parts.insert(info.part_number, record);
        PartSet {
            total: info.total_parts,
            parts,
            latest: info.part_number,
        }
    }

    fn is_full(&self) -> bool {
        self.parts.len() == usize::from(self.total)
    }

    pub fn expected(&self) -> u8 {
        self.total
    }

    /// Part texts joined in ascending part-number order.
    pub fn text(&self) -> String {
        self.parts.values().map(|r| r.text.as_str()).collect()
    }
}

#[derive(Debug, Clone)]
pub enum Assembly {
    Single(RawSmsRecord),
    MultipartInProgress(PartSet),
    MultipartComplete(PartSet),
}

#[derive(Debug, Clone)]
pub struct LogicalMessage {
    fingerprint: Fingerprint,
    assembly: Assembly,
    handed_off: bool,
}

impl LogicalMessage {
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn assembly(&self) -> &Assembly {
        &self.assembly
    }

    pub fn is_complete(&self) -> bool {
        match &self.assembly {
            Assembly::Single(_) | Assembly::MultipartComplete(_) => true,
            Assembly::MultipartInProgress(_) => false,
        }
    }

    pub fn expected_parts(&self) -> u32 {
        match &self.assembly {
            Assembly::Single(_) => 1,
            Assembly::MultipartInProgress(set) | Assembly::MultipartComplete(set) => {
                u32::from(set.expected())
            }
        }
    }

    pub fn text(&self) -> String {
        match &self.assembly {
            Assembly::Single(record) => record.text.clone(),
            Assembly::MultipartInProgress(set) | Assembly::MultipartComplete(set) => set.text(),
        }
    }

    pub fn locations(&self) -> Vec<StorageLocation> {
        match &self.assembly {
            Assembly::Single(record) => vec![record.location],
            Assembly::MultipartInProgress(set) | Assembly::MultipartComplete(set) => {
                set.parts.values().map(|r| r.location).collect()
            }
        }
    }

    /// Broker envelope.  Concatenated messages take identity and timestamps
    /// from the most recently received part.
    pub fn envelope(&self) -> Envelope {
        let header = match &self.assembly {
            Assembly::Single(record) => record,
            Assembly::MultipartInProgress(set) | Assembly::MultipartComplete(set) => {
                &set.parts[&set.latest]
            }
        };
        Envelope {
            kind: MessageType::Message,
            text: self.text(),
            parts: self.expected_parts(),
            identity: header.identity.clone(),
            received_timestamp: header.received_at.to_rfc3339(),
            smsc_timestamp: header.smsc_at.to_rfc3339(),
        }
    }
}

// ---------------------------------------------------------------------------
// ReassemblyCache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// New logical message created.
    Inserted(Fingerprint),
    /// New part added to an existing concatenated message.
    PartAdded(Fingerprint),
    /// Already seen; nothing changed.
    Duplicate(Fingerprint),
    /// Not an SMS the gateway forwards.
    Ignored(&'static str),
}

#[derive(Debug, Default)]
pub struct ReassemblyCache {
    entries: HashMap<Fingerprint, LogicalMessage>,
    order: Vec<Fingerprint>,
}

impl ReassemblyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<&LogicalMessage> {
        self.entries.get(fingerprint)
    }

    pub fn ingest(&mut self, record: RawSmsRecord) -> IngestOutcome {
        if record.kind == RecordKind::StatusReport {
            return IngestOutcome::Ignored("status report");
        }
        match record.udh {
            UserDataHeader::None => self.ingest_single(record),
            UserDataHeader::Concatenated(info) => self.ingest_part(info, record),
            UserDataHeader::Other => IngestOutcome::Ignored("unsupported user data header"),
        }
    }

    fn ingest_single(&mut self, record: RawSmsRecord) -> IngestOutcome {
        let fingerprint = Fingerprint::single(&record);
        if self.entries.contains_key(&fingerprint) {
            return IngestOutcome::Duplicate(fingerprint);
        }
        self.insert(LogicalMessage {
            fingerprint: fingerprint.clone(),
            assembly: Assembly::Single(record),
            handed_off: false,
        });
        IngestOutcome::Inserted(fingerprint)
    }

    fn ingest_part(&mut self, info: PartInfo, record: RawSmsRecord) -> IngestOutcome {
        let Some(reference) = info.reference else {
            warn!(identity = %record.identity, "concatenated part without reference ignored");
            return IngestOutcome::Ignored("concatenated part without reference");
        };
        if info.total_parts == 0 || info.part_number == 0 || info.part_number > info.total_parts {
            warn!(
                identity = %record.identity,
                part = info.part_number,
                total = info.total_parts,
                "concatenated part with impossible numbering ignored"
            );
            return IngestOutcome::Ignored("part number out of range");
        }

        let fingerprint = Fingerprint::multipart(reference, &record.identity);
        let Some(existing) = self.entries.get_mut(&fingerprint) else {
            let set = PartSet::new(info, record);
            let assembly = if set.is_full() {
                Assembly::MultipartComplete(set)
            } else {
                Assembly::MultipartInProgress(set)
            };
            self.insert(LogicalMessage {
                fingerprint: fingerprint.clone(),
                assembly,
                handed_off: false,
            });
            return IngestOutcome::Inserted(fingerprint);
        };

        let Assembly::MultipartInProgress(set) = &mut existing.assembly else {
            return IngestOutcome::Duplicate(fingerprint);
        };
        if set.parts.contains_key(&info.part_number) {
            return IngestOutcome::Duplicate(fingerprint);
        }
        set.parts.insert(info.part_number, record);
        set.latest = info.part_number;
        if set.is_full() {
            let set = std::mem::take(set);
            existing.assembly = Assembly::MultipartComplete(set);
            debug!(fingerprint = %fingerprint, "concatenated message complete");
        }
        IngestOutcome::PartAdded(fingerprint)
    }

    fn insert(&mut self, message: LogicalMessage) {
        self.order.push(message.fingerprint.clone());
        self.entries.insert(message.fingerprint.clone(), message);
    }

    /// Completed messages in insertion order.
    pub fn complete(&self) -> Vec<&LogicalMessage> {
        self.order
            .iter()
            .filter_map(|fp| self.entries.get(fp))
            .filter(|m| m.is_complete())
            .collect()
    }

    /// The oldest completed message not yet handed off.
    pub fn next_ready(&self) -> Option<&LogicalMessage> {
        self.order
            .iter()
            .filter_map(|fp| self.entries.get(fp))
            .find(|m| m.is_complete() && !m.handed_off)
    }

    pub fn mark_handed_off(&mut self, fingerprint: &Fingerprint) {
        if let Some(message) = self.entries.get_mut(fingerprint) {
            message.handed_off = true;
        }
    }

    /// Undo a hand-off whose envelope was withdrawn before publishing.
    pub fn release(&mut self, fingerprint: &Fingerprint) {
        if let Some(message) = self.entries.get_mut(fingerprint) {
            message.handed_off = false;
        }
    }

    /// Delete every constituent record from the device, then drop the entry.
    ///
    /// Returns `Ok(false)` when no entry exists.  A failed deletion keeps the
    /// entry so the eviction can be retried after reconnecting; records
    /// already deleted read back as end-of-data and are skipped.
    pub async fn evict<D: SmsDevice + ?Sized>(
        &mut self,
        fingerprint: &Fingerprint,
        device: &mut D,
    ) -> Result<bool, DeviceError> {
        let Some(message) = self.entries.get(fingerprint) else {
            return Ok(false);
        };
        for location in message.locations() {
            match device.delete_record(location).await {
                Ok(()) => debug!(location = %location, "deleted SMS from device storage"),
                Err(e) if e.is_end_of_data() => {}
                Err(e) => return Err(e),
            }
        }
        self.entries.remove(fingerprint);
        self.order.retain(|fp| fp != fingerprint);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, FixedOffset};

    fn at(s: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(s).unwrap()
    }

    #[test]
    fn fingerprints_are_deterministic_and_scoped() {
        let a = RawSmsRecord::single("+1555", "hi", at("2026-01-01T00:00:00Z"));
        let b = RawSmsRecord::single("+1555", "hi", at("2026-01-01T00:00:00Z"));
        assert_eq!(Fingerprint::single(&a), Fingerprint::single(&b));
        assert_eq!(Fingerprint::single(&a).as_str().len(), 16);
        assert_ne!(
            Fingerprint::multipart(7, "+1555"),
            Fingerprint::multipart(8, "+1555")
        );
        assert_ne!(
            Fingerprint::multipart(7, "+1555"),
            Fingerprint::multipart(7, "+1556")
        );
    }

    #[test]
    fn field_boundaries_do_not_collide() {
        let a = RawSmsRecord::single("+15", "55hi", at("2026-01-01T00:00:00Z"));
        let b = RawSmsRecord::single("+1555", "hi", at("2026-01-01T00:00:00Z"));
        assert_ne!(Fingerprint::single(&a), Fingerprint::single(&b));
    }

    #[test]
    fn single_part_total_completes_immediately() {
        let mut cache = ReassemblyCache::new();
        cache.ingest(RawSmsRecord::part(
            "+1",
            "whole",
            at("2026-01-01T00:00:00Z"),
            3,
            1,
            1,
        ));
        let complete = cache.complete();
        assert_eq!(complete.len(), 1);
        assert!(matches!(
            complete[0].assembly(),
            Assembly::MultipartComplete(_)
        ));
    }

    #[test]
    fn status_reports_and_foreign_headers_are_ignored() {
        let mut cache = ReassemblyCache::new();
        let mut report = RawSmsRecord::single("+1", "delivered", at("2026-01-01T00:00:00Z"));
        report.kind = RecordKind::StatusReport;
        assert!(matches!(cache.ingest(report), IngestOutcome::Ignored(_)));

        let mut wap = RawSmsRecord::single("+1", "push", at("2026-01-01T00:00:00Z"));
        wap.udh = UserDataHeader::Other;
        assert!(matches!(cache.ingest(wap), IngestOutcome::Ignored(_)));
        assert!(cache.is_empty());
    }

    #[test]
    fn out_of_range_part_numbers_are_ignored() {
        let mut cache = ReassemblyCache::new();
        let bad = RawSmsRecord::part("+1", "x", at("2026-01-01T00:00:00Z"), 1, 3, 2);
        assert!(matches!(cache.ingest(bad), IngestOutcome::Ignored(_)));
        let zero = RawSmsRecord::part("+1", "x", at("2026-01-01T00:00:00Z"), 1, 0, 2);
        assert!(matches!(cache.ingest(zero), IngestOutcome::Ignored(_)));
        assert!(cache.is_empty());
    }

    #[test]
    fn part_without_reference_is_ignored() {
        let mut cache = ReassemblyCache::new();
        let mut part = RawSmsRecord::part("+1", "x", at("2026-01-01T00:00:00Z"), 1, 1, 2);
        part.udh = UserDataHeader::Concatenated(PartInfo {
            reference: None,
            part_number: 1,
            total_parts: 2,
        });
        assert!(matches!(cache.ingest(part), IngestOutcome::Ignored(_)));
    }

    #[test]
    fn next_ready_skips_handed_off_and_follows_insertion_order() {
        let mut cache = ReassemblyCache::new();
        cache.ingest(RawSmsRecord::single("+1", "first", at("2026-01-01T00:00:00Z")));
        cache.ingest(RawSmsRecord::single("+2", "second", at("2026-01-01T00:00:01Z")));

        let first = cache.next_ready().unwrap().fingerprint().clone();
        assert_eq!(cache.get(&first).unwrap().text(), "first");
        cache.mark_handed_off(&first);
        assert_eq!(cache.next_ready().unwrap().text(), "second");

        cache.release(&first);
        assert_eq!(cache.next_ready().unwrap().text(), "first");
    }

    #[test]
    fn multipart_envelope_uses_latest_part_header() {
        let mut cache = ReassemblyCache::new();
        cache.ingest(RawSmsRecord::part(
            "+1",
            "lo",
            at("2026-01-01T00:00:05Z"),
            7,
            2,
            2,
        ));
        cache.ingest(RawSmsRecord::part(
            "+1",
            "Hel",
            at("2026-01-01T00:00:09Z"),
            7,
            1,
            2,
        ));
        let envelope = cache.next_ready().unwrap().envelope();
        assert_eq!(envelope.text, "Hello");
        assert_eq!(envelope.parts, 2);
        assert_eq!(envelope.received_timestamp, "2026-01-01T00:00:09+00:00");
    }
}
