//! Single-slot mailboxes and the shared Active flag.
//!
//! These are the only values shared between the device pipeline and the
//! broker pipeline.  A mailbox holds zero or one item; an occupied mailbox
//! means "one message in flight" in that direction, so `try_put` never
//! overwrites and never blocks.

use sms_protocol::{BrokerMessage, Envelope};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

// ---------------------------------------------------------------------------
// Mailbox
// ---------------------------------------------------------------------------

/// A capacity-1 buffer shared between the two pipelines.
pub struct Mailbox<T> {
    slot: Arc<Mutex<Option<T>>>,
}

impl<T> Clone for Mailbox<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    // A panic while holding the lock cannot leave an Option half-written.
    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Place `item` if the slot is empty; hand it back otherwise.
    pub fn try_put(&self, item: T) -> Result<(), T> {
        let mut slot = self.lock();
        if slot.is_some() {
            return Err(item);
        }
        *slot = Some(item);
        Ok(())
    }

    /// Remove and return the item, if any.
    pub fn take(&self) -> Option<T> {
        self.lock().take()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_none()
    }

    pub fn is_occupied(&self) -> bool {
        !self.is_empty()
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Mailbox<T> {
    /// Copy of the item without removing it.
    pub fn peek(&self) -> Option<T> {
        self.lock().clone()
    }
}

impl<T: PartialEq> Mailbox<T> {
    /// Remove the item only if it still equals `expected`.
    ///
    /// Used after a successful publish: the other side may have withdrawn the
    /// item in the meantime, in which case nothing is removed.
    pub fn take_if_eq(&self, expected: &T) -> bool {
        let mut slot = self.lock();
        if slot.as_ref() == Some(expected) {
            *slot = None;
            true
        } else {
            false
        }
    }
}

// ---------------------------------------------------------------------------
// ActiveFlag
// ---------------------------------------------------------------------------

/// Live pause/resume switch read by both pipelines every iteration.
///
/// Every transition to paused bumps a counter, so a side that only looks
/// now and then can still tell that a pause happened in between.
#[derive(Clone)]
pub struct ActiveFlag {
    inner: Arc<AtomicBool>,
    pauses: Arc<AtomicU64>,
}

impl ActiveFlag {
    pub fn new(active: bool) -> Self {
        Self {
            inner: Arc::new(AtomicBool::new(active)),
            pauses: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }

    pub fn set(&self, active: bool) {
        let was_active = self.inner.swap(active, Ordering::SeqCst);
        if was_active && !active {
            self.pauses.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Number of active -> paused transitions so far.
    pub fn pauses(&self) -> u64 {
        self.pauses.load(Ordering::SeqCst)
    }
}

impl Default for ActiveFlag {
    fn default() -> Self {
        Self::new(true)
    }
}

// ---------------------------------------------------------------------------
// Links
// ---------------------------------------------------------------------------

/// Everything the two pipelines share, cloned into each of them.
#[derive(Clone)]
pub struct Links {
    /// Device -> broker: one complete SMS awaiting publish.
    pub incoming: Mailbox<Envelope>,
    /// Broker -> device: one outbound message awaiting the send hook.
    pub outgoing: Mailbox<BrokerMessage>,
    /// Broker -> device: one command or request.
    pub command: Mailbox<BrokerMessage>,
    pub active: ActiveFlag,
}

impl Links {
    pub fn new() -> Self {
        Self {
            incoming: Mailbox::new(),
            outgoing: Mailbox::new(),
            command: Mailbox::new(),
            active: ActiveFlag::default(),
        }
    }
}

impl Default for Links {
    fn default() -> Self {
        Self::new()
    }
}
