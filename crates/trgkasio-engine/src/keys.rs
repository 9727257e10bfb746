//! Keystroke event counting.
//!
//! The poll loop only needs "how many key-downs and key-ups happened since I
//! last asked"; where those events come from (an OS hook, async key-state
//! polling, a test) is outside the data path. [`CountingKeySource`] is the
//! counter-backed implementation the driver wires up; whatever captures
//! keystrokes feeds it through [`CountingKeySource::note_key_down`] /
//! [`CountingKeySource::note_key_up`].

use std::sync::atomic::{AtomicU32, Ordering};

/// Key events observed since the previous poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyEventCounts {
    /// Key-down transitions.
    pub key_down: u32,
    /// Key-up transitions.
    pub key_up: u32,
}

/// Source of keystroke event counts, polled once per poll-loop tick.
///
/// `poll_key_event_count` resets the counters; it must be callable from the
/// poll thread without extra synchronization.
pub trait KeyEventSource: Send + Sync {
    /// Counts accumulated since the last call, then reset.
    fn poll_key_event_count(&self) -> KeyEventCounts;
}

/// Lock-free counter pair fed by an external keystroke capturer.
#[derive(Debug, Default)]
pub struct CountingKeySource {
    downs: AtomicU32,
    ups: AtomicU32,
}

impl CountingKeySource {
    /// A source with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one key-down transition.
    pub fn note_key_down(&self) {
        self.downs.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one key-up transition.
    pub fn note_key_up(&self) {
        self.ups.fetch_add(1, Ordering::Relaxed);
    }
}

impl KeyEventSource for CountingKeySource {
    fn poll_key_event_count(&self) -> KeyEventCounts {
        KeyEventCounts {
            key_down: self.downs.swap(0, Ordering::Relaxed),
            key_up: self.ups.swap(0, Ordering::Relaxed),
        }
    }
}
