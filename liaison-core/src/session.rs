//! Per-endpoint session flags.
//!
//! Timeouts, cancellation and graceful end of stream are expected outcomes of
//! distributed operation, so they are recorded here instead of being raised
//! as errors. Each flag is monotonic: once set it stays set for the lifetime
//! of the protocol object.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct SessionFlags {
    ended: AtomicBool,
    canceled: AtomicBool,
    timed_out: AtomicBool,
}

impl SessionFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Peer signaled graceful end of stream, or closed its transport.
    pub fn has_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// Local cancellation was requested or observed.
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// An operation exceeded its deadline.
    pub fn has_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Acquire)
    }

    /// Returns true if the flag was already set.
    pub fn set_ended(&self) -> bool {
        self.ended.swap(true, Ordering::AcqRel)
    }

    /// Returns true if the flag was already set.
    pub fn set_canceled(&self) -> bool {
        self.canceled.swap(true, Ordering::AcqRel)
    }

    /// Returns true if the flag was already set.
    pub fn set_timed_out(&self) -> bool {
        self.timed_out.swap(true, Ordering::AcqRel)
    }
}
