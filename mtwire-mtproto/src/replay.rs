//! Replay protection for incoming server message identifiers.

use std::collections::BTreeSet;
use std::fmt;

/// Reject server messages older than this many seconds.
pub const MAX_PAST_SECS: i64 = 300;

/// Reject server messages more than this many seconds in the future.
pub const MAX_FUTURE_SECS: i64 = 30;

/// Number of recent server msg_ids remembered for duplicate detection.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Why a server msg_id was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WindowError {
    /// Server identifiers must be odd.
    EvenId,
    /// Seen before.
    Duplicate,
    /// Older than the time window, or older than everything the window still
    /// remembers.
    TooOld,
    /// Too far in the future.
    TooNew,
}

impl fmt::Display for WindowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EvenId => write!(f, "server msg_id is even"),
            Self::Duplicate => write!(f, "duplicate server msg_id"),
            Self::TooOld => write!(f, "server msg_id is too old"),
            Self::TooNew => write!(f, "server msg_id is too far in the future"),
        }
    }
}

impl std::error::Error for WindowError {}

/// Bounded set of recently accepted server msg_ids.
#[derive(Debug)]
pub struct ReplayWindow {
    seen: BTreeSet<i64>,
    capacity: usize,
}

impl ReplayWindow {
    /// Window with [`DEFAULT_CAPACITY`].
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Window remembering at most `capacity` ids.
    pub fn with_capacity(capacity: usize) -> Self {
        Self { seen: BTreeSet::new(), capacity: capacity.max(1) }
    }

    /// Validate `msg_id` against `now` (server-corrected Unix seconds)
    /// without recording it.
    pub fn check(&self, msg_id: i64, now: i64) -> Result<(), WindowError> {
        if msg_id & 1 == 0 {
            return Err(WindowError::EvenId);
        }
        let secs = msg_id >> 32;
        if secs < now - MAX_PAST_SECS {
            return Err(WindowError::TooOld);
        }
        if secs > now + MAX_FUTURE_SECS {
            return Err(WindowError::TooNew);
        }
        if self.seen.contains(&msg_id) {
            return Err(WindowError::Duplicate);
        }
        if self.seen.len() >= self.capacity {
            if let Some(&oldest) = self.seen.first() {
                if msg_id < oldest {
                    return Err(WindowError::TooOld);
                }
            }
        }
        Ok(())
    }

    /// Validate and record `msg_id`.
    pub fn accept(&mut self, msg_id: i64, now: i64) -> Result<(), WindowError> {
        self.check(msg_id, now)?;
        self.seen.insert(msg_id);
        while self.seen.len() > self.capacity {
            self.seen.pop_first();
        }
        Ok(())
    }

    /// Number of remembered ids.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// True when nothing was accepted yet.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}
