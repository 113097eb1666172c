//! Per-message-type send rate limiting.
//!
//! Each system-log message type gets a circular window of wall-clock
//! seconds whose capacity is the configured messages-per-second cap. A send
//! attempt is dropped when the window is full and its oldest slot is still
//! in the current second. The first drop of a streak logs one throttled
//! warning; the first accepted message afterwards logs recovery, so a
//! flood never turns into a log storm of its own.

use std::collections::{HashMap, VecDeque};

use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Per-type window
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RateWindow {
    /// Wall-clock seconds of the most recent accepted sends.
    slots: VecDeque<i64>,
    in_drop_streak: bool,
}

impl RateWindow {
    fn check(&mut self, message_type: &str, now_secs: i64, capacity: usize) -> bool {
        if self.slots.len() >= capacity && self.slots.front() == Some(&now_secs) {
            if !self.in_drop_streak {
                warn!(
                    message_type,
                    limit_per_sec = capacity,
                    "message rate limit hit, dropping until the window rolls"
                );
                self.in_drop_streak = true;
            }
            return false;
        }
        if self.in_drop_streak {
            info!(message_type, "message rate back under the limit");
            self.in_drop_streak = false;
        }
        if self.slots.len() >= capacity {
            self.slots.pop_front();
        }
        self.slots.push_back(now_secs);
        true
    }
}

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

/// Send-rate limiter over all system-log message types.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: usize,
    windows: HashMap<String, RateWindow>,
}

impl RateLimiter {
    pub fn new(capacity: usize) -> Self {
        RateLimiter {
            capacity,
            windows: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Update the per-second cap at runtime. Existing windows are reset so
    /// the new capacity applies immediately.
    pub fn set_capacity(&mut self, capacity: usize) {
        if capacity != self.capacity {
            info!(
                old = self.capacity,
                new = capacity,
                "system message rate limit changed"
            );
            self.capacity = capacity;
            self.windows.clear();
        }
    }

    /// True if a send of `message_type` at `now_secs` is within the cap.
    /// A capacity of zero disables limiting entirely.
    pub fn check(&mut self, message_type: &str, now_secs: i64) -> bool {
        if self.capacity == 0 {
            return true;
        }
        let capacity = self.capacity;
        self.windows
            .entry(message_type.to_owned())
            .or_default()
            .check(message_type, now_secs, capacity)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
