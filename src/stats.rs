//! Message statistics registry.
//!
//! Tracks per-message-type and aggregate counters for transmitted and
//! received messages, with every drop attributed to one of the enumerated
//! reasons. The registry is touched from every send and receive path, so
//! operations are constant-time map updates behind a short-lived lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use beacon_protocol::{RxDropReason, TxDropReason};

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

/// Counters for one message type (or the aggregate).
#[derive(Debug, Clone, Default)]
pub struct MessageStats {
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub messages_sent_dropped: u64,
    pub bytes_sent_dropped: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
    pub messages_received_dropped: u64,
    pub bytes_received_dropped: u64,
    tx_drops: HashMap<TxDropReason, DropCounter>,
    rx_drops: HashMap<RxDropReason, DropCounter>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DropCounter {
    pub messages: u64,
    pub bytes: u64,
}

impl MessageStats {
    fn record_tx(&mut self, nbytes: u64, reason: TxDropReason) {
        if reason == TxDropReason::NoDrop {
            self.messages_sent += 1;
            self.bytes_sent += nbytes;
        } else {
            self.messages_sent_dropped += 1;
            self.bytes_sent_dropped += nbytes;
            let counter = self.tx_drops.entry(reason).or_default();
            counter.messages += 1;
            counter.bytes += nbytes;
        }
    }

    fn record_rx(&mut self, nbytes: u64, reason: RxDropReason) {
        if reason == RxDropReason::NoDrop {
            self.messages_received += 1;
            self.bytes_received += nbytes;
        } else {
            self.messages_received_dropped += 1;
            self.bytes_received_dropped += nbytes;
            let counter = self.rx_drops.entry(reason).or_default();
            counter.messages += 1;
            counter.bytes += nbytes;
        }
    }

    pub fn tx_drop(&self, reason: TxDropReason) -> DropCounter {
        self.tx_drops.get(&reason).copied().unwrap_or_default()
    }

    pub fn rx_drop(&self, reason: RxDropReason) -> DropCounter {
        self.rx_drops.get(&reason).copied().unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Registry {
    per_type: HashMap<String, MessageStats>,
    aggregate: MessageStats,
}

/// Shared handle to the statistics registry. Cheap to clone; every send and
/// receive path holds one.
#[derive(Debug, Clone, Default)]
pub struct StatsHandle {
    registry: Arc<Mutex<Registry>>,
}

impl StatsHandle {
    pub fn new() -> Self {
        StatsHandle::default()
    }

    /// Record a transmission outcome for `message_type`.
    pub fn update_tx(&self, message_type: &str, nbytes: u64, reason: TxDropReason) {
        let mut registry = self.registry.lock().expect("stats lock");
        registry
            .per_type
            .entry(message_type.to_owned())
            .or_default()
            .record_tx(nbytes, reason);
        registry.aggregate.record_tx(nbytes, reason);
    }

    /// Record a receive outcome for `message_type`.
    pub fn update_rx(&self, message_type: &str, nbytes: u64, reason: RxDropReason) {
        let mut registry = self.registry.lock().expect("stats lock");
        registry
            .per_type
            .entry(message_type.to_owned())
            .or_default()
            .record_rx(nbytes, reason);
        registry.aggregate.record_rx(nbytes, reason);
    }

    pub fn aggregate(&self) -> MessageStats {
        self.registry.lock().expect("stats lock").aggregate.clone()
    }

    pub fn message_type_stats(&self) -> Vec<(String, MessageStats)> {
        let registry = self.registry.lock().expect("stats lock");
        let mut entries: Vec<_> = registry
            .per_type
            .iter()
            .map(|(name, stats)| (name.clone(), stats.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
