//! Named trace ring buffers with stateful multi-reader cursors.
//!
//! Each buffer holds the most recent N trace messages (N fixed at create
//! time); writing to a full ring overwrites the oldest entry. Reads are
//! paginated per `(buffer, reader_context)`: a fresh context starts at the
//! oldest entry, and a cursor that the ring has overwritten past restarts
//! there too. The subsystem and each buffer carry independent enable flags;
//! writes while either is off are no-ops.

use std::collections::{BTreeMap, HashMap, VecDeque};

use beacon_protocol::Message;

// ---------------------------------------------------------------------------
// TraceBuffer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct TraceEntry {
    seqno: u64,
    message: Message,
}

#[derive(Debug)]
struct TraceBuffer {
    capacity: usize,
    enabled: bool,
    entries: VecDeque<TraceEntry>,
    /// Seqno handed to the next write; per-buffer monotonic, starts at 1.
    next_seqno: u64,
    /// `reader_context -> seqno of the next unread entry`.
    readers: HashMap<String, u64>,
}

impl TraceBuffer {
    fn new(capacity: usize, enabled: bool) -> Self {
        TraceBuffer {
            capacity,
            enabled,
            entries: VecDeque::with_capacity(capacity),
            next_seqno: 1,
            readers: HashMap::new(),
        }
    }

    fn oldest_seqno(&self) -> Option<u64> {
        self.entries.front().map(|e| e.seqno)
    }

    fn write(&mut self, mut message: Message) -> u64 {
        let seqno = self.next_seqno;
        self.next_seqno += 1;
        // The ring seqno is the correlation id: it becomes the message's
        // sequence and is mirrored into the category field.
        message.header.sequence = seqno;
        message.header.category = seqno.to_string();
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(TraceEntry { seqno, message });
        seqno
    }

    fn read(&mut self, context: &str, count: usize) -> Vec<(u64, Message)> {
        let Some(oldest) = self.oldest_seqno() else {
            return Vec::new();
        };
        let cursor = self
            .readers
            .get(context)
            .copied()
            // A cursor the ring overwrote past restarts at the oldest entry.
            .filter(|&c| c >= oldest)
            .unwrap_or(oldest);

        let mut out = Vec::new();
        for entry in self.entries.iter().skip_while(|e| e.seqno < cursor) {
            if count != 0 && out.len() == count {
                break;
            }
            out.push((entry.seqno, entry.message.clone()));
        }
        let next = out.last().map_or(cursor, |(seqno, _)| seqno + 1);
        self.readers.insert(context.to_owned(), next);
        out
    }
}

// ---------------------------------------------------------------------------
// TraceBuffers (subsystem)
// ---------------------------------------------------------------------------

/// The trace subsystem: a registry of named ring buffers plus the global
/// enable flag.
#[derive(Debug)]
pub struct TraceBuffers {
    enabled: bool,
    buffers: BTreeMap<String, TraceBuffer>,
}

impl Default for TraceBuffers {
    fn default() -> Self {
        TraceBuffers {
            enabled: true,
            buffers: BTreeMap::new(),
        }
    }
}

impl TraceBuffers {
    pub fn new() -> Self {
        TraceBuffers::default()
    }

    // -- subsystem flag --

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    // -- buffer admin --

    /// Create `name` with the given capacity. Re-creating an existing buffer
    /// is a no-op (the original ring and its readers are kept).
    pub fn create(&mut self, name: &str, capacity: usize, enabled: bool) {
        self.buffers
            .entry(name.to_owned())
            .or_insert_with(|| TraceBuffer::new(capacity.max(1), enabled));
    }

    pub fn delete(&mut self, name: &str) {
        self.buffers.remove(name);
    }

    pub fn set_buffer_enabled(&mut self, name: &str, enabled: bool) {
        if let Some(buffer) = self.buffers.get_mut(name) {
            buffer.enabled = enabled;
        }
    }

    pub fn is_buffer_enabled(&self, name: &str) -> bool {
        self.buffers.get(name).is_some_and(|b| b.enabled)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.buffers.contains_key(name)
    }

    pub fn list(&self) -> Vec<String> {
        self.buffers.keys().cloned().collect()
    }

    pub fn capacity(&self, name: &str) -> Option<usize> {
        self.buffers.get(name).map(|b| b.capacity)
    }

    // -- data path --

    /// Append `message` to `name`. Returns the per-buffer seqno, or `None`
    /// when tracing is disabled (globally or for this buffer) or the buffer
    /// does not exist.
    pub fn write(&mut self, name: &str, message: Message) -> Option<u64> {
        if !self.enabled {
            return None;
        }
        let buffer = self.buffers.get_mut(name)?;
        if !buffer.enabled {
            return None;
        }
        Some(buffer.write(message))
    }

    /// Read up to `count` entries for `context` (0 = everything up to the
    /// tail). The cursor advances past what was returned.
    pub fn read(&mut self, name: &str, context: &str, count: usize) -> Vec<(u64, Message)> {
        match self.buffers.get_mut(name) {
            Some(buffer) => buffer.read(context, count),
            None => Vec::new(),
        }
    }

    /// Forget the cursor for `(name, context)`; the next read starts over.
    pub fn read_done(&mut self, name: &str, context: &str) {
        if let Some(buffer) = self.buffers.get_mut(name) {
            buffer.readers.remove(context);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
