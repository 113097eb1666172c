//! Dependency connection registry and process-status roll-up.
//!
//! Components report the health of each external dependency under a
//! `(conn_type, name)` key. Every create, update, or delete recomputes the
//! process state: `Functional` with an empty description when every entry
//! is up, otherwise `NonFunctional` with a summary naming each entry that
//! is not. The result is emitted as a UVE keyed on the host name — except
//! that an update leaving an entry byte-identical is suppressed entirely.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    Up,
    Down,
    Init,
}

impl ConnStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnStatus::Up => "Up",
            ConnStatus::Down => "Down",
            ConnStatus::Init => "Initializing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Functional,
    NonFunctional,
    Starting,
}

impl ProcessState {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessState::Functional => "Functional",
            ProcessState::NonFunctional => "Non-Functional",
            ProcessState::Starting => "Starting",
        }
    }
}

/// One dependency's reported condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnInfo {
    pub conn_type: String,
    pub name: String,
    pub status: ConnStatus,
    pub server_addrs: Vec<String>,
    pub description: String,
}

/// Callback invoked with every recomputed roll-up.
pub type StatusEmitter = Box<dyn Fn(ProcessState, &str, &[ConnInfo]) + Send + Sync>;

// ---------------------------------------------------------------------------
// ConnectionState
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Registry {
    entries: BTreeMap<(String, String), ConnInfo>,
    process_state: Option<ProcessState>,
}

/// Shared connection registry. The generator installs an emitter that turns
/// roll-ups into the process-status UVE.
#[derive(Clone)]
pub struct ConnectionState {
    registry: Arc<Mutex<Registry>>,
    emitter: Arc<Mutex<Option<StatusEmitter>>>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState {
            registry: Arc::new(Mutex::new(Registry::default())),
            emitter: Arc::new(Mutex::new(None)),
        }
    }
}

impl ConnectionState {
    pub fn new() -> Self {
        ConnectionState::default()
    }

    pub fn set_emitter(&self, emitter: StatusEmitter) {
        *self.emitter.lock().expect("conn emitter lock") = Some(emitter);
    }

    /// Report a dependency's condition. A submission identical to the
    /// stored entry in `(status, server_addrs, description)` is a no-op.
    pub fn update(
        &self,
        conn_type: &str,
        name: &str,
        status: ConnStatus,
        server_addrs: Vec<String>,
        description: &str,
    ) {
        let snapshot = {
            let mut registry = self.registry.lock().expect("conn registry lock");
            let key = (conn_type.to_owned(), name.to_owned());
            if let Some(existing) = registry.entries.get(&key) {
                if existing.status == status
                    && existing.server_addrs == server_addrs
                    && existing.description == description
                {
                    return;
                }
            }
            registry.entries.insert(
                key,
                ConnInfo {
                    conn_type: conn_type.to_owned(),
                    name: name.to_owned(),
                    status,
                    server_addrs,
                    description: description.to_owned(),
                },
            );
            Self::recompute(&mut registry)
        };
        self.emit(snapshot);
    }

    /// Drop a dependency entry (absent keys are fine) and re-emit.
    pub fn delete(&self, conn_type: &str, name: &str) {
        let snapshot = {
            let mut registry = self.registry.lock().expect("conn registry lock");
            registry
                .entries
                .remove(&(conn_type.to_owned(), name.to_owned()));
            Self::recompute(&mut registry)
        };
        self.emit(snapshot);
    }

    /// `Starting` until the first report arrives.
    pub fn process_state(&self) -> ProcessState {
        self.registry
            .lock()
            .expect("conn registry lock")
            .process_state
            .unwrap_or(ProcessState::Starting)
    }

    pub fn entries(&self) -> Vec<ConnInfo> {
        self.registry
            .lock()
            .expect("conn registry lock")
            .entries
            .values()
            .cloned()
            .collect()
    }

    /// The roll-up rule: all up = Functional with an empty description;
    /// otherwise every non-up entry is summarized.
    pub fn rollup(entries: &[ConnInfo]) -> (ProcessState, String) {
        let mut down: Vec<String> = Vec::new();
        for entry in entries {
            if entry.status != ConnStatus::Up {
                let mut part = entry.conn_type.clone();
                if !entry.name.is_empty() {
                    part.push(':');
                    part.push_str(&entry.name);
                }
                if !entry.description.is_empty() {
                    part.push('[');
                    part.push_str(&entry.description);
                    part.push(']');
                }
                down.push(part);
            }
        }
        if down.is_empty() {
            (ProcessState::Functional, String::new())
        } else {
            (
                ProcessState::NonFunctional,
                format!("{} connection down", down.join(", ")),
            )
        }
    }

    fn recompute(registry: &mut Registry) -> (ProcessState, String, Vec<ConnInfo>) {
        let entries: Vec<ConnInfo> = registry.entries.values().cloned().collect();
        let (state, description) = Self::rollup(&entries);
        registry.process_state = Some(state);
        (state, description, entries)
    }

    fn emit(&self, (state, description, entries): (ProcessState, String, Vec<ConnInfo>)) {
        if let Some(emitter) = self.emitter.lock().expect("conn emitter lock").as_ref() {
            emitter(state, &description, &entries);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
