//! Connection state machine supervising the collector session.
//!
//! One task consumes a serialized event queue and walks the states
//! `Idle -> Connect -> ClientInit -> Established`, detouring through
//! `ConnectToBackup` on connect failures and `Disconnect` when no collector
//! is known. Only the transitions in the table below fire; every other
//! `(state, event)` pair is logged as unconsumed and dropped, with one
//! out-of-band exception: a control message received while already
//! `Established` restarts UVE sync in place instead of transitioning.
//!
//! | From            | Event                                            | To              |
//! |-----------------|--------------------------------------------------|-----------------|
//! | Idle            | IdleHoldTimerExpired, CollectorChange            | Connect         |
//! | Disconnect      | CollectorChange                                  | Connect         |
//! | Connect         | CollectorUnknown                                 | Disconnect      |
//! | Connect         | TcpConnectFail, ConnectTimerExpired              | ConnectToBackup |
//! | Connect         | CollectorChange                                  | Idle            |
//! | Connect         | TcpConnected                                     | ClientInit      |
//! | ConnectToBackup | BackupCollectorUnknown, TcpConnectFail,          | Idle            |
//! |                 | ConnectTimerExpired, CollectorChange             |                 |
//! | ConnectToBackup | TcpConnected                                     | ClientInit      |
//! | ClientInit      | ConnectTimerExpired, TcpClose, CollectorChange   | Idle            |
//! | ClientInit      | CtrlMessageRecv                                  | Established     |
//! | Established     | TcpClose                                         | ConnectToBackup |
//! | Established     | CollectorChange                                  | Connect         |
//!
//! Timer expiries and session events carry the session generation id;
//! anything tagged with a stale id is dropped before dispatch, which is
//! what makes timer cancellation race-free.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use beacon_protocol::{CtrlServerToClient, TxDropReason};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::session::{SendElement, Session, SessionEvent};
use crate::stats::StatsHandle;

// ---------------------------------------------------------------------------
// States and events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmState {
    Idle,
    Disconnect,
    Connect,
    ConnectToBackup,
    ClientInit,
    Established,
}

impl SmState {
    pub fn as_str(self) -> &'static str {
        match self {
            SmState::Idle => "Idle",
            SmState::Disconnect => "Disconnect",
            SmState::Connect => "Connect",
            SmState::ConnectToBackup => "ConnectToBackup",
            SmState::ClientInit => "ClientInit",
            SmState::Established => "Established",
        }
    }
}

#[derive(Debug)]
pub enum SmEvent {
    Start,
    Stop,
    IdleHoldTimerExpired,
    ConnectTimerExpired { session_id: u64 },
    CollectorUnknown,
    BackupCollectorUnknown,
    TcpConnected { session_id: u64 },
    TcpConnectFail { session_id: u64 },
    TcpClose { session_id: u64 },
    CollectorChange { primary: Option<String>, secondary: Option<String> },
    CtrlMessageRecv { session_id: u64, ctrl: CtrlServerToClient, source: String },
    UveSend { element: SendElement },
}

impl SmEvent {
    fn name(&self) -> &'static str {
        match self {
            SmEvent::Start => "Start",
            SmEvent::Stop => "Stop",
            SmEvent::IdleHoldTimerExpired => "IdleHoldTimerExpired",
            SmEvent::ConnectTimerExpired { .. } => "ConnectTimerExpired",
            SmEvent::CollectorUnknown => "CollectorUnknown",
            SmEvent::BackupCollectorUnknown => "BackupCollectorUnknown",
            SmEvent::TcpConnected { .. } => "TcpConnected",
            SmEvent::TcpConnectFail { .. } => "TcpConnectFail",
            SmEvent::TcpClose { .. } => "TcpClose",
            SmEvent::CollectorChange { .. } => "CollectorChange",
            SmEvent::CtrlMessageRecv { .. } => "CtrlMessageRecv",
            SmEvent::UveSend { .. } => "UveSend",
        }
    }

    /// The session generation this event is about, if it is session-bound.
    fn session_id(&self) -> Option<u64> {
        match self {
            SmEvent::ConnectTimerExpired { session_id }
            | SmEvent::TcpConnected { session_id }
            | SmEvent::TcpConnectFail { session_id }
            | SmEvent::TcpClose { session_id }
            | SmEvent::CtrlMessageRecv { session_id, .. } => Some(*session_id),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Callbacks and shared view
// ---------------------------------------------------------------------------

/// Hooks the owning client installs into the machine. The machine itself
/// never builds messages; it only supervises the session and calls out at
/// the two points the protocol requires.
pub struct SmCallbacks {
    /// Create a session for `(generation, "host:port")`.
    pub create_session: Box<dyn Fn(u64, String) -> Arc<Session> + Send>,
    /// ClientInit entry: send the control handshake (and client info), with
    /// the successful-connect count.
    pub on_client_init: Box<dyn Fn(&Arc<Session>, u32) + Send>,
    /// Established entry (or a later control message): start UVE sync.
    pub on_established: Box<dyn Fn(CtrlServerToClient) + Send>,
}

/// State visible outside the machine task (introspect, send paths).
#[derive(Debug, Default)]
pub struct SmShared {
    state: Mutex<Option<SmState>>,
    session: Mutex<Option<Arc<Session>>>,
    collector_name: Mutex<String>,
    active: Mutex<Option<String>>,
    backup: Mutex<Option<String>>,
    connect_count: AtomicU32,
}

impl SmShared {
    pub fn state(&self) -> SmState {
        self.state.lock().expect("sm state lock").unwrap_or(SmState::Idle)
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.lock().expect("sm session lock").clone()
    }

    pub fn collector_name(&self) -> String {
        self.collector_name.lock().expect("sm collector lock").clone()
    }

    pub fn active_collector(&self) -> Option<String> {
        self.active.lock().expect("sm active lock").clone()
    }

    pub fn backup_collector(&self) -> Option<String> {
        self.backup.lock().expect("sm backup lock").clone()
    }

    pub fn connect_count(&self) -> u32 {
        self.connect_count.load(Ordering::SeqCst)
    }
}

/// Cheap handle for posting events and reading shared state.
#[derive(Clone)]
pub struct SmHandle {
    tx: mpsc::UnboundedSender<SmEvent>,
    pub shared: Arc<SmShared>,
}

impl SmHandle {
    pub fn post(&self, event: SmEvent) {
        let _ = self.tx.send(event);
    }

    pub fn stop(&self) {
        self.post(SmEvent::Stop);
    }

    /// Route a UVE (fresh or sync replay) through the machine so replays
    /// and updates interleave on one queue.
    pub fn send_uve(&self, element: SendElement) {
        self.post(SmEvent::UveSend { element });
    }

    /// Collector list changed (reconfiguration or discovery push).
    pub fn collector_change(&self, primary: Option<String>, secondary: Option<String>) {
        self.post(SmEvent::CollectorChange { primary, secondary });
    }

    /// Map a session event onto the machine's event alphabet.
    pub fn on_session_event(&self, session_id: u64, event: SessionEvent) {
        match event {
            SessionEvent::Established => self.post(SmEvent::TcpConnected { session_id }),
            SessionEvent::Error => self.post(SmEvent::TcpConnectFail { session_id }),
            SessionEvent::Close => self.post(SmEvent::TcpClose { session_id }),
        }
    }

    /// Hand a received control message to the machine. A failed negotiation
    /// closes the session instead; the connect timer then recovers us.
    pub fn on_ctrl_msg(&self, session_id: u64, ctrl: CtrlServerToClient, source: String) {
        if ctrl.success {
            self.post(SmEvent::CtrlMessageRecv {
                session_id,
                ctrl,
                source,
            });
        } else {
            warn!(collector = %source, "collector rejected negotiation, closing session");
            if let Some(session) = self.shared.session() {
                if session.id == session_id {
                    session.close();
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// StateMachine
// ---------------------------------------------------------------------------

pub struct StateMachine {
    state: SmState,
    shared: Arc<SmShared>,
    tx: mpsc::UnboundedSender<SmEvent>,
    callbacks: SmCallbacks,
    stats: StatsHandle,
    idle_hold_time: Duration,
    connect_time: Duration,
    configured_primary: Option<String>,
    configured_secondary: Option<String>,
    active: Option<String>,
    backup: Option<String>,
    session: Option<Arc<Session>>,
    session_seq: u64,
    idle_hold_timer: Option<tokio::task::JoinHandle<()>>,
    connect_timer: Option<tokio::task::JoinHandle<()>>,
    admin_down: bool,
}

impl StateMachine {
    /// Spawn the machine task. It starts in Idle and immediately processes
    /// `Start`, so the first connect attempt happens after one idle-hold.
    pub fn spawn(
        primary: Option<String>,
        secondary: Option<String>,
        idle_hold_time: Duration,
        connect_time: Duration,
        callbacks: SmCallbacks,
        stats: StatsHandle,
    ) -> (SmHandle, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SmShared::default());
        *shared.state.lock().expect("sm state lock") = Some(SmState::Idle);
        *shared.active.lock().expect("sm active lock") = primary.clone();
        *shared.backup.lock().expect("sm backup lock") = secondary.clone();

        let mut machine = StateMachine {
            state: SmState::Idle,
            shared: shared.clone(),
            tx: tx.clone(),
            callbacks,
            stats,
            idle_hold_time,
            connect_time,
            configured_primary: primary.clone(),
            configured_secondary: secondary.clone(),
            active: primary,
            backup: secondary,
            session: None,
            session_seq: 0,
            idle_hold_timer: None,
            connect_timer: None,
            admin_down: false,
        };

        let handle = SmHandle { tx, shared };
        let task = tokio::spawn(async move {
            machine.handle(SmEvent::Start);
            while let Some(event) = rx.recv().await {
                machine.handle(event);
            }
            machine.delete_session();
        });
        (handle, task)
    }

    // -----------------------------------------------------------------------
    // Event dispatch
    // -----------------------------------------------------------------------

    fn handle(&mut self, event: SmEvent) {
        // Established UVE traffic is the steady state; don't log each one.
        let log_event =
            !(self.state == SmState::Established && matches!(event, SmEvent::UveSend { .. }));
        if log_event {
            debug!(event = event.name(), state = self.state.as_str(), "processing event");
        }

        if let Some(session_id) = event.session_id() {
            let current = self.session.as_ref().map(|s| s.id);
            if current != Some(session_id) {
                info!(
                    event = event.name(),
                    session = session_id,
                    "ignoring event for old session"
                );
                return;
            }
        }

        match event {
            SmEvent::Start => {
                self.admin_down = false;
                self.enter(SmState::Idle, "Start");
            }
            SmEvent::Stop => {
                self.admin_down = true;
                self.enter(SmState::Idle, "Stop");
            }
            SmEvent::UveSend { element } => self.handle_uve_send(element),
            SmEvent::CollectorChange { primary, secondary } => {
                if primary == self.active {
                    // The backup may still have changed; remember it for the
                    // next Idle reset without disturbing the session.
                    self.configured_primary = primary;
                    self.configured_secondary = secondary.clone();
                    self.backup = secondary;
                    self.publish_collectors();
                    info!("no change in active collector, ignoring collector change");
                    return;
                }
                self.configured_primary = primary.clone();
                self.configured_secondary = secondary.clone();
                self.active = primary;
                self.backup = secondary;
                self.publish_collectors();
                let next = match self.state {
                    SmState::Idle | SmState::Disconnect | SmState::Established => SmState::Connect,
                    SmState::Connect | SmState::ConnectToBackup | SmState::ClientInit => {
                        SmState::Idle
                    }
                };
                self.enter(next, "CollectorChange");
            }
            SmEvent::CtrlMessageRecv { ctrl, source, .. } => match self.state {
                SmState::ClientInit => {
                    *self.shared.collector_name.lock().expect("sm collector lock") = source;
                    self.enter_established(ctrl);
                }
                // Out-of-band case: a control message on a live session
                // restarts UVE sync without a transition.
                SmState::Established => (self.callbacks.on_established)(ctrl),
                _ => self.unconsumed("CtrlMessageRecv"),
            },
            SmEvent::IdleHoldTimerExpired if self.state == SmState::Idle => {
                self.enter(SmState::Connect, "IdleHoldTimerExpired");
            }
            SmEvent::CollectorUnknown if self.state == SmState::Connect => {
                self.enter(SmState::Disconnect, "CollectorUnknown");
            }
            SmEvent::BackupCollectorUnknown if self.state == SmState::ConnectToBackup => {
                self.enter(SmState::Idle, "BackupCollectorUnknown");
            }
            SmEvent::TcpConnected { .. } => match self.state {
                SmState::Connect | SmState::ConnectToBackup => {
                    self.enter(SmState::ClientInit, "TcpConnected");
                }
                _ => self.unconsumed("TcpConnected"),
            },
            SmEvent::TcpConnectFail { .. } => match self.state {
                SmState::Connect => self.enter(SmState::ConnectToBackup, "TcpConnectFail"),
                SmState::ConnectToBackup => self.enter(SmState::Idle, "TcpConnectFail"),
                _ => self.unconsumed("TcpConnectFail"),
            },
            SmEvent::ConnectTimerExpired { .. } => match self.state {
                SmState::Connect => self.enter(SmState::ConnectToBackup, "ConnectTimerExpired"),
                SmState::ConnectToBackup | SmState::ClientInit => {
                    self.enter(SmState::Idle, "ConnectTimerExpired");
                }
                _ => self.unconsumed("ConnectTimerExpired"),
            },
            SmEvent::TcpClose { .. } => match self.state {
                SmState::ClientInit => self.enter(SmState::Idle, "TcpClose"),
                SmState::Established => self.enter(SmState::ConnectToBackup, "TcpClose"),
                _ => self.unconsumed("TcpClose"),
            },
            other => self.unconsumed(other.name()),
        }
    }

    fn unconsumed(&self, event: &str) {
        info!(event, state = self.state.as_str(), "unconsumed event");
    }

    fn handle_uve_send(&mut self, element: SendElement) {
        match self.state {
            SmState::Established | SmState::ClientInit => {
                let Some(session) = self.session.clone() else {
                    self.stats.update_tx(
                        &element.name,
                        element.frame.len() as u64,
                        TxDropReason::NoSession,
                    );
                    return;
                };
                let weight = element.frame.len() as u64;
                let name = element.name.clone();
                if !session.enqueue(element) {
                    self.stats.update_tx(&name, weight, TxDropReason::NoSession);
                }
            }
            state => {
                debug!(state = state.as_str(), "discarding UVE send in non-connected state");
                self.stats.update_tx(
                    &element.name,
                    element.frame.len() as u64,
                    TxDropReason::WrongClientSmState,
                );
            }
        }
    }

    // -----------------------------------------------------------------------
    // Transitions and entry actions
    // -----------------------------------------------------------------------

    fn enter(&mut self, next: SmState, event: &str) {
        let prev = self.state;
        self.state = next;
        *self.shared.state.lock().expect("sm state lock") = Some(next);
        info!(
            event,
            from = prev.as_str(),
            to = next.as_str(),
            "client state transition"
        );
        match next {
            SmState::Idle => self.enter_idle(),
            SmState::Disconnect => {}
            SmState::Connect => self.enter_connect(),
            SmState::ConnectToBackup => self.enter_connect_to_backup(),
            SmState::ClientInit => self.enter_client_init(),
            // Established entry needs the control message; handled by
            // enter_established.
            SmState::Established => {}
        }
    }

    fn enter_idle(&mut self) {
        self.cancel_connect_timer();
        self.active = self.configured_primary.clone();
        self.backup = self.configured_secondary.clone();
        self.publish_collectors();
        self.delete_session();
        if !self.admin_down {
            self.start_idle_hold_timer();
        }
    }

    fn enter_connect(&mut self) {
        self.cancel_idle_hold_timer();
        self.reset_collector_name();
        self.delete_session();
        match self.active.clone() {
            Some(peer) => self.connect_to(peer),
            None => {
                let _ = self.tx.send(SmEvent::CollectorUnknown);
            }
        }
    }

    fn enter_connect_to_backup(&mut self) {
        self.cancel_connect_timer();
        self.delete_session();
        if self.backup.is_some() {
            std::mem::swap(&mut self.active, &mut self.backup);
            self.publish_collectors();
            let peer = self.active.clone().expect("swapped-in backup collector");
            self.connect_to(peer);
        } else {
            let _ = self.tx.send(SmEvent::BackupCollectorUnknown);
        }
    }

    fn enter_client_init(&mut self) {
        let connects = self.shared.connect_count.fetch_add(1, Ordering::SeqCst) + 1;
        let Some(session) = self.session.clone() else {
            return;
        };
        session.start_reader();
        (self.callbacks.on_client_init)(&session, connects);
    }

    fn enter_established(&mut self, ctrl: CtrlServerToClient) {
        self.cancel_connect_timer();
        let prev = self.state;
        self.state = SmState::Established;
        *self.shared.state.lock().expect("sm state lock") = Some(SmState::Established);
        info!(
            event = "CtrlMessageRecv",
            from = prev.as_str(),
            to = "Established",
            "client state transition"
        );
        (self.callbacks.on_established)(ctrl);
    }

    fn connect_to(&mut self, peer: String) {
        self.session_seq += 1;
        let session = (self.callbacks.create_session)(self.session_seq, peer);
        *self.shared.session.lock().expect("sm session lock") = Some(session.clone());
        self.session = Some(session.clone());
        self.start_connect_timer(session.id);
        session.start_connect();
    }

    fn delete_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.close();
            *self.shared.session.lock().expect("sm session lock") = None;
            self.reset_collector_name();
        }
    }

    fn reset_collector_name(&self) {
        self.shared.collector_name.lock().expect("sm collector lock").clear();
    }

    fn publish_collectors(&self) {
        *self.shared.active.lock().expect("sm active lock") = self.active.clone();
        *self.shared.backup.lock().expect("sm backup lock") = self.backup.clone();
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    fn start_idle_hold_timer(&mut self) {
        self.cancel_idle_hold_timer();
        if self.idle_hold_time.is_zero() {
            let _ = self.tx.send(SmEvent::IdleHoldTimerExpired);
            return;
        }
        let tx = self.tx.clone();
        let delay = self.idle_hold_time;
        self.idle_hold_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(SmEvent::IdleHoldTimerExpired);
        }));
    }

    fn cancel_idle_hold_timer(&mut self) {
        if let Some(timer) = self.idle_hold_timer.take() {
            timer.abort();
        }
    }

    fn start_connect_timer(&mut self, session_id: u64) {
        self.cancel_connect_timer();
        let tx = self.tx.clone();
        let delay = self.connect_time;
        self.connect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(SmEvent::ConnectTimerExpired { session_id });
        }));
    }

    fn cancel_connect_timer(&mut self) {
        if let Some(timer) = self.connect_timer.take() {
            timer.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LoggingHandle;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::mpsc;
    use tokio::time::{Duration, sleep, timeout};

    struct Harness {
        handle: SmHandle,
        task: tokio::task::JoinHandle<()>,
        events: mpsc::UnboundedReceiver<(u64, SessionEvent)>,
        stats: StatsHandle,
    }

    /// Machine wired to throw-away sessions targeting a dead port, with a
    /// copy of the session event stream for the test to observe.
    fn spawn_machine(primary: Option<&str>, secondary: Option<&str>) -> Harness {
        let (event_tx, events) = mpsc::unbounded_channel();
        let stats = StatsHandle::new();
        let session_stats = stats.clone();
        let callbacks = SmCallbacks {
            create_session: Box::new(move |id, peer| {
                let (frame_tx, _frame_rx) = mpsc::unbounded_channel();
                Session::new(
                    id,
                    peer,
                    event_tx.clone(),
                    frame_tx,
                    session_stats.clone(),
                    LoggingHandle::new(),
                    Arc::new(AtomicBool::new(true)),
                )
            }),
            on_client_init: Box::new(|_, _| {}),
            on_established: Box::new(|_| {}),
        };
        let (handle, task) = StateMachine::spawn(
            primary.map(str::to_owned),
            secondary.map(str::to_owned),
            Duration::from_millis(10),
            Duration::from_secs(5),
            callbacks,
            stats.clone(),
        );
        Harness {
            handle,
            task,
            events,
            stats,
        }
    }

    #[tokio::test]
    async fn no_collector_parks_in_disconnect() {
        let harness = spawn_machine(None, None);
        sleep(Duration::from_millis(100)).await;
        assert_eq!(harness.handle.shared.state(), SmState::Disconnect);
        harness.task.abort();
    }

    #[tokio::test]
    async fn collector_change_from_disconnect_starts_a_connect() {
        let harness = spawn_machine(None, None);
        sleep(Duration::from_millis(100)).await;
        assert_eq!(harness.handle.shared.state(), SmState::Disconnect);

        harness
            .handle
            .collector_change(Some("127.0.0.1:1".to_owned()), None);
        sleep(Duration::from_millis(50)).await;
        // Connect was entered: a session exists now (the connect itself will
        // fail later, which is fine for this test).
        assert!(harness.handle.shared.session().is_some());
        assert_eq!(
            harness.handle.shared.active_collector().as_deref(),
            Some("127.0.0.1:1")
        );
        harness.task.abort();
    }

    #[tokio::test]
    async fn connect_failure_without_backup_returns_to_idle() {
        let mut harness = spawn_machine(Some("127.0.0.1:1"), None);
        // Wait for the session's connect-failure event to be observed.
        let (_, event) = timeout(Duration::from_secs(6), harness.events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, SessionEvent::Error);
        sleep(Duration::from_millis(100)).await;
        // Connect -> ConnectToBackup (no backup) -> Idle -> (idle hold)…
        // The machine keeps cycling; whatever the instant, it must not be
        // stuck in Connect with a dead session and must have reset active
        // back to the configured primary at least once.
        assert_eq!(
            harness.handle.shared.active_collector().as_deref(),
            Some("127.0.0.1:1")
        );
        harness.task.abort();
    }

    #[tokio::test]
    async fn failover_swaps_active_and_backup() {
        let mut harness = spawn_machine(Some("127.0.0.1:1"), Some("127.0.0.2:1"));
        let (_, event) = timeout(Duration::from_secs(6), harness.events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, SessionEvent::Error);
        // Give the machine a moment to run ConnectToBackup's entry action.
        sleep(Duration::from_millis(50)).await;
        assert_eq!(
            harness.handle.shared.active_collector().as_deref(),
            Some("127.0.0.2:1"),
            "backup should be active after the primary failed"
        );
        harness.task.abort();
    }

    #[tokio::test]
    async fn stale_session_events_are_ignored() {
        let harness = spawn_machine(Some("127.0.0.1:1"), None);
        sleep(Duration::from_millis(30)).await;
        let state_before = harness.handle.shared.state();
        // Event for a session generation that never existed.
        harness.handle.post(SmEvent::TcpConnected { session_id: 999 });
        sleep(Duration::from_millis(30)).await;
        // A stale TcpConnected must not push us into ClientInit.
        assert_ne!(harness.handle.shared.state(), SmState::ClientInit);
        let _ = state_before;
        harness.task.abort();
    }

    #[tokio::test]
    async fn stop_parks_the_machine_in_idle() {
        let harness = spawn_machine(Some("127.0.0.1:1"), None);
        harness.handle.stop();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(harness.handle.shared.state(), SmState::Idle);
        // Admin-down: no reconnect attempt, so no session.
        sleep(Duration::from_millis(100)).await;
        assert!(harness.handle.shared.session().is_none());
        harness.task.abort();
    }

    #[tokio::test]
    async fn control_message_on_established_session_restarts_sync_in_place() {
        // A live listener so the machine's connect attempt succeeds and the
        // session (generation 1) stays open for the whole test.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let _stream = stream;
                    sleep(Duration::from_secs(30)).await;
                });
            }
        });

        let (event_tx, _events) = mpsc::unbounded_channel();
        let stats = StatsHandle::new();
        let session_stats = stats.clone();
        let syncs = Arc::new(AtomicU32::new(0));
        let sync_count = syncs.clone();
        let callbacks = SmCallbacks {
            create_session: Box::new(move |id, peer| {
                let (frame_tx, _frame_rx) = mpsc::unbounded_channel();
                Session::new(
                    id,
                    peer,
                    event_tx.clone(),
                    frame_tx,
                    session_stats.clone(),
                    LoggingHandle::new(),
                    Arc::new(AtomicBool::new(true)),
                )
            }),
            on_client_init: Box::new(|_, _| {}),
            on_established: Box::new(move |_| {
                sync_count.fetch_add(1, Ordering::SeqCst);
            }),
        };
        let (handle, task) = StateMachine::spawn(
            Some(endpoint),
            None,
            Duration::from_millis(10),
            Duration::from_secs(5),
            callbacks,
            stats,
        );

        // Wait for the first connect attempt to create session 1.
        timeout(Duration::from_secs(5), async {
            while handle.shared.session().is_none() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("a session should be created");

        // Drive the handshake: TCP up, then the collector's control reply.
        handle.post(SmEvent::TcpConnected { session_id: 1 });
        handle.post(SmEvent::CtrlMessageRecv {
            session_id: 1,
            ctrl: CtrlServerToClient {
                success: true,
                type_info: vec![],
            },
            source: "collector-a".to_owned(),
        });
        sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.shared.state(), SmState::Established);
        assert_eq!(syncs.load(Ordering::SeqCst), 1);

        // A second control message is consumed in place: sync runs again,
        // the state does not change, the session generation stays the same.
        handle.post(SmEvent::CtrlMessageRecv {
            session_id: 1,
            ctrl: CtrlServerToClient {
                success: true,
                type_info: vec![],
            },
            source: "collector-a".to_owned(),
        });
        sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.shared.state(), SmState::Established);
        assert_eq!(syncs.load(Ordering::SeqCst), 2);
        assert_eq!(handle.shared.session().map(|s| s.id), Some(1));
        task.abort();
    }

    #[tokio::test]
    async fn uve_send_outside_connected_states_counts_wrong_state_drop() {
        let harness = spawn_machine(None, None);
        sleep(Duration::from_millis(50)).await;
        harness.handle.send_uve(SendElement {
            name: "NodeStatusUVE".to_owned(),
            level: beacon_protocol::Level::Info,
            category: String::new(),
            log_line: "uve".to_owned(),
            frame: "frame".to_owned(),
        });
        sleep(Duration::from_millis(50)).await;
        let aggregate = harness.stats.aggregate();
        assert_eq!(
            aggregate.tx_drop(TxDropReason::WrongClientSmState).messages,
            1
        );
        harness.task.abort();
    }
}
