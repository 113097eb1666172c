//! Collector client: the wiring between the generator facade, the state
//! machine, and the per-connect sessions.
//!
//! The client owns three tasks: the state machine event loop, a forwarder
//! turning session events into machine events, and the receive dispatcher
//! that decodes incoming frames and routes them — control messages to the
//! state machine, everything else to the generator's request queue.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use beacon_protocol::{
    CTRL_SERVER_TO_CLIENT, CtrlServerToClient, HINT_CONTROL, Message, RxDropReason, TxDropReason,
};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::logging::LoggingHandle;
use crate::session::{SendElement, Session};
use crate::state_machine::{SmCallbacks, SmHandle, StateMachine};
use crate::stats::StatsHandle;

// ---------------------------------------------------------------------------
// Hooks back into the generator facade
// ---------------------------------------------------------------------------

/// What the client needs from its owner, handed in as closures to keep the
/// dependency arrow pointing one way.
pub struct ClientHooks {
    /// ClientInit: send the control handshake for this session.
    pub on_client_init: Box<dyn Fn(&Arc<Session>, u32) + Send + Sync>,
    /// Established (or a later control message): run UVE sync.
    pub on_established: Box<dyn Fn(CtrlServerToClient) + Send + Sync>,
    /// A decoded non-control message arrived from the collector.
    pub on_request: Box<dyn Fn(Message) + Send + Sync>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct Client {
    pub sm: SmHandle,
    stats: StatsHandle,
    logging: LoggingHandle,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Client {
    /// Start the client against `primary`/`secondary` collectors.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        primary: Option<String>,
        secondary: Option<String>,
        idle_hold_time: Duration,
        connect_time: Duration,
        stats: StatsHandle,
        logging: LoggingHandle,
        send_queue_enabled: Arc<AtomicBool>,
        hooks: ClientHooks,
    ) -> Client {
        let (session_event_tx, mut session_event_rx) = mpsc::unbounded_channel();
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<(u64, String)>();

        let hooks = Arc::new(hooks);
        let create_session = {
            let stats = stats.clone();
            let logging = logging.clone();
            Box::new(move |id: u64, peer: String| {
                Session::new(
                    id,
                    peer,
                    session_event_tx.clone(),
                    frame_tx.clone(),
                    stats.clone(),
                    logging.clone(),
                    send_queue_enabled.clone(),
                )
            })
        };
        let on_client_init = {
            let hooks = hooks.clone();
            Box::new(move |session: &Arc<Session>, connects: u32| {
                (hooks.on_client_init)(session, connects);
            })
        };
        let on_established = {
            let hooks = hooks.clone();
            Box::new(move |ctrl: CtrlServerToClient| (hooks.on_established)(ctrl))
        };

        let (sm, sm_task) = StateMachine::spawn(
            primary,
            secondary,
            idle_hold_time,
            connect_time,
            SmCallbacks {
                create_session,
                on_client_init,
                on_established,
            },
            stats.clone(),
        );

        // Session events -> machine events.
        let event_task = {
            let sm = sm.clone();
            tokio::spawn(async move {
                while let Some((session_id, event)) = session_event_rx.recv().await {
                    sm.on_session_event(session_id, event);
                }
            })
        };

        // Frame bodies -> control / request dispatch.
        let dispatch_task = {
            let sm = sm.clone();
            let stats = stats.clone();
            tokio::spawn(async move {
                while let Some((session_id, body)) = frame_rx.recv().await {
                    Self::dispatch_frame(&sm, &stats, &hooks, session_id, &body);
                }
            })
        };

        Client {
            sm,
            stats,
            logging,
            tasks: vec![sm_task, event_task, dispatch_task],
        }
    }

    /// Queue a non-UVE message on the current session. Returns false (and
    /// accounts the drop) when no usable session exists.
    pub fn send_message(&self, element: SendElement) -> bool {
        let name = element.name.clone();
        let level = element.level;
        let weight = element.frame.len() as u64;
        let log_line = element.log_line.clone();
        let queued = match self.sm.shared.session() {
            Some(session) => session.enqueue(element),
            None => false,
        };
        if !queued {
            self.stats.update_tx(&name, weight, TxDropReason::NoSession);
            self.logging
                .log_drop("no session", level, &log_line, chrono::Utc::now().timestamp());
        }
        queued
    }

    /// Route a UVE through the state machine queue so sync replays and
    /// fresh updates interleave in one place.
    pub fn send_uve(&self, element: SendElement) {
        self.sm.send_uve(element);
    }

    pub fn shutdown(&mut self) {
        self.sm.stop();
        if let Some(session) = self.sm.shared.session() {
            session.close();
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    // -----------------------------------------------------------------------
    // Receive dispatch
    // -----------------------------------------------------------------------

    fn dispatch_frame(
        sm: &SmHandle,
        stats: &StatsHandle,
        hooks: &Arc<ClientHooks>,
        session_id: u64,
        body: &str,
    ) {
        let nbytes = body.len() as u64;
        let message = match Message::decode_body(body) {
            Ok(message) => message,
            Err(e) => {
                error!(error = %e, "failed to decode message body");
                stats.update_rx("Unknown", nbytes, RxDropReason::DecodingFailed);
                return;
            }
        };

        if message.header.hints & HINT_CONTROL != 0 {
            if message.name != CTRL_SERVER_TO_CLIENT {
                error!(name = %message.name, "invalid control message");
                stats.update_rx(&message.name, nbytes, RxDropReason::ControlMsgFailed);
                return;
            }
            match CtrlServerToClient::from_payload(&message.payload) {
                Ok(ctrl) => {
                    debug!(types = ctrl.type_info.len(), "control message received");
                    stats.update_rx(&message.name, nbytes, RxDropReason::NoDrop);
                    sm.on_ctrl_msg(session_id, ctrl, message.header.source.clone());
                }
                Err(e) => {
                    error!(error = %e, "failed to decode control message");
                    stats.update_rx(&message.name, nbytes, RxDropReason::ControlMsgFailed);
                }
            }
            return;
        }

        debug!(name = %message.name, "message received");
        stats.update_rx(&message.name, nbytes, RxDropReason::NoDrop);
        (hooks.on_request)(message);
    }
}
