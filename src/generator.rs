//! The generator facade: the one object a service embeds.
//!
//! `Generator::init` wires every subsystem together — statistics, logging
//! params, trace rings, the rate limiter, the UVE cache, the connection
//! state registry, the introspect HTTP server, and (when a collector is
//! configured) the client with its state machine. The submission methods
//! apply the gating pipeline and hand accepted messages to the session.
//!
//! Setup failures are logged and degrade the generator to log-only
//! operation; the single fatal condition is an unbindable introspect port.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use beacon_protocol::{
    CTRL_CLIENT_TO_SERVER, CtrlClientToServer, CtrlServerToClient, HINT_CONTROL, HINT_KEY,
    HINT_SYNC_REPLAY, Level, Message, MessageHeader, MessageKind, RxDropReason, TxDropReason,
    UveData, UvePayload, xml::XmlElement,
};
use tracing::{debug, error, info};

use crate::client::{Client, ClientHooks};
use crate::config::GeneratorConfig;
use crate::connection_info::{ConnInfo, ConnectionState, ProcessState};
use crate::introspect::IntrospectServer;
use crate::logging::LoggingHandle;
use crate::queue::WaterMark;
use crate::rate_limit::RateLimiter;
use crate::session::{SendElement, Session};
use crate::stats::StatsHandle;
use crate::trace::TraceBuffers;
use crate::uve::{UveCache, UveTypeDesc};

/// Sentinel for "no send-level gating" (every severity accepted).
const SEND_LEVEL_DISABLED: i8 = i8::MAX;

/// Built-in UVE type carrying the generator's own client state.
pub const CLIENT_INFO_UVE: &str = "GeneratorClientInfo";
/// Built-in UVE type carrying the process-status roll-up.
pub const PROCESS_STATUS_UVE: &str = "ProcessStatus";

/// Default send-queue watermarks: as the queue fills, raise the send level
/// so the least severe messages drop first; as it drains, lower it again
/// until gating is off.
const HIGH_WATERMARKS: [(u64, Level); 3] = [
    (50_000, Level::Debug),
    (100_000, Level::Error),
    (150_000, Level::Emergency),
];
const LOW_WATERMARKS: [(u64, Level); 3] = [
    (25_000, Level::Invalid),
    (75_000, Level::Debug),
    (125_000, Level::Error),
];

pub type RequestHandler = Arc<dyn Fn(&Generator, &Message) + Send + Sync>;

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Generator {
    inner: Arc<GeneratorInner>,
}

pub struct GeneratorInner {
    config: Mutex<GeneratorConfig>,
    stats: StatsHandle,
    logging: LoggingHandle,
    traces: Mutex<TraceBuffers>,
    rate_limiter: Mutex<RateLimiter>,
    uve_cache: UveCache,
    conn_state: ConnectionState,
    client: Mutex<Option<Client>>,
    handlers: Mutex<HashMap<String, RequestHandler>>,
    http_responses: Mutex<HashMap<String, String>>,
    send_level: AtomicI8,
    send_queue_enabled: Arc<AtomicBool>,
    seqnum: AtomicU64,
    http_port: Mutex<Option<u16>>,
    introspect_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    start_time: i64,
    uninitialized: AtomicBool,
}

impl Generator {
    /// Bring the generator up. Registers the built-in and caller UVE types,
    /// starts the introspect server (exiting the process if its port cannot
    /// be bound), and starts the collector client when configured.
    pub async fn init(config: GeneratorConfig, mut uve_types: Vec<UveTypeDesc>) -> Generator {
        crate::logging::init_tracing();
        info!(
            module = %config.module,
            source = %config.source,
            connect = config.connect_to_collector,
            "generator starting"
        );

        uve_types.push(UveTypeDesc::new(CLIENT_INFO_UVE));
        uve_types.push(UveTypeDesc::new(PROCESS_STATUS_UVE));

        let generator = Generator {
            inner: Arc::new(GeneratorInner {
                stats: StatsHandle::new(),
                logging: LoggingHandle::new(),
                traces: Mutex::new(TraceBuffers::new()),
                rate_limiter: Mutex::new(RateLimiter::new(config.system_log_rate_limit)),
                uve_cache: UveCache::new(uve_types),
                conn_state: ConnectionState::new(),
                client: Mutex::new(None),
                handlers: Mutex::new(HashMap::new()),
                http_responses: Mutex::new(HashMap::new()),
                send_level: AtomicI8::new(SEND_LEVEL_DISABLED),
                send_queue_enabled: Arc::new(AtomicBool::new(true)),
                seqnum: AtomicU64::new(0),
                http_port: Mutex::new(None),
                introspect_task: Mutex::new(None),
                start_time: chrono::Utc::now().timestamp_micros(),
                uninitialized: AtomicBool::new(false),
                config: Mutex::new(config.clone()),
            }),
        };

        // Process-status roll-ups are emitted as a UVE keyed on the host.
        {
            let weak = Arc::downgrade(&generator.inner);
            let host = config.source.clone();
            generator.inner.conn_state.set_emitter(Box::new(
                move |state, description, entries| {
                    if let Some(inner) = weak.upgrade() {
                        let generator = Generator { inner };
                        generator.emit_process_status(&host, state, description, entries);
                    }
                },
            ));
        }

        if let Some(port) = config.http_port {
            match IntrospectServer::start(generator.clone(), port).await {
                Ok(bound) => {
                    info!(port = bound.port, "introspect server started");
                    *generator.inner.http_port.lock().expect("http port lock") = Some(bound.port);
                    *generator
                        .inner
                        .introspect_task
                        .lock()
                        .expect("introspect task lock") = Some(bound.task);
                    generator.record_port("http", bound.port);
                }
                Err(e) => {
                    // The one fatal condition: an operator pointed us at a
                    // port we cannot own.
                    error!(port, error = %e, "cannot bind introspect HTTP port");
                    std::process::exit(1);
                }
            }
        }

        if config.connect_to_collector {
            generator.start_client(&config);
        }
        generator
    }

    // -----------------------------------------------------------------------
    // Submission: generic messages
    // -----------------------------------------------------------------------

    /// Build a message with the generator's identity filled in.
    pub fn message(
        &self,
        kind: MessageKind,
        name: &str,
        level: Level,
        payload: XmlElement,
    ) -> Message {
        let config = self.inner.config.lock().expect("config lock");
        Message {
            header: MessageHeader {
                module: config.module.clone(),
                source: config.source.clone(),
                node_type: config.node_type.clone(),
                instance_id: config.instance_id.clone(),
                kind: Some(kind),
                level: Some(level),
                ..MessageHeader::default()
            },
            name: name.to_owned(),
            payload,
        }
    }

    /// Submit a non-UVE message. Returns 0 when accepted for (best-effort)
    /// transmission, -1 on any drop; statistics are updated either way.
    pub fn send(&self, mut msg: Message) -> i32 {
        let name = msg.name.clone();
        if name.is_empty() || msg.header.kind.is_none() {
            error!(name = %name, "message validation failed");
            self.inner
                .stats
                .update_tx(&name, 0, TxDropReason::ValidationFailed);
            return -1;
        }
        let level = msg.header.level.unwrap_or(Level::Debug);
        let now = chrono::Utc::now();

        // Unit-test mode short-circuits delivery entirely.
        if self.is_unit_test() || level.is_unit_test() {
            if self
                .inner
                .logging
                .is_logging_allowed(level, &msg.header.category)
            {
                self.inner.logging.log_at(level, &log_line(&msg));
            }
            return 0;
        }

        if msg.header.kind == Some(MessageKind::AsyncSystem)
            && !self
                .inner
                .rate_limiter
                .lock()
                .expect("rate limiter lock")
                .check(&name, now.timestamp())
        {
            self.inner
                .stats
                .update_tx(&name, 0, TxDropReason::RatelimitDrop);
            return -1;
        }

        // Queue-level gate: under back-pressure the send level rises and
        // the less severe messages stop here.
        let send_level = self.inner.send_level.load(Ordering::SeqCst);
        if (level as i8) >= send_level {
            self.inner
                .stats
                .update_tx(&name, 0, TxDropReason::QueueLevel);
            return -1;
        }

        msg.header.timestamp = now.timestamp_micros();
        // Trace replays keep their ring seqno; everything else gets a fresh
        // submission seqno.
        if msg.header.sequence == 0 {
            msg.header.sequence = self.next_seqnum();
        }

        let connect_to_collector = self
            .inner
            .config
            .lock()
            .expect("config lock")
            .connect_to_collector;
        let client = self.inner.client.lock().expect("client lock");
        match client.as_ref() {
            Some(client) => {
                if client.send_message(self.element(&msg, level)) {
                    0
                } else {
                    -1
                }
            }
            None if connect_to_collector => {
                self.inner
                    .stats
                    .update_tx(&name, 0, TxDropReason::NoClient);
                error!(name = %name, "no client, dropping message");
                -1
            }
            None => {
                // Log-only mode: the message is "delivered" to the log.
                self.inner.logging.log_at(level, &log_line(&msg));
                self.inner
                    .stats
                    .update_tx(&name, msg.encode_body().len() as u64, TxDropReason::NoDrop);
                0
            }
        }
    }

    /// Submit a response. Contexts beginning `http://` or `https://` render
    /// into the introspect response buffer instead of going to the wire.
    pub fn send_response(&self, mut msg: Message) -> i32 {
        msg.header.kind = Some(MessageKind::Response);
        if msg.header.context.starts_with("http://") || msg.header.context.starts_with("https://")
        {
            let mut responses = self.inner.http_responses.lock().expect("responses lock");
            responses
                .entry(msg.header.context.clone())
                .or_default()
                .push_str(&msg.payload.to_xml_string());
            return 0;
        }
        self.send(msg)
    }

    /// Collect (and clear) the rendered introspect response for `context`.
    pub fn take_http_response(&self, context: &str) -> Option<String> {
        self.inner
            .http_responses
            .lock()
            .expect("responses lock")
            .remove(context)
    }

    // -----------------------------------------------------------------------
    // Submission: UVEs and alarms
    // -----------------------------------------------------------------------

    /// Submit a fresh UVE for a registered type.
    pub fn send_uve(&self, type_name: &str, payload: UvePayload) -> i32 {
        self.submit_uve(type_name, payload, MessageKind::Uve, false, 0)
    }

    /// Submit an alarm: a UVE variant carrying an acknowledgement token
    /// derived from `(host, http_port, timestamp)`.
    pub fn send_alarm(&self, type_name: &str, mut payload: UvePayload) -> i32 {
        if let UvePayload::Data(data) = &mut payload {
            data.attrs.insert("token".to_owned(), self.alarm_token());
        }
        self.submit_uve(type_name, payload, MessageKind::Alarm, false, 0)
    }

    fn alarm_token(&self) -> String {
        let config = self.inner.config.lock().expect("config lock");
        let port = self.inner.http_port.lock().expect("http port lock").unwrap_or(0);
        let raw = format!(
            "{}:{}:{}",
            config.source,
            port,
            chrono::Utc::now().timestamp_micros()
        );
        BASE64.encode(raw)
    }

    fn submit_uve(
        &self,
        type_name: &str,
        payload: UvePayload,
        kind: MessageKind,
        replay: bool,
        replay_seqno: u64,
    ) -> i32 {
        if payload.name().is_empty() {
            self.inner
                .stats
                .update_tx(type_name, 0, TxDropReason::ValidationFailed);
            return -1;
        }
        let Some(dynamic) = self.inner.uve_cache.is_dynamic(type_name) else {
            self.inner
                .stats
                .update_tx(type_name, 0, TxDropReason::ValidationFailed);
            return -1;
        };
        let kind = if dynamic { MessageKind::DynamicUve } else { kind };

        let seqno = if replay {
            replay_seqno
        } else {
            let seqno = self.next_seqnum();
            if !self.inner.uve_cache.update(type_name, &payload, seqno) {
                self.inner
                    .stats
                    .update_tx(type_name, 0, TxDropReason::ValidationFailed);
                return -1;
            }
            seqno
        };

        let mut msg = self.message(kind, type_name, Level::Info, payload.to_payload(type_name));
        msg.header.sequence = seqno;
        msg.header.timestamp = chrono::Utc::now().timestamp_micros();
        msg.header.hints = if replay {
            HINT_KEY | HINT_SYNC_REPLAY
        } else {
            HINT_KEY
        };

        if self.is_unit_test() {
            debug!(type_name, key = payload.name(), "unit test mode, UVE not sent");
            return 0;
        }
        let client = self.inner.client.lock().expect("client lock");
        match client.as_ref() {
            Some(client) => client.send_uve(self.element(&msg, Level::Info)),
            None => debug!(type_name, key = payload.name(), "no client, UVE cached only"),
        }
        0
    }

    // -----------------------------------------------------------------------
    // UVE sync protocol
    // -----------------------------------------------------------------------

    fn handle_ctrl_msg(&self, ctrl: CtrlServerToClient) {
        let baselines: HashMap<String, u64> = ctrl
            .type_info
            .into_iter()
            .map(|entry| (entry.type_name, entry.seqno))
            .collect();
        let mut replays: Vec<(String, UvePayload, u64)> = Vec::new();
        self.inner.uve_cache.sync(&baselines, |type_name, entry| {
            replays.push((type_name.to_owned(), entry.data.clone(), entry.seqno));
        });
        let count = replays.len();
        for (type_name, payload, seqno) in replays {
            self.submit_uve(&type_name, payload, MessageKind::Uve, true, seqno);
        }
        info!(count, "UVE sync replay complete");
    }

    /// Replay one type's cache (introspect request path). Returns the
    /// number of entries re-sent, or `None` for an unknown type.
    pub fn sync_uve_type(&self, type_name: &str) -> Option<usize> {
        let mut replays: Vec<(UvePayload, u64)> = Vec::new();
        let count = self.inner.uve_cache.sync_type(type_name, |_, entry| {
            replays.push((entry.data.clone(), entry.seqno));
        })?;
        for (payload, seqno) in replays {
            self.submit_uve(type_name, payload, MessageKind::Uve, true, seqno);
        }
        Some(count)
    }

    // -----------------------------------------------------------------------
    // Client wiring
    // -----------------------------------------------------------------------

    fn start_client(&self, config: &GeneratorConfig) {
        let weak = Arc::downgrade(&self.inner);
        let hooks = ClientHooks {
            on_client_init: {
                let weak = weak.clone();
                Box::new(move |session, connects| {
                    if let Some(inner) = weak.upgrade() {
                        let generator = Generator { inner };
                        generator.send_client_init(session, connects);
                        generator.send_generator_info();
                    }
                })
            },
            on_established: {
                let weak = weak.clone();
                Box::new(move |ctrl| {
                    if let Some(inner) = weak.upgrade() {
                        let generator = Generator { inner };
                        generator.handle_ctrl_msg(ctrl);
                        generator.send_generator_info();
                    }
                })
            },
            on_request: {
                let weak = weak.clone();
                Box::new(move |message| {
                    if let Some(inner) = weak.upgrade() {
                        let generator = Generator { inner };
                        generator.dispatch_request(&message);
                    }
                })
            },
        };

        let client = Client::start(
            config.primary_collector().map(str::to_owned),
            config.secondary_collector().map(str::to_owned),
            config.idle_hold_time,
            config.connect_time,
            self.inner.stats.clone(),
            self.inner.logging.clone(),
            self.inner.send_queue_enabled.clone(),
            hooks,
        );

        *self.inner.client.lock().expect("client lock") = Some(client);
    }

    /// Build the default watermark lists. The callbacks adjust the shared
    /// send level; they are installed on each new session's queue during
    /// the ClientInit handshake.
    fn watermarks(&self) -> (Vec<WaterMark>, Vec<WaterMark>) {
        let weak = Arc::downgrade(&self.inner);
        let high = HIGH_WATERMARKS
            .iter()
            .map(|&(bytes, level)| {
                let weak = weak.clone();
                WaterMark::new(bytes, move |qsize| {
                    if let Some(inner) = weak.upgrade() {
                        debug!(qsize, level = %level, "send queue high watermark");
                        inner.send_level.store(level as i8, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        let low = LOW_WATERMARKS
            .iter()
            .map(|&(bytes, level)| {
                let weak = weak.clone();
                WaterMark::new(bytes, move |qsize| {
                    if let Some(inner) = weak.upgrade() {
                        debug!(qsize, level = %level, "send queue low watermark");
                        let value = if level == Level::Invalid {
                            SEND_LEVEL_DISABLED
                        } else {
                            level as i8
                        };
                        inner.send_level.store(value, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        (high, low)
    }

    fn send_client_init(&self, session: &Arc<Session>, connects: u32) {
        let (high, low) = self.watermarks();
        session.send_queue().set_high_watermarks(high);
        session.send_queue().set_low_watermarks(low);

        let config = self.inner.config.lock().expect("config lock");
        let ctrl = CtrlClientToServer {
            source: config.source.clone(),
            module: config.module.clone(),
            connect_count: connects,
            uve_type_names: self.inner.uve_cache.type_names(),
            pid: std::process::id(),
            node_type: config.node_type.clone(),
            instance_id: config.instance_id.clone(),
        };
        drop(config);

        let mut msg = self.message(
            MessageKind::Request,
            CTRL_CLIENT_TO_SERVER,
            Level::Info,
            ctrl.to_payload(),
        );
        msg.header.hints |= HINT_CONTROL;
        msg.header.context = "ctrl".to_owned();
        msg.header.timestamp = chrono::Utc::now().timestamp_micros();
        msg.header.sequence = self.next_seqnum();
        debug!(types = ctrl.uve_type_names.len(), "sending control handshake");
        session.enqueue(self.element(&msg, Level::Info));
    }

    /// Emit the generator's own client-state UVE (connection status, pid,
    /// ports, connect counts).
    pub fn send_generator_info(&self) {
        let config = self.inner.config.lock().expect("config lock");
        let key = format!(
            "{}:{}:{}:{}",
            config.source, config.node_type, config.module, config.instance_id
        );
        let primary = config.primary_collector().unwrap_or("").to_owned();
        let secondary = config.secondary_collector().unwrap_or("").to_owned();
        drop(config);

        let mut data = UveData::new(key);
        data.attrs
            .insert("start_time".to_owned(), self.inner.start_time.to_string());
        data.attrs
            .insert("pid".to_owned(), std::process::id().to_string());
        if let Some(port) = *self.inner.http_port.lock().expect("http port lock") {
            data.attrs.insert("http_port".to_owned(), port.to_string());
        }
        if let Some(client) = self.inner.client.lock().expect("client lock").as_ref() {
            data.attrs
                .insert("status".to_owned(), client.sm.shared.state().as_str().to_owned());
            data.attrs.insert(
                "collector_name".to_owned(),
                client.sm.shared.collector_name(),
            );
            data.attrs.insert(
                "successful_connections".to_owned(),
                client.sm.shared.connect_count().to_string(),
            );
        }
        data.attrs.insert("primary".to_owned(), primary);
        data.attrs.insert("secondary".to_owned(), secondary);
        self.send_uve(CLIENT_INFO_UVE, UvePayload::Data(data));
    }

    fn emit_process_status(
        &self,
        host: &str,
        state: ProcessState,
        description: &str,
        entries: &[ConnInfo],
    ) {
        let config = self.inner.config.lock().expect("config lock");
        let module = config.module.clone();
        let instance_id = config.instance_id.clone();
        drop(config);

        let mut data = UveData::new(host);
        data.attrs
            .insert("module_id".to_owned(), module);
        data.attrs.insert("instance_id".to_owned(), instance_id);
        data.attrs
            .insert("state".to_owned(), state.as_str().to_owned());
        data.attrs
            .insert("description".to_owned(), description.to_owned());
        for entry in entries {
            data.attrs.insert(
                format!("connection:{}:{}", entry.conn_type, entry.name),
                format!(
                    "{};{};{}",
                    entry.status.as_str(),
                    entry.server_addrs.join(" "),
                    entry.description
                ),
            );
        }
        self.send_uve(PROCESS_STATUS_UVE, UvePayload::Data(data));
    }

    // -----------------------------------------------------------------------
    // Request dispatch
    // -----------------------------------------------------------------------

    /// Install a handler for a named request (collector- or introspect-
    /// originated).
    pub fn register_request_handler(
        &self,
        name: &str,
        handler: impl Fn(&Generator, &Message) + Send + Sync + 'static,
    ) {
        self.inner
            .handlers
            .lock()
            .expect("handlers lock")
            .insert(name.to_owned(), Arc::new(handler));
    }

    /// Dispatch a decoded request to its registered handler.
    pub fn dispatch_request(&self, message: &Message) {
        let nbytes = message.encode_body().len() as u64;
        let handler = self
            .inner
            .handlers
            .lock()
            .expect("handlers lock")
            .get(&message.name)
            .cloned();
        match handler {
            Some(handler) => {
                self.inner
                    .stats
                    .update_rx(&message.name, nbytes, RxDropReason::NoDrop);
                handler(self, message);
            }
            None => {
                error!(name = %message.name, "no handler for request");
                self.inner
                    .stats
                    .update_rx(&message.name, nbytes, RxDropReason::CreateFailed);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Trace buffers
    // -----------------------------------------------------------------------

    pub fn trace_buffer_create(&self, name: &str, capacity: usize, enabled: bool) {
        self.inner
            .traces
            .lock()
            .expect("traces lock")
            .create(name, capacity, enabled);
    }

    pub fn trace_buffer_delete(&self, name: &str) {
        self.inner.traces.lock().expect("traces lock").delete(name);
    }

    pub fn trace_buffer_enable(&self, name: &str, enabled: bool) {
        self.inner
            .traces
            .lock()
            .expect("traces lock")
            .set_buffer_enabled(name, enabled);
    }

    pub fn is_trace_buffer_enabled(&self, name: &str) -> bool {
        self.inner
            .traces
            .lock()
            .expect("traces lock")
            .is_buffer_enabled(name)
    }

    pub fn trace_enable(&self, enabled: bool) {
        let mut traces = self.inner.traces.lock().expect("traces lock");
        if enabled {
            traces.enable();
        } else {
            traces.disable();
        }
    }

    pub fn is_trace_enabled(&self) -> bool {
        self.inner.traces.lock().expect("traces lock").is_enabled()
    }

    pub fn trace_buffer_list(&self) -> Vec<String> {
        self.inner.traces.lock().expect("traces lock").list()
    }

    pub fn trace_buffer_capacity(&self, name: &str) -> Option<usize> {
        self.inner.traces.lock().expect("traces lock").capacity(name)
    }

    /// Append a trace message to `buffer`; returns the ring seqno when
    /// tracing is on.
    pub fn trace_write(&self, buffer: &str, mut msg: Message) -> Option<u64> {
        msg.header.kind = Some(MessageKind::Trace);
        msg.header.timestamp = chrono::Utc::now().timestamp_micros();
        self.inner
            .traces
            .lock()
            .expect("traces lock")
            .write(buffer, msg)
    }

    pub fn trace_read(&self, buffer: &str, context: &str, count: usize) -> Vec<(u64, Message)> {
        self.inner
            .traces
            .lock()
            .expect("traces lock")
            .read(buffer, context, count)
    }

    pub fn trace_read_done(&self, buffer: &str, context: &str) {
        self.inner
            .traces
            .lock()
            .expect("traces lock")
            .read_done(buffer, context)
    }

    /// Replay a trace buffer to the collector. Uses a dedicated reader
    /// context, so entries already shipped are never re-sent.
    pub fn send_trace_to_collector(&self, buffer: &str, count: usize) -> usize {
        let entries = self.trace_read(buffer, "Collector", count);
        let sent = entries.len();
        for (_, message) in entries {
            self.send(message);
        }
        sent
    }

    // -----------------------------------------------------------------------
    // Knobs
    // -----------------------------------------------------------------------

    pub fn set_logging_params(
        &self,
        enable_local: bool,
        category: &str,
        level: Level,
        file: &str,
        enable_syslog: bool,
        syslog_facility: &str,
    ) {
        let logging = &self.inner.logging;
        logging.set_local_logging(enable_local);
        logging.set_category(category);
        logging.set_level(level);
        logging.set_file(file, None, None);
        logging.set_syslog(enable_syslog, syslog_facility);
    }

    pub fn logging(&self) -> &LoggingHandle {
        &self.inner.logging
    }

    /// Current send level, `Level::Invalid` when gating is off.
    pub fn send_level(&self) -> Level {
        match self.inner.send_level.load(Ordering::SeqCst) {
            SEND_LEVEL_DISABLED => Level::Invalid,
            value => Level::ALL
                .into_iter()
                .find(|l| *l as i8 == value)
                .unwrap_or(Level::Invalid),
        }
    }

    /// Set the minimum severity accepted for transmission;
    /// `Level::Invalid` disables gating.
    pub fn set_send_level(&self, level: Level) {
        let value = if level == Level::Invalid {
            SEND_LEVEL_DISABLED
        } else {
            level as i8
        };
        let old = self.inner.send_level.swap(value, Ordering::SeqCst);
        if old != value {
            info!(from = old, to = value, "send level changed");
        }
    }

    pub fn is_send_queue_enabled(&self) -> bool {
        self.inner.send_queue_enabled.load(Ordering::SeqCst)
    }

    /// Pause or resume transmission; resuming kicks the session's runner.
    pub fn set_send_queue(&self, enable: bool) {
        let was = self.inner.send_queue_enabled.swap(enable, Ordering::SeqCst);
        if was != enable {
            info!(from = was, to = enable, "send queue toggled");
            if enable {
                if let Some(client) = self.inner.client.lock().expect("client lock").as_ref() {
                    if let Some(session) = client.sm.shared.session() {
                        session.kick_runner();
                    }
                }
            }
        }
    }

    pub fn set_system_log_rate_limit(&self, per_second: usize) {
        self.inner
            .rate_limiter
            .lock()
            .expect("rate limiter lock")
            .set_capacity(per_second);
    }

    /// Replace the collector list; the state machine reconnects as needed.
    pub fn reconfig_collectors(&self, collectors: Vec<String>) {
        let (primary, secondary) = {
            let mut config = self.inner.config.lock().expect("config lock");
            config.collectors = collectors;
            (
                config.primary_collector().map(str::to_owned),
                config.secondary_collector().map(str::to_owned),
            )
        };
        if let Some(client) = self.inner.client.lock().expect("client lock").as_ref() {
            client.sm.collector_change(primary, secondary);
        }
    }

    // -----------------------------------------------------------------------
    // Accessors (introspect and embedding services)
    // -----------------------------------------------------------------------

    pub fn stats(&self) -> &StatsHandle {
        &self.inner.stats
    }

    pub fn uve_cache(&self) -> &UveCache {
        &self.inner.uve_cache
    }

    pub fn connection_state(&self) -> &ConnectionState {
        &self.inner.conn_state
    }

    pub fn module(&self) -> String {
        self.inner.config.lock().expect("config lock").module.clone()
    }

    pub fn source(&self) -> String {
        self.inner.config.lock().expect("config lock").source.clone()
    }

    pub fn http_port(&self) -> Option<u16> {
        *self.inner.http_port.lock().expect("http port lock")
    }

    pub fn is_unit_test(&self) -> bool {
        self.inner.config.lock().expect("config lock").unit_test
    }

    /// Collector connection view: `(remote name, state, connect count)`.
    pub fn collector_info(&self) -> (String, String, u32) {
        match self.inner.client.lock().expect("client lock").as_ref() {
            Some(client) => (
                client.sm.shared.collector_name(),
                client.sm.shared.state().as_str().to_owned(),
                client.sm.shared.connect_count(),
            ),
            None => (String::new(), "Idle".to_owned(), 0),
        }
    }

    pub fn active_collector(&self) -> Option<String> {
        self.inner
            .client
            .lock()
            .expect("client lock")
            .as_ref()
            .and_then(|client| client.sm.shared.active_collector())
    }

    /// Send-queue counters of the live session, if any.
    pub fn session_queue_stats(&self) -> Option<crate::queue::QueueStats> {
        self.inner
            .client
            .lock()
            .expect("client lock")
            .as_ref()
            .and_then(|client| client.sm.shared.session())
            .map(|session| session.send_queue().stats())
    }

    // -----------------------------------------------------------------------
    // Side channel and teardown
    // -----------------------------------------------------------------------

    /// Announce a locally bound port by writing `<port>\n` to the named
    /// pipe `/tmp/<module>.<parent_pid>.<name>_port`, when it exists.
    pub fn record_port(&self, name: &str, port: u16) {
        let module = self.module();
        let pipe = format!(
            "/tmp/{}.{}.{}_port",
            module,
            std::os::unix::process::parent_id(),
            name
        );
        if !std::path::Path::new(&pipe).exists() {
            debug!(pipe = %pipe, "port pipe absent, not recording port");
            return;
        }
        match std::fs::OpenOptions::new().write(true).open(&pipe) {
            Ok(mut file) => {
                use std::io::Write as _;
                if let Err(e) = writeln!(file, "{port}") {
                    error!(pipe = %pipe, error = %e, "cannot write port to pipe");
                } else {
                    info!(pipe = %pipe, port, "recorded port");
                }
            }
            Err(e) => error!(pipe = %pipe, error = %e, "cannot open port pipe"),
        }
    }

    /// Tear everything down. Safe to call more than once.
    pub fn uninit(&self) {
        if self.inner.uninitialized.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("generator shutting down");
        if let Some(mut client) = self.inner.client.lock().expect("client lock").take() {
            client.shutdown();
        }
        if let Some(task) = self
            .inner
            .introspect_task
            .lock()
            .expect("introspect task lock")
            .take()
        {
            task.abort();
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn next_seqnum(&self) -> u64 {
        self.inner.seqnum.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn element(&self, msg: &Message, level: Level) -> SendElement {
        SendElement {
            name: msg.name.clone(),
            level,
            category: msg.header.category.clone(),
            log_line: log_line(msg),
            frame: msg.encode_frame(),
        }
    }
}

fn log_line(msg: &Message) -> String {
    format!("{}: {}", msg.name, msg.payload.to_xml_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_info::ConnStatus;
    use base64::Engine as _;

    fn test_config() -> GeneratorConfig {
        let mut config = GeneratorConfig::new("generator-test", "host-1");
        config.connect_to_collector = false;
        config.http_port = None;
        config
    }

    fn payload(name: &str) -> XmlElement {
        XmlElement::new(name).child(XmlElement::leaf("what", "test"))
    }

    #[tokio::test]
    async fn log_only_mode_accepts_and_counts_sends() {
        let generator = Generator::init(test_config(), vec![]).await;
        let msg = generator.message(
            MessageKind::AsyncSystem,
            "SystemLogTest",
            Level::Info,
            payload("SystemLogTest"),
        );
        assert_eq!(generator.send(msg), 0);
        let aggregate = generator.stats().aggregate();
        assert_eq!(aggregate.messages_sent, 1);
        generator.uninit();
    }

    #[tokio::test]
    async fn send_level_gate_drops_less_severe_messages() {
        let generator = Generator::init(test_config(), vec![]).await;
        generator.set_send_level(Level::Warning);
        for (level, expect) in [
            (Level::Error, 0),
            (Level::Warning, -1),
            (Level::Notice, -1),
            (Level::Debug, -1),
        ] {
            let msg = generator.message(
                MessageKind::AsyncObject,
                "GateTest",
                level,
                payload("GateTest"),
            );
            assert_eq!(generator.send(msg), expect, "level {level}");
        }
        let aggregate = generator.stats().aggregate();
        assert_eq!(aggregate.tx_drop(TxDropReason::QueueLevel).messages, 3);

        // Disabling the gate restores acceptance.
        generator.set_send_level(Level::Invalid);
        let msg = generator.message(
            MessageKind::AsyncObject,
            "GateTest",
            Level::Debug,
            payload("GateTest"),
        );
        assert_eq!(generator.send(msg), 0);
        generator.uninit();
    }

    #[tokio::test]
    async fn system_logs_are_rate_limited_per_second() {
        let mut config = test_config();
        config.system_log_rate_limit = 10;
        let generator = Generator::init(config, vec![]).await;
        let mut accepted = 0;
        for _ in 0..15 {
            let msg = generator.message(
                MessageKind::AsyncSystem,
                "SystemLogTest",
                Level::Info,
                payload("SystemLogTest"),
            );
            if generator.send(msg) == 0 {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 10);
        let aggregate = generator.stats().aggregate();
        assert_eq!(aggregate.tx_drop(TxDropReason::RatelimitDrop).messages, 5);
        generator.uninit();
    }

    #[tokio::test]
    async fn uve_submissions_populate_the_cache() {
        let generator =
            Generator::init(test_config(), vec![UveTypeDesc::new("UVETest")]).await;
        let mut data = UveData::new("uve1");
        data.attrs.insert("xyz".to_owned(), "345".to_owned());
        assert_eq!(generator.send_uve("UVETest", UvePayload::Data(data)), 0);

        let entries = generator.uve_cache().dump_type("UVETest").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].seqno, 1);

        // Unregistered type is a validation failure.
        assert_eq!(
            generator.send_uve("NotRegistered", UvePayload::Data(UveData::new("x"))),
            -1
        );
        generator.uninit();
    }

    #[tokio::test]
    async fn process_status_rollup_emits_uve_on_host_key() {
        let generator = Generator::init(test_config(), vec![]).await;
        generator
            .connection_state()
            .update("Test", "Test1", ConnStatus::Up, vec![], "");
        generator
            .connection_state()
            .update("Test", "Test2", ConnStatus::Down, vec![], "Test2 DOWN");

        let entries = generator.uve_cache().dump_type(PROCESS_STATUS_UVE).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].data.name(), "host-1");
        match &entries[0].data {
            UvePayload::Data(data) => {
                assert_eq!(
                    data.attrs.get("description").map(String::as_str),
                    Some("Test:Test2[Test2 DOWN] connection down")
                );
            }
            UvePayload::Dynamic(_) => panic!("wrong payload shape"),
        }
        generator.uninit();
    }

    #[tokio::test]
    async fn trace_writes_stamp_ring_seqno_into_category() {
        let generator = Generator::init(test_config(), vec![]).await;
        generator.trace_buffer_create("boot", 3, true);
        let msg = generator.message(
            MessageKind::Trace,
            "TraceTest",
            Level::Debug,
            payload("TraceTest"),
        );
        assert_eq!(generator.trace_write("boot", msg.clone()), Some(1));
        assert_eq!(generator.trace_write("boot", msg), Some(2));

        let read = generator.trace_read("boot", "ctx", 0);
        assert_eq!(read.len(), 2);
        assert_eq!(read[0].1.header.category, "1");
        assert_eq!(read[1].1.header.category, "2");
        generator.uninit();
    }

    #[tokio::test]
    async fn http_context_responses_render_to_buffer_not_wire() {
        let generator = Generator::init(test_config(), vec![]).await;
        let mut msg = generator.message(
            MessageKind::Response,
            "PingResponse",
            Level::Info,
            payload("PingResponse"),
        );
        msg.header.context = "http://req-1".to_owned();
        assert_eq!(generator.send_response(msg), 0);
        let body = generator.take_http_response("http://req-1").unwrap();
        assert!(body.contains("PingResponse"));
        // Taking the response clears the buffer.
        assert!(generator.take_http_response("http://req-1").is_none());
        generator.uninit();
    }

    #[tokio::test]
    async fn alarms_carry_a_base64_token() {
        let generator =
            Generator::init(test_config(), vec![UveTypeDesc::new("AlarmTest")]).await;
        let mut data = UveData::new("node-1");
        data.attrs
            .insert("severity".to_owned(), "raised".to_owned());
        assert_eq!(generator.send_alarm("AlarmTest", UvePayload::Data(data)), 0);

        let entries = generator.uve_cache().dump_type("AlarmTest").unwrap();
        match &entries[0].data {
            UvePayload::Data(data) => {
                let token = data.attrs.get("token").expect("alarm token attached");
                let decoded = BASE64.decode(token).expect("token is valid base64");
                let decoded = String::from_utf8(decoded).unwrap();
                assert!(decoded.starts_with("host-1:"));
            }
            UvePayload::Dynamic(_) => panic!("wrong payload shape"),
        }
        generator.uninit();
    }

    #[tokio::test]
    async fn trace_replay_to_collector_never_resends_entries() {
        let generator = Generator::init(test_config(), vec![]).await;
        generator.trace_buffer_create("events", 8, true);
        for _ in 0..3 {
            let msg = generator.message(
                MessageKind::Trace,
                "TraceTest",
                Level::Debug,
                payload("TraceTest"),
            );
            generator.trace_write("events", msg);
        }

        assert_eq!(generator.send_trace_to_collector("events", 0), 3);
        // Nothing new since the last run: nothing is re-sent.
        assert_eq!(generator.send_trace_to_collector("events", 0), 0);

        let msg = generator.message(
            MessageKind::Trace,
            "TraceTest",
            Level::Debug,
            payload("TraceTest"),
        );
        generator.trace_write("events", msg);
        assert_eq!(generator.send_trace_to_collector("events", 0), 1);
        generator.uninit();
    }

    #[tokio::test]
    async fn uninit_is_idempotent() {
        let generator = Generator::init(test_config(), vec![]).await;
        generator.uninit();
        generator.uninit();
    }
}
