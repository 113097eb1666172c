//! Collector session: one TCP connection with a framed reader and a
//! coalescing writer.
//!
//! A session is created by the state machine for each connect attempt and
//! carries a generation id so events from torn-down sessions can be
//! recognized and dropped. The reader task feeds raw bytes into the frame
//! decoder and hands complete bodies to the dispatcher; a framing error
//! closes the session. The writer drains the send queue, concatenating
//! frames up to a 4 KiB cache while more are queued to amortize syscalls.
//!
//! # Lifecycle
//! `start_connect` -> `Established` or `Error` event ->
//! (state machine) `start_reader` -> frames flow -> `Close` event on
//! remote close, read error, or framing error. `close` is idempotent and
//! the only way a session ends locally.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use beacon_protocol::{Level, TxDropReason, frame::FrameDecoder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::logging::LoggingHandle;
use crate::queue::WorkQueue;
use crate::stats::StatsHandle;

/// Writer cache cap: frames are coalesced up to this size while the queue
/// holds more of them.
const MAX_SEND_BUF_SIZE: usize = 4096;
/// TCP connect deadline for a single attempt (the state machine's connect
/// timer bounds the whole exchange separately).
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const KEEPALIVE_IDLE: Duration = Duration::from_secs(15);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(3);
const KEEPALIVE_PROBES: u32 = 5;
#[cfg(target_os = "linux")]
const TCP_USER_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Events and queue elements
// ---------------------------------------------------------------------------

/// Session lifecycle events delivered to the state machine, tagged with the
/// session generation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// TCP connect completed.
    Established,
    /// TCP connect failed.
    Error,
    /// Remote close, read error, or framing error.
    Close,
}

/// One queued outbound message: the pre-encoded frame plus what the writer
/// needs for self-logging and statistics.
#[derive(Debug, Clone)]
pub struct SendElement {
    pub name: String,
    pub level: Level,
    pub category: String,
    pub log_line: String,
    pub frame: String,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Session {
    /// Generation id; events carrying a stale id are ignored upstream.
    pub id: u64,
    peer: String,
    event_tx: mpsc::UnboundedSender<(u64, SessionEvent)>,
    frame_tx: mpsc::UnboundedSender<(u64, String)>,
    send_queue: Arc<WorkQueue<SendElement>>,
    stats: StatsHandle,
    logging: LoggingHandle,
    connected: Arc<AtomicBool>,
    closed: AtomicBool,
    read_half: std::sync::Mutex<Option<OwnedReadHalf>>,
    write_half: Arc<tokio::sync::Mutex<Option<OwnedWriteHalf>>>,
    write_cache: Arc<tokio::sync::Mutex<String>>,
    tasks: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Session {
    /// Create a session and start its writer runner. `send_queue_enabled`
    /// is the generator-wide transmit switch observed by the runner
    /// predicate alongside the connection state.
    pub fn new(
        id: u64,
        peer: String,
        event_tx: mpsc::UnboundedSender<(u64, SessionEvent)>,
        frame_tx: mpsc::UnboundedSender<(u64, String)>,
        stats: StatsHandle,
        logging: LoggingHandle,
        send_queue_enabled: Arc<AtomicBool>,
    ) -> Arc<Self> {
        let connected = Arc::new(AtomicBool::new(false));
        let session = Arc::new(Session {
            id,
            peer,
            event_tx,
            frame_tx,
            send_queue: Arc::new(WorkQueue::new()),
            stats,
            logging,
            connected: connected.clone(),
            closed: AtomicBool::new(false),
            read_half: std::sync::Mutex::new(None),
            write_half: Arc::new(tokio::sync::Mutex::new(None)),
            write_cache: Arc::new(tokio::sync::Mutex::new(String::new())),
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        {
            let connected = connected.clone();
            session.send_queue.set_start_runner(Some(Box::new(move || {
                connected.load(Ordering::SeqCst) && send_queue_enabled.load(Ordering::SeqCst)
            })));
        }
        let runner = {
            let session = session.clone();
            let queue = session.send_queue.clone();
            tokio::spawn(queue.run(move |element| {
                let session = session.clone();
                async move {
                    session.write_element(element).await;
                }
            }))
        };
        session.tasks.lock().expect("session tasks lock").push(runner);
        session
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn send_queue(&self) -> &Arc<WorkQueue<SendElement>> {
        &self.send_queue
    }

    /// Queue an element for transmission. Returns false once the session is
    /// closed or the bounded queue rejected it.
    pub fn enqueue(&self, element: SendElement) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let weight = element.frame.len() as u64;
        self.send_queue.enqueue(element, weight)
    }

    /// Wake the writer runner (after the send-queue switch flips back on).
    pub fn kick_runner(&self) {
        self.send_queue.kick();
    }

    // -----------------------------------------------------------------------
    // Connect / reader tasks
    // -----------------------------------------------------------------------

    /// Start the TCP connect attempt; emits `Established` or `Error`.
    pub fn start_connect(self: &Arc<Self>) {
        let session = self.clone();
        let task = tokio::spawn(async move {
            let attempt = tokio::time::timeout(
                CONNECT_TIMEOUT,
                TcpStream::connect(session.peer.clone()),
            )
            .await;
            match attempt {
                Ok(Ok(stream)) => {
                    session.configure_socket(&stream);
                    let (read, write) = stream.into_split();
                    *session.read_half.lock().expect("session read half lock") = Some(read);
                    *session.write_half.lock().await = Some(write);
                    session.connected.store(true, Ordering::SeqCst);
                    session.send_queue.kick();
                    info!(peer = %session.peer, session = session.id, "collector session connected");
                    session.emit(SessionEvent::Established);
                }
                Ok(Err(e)) => {
                    warn!(peer = %session.peer, session = session.id, error = %e, "collector connect failed");
                    session.emit(SessionEvent::Error);
                }
                Err(_) => {
                    warn!(peer = %session.peer, session = session.id, "collector connect timed out");
                    session.emit(SessionEvent::Error);
                }
            }
        });
        self.tasks.lock().expect("session tasks lock").push(task);
    }

    /// Start the reader loop. Called once the state machine enters
    /// ClientInit; bytes flow through the frame decoder from here on.
    pub fn start_reader(self: &Arc<Self>) {
        let Some(mut read_half) = self.read_half.lock().expect("session read half lock").take()
        else {
            return;
        };
        let session = self.clone();
        let task = tokio::spawn(async move {
            let mut decoder = FrameDecoder::new();
            let mut buf = vec![0u8; 4096];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => {
                        debug!(session = session.id, "collector closed the connection");
                        session.emit(SessionEvent::Close);
                        return;
                    }
                    Ok(n) => match decoder.feed(&buf[..n]) {
                        Ok(bodies) => {
                            for body in bodies {
                                let _ = session.frame_tx.send((session.id, body));
                            }
                        }
                        Err(e) => {
                            error!(session = session.id, error = %e, "framing error, closing collector session");
                            session.emit(SessionEvent::Close);
                            return;
                        }
                    },
                    Err(e) => {
                        warn!(session = session.id, error = %e, "read error on collector session");
                        session.emit(SessionEvent::Close);
                        return;
                    }
                }
            }
        });
        self.tasks.lock().expect("session tasks lock").push(task);
    }

    /// Close at most once: stop tasks, drop the socket, drain the queue.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connected.store(false, Ordering::SeqCst);
        for task in self.tasks.lock().expect("session tasks lock").drain(..) {
            task.abort();
        }
        self.read_half.lock().expect("session read half lock").take();
        self.send_queue.clear();
    }

    // -----------------------------------------------------------------------
    // Writer
    // -----------------------------------------------------------------------

    async fn write_element(&self, element: SendElement) {
        if !self.connected.load(Ordering::SeqCst) {
            self.stats.update_tx(
                &element.name,
                element.frame.len() as u64,
                TxDropReason::SessionNotConnected,
            );
            self.logging.log_drop(
                "session not connected",
                element.level,
                &element.log_line,
                chrono::Utc::now().timestamp(),
            );
            return;
        }
        if self.logging.is_logging_allowed(element.level, &element.category) {
            self.logging.log_at(element.level, &element.log_line);
        }
        self.stats
            .update_tx(&element.name, element.frame.len() as u64, TxDropReason::NoDrop);

        // Coalesce while more frames are queued; flush on cap or burst end.
        let more = !self.send_queue.is_empty();
        let flush = {
            let mut cache = self.write_cache.lock().await;
            cache.push_str(&element.frame);
            if more && cache.len() < MAX_SEND_BUF_SIZE {
                None
            } else {
                Some(std::mem::take(&mut *cache))
            }
        };
        if let Some(buf) = flush {
            self.write_bytes(buf.as_bytes()).await;
        }
    }

    async fn write_bytes(&self, buf: &[u8]) {
        let mut guard = self.write_half.lock().await;
        let Some(write_half) = guard.as_mut() else {
            return;
        };
        if let Err(e) = write_half.write_all(buf).await {
            error!(session = self.id, error = %e, "write error on collector session");
        }
    }

    // -----------------------------------------------------------------------
    // Socket options
    // -----------------------------------------------------------------------

    /// Keepalive and user-timeout are best-effort; a platform refusing them
    /// degrades detection latency, not correctness.
    fn configure_socket(&self, stream: &TcpStream) {
        let sock = socket2::SockRef::from(stream);
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(KEEPALIVE_IDLE)
            .with_interval(KEEPALIVE_INTERVAL)
            .with_retries(KEEPALIVE_PROBES);
        if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
            warn!(session = self.id, error = %e, "failed to set TCP keepalive");
        }
        #[cfg(target_os = "linux")]
        if let Err(e) = sock.set_tcp_user_timeout(Some(TCP_USER_TIMEOUT)) {
            warn!(session = self.id, error = %e, "failed to set TCP user timeout");
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send((self.id, event));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
