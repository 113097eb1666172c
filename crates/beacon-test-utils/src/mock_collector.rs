// mock_collector: A mock Collector endpoint for testing the generator.
//
// Accepts framed TCP connections, validates the control handshake, replies
// with a configurable control message (success flag + per-type sequence
// baselines), and records every decoded message for assertions.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use beacon_protocol::frame::FrameDecoder;
use beacon_protocol::{
    CTRL_SERVER_TO_CLIENT, CtrlServerToClient, HINT_CONTROL, Level, Message, MessageHeader,
    MessageKind, UveTypeSeqno,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Scripted behavior for the mock.
#[derive(Debug, Clone)]
pub struct MockCollectorConfig {
    /// `success` flag carried in the control reply. `false` makes the
    /// client drop the session and retry, like a failed negotiation.
    pub reply_success: bool,
    /// Per-type sequence baselines sent to the client in the reply.
    pub baselines: Vec<(String, u64)>,
    /// Identity reported in the reply's header source field.
    pub name: String,
}

impl Default for MockCollectorConfig {
    fn default() -> Self {
        MockCollectorConfig {
            reply_success: true,
            baselines: Vec::new(),
            name: "mock-collector".to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// MockCollector
// ---------------------------------------------------------------------------

/// A mock Collector bound to an ephemeral localhost port.
///
/// Each test spins up its own isolated instance. Every decoded message
/// (the control handshake included) is captured in arrival order.
pub struct MockCollector {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<Message>>>,
    connections: Arc<AtomicUsize>,
    conn_tasks: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>,
    _accept_task: tokio::task::JoinHandle<()>,
}

impl MockCollector {
    /// Start the mock, binding a random available port.
    pub async fn start(config: MockCollectorConfig) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let received = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let conn_tasks = Arc::new(Mutex::new(Vec::new()));

        let accept_task = {
            let received = received.clone();
            let connections = connections.clone();
            let conn_tasks = conn_tasks.clone();
            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, peer)) => {
                            debug!(%peer, "mock collector accepted connection");
                            connections.fetch_add(1, Ordering::SeqCst);
                            let received = received.clone();
                            let config = config.clone();
                            let task = tokio::spawn(async move {
                                let _ = handle_connection(stream, received, config).await;
                            });
                            conn_tasks.lock().expect("conn tasks lock").push(task);
                        }
                        Err(_) => break,
                    }
                }
            })
        };

        Ok(MockCollector {
            addr,
            received,
            connections,
            conn_tasks,
            _accept_task: accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// The `host:port` string for the generator's collector list.
    pub fn endpoint(&self) -> String {
        self.addr.to_string()
    }

    /// Snapshot of every message decoded so far, in arrival order.
    pub fn received(&self) -> Vec<Message> {
        self.received.lock().expect("received lock").clone()
    }

    /// Messages with the given payload name.
    pub fn received_named(&self, name: &str) -> Vec<Message> {
        self.received()
            .into_iter()
            .filter(|m| m.name == name)
            .collect()
    }

    /// Number of TCP connections accepted since start.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Poll until a message named `name` has arrived, or time out.
    pub async fn wait_for_message(
        &self,
        name: &str,
        timeout: std::time::Duration,
    ) -> Option<Message> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(message) = self.received_named(name).into_iter().next() {
                return Some(message);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    /// Kill every live connection (simulates a collector restart). The
    /// listener stays up, so clients can reconnect.
    pub fn drop_connections(&self) {
        for task in self.conn_tasks.lock().expect("conn tasks lock").drain(..) {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Per-connection handler
// ---------------------------------------------------------------------------

async fn handle_connection(
    mut stream: TcpStream,
    received: Arc<Mutex<Vec<Message>>>,
    config: MockCollectorConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; 4096];
    let mut handshake_done = false;
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        for body in decoder.feed(&buf[..n])? {
            let message = Message::decode_body(&body)?;
            let is_control = message.header.hints & HINT_CONTROL != 0;
            received.lock().expect("received lock").push(message);
            // The first control message triggers the scripted reply.
            if is_control && !handshake_done {
                handshake_done = true;
                let reply = control_reply(&config);
                stream.write_all(reply.encode_frame().as_bytes()).await?;
            }
        }
    }
}

fn control_reply(config: &MockCollectorConfig) -> Message {
    let ctrl = CtrlServerToClient {
        success: config.reply_success,
        type_info: config
            .baselines
            .iter()
            .map(|(type_name, seqno)| UveTypeSeqno {
                type_name: type_name.clone(),
                seqno: *seqno,
            })
            .collect(),
    };
    Message {
        header: MessageHeader {
            source: config.name.clone(),
            module: "collector".to_owned(),
            kind: Some(MessageKind::Response),
            level: Some(Level::Info),
            hints: HINT_CONTROL,
            ..MessageHeader::default()
        },
        name: CTRL_SERVER_TO_CLIENT.to_owned(),
        payload: ctrl.to_payload(),
    }
}
