// beacon-protocol: Collector link protocol types and serialization.
//
// Everything that crosses the wire lives here: the message header, severity
// levels, message kinds, hint flags, drop reasons, the control handshake
// messages, and the UVE payload model. The framed envelope codec is in
// `frame`; the small element model both sides are built on is in `xml`.

pub mod frame;
pub mod xml;

use std::collections::BTreeMap;
use std::fmt;

use crate::xml::XmlElement;

// ---------------------------------------------------------------------------
// Wire constants
// ---------------------------------------------------------------------------

/// Body carries a user-visible primary key.
pub const HINT_KEY: u32 = 0x1;
/// Message is addressed to the connection state machine, not a handler.
pub const HINT_CONTROL: u32 = 0x2;
/// UVE is a sync replay carrying its original sequence number.
pub const HINT_SYNC_REPLAY: u32 = 0x4;

/// Wire name of the client-side control handshake message.
pub const CTRL_CLIENT_TO_SERVER: &str = "SandeshCtrlClientToServer";
/// Wire name of the collector's control reply. A `HINT_CONTROL` payload with
/// any other name is a protocol error.
pub const CTRL_SERVER_TO_CLIENT: &str = "SandeshCtrlServerToClient";

// ---------------------------------------------------------------------------
// Level
// ---------------------------------------------------------------------------

/// Message severity. Lower values are more severe; `Debug` is the least
/// severe deliverable level. The `Ut*` range short-circuits delivery under
/// unit test, and `Invalid` is the unset sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i8)]
pub enum Level {
    Invalid = -1,
    Emergency = 0,
    Alert = 1,
    Critical = 2,
    Error = 3,
    Warning = 4,
    Notice = 5,
    Info = 6,
    Debug = 7,
    UtStart = 8,
    UtDebug = 9,
    UtEnd = 10,
}

impl Level {
    pub const ALL: [Level; 8] = [
        Level::Emergency,
        Level::Alert,
        Level::Critical,
        Level::Error,
        Level::Warning,
        Level::Notice,
        Level::Info,
        Level::Debug,
    ];

    /// True for the reserved unit-test range.
    pub fn is_unit_test(self) -> bool {
        Level::UtStart <= self && self <= Level::UtEnd
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Level::Invalid => "invalid",
            Level::Emergency => "emergency",
            Level::Alert => "alert",
            Level::Critical => "critical",
            Level::Error => "error",
            Level::Warning => "warning",
            Level::Notice => "notice",
            Level::Info => "info",
            Level::Debug => "debug",
            Level::UtStart => "ut-start",
            Level::UtDebug => "ut-debug",
            Level::UtEnd => "ut-end",
        }
    }

    pub fn parse(name: &str) -> Option<Level> {
        match name {
            "invalid" => Some(Level::Invalid),
            "emergency" => Some(Level::Emergency),
            "alert" => Some(Level::Alert),
            "critical" => Some(Level::Critical),
            "error" => Some(Level::Error),
            "warning" => Some(Level::Warning),
            "notice" => Some(Level::Notice),
            "info" => Some(Level::Info),
            "debug" => Some(Level::Debug),
            "ut-start" => Some(Level::UtStart),
            "ut-debug" => Some(Level::UtDebug),
            "ut-end" => Some(Level::UtEnd),
            _ => None,
        }
    }

    fn from_i8(value: i8) -> Option<Level> {
        match value {
            -1 => Some(Level::Invalid),
            0 => Some(Level::Emergency),
            1 => Some(Level::Alert),
            2 => Some(Level::Critical),
            3 => Some(Level::Error),
            4 => Some(Level::Warning),
            5 => Some(Level::Notice),
            6 => Some(Level::Info),
            7 => Some(Level::Debug),
            8 => Some(Level::UtStart),
            9 => Some(Level::UtDebug),
            10 => Some(Level::UtEnd),
            _ => None,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// MessageKind
// ---------------------------------------------------------------------------

/// Tagged message variant carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    AsyncSystem,
    AsyncObject,
    AsyncFlow,
    Request,
    Response,
    Trace,
    Uve,
    Alarm,
    DynamicUve,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::AsyncSystem => "system",
            MessageKind::AsyncObject => "object",
            MessageKind::AsyncFlow => "flow",
            MessageKind::Request => "request",
            MessageKind::Response => "response",
            MessageKind::Trace => "trace",
            MessageKind::Uve => "uve",
            MessageKind::Alarm => "alarm",
            MessageKind::DynamicUve => "dynamic-uve",
        }
    }

    pub fn parse(name: &str) -> Option<MessageKind> {
        match name {
            "system" => Some(MessageKind::AsyncSystem),
            "object" => Some(MessageKind::AsyncObject),
            "flow" => Some(MessageKind::AsyncFlow),
            "request" => Some(MessageKind::Request),
            "response" => Some(MessageKind::Response),
            "trace" => Some(MessageKind::Trace),
            "uve" => Some(MessageKind::Uve),
            "alarm" => Some(MessageKind::Alarm),
            "dynamic-uve" => Some(MessageKind::DynamicUve),
            _ => None,
        }
    }

    /// UVE-family kinds go through the cache rather than the plain send path.
    pub fn is_uve(self) -> bool {
        matches!(
            self,
            MessageKind::Uve | MessageKind::Alarm | MessageKind::DynamicUve
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Drop reasons
// ---------------------------------------------------------------------------

/// Why an outgoing message was not sent. `NoDrop` marks a successful send in
/// the statistics registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxDropReason {
    NoDrop,
    ValidationFailed,
    RatelimitDrop,
    QueueLevel,
    NoClient,
    NoSession,
    NoQueue,
    ClientSendFailed,
    HeaderWriteFailed,
    WriteFailed,
    SessionNotConnected,
    WrongClientSmState,
}

impl TxDropReason {
    pub const DROPS: [TxDropReason; 11] = [
        TxDropReason::ValidationFailed,
        TxDropReason::RatelimitDrop,
        TxDropReason::QueueLevel,
        TxDropReason::NoClient,
        TxDropReason::NoSession,
        TxDropReason::NoQueue,
        TxDropReason::ClientSendFailed,
        TxDropReason::HeaderWriteFailed,
        TxDropReason::WriteFailed,
        TxDropReason::SessionNotConnected,
        TxDropReason::WrongClientSmState,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TxDropReason::NoDrop => "no_drop",
            TxDropReason::ValidationFailed => "validation_failed",
            TxDropReason::RatelimitDrop => "ratelimit_drop",
            TxDropReason::QueueLevel => "queue_level",
            TxDropReason::NoClient => "no_client",
            TxDropReason::NoSession => "no_session",
            TxDropReason::NoQueue => "no_queue",
            TxDropReason::ClientSendFailed => "client_send_failed",
            TxDropReason::HeaderWriteFailed => "header_write_failed",
            TxDropReason::WriteFailed => "write_failed",
            TxDropReason::SessionNotConnected => "session_not_connected",
            TxDropReason::WrongClientSmState => "wrong_client_sm_state",
        }
    }
}

/// Why an incoming message was not dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RxDropReason {
    NoDrop,
    QueueLevel,
    NoQueue,
    ControlMsgFailed,
    CreateFailed,
    DecodingFailed,
}

impl RxDropReason {
    pub const DROPS: [RxDropReason; 5] = [
        RxDropReason::QueueLevel,
        RxDropReason::NoQueue,
        RxDropReason::ControlMsgFailed,
        RxDropReason::CreateFailed,
        RxDropReason::DecodingFailed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RxDropReason::NoDrop => "no_drop",
            RxDropReason::QueueLevel => "queue_level",
            RxDropReason::NoQueue => "no_queue",
            RxDropReason::ControlMsgFailed => "control_msg_failed",
            RxDropReason::CreateFailed => "create_failed",
            RxDropReason::DecodingFailed => "decoding_failed",
        }
    }
}

// ---------------------------------------------------------------------------
// MessageHeader
// ---------------------------------------------------------------------------

/// The header written ahead of every payload on the collector link.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageHeader {
    pub scope: String,
    /// Wall-clock µs since the Unix epoch, stamped at submission.
    pub timestamp: i64,
    pub module: String,
    pub source: String,
    pub context: String,
    /// Process-wide monotonic sequence number, assigned at submission.
    pub sequence: u64,
    pub version_sig: u64,
    pub kind: Option<MessageKind>,
    pub hints: u32,
    pub level: Option<Level>,
    pub category: String,
    pub node_type: String,
    pub instance_id: String,
}

impl MessageHeader {
    pub fn to_xml(&self) -> XmlElement {
        let mut element = XmlElement::new("header")
            .attr("scope", &self.scope)
            .attr("timestamp", self.timestamp.to_string())
            .attr("module", &self.module)
            .attr("source", &self.source)
            .attr("context", &self.context)
            .attr("sequence", self.sequence.to_string())
            .attr("version", self.version_sig.to_string())
            .attr("hints", self.hints.to_string())
            .attr("category", &self.category)
            .attr("node-type", &self.node_type)
            .attr("instance-id", &self.instance_id);
        if let Some(kind) = self.kind {
            element = element.attr("kind", kind.as_str());
        }
        if let Some(level) = self.level {
            element = element.attr("level", (level as i8).to_string());
        }
        element
    }

    pub fn from_xml(element: &XmlElement) -> Result<MessageHeader, WireError> {
        if element.name != "header" {
            return Err(WireError::MissingHeader);
        }
        let attr = |key: &str| element.attribute(key).unwrap_or("").to_owned();
        let parse_num = |key: &str| -> Result<i64, WireError> {
            match element.attribute(key) {
                None | Some("") => Ok(0),
                Some(raw) => raw
                    .parse()
                    .map_err(|_| WireError::BadHeaderField(key.to_owned())),
            }
        };
        let kind = match element.attribute("kind") {
            None | Some("") => None,
            Some(raw) => Some(
                MessageKind::parse(raw).ok_or_else(|| WireError::BadHeaderField("kind".into()))?,
            ),
        };
        let level = match element.attribute("level") {
            None | Some("") => None,
            Some(raw) => {
                let value: i8 = raw
                    .parse()
                    .map_err(|_| WireError::BadHeaderField("level".into()))?;
                Some(Level::from_i8(value).ok_or_else(|| WireError::BadHeaderField("level".into()))?)
            }
        };
        Ok(MessageHeader {
            scope: attr("scope"),
            timestamp: parse_num("timestamp")?,
            module: attr("module"),
            source: attr("source"),
            context: attr("context"),
            sequence: parse_num("sequence")? as u64,
            version_sig: parse_num("version")? as u64,
            kind,
            hints: parse_num("hints")? as u32,
            level,
            category: attr("category"),
            node_type: attr("node-type"),
            instance_id: attr("instance-id"),
        })
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// One decoded (or to-be-encoded) message body: the header, the payload
/// element name, and the payload element itself. The payload grammar is
/// owned by the submitting type; beacon treats it as opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: MessageHeader,
    pub name: String,
    pub payload: XmlElement,
}

impl Message {
    /// Serialize the body (header + payload) without the envelope.
    pub fn encode_body(&self) -> String {
        let mut out = String::new();
        self.header.to_xml().write_to(&mut out);
        self.payload.write_to(&mut out);
        out
    }

    /// Serialize the full on-wire frame, envelope included.
    pub fn encode_frame(&self) -> String {
        frame::encode(&self.encode_body())
    }

    /// Parse a body produced by `encode_body` (the BODY yielded by the
    /// frame decoder): a `header` element followed by one payload element.
    pub fn decode_body(body: &str) -> Result<Message, WireError> {
        let (header_element, consumed) = XmlElement::parse_prefix(body)?;
        let header = MessageHeader::from_xml(&header_element)?;
        let (payload, _) = XmlElement::parse_prefix(&body[consumed..])?;
        Ok(Message {
            header,
            name: payload.name.clone(),
            payload,
        })
    }
}

/// Body-level decode errors (distinct from envelope framing errors).
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("body does not start with a header element")]
    MissingHeader,
    #[error("bad header field '{0}'")]
    BadHeaderField(String),
    #[error("control message field '{0}' is invalid")]
    BadControlField(String),
    #[error("unexpected payload element '{0}'")]
    UnexpectedPayload(String),
    #[error(transparent)]
    Xml(#[from] xml::XmlError),
}

// ---------------------------------------------------------------------------
// Control messages
// ---------------------------------------------------------------------------

/// First message on every new session, sent by the client before anything
/// else. Carries the registered UVE type names so the collector can reply
/// with its per-type sequence baselines.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CtrlClientToServer {
    pub source: String,
    pub module: String,
    /// Number of successful connections, this one included.
    pub connect_count: u32,
    pub uve_type_names: Vec<String>,
    pub pid: u32,
    pub node_type: String,
    pub instance_id: String,
}

impl CtrlClientToServer {
    pub fn to_payload(&self) -> XmlElement {
        let mut types = XmlElement::new("uve-types");
        for name in &self.uve_type_names {
            types.children.push(XmlElement::leaf("type", name));
        }
        XmlElement::new(CTRL_CLIENT_TO_SERVER)
            .child(XmlElement::leaf("source", &self.source))
            .child(XmlElement::leaf("module", &self.module))
            .child(XmlElement::leaf(
                "connect-count",
                self.connect_count.to_string(),
            ))
            .child(types)
            .child(XmlElement::leaf("pid", self.pid.to_string()))
            .child(XmlElement::leaf("node-type", &self.node_type))
            .child(XmlElement::leaf("instance-id", &self.instance_id))
    }

    pub fn from_payload(payload: &XmlElement) -> Result<CtrlClientToServer, WireError> {
        if payload.name != CTRL_CLIENT_TO_SERVER {
            return Err(WireError::UnexpectedPayload(payload.name.clone()));
        }
        let uve_type_names = payload
            .find_child("uve-types")
            .map(|types| types.children.iter().map(|c| c.text.clone()).collect())
            .unwrap_or_default();
        Ok(CtrlClientToServer {
            source: payload.child_text("source").to_owned(),
            module: payload.child_text("module").to_owned(),
            connect_count: payload
                .child_text("connect-count")
                .parse()
                .map_err(|_| WireError::BadControlField("connect-count".into()))?,
            uve_type_names,
            pid: payload
                .child_text("pid")
                .parse()
                .map_err(|_| WireError::BadControlField("pid".into()))?,
            node_type: payload.child_text("node-type").to_owned(),
            instance_id: payload.child_text("instance-id").to_owned(),
        })
    }
}

/// Per-type sequence baseline in the collector's control reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UveTypeSeqno {
    pub type_name: String,
    pub seqno: u64,
}

/// The collector's reply to `CtrlClientToServer`. `success = false` means
/// negotiation failed and the client must drop the session and retry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CtrlServerToClient {
    pub success: bool,
    pub type_info: Vec<UveTypeSeqno>,
}

impl CtrlServerToClient {
    pub fn to_payload(&self) -> XmlElement {
        let mut type_info = XmlElement::new("type-info");
        for entry in &self.type_info {
            type_info.children.push(
                XmlElement::new("type")
                    .attr("name", &entry.type_name)
                    .attr("seqno", entry.seqno.to_string()),
            );
        }
        XmlElement::new(CTRL_SERVER_TO_CLIENT)
            .child(XmlElement::leaf("success", self.success.to_string()))
            .child(type_info)
    }

    pub fn from_payload(payload: &XmlElement) -> Result<CtrlServerToClient, WireError> {
        if payload.name != CTRL_SERVER_TO_CLIENT {
            return Err(WireError::UnexpectedPayload(payload.name.clone()));
        }
        let success = payload.child_text("success") == "true";
        let mut type_info = Vec::new();
        if let Some(list) = payload.find_child("type-info") {
            for entry in &list.children {
                type_info.push(UveTypeSeqno {
                    type_name: entry.attribute("name").unwrap_or("").to_owned(),
                    seqno: entry
                        .attribute("seqno")
                        .unwrap_or("0")
                        .parse()
                        .map_err(|_| WireError::BadControlField("seqno".into()))?,
                });
            }
        }
        Ok(CtrlServerToClient { success, type_info })
    }
}

// ---------------------------------------------------------------------------
// UVE payloads
// ---------------------------------------------------------------------------

/// A plain UVE payload: a keyed attribute map.
///
/// Merging overlays the incoming attributes onto the cached ones; absent
/// attributes keep their cached values.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UveData {
    pub name: String,
    /// Cache partition; empty means the default table.
    pub table: String,
    pub deleted: bool,
    pub attrs: BTreeMap<String, String>,
}

impl UveData {
    pub fn new(name: impl Into<String>) -> Self {
        UveData {
            name: name.into(),
            ..UveData::default()
        }
    }

    pub fn merge_from(&mut self, incoming: &UveData) {
        if incoming.deleted {
            self.deleted = true;
        }
        for (key, value) in &incoming.attrs {
            self.attrs.insert(key.clone(), value.clone());
        }
    }
}

/// A dynamic UVE payload: a replace-on-update element map.
///
/// Merging replaces the cached element map wholesale; the `BTreeMap`
/// canonicalizes element order by key.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DynamicUveData {
    pub name: String,
    pub table: String,
    pub deleted: bool,
    pub elements: BTreeMap<String, String>,
}

impl DynamicUveData {
    pub fn merge_from(&mut self, incoming: &DynamicUveData) {
        if incoming.deleted {
            self.deleted = true;
        } else {
            self.elements = incoming.elements.clone();
        }
    }
}

/// Either UVE payload shape, as carried through the cache and onto the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UvePayload {
    Data(UveData),
    Dynamic(DynamicUveData),
}

impl UvePayload {
    pub fn name(&self) -> &str {
        match self {
            UvePayload::Data(data) => &data.name,
            UvePayload::Dynamic(data) => &data.name,
        }
    }

    pub fn table(&self) -> &str {
        match self {
            UvePayload::Data(data) => &data.table,
            UvePayload::Dynamic(data) => &data.table,
        }
    }

    pub fn deleted(&self) -> bool {
        match self {
            UvePayload::Data(data) => data.deleted,
            UvePayload::Dynamic(data) => data.deleted,
        }
    }

    /// Merge `incoming` into `self` per the payload shape's rule. Shape
    /// mismatches replace outright (a type never changes shape in practice).
    pub fn merge_from(&mut self, incoming: &UvePayload) {
        match (self, incoming) {
            (UvePayload::Data(existing), UvePayload::Data(new)) => existing.merge_from(new),
            (UvePayload::Dynamic(existing), UvePayload::Dynamic(new)) => existing.merge_from(new),
            (slot, new) => *slot = new.clone(),
        }
    }

    /// Serialize as the payload element of a UVE message named `type_name`.
    pub fn to_payload(&self, type_name: &str) -> XmlElement {
        let mut element = XmlElement::new(type_name)
            .attr("name", self.name())
            .attr("table", self.table());
        if self.deleted() {
            element = element.attr("deleted", "true");
        }
        match self {
            UvePayload::Data(data) => {
                for (key, value) in &data.attrs {
                    element
                        .children
                        .push(XmlElement::new("attr").attr("name", key).text(value));
                }
            }
            UvePayload::Dynamic(data) => {
                for (key, value) in &data.elements {
                    element
                        .children
                        .push(XmlElement::new("element").attr("name", key).text(value));
                }
            }
        }
        element
    }

    /// Parse a payload element produced by `to_payload`. `dynamic` selects
    /// the shape, since both serialize to the same outline.
    pub fn from_payload(payload: &XmlElement, dynamic: bool) -> UvePayload {
        let name = payload.attribute("name").unwrap_or("").to_owned();
        let table = payload.attribute("table").unwrap_or("").to_owned();
        let deleted = payload.attribute("deleted") == Some("true");
        let entries: BTreeMap<String, String> = payload
            .children
            .iter()
            .map(|c| {
                (
                    c.attribute("name").unwrap_or("").to_owned(),
                    c.text.clone(),
                )
            })
            .collect();
        if dynamic {
            UvePayload::Dynamic(DynamicUveData {
                name,
                table,
                deleted,
                elements: entries,
            })
        } else {
            UvePayload::Data(UveData {
                name,
                table,
                deleted,
                attrs: entries,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
