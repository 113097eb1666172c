//! Embedded introspect HTTP server.
//!
//! Provides:
//! - `GET /` and `/index.html`      — home page listing available requests
//! - `GET /Snh_<RequestName>?k=v&…` — control requests (logging params,
//!   send queue, collector info, statistics, trace buffers, UVE cache)
//! - `GET /css/…`, `/js/…`, `/universal_parse.xsl` — static assets
//!
//! Query parameters are URL-decoded and bound to request fields by name;
//! an empty value means "field not provided" (distinct from an empty
//! string), unknown fields are ignored, and an unknown request name yields
//! an HTML error body with HTTP 200.
//!
//! Binding the port is the generator's only fatal startup condition, so
//! `start` returns the bind error instead of swallowing it.

use std::collections::HashMap;

use beacon_protocol::{Level, Message, MessageHeader, MessageKind, RxDropReason, TxDropReason};
use beacon_protocol::xml::XmlElement;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::generator::Generator;
use crate::stats::MessageStats;

const XSL_HEADER: &str = "<?xml-stylesheet type=\"text/xsl\" href=\"/universal_parse.xsl\"?>";

/// Built-in request names, shown on the home page.
const BUILTIN_REQUESTS: [&str; 13] = [
    "LoggingParamsSet",
    "LoggingParamsStatus",
    "SendQueueSet",
    "SendQueueStatus",
    "CollectorInfoRequest",
    "MessageStatsRequest",
    "TraceBufferListRequest",
    "TraceBufferStatusRequest",
    "TraceEnableDisableRequest",
    "TraceBufferEnableDisableRequest",
    "TraceBufferDumpRequest",
    "UveCacheRequest",
    "UveTypesRequest",
];

// ---------------------------------------------------------------------------
// Server handle
// ---------------------------------------------------------------------------

pub struct BoundIntrospect {
    pub port: u16,
    pub task: tokio::task::JoinHandle<()>,
}

pub struct IntrospectServer;

impl IntrospectServer {
    /// Bind `0.0.0.0:port` (0 = ephemeral) and start serving.
    pub async fn start(generator: Generator, port: u16) -> Result<BoundIntrospect, std::io::Error> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let port = listener.local_addr()?.port();
        let task = tokio::spawn(run_server(listener, generator));
        Ok(BoundIntrospect { port, task })
    }
}

async fn run_server(listener: TcpListener, generator: Generator) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let generator = generator.clone();
                tokio::spawn(async move {
                    handle_connection(stream, generator).await;
                });
            }
            Err(_) => break,
        }
    }
}

// ---------------------------------------------------------------------------
// Request handling
// ---------------------------------------------------------------------------

async fn handle_connection(mut stream: TcpStream, generator: Generator) {
    // 4 KiB is plenty for a request line plus headers.
    let mut buf = vec![0u8; 4096];
    let n = match stream.read(&mut buf).await {
        Ok(n) if n > 0 => n,
        _ => return,
    };
    let request = match std::str::from_utf8(&buf[..n]) {
        Ok(s) => s,
        Err(_) => {
            send_response(&mut stream, 400, "text/plain", "Bad Request").await;
            return;
        }
    };
    let Some(first_line) = request.lines().next() else {
        send_response(&mut stream, 400, "text/plain", "Bad Request").await;
        return;
    };
    let mut parts = first_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let target = parts.next().unwrap_or("/");
    if method != "GET" {
        send_response(&mut stream, 405, "text/plain", "Method Not Allowed").await;
        return;
    }

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, query),
        None => (target, ""),
    };
    debug!(path, "introspect request");

    match path {
        "/" | "/index.html" => {
            let html = home_page(&generator);
            send_response(&mut stream, 200, "text/html; charset=utf-8", &html).await;
        }
        "/universal_parse.xsl" => {
            send_response(&mut stream, 200, "text/xsl", UNIVERSAL_PARSE_XSL).await;
        }
        "/css/style.css" => {
            send_response(&mut stream, 200, "text/css", STYLE_CSS).await;
        }
        "/js/util.js" => {
            send_response(&mut stream, 200, "application/javascript", UTIL_JS).await;
        }
        _ if path.starts_with("/Snh_") => {
            let name = &path["/Snh_".len()..];
            let params = parse_query(query);
            let body = dispatch(&generator, name, &params);
            send_response(&mut stream, 200, "text/xsl", &body).await;
        }
        _ => {
            send_response(&mut stream, 404, "text/plain", "Not Found").await;
        }
    }
}

/// Split and URL-decode a query string. Keys with empty values are
/// omitted: an empty value means "field not provided".
fn parse_query(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        if value.is_empty() {
            continue;
        }
        params.insert(url_decode(key), url_decode(value));
    }
    params
}

fn url_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                let hex = bytes.get(i + 1..i + 3).and_then(|h| {
                    std::str::from_utf8(h)
                        .ok()
                        .and_then(|h| u8::from_str_radix(h, 16).ok())
                });
                match hex {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

fn dispatch(generator: &Generator, name: &str, params: &HashMap<String, String>) -> String {
    match name {
        "LoggingParamsSet" => logging_params_set(generator, params),
        "LoggingParamsStatus" => logging_params_response(generator),
        "SendQueueSet" => {
            if let Some(enable) = bool_param(params, "enable") {
                generator.set_send_queue(enable);
            }
            send_queue_response(generator)
        }
        "SendQueueStatus" => send_queue_response(generator),
        "CollectorInfoRequest" => collector_info_response(generator),
        "MessageStatsRequest" => message_stats_response(generator),
        "TraceBufferListRequest" => trace_buffer_list_response(generator),
        "TraceBufferStatusRequest" => trace_buffer_status_response(generator),
        "TraceEnableDisableRequest" => {
            let enable = bool_param(params, "enable").unwrap_or(!generator.is_trace_enabled());
            generator.trace_enable(enable);
            let status = if generator.is_trace_enabled() {
                "Tracing enabled"
            } else {
                "Tracing disabled"
            };
            render(XmlElement::leaf("TraceEnableDisableResponse", status))
        }
        "TraceBufferEnableDisableRequest" => trace_buffer_enable_disable(generator, params),
        "TraceBufferDumpRequest" => trace_buffer_dump(generator, params),
        "UveCacheRequest" => uve_cache_response(generator, params),
        "UveTypesRequest" => uve_types_response(generator),
        _ => dispatch_registered(generator, name, params),
    }
}

/// Route an unrecognized name through the request-handler registry, the
/// same table collector-originated requests use. The handler's responses
/// are rendered into a per-request buffer keyed by an `http://` context.
fn dispatch_registered(
    generator: &Generator,
    name: &str,
    params: &HashMap<String, String>,
) -> String {
    static REQUEST_SEQ: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
    let mut payload = XmlElement::new(name);
    for (key, value) in params {
        payload.attributes.push((key.clone(), value.clone()));
    }
    let context = format!(
        "http://introspect/{}/{}",
        name,
        REQUEST_SEQ.fetch_add(1, std::sync::atomic::Ordering::SeqCst)
    );
    let message = Message {
        header: MessageHeader {
            context: context.clone(),
            kind: Some(MessageKind::Request),
            level: Some(Level::Info),
            ..MessageHeader::default()
        },
        name: name.to_owned(),
        payload,
    };
    generator.dispatch_request(&message);
    match generator.take_http_response(&context) {
        Some(body) => format!("{XSL_HEADER}{body}"),
        None => format!("<h3>Invalid request \"{name}\"</h3>"),
    }
}

// ---------------------------------------------------------------------------
// Built-in request handlers
// ---------------------------------------------------------------------------

fn logging_params_set(generator: &Generator, params: &HashMap<String, String>) -> String {
    if let Some(enable) = bool_param(params, "enable") {
        generator.logging().set_local_logging(enable);
    }
    if let Some(category) = params.get("category") {
        generator.logging().set_category(category);
    }
    if let Some(level) = params.get("level").and_then(|l| Level::parse(l)) {
        generator.logging().set_level(level);
    }
    if let Some(enable) = bool_param(params, "syslog") {
        let facility = generator.logging().params().syslog_facility;
        generator.logging().set_syslog(enable, &facility);
    }
    logging_params_response(generator)
}

fn logging_params_response(generator: &Generator) -> String {
    let params = generator.logging().params();
    render(
        XmlElement::new("LoggingParams")
            .child(XmlElement::leaf("enable", params.enable_local.to_string()))
            .child(XmlElement::leaf("category", params.category))
            .child(XmlElement::leaf("level", params.level.as_str()))
            .child(XmlElement::leaf("file", params.file))
            .child(XmlElement::leaf("syslog", params.enable_syslog.to_string()))
            .child(XmlElement::leaf("syslog_facility", params.syslog_facility)),
    )
}

fn send_queue_response(generator: &Generator) -> String {
    render(
        XmlElement::new("SendQueueResponse").child(XmlElement::leaf(
            "enable",
            generator.is_send_queue_enabled().to_string(),
        )),
    )
}

fn collector_info_response(generator: &Generator) -> String {
    let (name, state, connects) = generator.collector_info();
    let (ip, port) = generator
        .active_collector()
        .and_then(|endpoint| {
            crate::config::parse_endpoint(&endpoint)
                .ok()
                .map(|(host, port)| (host, port.to_string()))
        })
        .unwrap_or_default();
    render(
        XmlElement::new("CollectorInfoResponse")
            .child(XmlElement::leaf("ip", ip))
            .child(XmlElement::leaf("port", port))
            .child(XmlElement::leaf("status", state))
            .child(XmlElement::leaf("collector_name", name))
            .child(XmlElement::leaf("successful_connections", connects.to_string())),
    )
}

fn stats_element(name: &str, stats: &MessageStats) -> XmlElement {
    let mut element = XmlElement::new("MessageTypeStats")
        .attr("message_type", name)
        .child(XmlElement::leaf("messages_sent", stats.messages_sent.to_string()))
        .child(XmlElement::leaf("bytes_sent", stats.bytes_sent.to_string()))
        .child(XmlElement::leaf(
            "messages_sent_dropped",
            stats.messages_sent_dropped.to_string(),
        ))
        .child(XmlElement::leaf(
            "messages_received",
            stats.messages_received.to_string(),
        ))
        .child(XmlElement::leaf(
            "bytes_received",
            stats.bytes_received.to_string(),
        ))
        .child(XmlElement::leaf(
            "messages_received_dropped",
            stats.messages_received_dropped.to_string(),
        ));
    for reason in TxDropReason::DROPS {
        let counter = stats.tx_drop(reason);
        if counter.messages > 0 {
            element.children.push(
                XmlElement::new("tx_drop")
                    .attr("reason", reason.as_str())
                    .attr("messages", counter.messages.to_string())
                    .attr("bytes", counter.bytes.to_string()),
            );
        }
    }
    for reason in RxDropReason::DROPS {
        let counter = stats.rx_drop(reason);
        if counter.messages > 0 {
            element.children.push(
                XmlElement::new("rx_drop")
                    .attr("reason", reason.as_str())
                    .attr("messages", counter.messages.to_string())
                    .attr("bytes", counter.bytes.to_string()),
            );
        }
    }
    element
}

fn message_stats_response(generator: &Generator) -> String {
    let mut response = XmlElement::new("MessageStatsResponse");
    let mut per_type = XmlElement::new("type_stats");
    for (name, stats) in generator.stats().message_type_stats() {
        per_type.children.push(stats_element(&name, &stats));
    }
    response.children.push(per_type);
    response
        .children
        .push(stats_element("aggregate", &generator.stats().aggregate()));
    if let Some(queue) = generator.session_queue_stats() {
        response.children.push(
            XmlElement::new("send_queue_stats")
                .child(XmlElement::leaf("enqueues", queue.num_enqueues.to_string()))
                .child(XmlElement::leaf("dequeues", queue.num_dequeues.to_string()))
                .child(XmlElement::leaf("count", queue.len.to_string()))
                .child(XmlElement::leaf("bytes", queue.bytes.to_string()))
                .child(XmlElement::leaf("drops", queue.drops.to_string())),
        );
    }
    render(response)
}

fn trace_buffer_list_response(generator: &Generator) -> String {
    let mut response = XmlElement::new("TraceBufferListResponse");
    for name in generator.trace_buffer_list() {
        response
            .children
            .push(XmlElement::leaf("trace_buf_name", name));
    }
    render(response)
}

fn trace_buffer_status_response(generator: &Generator) -> String {
    let mut response = XmlElement::new("TraceBufferStatusResponse");
    for name in generator.trace_buffer_list() {
        let enabled = generator.is_trace_buffer_enabled(&name);
        response.children.push(
            XmlElement::new("trace_buffer")
                .attr("name", name)
                .attr("enabled", enabled.to_string()),
        );
    }
    render(response)
}

fn trace_buffer_enable_disable(generator: &Generator, params: &HashMap<String, String>) -> String {
    let status = match params.get("name") {
        Some(name) if generator.trace_buffer_list().contains(name) => {
            let enable =
                bool_param(params, "enable").unwrap_or(!generator.is_trace_buffer_enabled(name));
            generator.trace_buffer_enable(name, enable);
            if generator.is_trace_buffer_enabled(name) {
                "Trace buffer enabled"
            } else {
                "Trace buffer disabled"
            }
        }
        _ => "Invalid trace buffer",
    };
    render(XmlElement::leaf("TraceBufferEnableDisableResponse", status))
}

fn trace_buffer_dump(generator: &Generator, params: &HashMap<String, String>) -> String {
    let Some(name) = params.get("name") else {
        return render(XmlElement::leaf("TraceBufferDumpResponse", "Invalid trace buffer"));
    };
    let count = params
        .get("count")
        .and_then(|c| c.parse().ok())
        .unwrap_or(0usize);
    let context = params
        .get("context")
        .cloned()
        .unwrap_or_else(|| "Http".to_owned());
    let mut response = XmlElement::new("TraceBufferDumpResponse").attr("buffer", name);
    for (seqno, message) in generator.trace_read(name, &context, count) {
        response.children.push(
            XmlElement::new("trace")
                .attr("seqno", seqno.to_string())
                .child(message.payload.clone()),
        );
    }
    render(response)
}

fn uve_cache_response(generator: &Generator, params: &HashMap<String, String>) -> String {
    let Some(tname) = params.get("tname") else {
        return render(XmlElement::leaf("UveCacheResponse", "missing tname"));
    };
    let mut response = XmlElement::new("UveCacheResponse").attr("tname", tname.as_str());
    // The cache request also replays the type to the collector, so an
    // operator can force a resync of one type.
    if let Some(replayed) = generator.sync_uve_type(tname) {
        response = response.attr("replayed", replayed.to_string());
    }
    match generator.uve_cache().dump_type(tname) {
        Some(entries) => {
            response.attributes.push(("count".to_owned(), entries.len().to_string()));
            for entry in entries {
                response.children.push(
                    XmlElement::new("entry")
                        .attr("seqno", entry.seqno.to_string())
                        .attr("update_count", entry.update_count.to_string())
                        .child(entry.data.to_payload(tname)),
                );
            }
        }
        None => {
            response.text = format!("unknown UVE type \"{tname}\"");
        }
    }
    render(response)
}

fn uve_types_response(generator: &Generator) -> String {
    let mut response = XmlElement::new("UveTypesResponse");
    for (name, dynamic, seqno) in generator.uve_cache().type_seqnos() {
        response.children.push(
            XmlElement::new("uve_type")
                .attr("name", name)
                .attr("dynamic", dynamic.to_string())
                .attr("seqno", seqno.to_string()),
        );
    }
    render(response)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn bool_param(params: &HashMap<String, String>, key: &str) -> Option<bool> {
    params.get(key).map(|v| v == "true" || v == "1")
}

fn render(element: XmlElement) -> String {
    format!("{XSL_HEADER}{}", element.to_xml_string())
}

fn home_page(generator: &Generator) -> String {
    let mut html = String::from(
        "<!DOCTYPE html><html><head>\
         <link href=\"/css/style.css\" rel=\"stylesheet\" type=\"text/css\"/>",
    );
    html.push_str(&format!("<title>{}</title></head><body>", generator.module()));
    html.push_str(&format!("<h1>Modules for {}</h1>", generator.module()));
    for request in BUILTIN_REQUESTS {
        html.push_str(&format!("<a href=\"/Snh_{request}\">{request}</a><br/>"));
    }
    html.push_str("</body></html>");
    html
}

async fn send_response(stream: &mut TcpStream, status: u16, content_type: &str, body: &str) {
    let status_text = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        _ => "Unknown",
    };
    let response = format!(
        "HTTP/1.1 {status} {status_text}\r\n\
         Content-Type: {content_type}\r\n\
         Content-Length: {len}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        len = body.len(),
    );
    let _ = stream.write_all(response.as_bytes()).await;
}

// ---------------------------------------------------------------------------
// Static assets
// ---------------------------------------------------------------------------

const UNIVERSAL_PARSE_XSL: &str = r#"<?xml version="1.0"?>
<xsl:stylesheet version="1.0" xmlns:xsl="http://www.w3.org/1999/XSL/Transform">
<xsl:template match="/">
  <html><head><link href="/css/style.css" rel="stylesheet" type="text/css"/></head>
  <body><xsl:apply-templates/></body></html>
</xsl:template>
<xsl:template match="*">
  <div class="node"><span class="name"><xsl:value-of select="name()"/></span>
  <xsl:for-each select="@*">
    <span class="attr"><xsl:value-of select="name()"/>=<xsl:value-of select="."/></span>
  </xsl:for-each>
  <span class="text"><xsl:value-of select="text()"/></span>
  <div class="children"><xsl:apply-templates select="*"/></div></div>
</xsl:template>
</xsl:stylesheet>
"#;

const STYLE_CSS: &str = "body { font-family: monospace; margin: 1em; }\n\
.node { margin-left: 1em; }\n\
.name { font-weight: bold; }\n\
.attr { color: #555; margin-left: 0.5em; }\n";

const UTIL_JS: &str = "// introspect helper: no dynamic behavior required\n";

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
