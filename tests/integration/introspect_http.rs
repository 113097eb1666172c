//! Introspect HTTP surface tests.
//!
//! Drives the embedded server over a raw socket: home page, control
//! requests with query-parameter binding, trace dumps with reader-context
//! pagination, UVE cache dumps, and the unknown-request contract
//! (HTML error body, HTTP 200).

use std::time::Duration;

use beacon::uve::UveTypeDesc;
use beacon::{Generator, GeneratorConfig, Level, MessageKind, UveData, UvePayload};
use beacon_protocol::xml::XmlElement;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

async fn start_generator() -> Generator {
    let mut config = GeneratorConfig::new("introspect-test", "host-introspect");
    config.connect_to_collector = false;
    config.http_port = Some(0);
    Generator::init(config, vec![UveTypeDesc::new("UVETest")]).await
}

/// Issue a GET and return `(status, body)`.
async fn http_get(port: u16, target: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.expect("connect");
    let request = format!("GET {target} HTTP/1.1\r\nHost: localhost\r\n\r\n");
    stream.write_all(request.as_bytes()).await.expect("write");

    let mut response = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => response.extend_from_slice(&buf[..n]),
            Ok(Err(_)) => break,
        }
    }
    let response = String::from_utf8_lossy(&response).into_owned();
    let status: u16 = response
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_owned())
        .unwrap_or_default();
    (status, body)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn home_page_lists_the_module() {
    let generator = start_generator().await;
    let port = generator.http_port().unwrap();
    for target in ["/", "/index.html"] {
        let (status, body) = http_get(port, target).await;
        assert_eq!(status, 200);
        assert!(body.contains("introspect-test"));
        assert!(body.contains("Snh_MessageStatsRequest"));
    }
    generator.uninit();
}

#[tokio::test]
async fn static_assets_are_served() {
    let generator = start_generator().await;
    let port = generator.http_port().unwrap();
    let (status, body) = http_get(port, "/universal_parse.xsl").await;
    assert_eq!(status, 200);
    assert!(body.contains("xsl:stylesheet"));
    let (status, _) = http_get(port, "/css/style.css").await;
    assert_eq!(status, 200);
    let (status, _) = http_get(port, "/js/util.js").await;
    assert_eq!(status, 200);
    generator.uninit();
}

#[tokio::test]
async fn logging_params_set_binds_query_fields_by_name() {
    let generator = start_generator().await;
    let port = generator.http_port().unwrap();

    // Empty `category=` means "not provided": only enable and level apply.
    let (status, body) = http_get(
        port,
        "/Snh_LoggingParamsSet?enable=true&category=&level=debug&unknown=zz",
    )
    .await;
    assert_eq!(status, 200);
    assert!(body.contains("<level>debug</level>"));
    assert!(body.contains("<enable>true</enable>"));

    let params = generator.logging().params();
    assert!(params.enable_local);
    assert_eq!(params.level, Level::Debug);
    assert_eq!(params.category, "", "empty value must not clear-set the field");

    let (_, status_body) = http_get(port, "/Snh_LoggingParamsStatus").await;
    assert!(status_body.contains("<level>debug</level>"));
    generator.uninit();
}

#[tokio::test]
async fn send_queue_toggle_round_trips() {
    let generator = start_generator().await;
    let port = generator.http_port().unwrap();

    let (_, body) = http_get(port, "/Snh_SendQueueSet?enable=false").await;
    assert!(body.contains("<enable>false</enable>"));
    assert!(!generator.is_send_queue_enabled());

    let (_, body) = http_get(port, "/Snh_SendQueueSet?enable=true").await;
    assert!(body.contains("<enable>true</enable>"));
    assert!(generator.is_send_queue_enabled());
    generator.uninit();
}

#[tokio::test]
async fn message_stats_enumerate_drop_reasons() {
    let generator = start_generator().await;
    let port = generator.http_port().unwrap();

    // Provoke a queue-level drop, then check it shows up.
    generator.set_send_level(Level::Emergency);
    let msg = generator.message(
        MessageKind::AsyncObject,
        "DropTest",
        Level::Debug,
        XmlElement::new("DropTest"),
    );
    assert_eq!(generator.send(msg), -1);
    generator.set_send_level(Level::Invalid);

    let (status, body) = http_get(port, "/Snh_MessageStatsRequest").await;
    assert_eq!(status, 200);
    assert!(body.contains("MessageStatsResponse"));
    assert!(body.contains("queue_level"));
    generator.uninit();
}

#[tokio::test]
async fn trace_dump_respects_the_reader_context() {
    let generator = start_generator().await;
    let port = generator.http_port().unwrap();
    generator.trace_buffer_create("boot", 10, true);
    for i in 0..3 {
        let msg = generator.message(
            MessageKind::Trace,
            "TraceTest",
            Level::Debug,
            XmlElement::new("TraceTest").attr("magic", i.to_string()),
        );
        generator.trace_write("boot", msg);
    }

    let (_, list) = http_get(port, "/Snh_TraceBufferListRequest").await;
    assert!(list.contains("boot"));

    let (_, dump) = http_get(port, "/Snh_TraceBufferDumpRequest?name=boot&context=r3").await;
    assert_eq!(dump.matches("<trace ").count(), 3);

    // Same context again: the cursor has advanced to the tail.
    let (_, redump) = http_get(port, "/Snh_TraceBufferDumpRequest?name=boot&context=r3").await;
    assert_eq!(redump.matches("<trace ").count(), 0);

    // A fresh context starts at the oldest entry.
    let (_, other) = http_get(port, "/Snh_TraceBufferDumpRequest?name=boot&context=r4").await;
    assert_eq!(other.matches("<trace ").count(), 3);
    generator.uninit();
}

#[tokio::test]
async fn trace_buffer_enable_disable_round_trips() {
    let generator = start_generator().await;
    let port = generator.http_port().unwrap();
    generator.trace_buffer_create("quiet", 4, true);

    let (_, body) =
        http_get(port, "/Snh_TraceBufferEnableDisableRequest?name=quiet&enable=false").await;
    assert!(body.contains("disabled"));
    assert!(!generator.is_trace_buffer_enabled("quiet"));

    // Without `enable` the request toggles.
    let (_, body) = http_get(port, "/Snh_TraceBufferEnableDisableRequest?name=quiet").await;
    assert!(body.contains("enabled"));
    assert!(generator.is_trace_buffer_enabled("quiet"));

    let (_, body) = http_get(port, "/Snh_TraceBufferEnableDisableRequest?name=missing").await;
    assert!(body.contains("Invalid trace buffer"));
    generator.uninit();
}

#[tokio::test]
async fn uve_cache_dump_reports_entries_and_types() {
    let generator = start_generator().await;
    let port = generator.http_port().unwrap();
    let mut data = UveData::new("uve1");
    data.attrs.insert("xyz".to_owned(), "345".to_owned());
    generator.send_uve("UVETest", UvePayload::Data(data));

    let (_, body) = http_get(port, "/Snh_UveCacheRequest?tname=UVETest").await;
    assert!(body.contains("count=\"1\""));
    assert!(body.contains("uve1"));

    let (_, types) = http_get(port, "/Snh_UveTypesRequest").await;
    assert!(types.contains("UVETest"));
    generator.uninit();
}

#[tokio::test]
async fn unknown_request_returns_html_error_with_http_200() {
    let generator = start_generator().await;
    let port = generator.http_port().unwrap();
    let (status, body) = http_get(port, "/Snh_NoSuchRequest").await;
    assert_eq!(status, 200);
    assert!(body.contains("Invalid request"));

    // Unknown non-Snh paths are plain 404s.
    let (status, _) = http_get(port, "/not-here").await;
    assert_eq!(status, 404);
    generator.uninit();
}

#[tokio::test]
async fn registered_request_handlers_render_responses_into_the_page() {
    let generator = start_generator().await;
    let port = generator.http_port().unwrap();

    generator.register_request_handler("PingRequest", |generator, request| {
        let mut response = generator.message(
            MessageKind::Response,
            "PingResponse",
            Level::Info,
            XmlElement::new("PingResponse").child(XmlElement::leaf(
                "echo",
                request.payload.attribute("what").unwrap_or(""),
            )),
        );
        response.header.context = request.header.context.clone();
        generator.send_response(response);
    });

    let (status, body) = http_get(port, "/Snh_PingRequest?what=hello%20there").await;
    assert_eq!(status, 200);
    assert!(body.contains("<echo>hello there</echo>"));
    generator.uninit();
}
