//! End-to-end tests: a live server on an ephemeral port, driven over
//! raw TCP so framing, pipelining, and close behaviour are all visible.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::Duration;

use mazurka::{
    BasicAuth, ContentEntry, ContentKind, DiskRoot, Dispatch, Embedded, MatchMode, Reply,
    Server, ServerConfig,
};

fn base_config() -> ServerConfig {
    let mut cfg = ServerConfig::default();
    cfg.ip4 = Some(Ipv4Addr::LOCALHOST);
    cfg.port = 0;
    cfg
}

fn embedded(pattern: &str, body: &'static [u8], etag: Option<&'static str>) -> ContentEntry {
    ContentEntry::new(
        pattern,
        MatchMode::Exact,
        ContentKind::Embedded(Embedded {
            mime: "text/html",
            etag,
            body,
        }),
    )
}

fn start(cfg: ServerConfig) -> u16 {
    let mut server = Server::new(cfg);
    server.bind().expect("bind");
    let port = server.port();
    let shutdown = Arc::new(AtomicBool::new(false));
    thread::spawn(move || {
        let _ = server.serve(shutdown);
    });
    port
}

fn connect(port: u16) -> TcpStream {
    let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("timeout");
    stream
}

/// Read one framed response: head up to the blank line, then exactly
/// Content-Length body bytes.
fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).expect("read head");
        assert!(
            n > 0,
            "eof before end of head: {:?}",
            String::from_utf8_lossy(&head)
        );
        head.push(byte[0]);
    }
    let head = String::from_utf8_lossy(&head).into_owned();
    let len = content_length(&head);
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).expect("read body");
    (head, body)
}

fn content_length(head: &str) -> usize {
    for line in head.lines() {
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                return value.trim().parse().unwrap_or(0);
            }
        }
    }
    0
}

fn header_value<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().find_map(|line| {
        let (n, v) = line.split_once(':')?;
        n.eq_ignore_ascii_case(name).then(|| v.trim())
    })
}

fn assert_eof(stream: &mut TcpStream) {
    let mut byte = [0u8; 1];
    match stream.read(&mut byte) {
        Ok(0) => {}
        other => panic!("expected eof, got {other:?}"),
    }
}

#[test]
fn embedded_entry_serves_content() {
    let mut cfg = base_config();
    cfg.content = vec![embedded("/ir.html", b"BODY", Some("\"e1\""))];
    let port = start(cfg);

    let mut stream = connect(port);
    stream
        .write_all(b"GET /ir.html HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);

    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    assert_eq!(content_length(&head), 4);
    assert_eq!(body, b"BODY");
    assert!(header_value(&head, "date").is_some());
    assert!(header_value(&head, "server").is_some());
}

#[test]
fn embedded_entry_if_none_match() {
    let mut cfg = base_config();
    cfg.content = vec![embedded("/ir.html", b"BODY", Some("\"e1\""))];
    let port = start(cfg);

    let mut stream = connect(port);
    stream
        .write_all(b"GET /ir.html HTTP/1.1\r\nHost: x\r\nIf-None-Match: \"e1\"\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);

    assert!(head.starts_with("HTTP/1.1 304 Not Modified\r\n"), "{head}");
    assert!(body.is_empty());
    assert_eq!(header_value(&head, "etag"), Some("\"e1\""));

    // Connection stays usable after the 304.
    stream
        .write_all(b"GET /ir.html HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
    assert_eq!(body, b"BODY");
}

#[test]
fn not_found_on_http10_closes() {
    let cfg = base_config();
    let port = start(cfg);

    let mut stream = connect(port);
    stream.write_all(b"GET /nope HTTP/1.0\r\n\r\n").unwrap();
    let (head, body) = read_response(&mut stream);

    assert!(head.starts_with("HTTP/1.0 404 Not Found\r\n"), "{head}");
    assert_eq!(content_length(&head), 15);
    assert_eq!(body, b"404 Not Found\r\n");
    assert_eof(&mut stream);
}

#[test]
fn chunked_post_reaches_dynamic_handler_contiguously() {
    let mut cfg = base_config();
    cfg.content = vec![ContentEntry::new(
        "/cgi",
        MatchMode::Exact,
        ContentKind::Dynamic(Arc::new(|req| {
            Dispatch::Reply(Reply::ok(req.body.to_vec()))
        })),
    )];
    let port = start(cfg);

    let mut stream = connect(port);
    stream
        .write_all(
            b"POST /cgi HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n\
              5\r\nhello\r\n0\r\n\r\n",
        )
        .unwrap();
    let (head, body) = read_response(&mut stream);

    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
    assert_eq!(body, b"hello");
}

#[test]
fn directory_request_redirects_to_canonical_url() {
    let docroot = tempfile::tempdir().unwrap();
    std::fs::create_dir(docroot.path().join("dir")).unwrap();

    let mut cfg = base_config();
    cfg.content = vec![ContentEntry::new(
        "/",
        MatchMode::DirPrefix,
        ContentKind::Disk(DiskRoot {
            root: docroot.path().to_string_lossy().into_owned(),
            index: None,
            listing: true,
        }),
    )];
    let port = start(cfg);

    let mut stream = connect(port);
    stream
        .write_all(b"GET /dir HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let (head, _) = read_response(&mut stream);

    assert!(head.starts_with("HTTP/1.1 308 Permanent Redirect\r\n"), "{head}");
    assert_eq!(header_value(&head, "location"), Some("/dir/"));
}

#[test]
fn pipelined_requests_get_ordered_responses() {
    let mut cfg = base_config();
    cfg.content = vec![
        embedded("/a", b"first", None),
        embedded("/b", b"second!", None),
    ];
    let port = start(cfg);

    let mut stream = connect(port);
    stream
        .write_all(
            b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n",
        )
        .unwrap();

    let (head_a, body_a) = read_response(&mut stream);
    assert!(head_a.starts_with("HTTP/1.1 200"), "{head_a}");
    assert_eq!(body_a, b"first");

    let (head_b, body_b) = read_response(&mut stream);
    assert!(head_b.starts_with("HTTP/1.1 200"), "{head_b}");
    assert_eq!(body_b, b"second!");
}

#[test]
fn oversized_header_block_gets_413_and_close() {
    let mut cfg = base_config();
    cfg.max_head_len = 256;
    let port = start(cfg);

    let mut stream = connect(port);
    let mut req = b"GET / HTTP/1.1\r\nHost: x\r\n".to_vec();
    req.extend_from_slice(format!("X-Pad: {}\r\n", "p".repeat(300)).as_bytes());
    req.extend_from_slice(b"\r\n");
    stream.write_all(&req).unwrap();

    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 413"), "{head}");
    assert_eof(&mut stream);
}

#[test]
fn full_slot_table_rejects_newcomer_with_503() {
    let mut cfg = base_config();
    cfg.max_conns = 2;
    cfg.content = vec![embedded("/", b"ok", None)];
    let port = start(cfg);

    // Occupy both slots and prove they work.
    let mut first = connect(port);
    first.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let (head, _) = read_response(&mut first);
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");

    let mut second = connect(port);
    second.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let (head, _) = read_response(&mut second);
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");

    // The newcomer is turned away; the older connections are intact.
    let mut third = connect(port);
    let (head, body) = read_response(&mut third);
    assert!(head.starts_with("HTTP/1.1 503"), "{head}");
    assert_eq!(body, b"503 Service Unavailable\r\n");
    assert_eof(&mut third);

    first.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let (head, _) = read_response(&mut first);
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
}

#[test]
fn per_client_cap_rejects_with_503() {
    let mut cfg = base_config();
    cfg.max_client_conns = 1;
    cfg.content = vec![embedded("/", b"ok", None)];
    let port = start(cfg);

    let mut first = connect(port);
    first.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let (head, _) = read_response(&mut first);
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");

    let mut second = connect(port);
    let (head, _) = read_response(&mut second);
    assert!(head.starts_with("HTTP/1.1 503"), "{head}");
    assert_eof(&mut second);
}

#[test]
fn disk_file_etag_and_mime() {
    let docroot = tempfile::tempdir().unwrap();
    std::fs::write(docroot.path().join("style.css"), b"body{}").unwrap();

    let mut cfg = base_config();
    cfg.content = vec![ContentEntry::new(
        "/",
        MatchMode::DirPrefix,
        ContentKind::Disk(DiskRoot {
            root: docroot.path().to_string_lossy().into_owned(),
            index: None,
            listing: false,
        }),
    )];
    let port = start(cfg);

    let mut stream = connect(port);
    stream
        .write_all(b"GET /style.css HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
    assert_eq!(header_value(&head, "content-type"), Some("text/css"));
    assert_eq!(body, b"body{}");

    let etag = header_value(&head, "etag").expect("etag").to_string();
    let revalidate = format!("GET /style.css HTTP/1.1\r\nHost: x\r\nIf-None-Match: {etag}\r\n\r\n");
    stream.write_all(revalidate.as_bytes()).unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 304"), "{head}");
    assert!(body.is_empty());
}

#[test]
fn directory_listing_is_sorted_html() {
    let docroot = tempfile::tempdir().unwrap();
    std::fs::write(docroot.path().join("b.txt"), b"b").unwrap();
    std::fs::write(docroot.path().join("a.txt"), b"a").unwrap();
    std::fs::create_dir(docroot.path().join("albums")).unwrap();

    let mut cfg = base_config();
    cfg.content = vec![ContentEntry::new(
        "/",
        MatchMode::Prefix,
        ContentKind::Disk(DiskRoot {
            root: docroot.path().to_string_lossy().into_owned(),
            index: None,
            listing: true,
        }),
    )];
    let port = start(cfg);

    let mut stream = connect(port);
    stream.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
    assert_eq!(header_value(&head, "content-type"), Some("text/html"));

    let page = String::from_utf8(body).unwrap();
    let parent = page.find(">..<").expect("parent link");
    let a = page.find(">a.txt<").expect("a.txt");
    let albums = page.find(">albums/<").expect("albums");
    let b = page.find(">b.txt<").expect("b.txt");
    // Byte-wise order: .. < a.txt < albums/ < b.txt
    assert!(parent < a && a < albums && albums < b, "unsorted: {page}");
}

#[test]
fn basic_auth_layers_in_front_of_content() {
    let mut cfg = base_config();
    cfg.content = vec![
        ContentEntry::new(
            "/secret",
            MatchMode::Exact,
            ContentKind::BasicAuth(BasicAuth {
                realm: "player".to_string(),
                tokens: vec!["dXNlcjpwYXNz".to_string()],
            }),
        ),
        embedded("/secret", b"hidden", None),
    ];
    let port = start(cfg);

    let mut stream = connect(port);
    stream
        .write_all(b"GET /secret HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 401 Unauthorized\r\n"), "{head}");
    assert_eq!(
        header_value(&head, "www-authenticate"),
        Some("Basic realm=\"player\"")
    );

    stream
        .write_all(
            b"GET /secret HTTP/1.1\r\nHost: x\r\nAuthorization: Basic dXNlcjpwYXNz\r\n\r\n",
        )
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
    assert_eq!(body, b"hidden");
}

#[test]
fn redirect_entry_rewrites_prefix() {
    let mut cfg = base_config();
    cfg.content = vec![ContentEntry::new(
        "/old",
        MatchMode::Prefix,
        ContentKind::Redirect {
            target: "/new".to_string(),
        },
    )];
    let port = start(cfg);

    let mut stream = connect(port);
    stream
        .write_all(b"GET /old/track/7 HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 308"), "{head}");
    assert_eq!(header_value(&head, "location"), Some("/new/track/7"));
}

#[test]
fn head_request_omits_body_but_keeps_framing() {
    let mut cfg = base_config();
    cfg.content = vec![embedded("/page", b"payload", None)];
    let port = start(cfg);

    let mut stream = connect(port);
    stream
        .write_all(
            b"HEAD /page HTTP/1.1\r\nHost: x\r\n\r\nGET /page HTTP/1.1\r\nHost: x\r\n\r\n",
        )
        .unwrap();

    // HEAD: advertised length, no body bytes on the wire. If a body had
    // been sent, the next response head would fail to parse.
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        assert!(stream.read(&mut byte).unwrap() > 0);
        head.push(byte[0]);
    }
    let head = String::from_utf8_lossy(&head).into_owned();
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
    assert_eq!(content_length(&head), 7);

    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
    assert_eq!(body, b"payload");
}

#[test]
fn disallowed_methods_get_405_and_keepalive() {
    let mut cfg = base_config();
    cfg.content = vec![embedded("/", b"ok", None)];
    let port = start(cfg);

    let mut stream = connect(port);
    stream
        .write_all(b"DELETE / HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 405"), "{head}");

    stream.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
    assert_eq!(body, b"ok");
}

#[test]
fn malformed_version_gets_400_and_close() {
    let cfg = base_config();
    let port = start(cfg);

    let mut stream = connect(port);
    stream
        .write_all(b"GET / HTTP/9.9\r\nHost: x\r\n\r\n")
        .unwrap();
    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 400"), "{head}");
    assert_eof(&mut stream);
}

#[test]
fn dot_segments_canonicalize_before_routing() {
    let mut cfg = base_config();
    cfg.content = vec![embedded("/ir.html", b"BODY", None)];
    let port = start(cfg);

    let mut stream = connect(port);
    stream
        .write_all(b"GET /x/../ir.html HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
    assert_eq!(body, b"BODY");
}
