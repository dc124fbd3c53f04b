//! Content-table routing.
//!
//! Routes are declarative entries tried strictly in declaration order.
//! A handler may serve the request, fall through to the next entry
//! (`NotFound`), or ask for the connection to close. Basic-auth layers
//! in front of content by matching the same pattern earlier in the
//! table and falling through once credentials check out.

use std::sync::Arc;

use crate::config::ServerConfig;
use crate::conn::{Conn, RequestView};
use crate::diskfile;
use crate::http::{self, Dispatch, Method};
use crate::outbuf::{Chunk, Enqueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// URL equals the pattern.
    Exact,
    /// URL begins with the pattern.
    Prefix,
    /// A pattern ending `/` accepts strictly longer URLs; one without
    /// accepts equality or a following `/`.
    DirPrefix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Handled; stop the table walk.
    Ok,
    /// Not handled; try the next entry.
    NotFound,
    /// Terminate the connection after queued output drains.
    Close,
}

/// A statically embedded asset: the blob lives in the binary, so the
/// output engine can borrow it for free.
pub struct Embedded {
    pub mime: &'static str,
    pub etag: Option<&'static str>,
    pub body: &'static [u8],
}

pub struct DiskRoot {
    pub root: String,
    pub index: Option<String>,
    pub listing: bool,
}

pub type DynHandler = Arc<dyn Fn(&RequestView<'_>) -> Dispatch + Send + Sync>;

pub struct BasicAuth {
    pub realm: String,
    /// Accepted `base64(user:pass)` tokens, pre-encoded at config time.
    pub tokens: Vec<String>,
}

pub enum ContentKind {
    Embedded(Embedded),
    Disk(DiskRoot),
    Dynamic(DynHandler),
    Redirect { target: String },
    BasicAuth(BasicAuth),
}

pub struct ContentEntry {
    /// Entry only applies when the request's Host equals this.
    pub host: Option<String>,
    pub pattern: String,
    pub mode: MatchMode,
    /// Stop the table walk after this entry regardless of its outcome.
    pub stop: bool,
    pub kind: ContentKind,
}

impl ContentEntry {
    pub fn new(pattern: impl Into<String>, mode: MatchMode, kind: ContentKind) -> Self {
        Self {
            host: None,
            pattern: pattern.into(),
            mode,
            stop: false,
            kind,
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn stop_on_match(mut self) -> Self {
        self.stop = true;
        self
    }
}

/// Route a parsed request. Methods outside GET/POST/HEAD never reach
/// the table.
pub fn dispatch(conn: &mut Conn, cfg: &ServerConfig) -> Outcome {
    if !matches!(conn.method, Method::Get | Method::Post | Method::Head) {
        send_error(conn, cfg, 405, false);
        return finished(conn, Outcome::Ok);
    }

    for entry in &cfg.content {
        if let Some(want) = &entry.host {
            match conn.header(b"host", 0) {
                Some(h) if h.eq_ignore_ascii_case(want.as_bytes()) => {}
                _ => continue,
            }
        }
        if !url_matches(entry.mode, &entry.pattern, conn.path_str()) {
            continue;
        }

        let outcome = match &entry.kind {
            ContentKind::Embedded(e) => serve_embedded(conn, cfg, e),
            ContentKind::Disk(d) => diskfile::serve(conn, cfg, d),
            ContentKind::Dynamic(h) => serve_dynamic(conn, cfg, h),
            ContentKind::Redirect { target } => serve_redirect(conn, cfg, &entry.pattern, target),
            ContentKind::BasicAuth(a) => check_auth(conn, cfg, a),
        };
        if conn.broken {
            return Outcome::Close;
        }
        match outcome {
            Outcome::NotFound => {
                if entry.stop {
                    break;
                }
            }
            other => return other,
        }
    }

    send_error(conn, cfg, 404, false);
    finished(conn, Outcome::Ok)
}

fn finished(conn: &Conn, outcome: Outcome) -> Outcome {
    if conn.broken { Outcome::Close } else { outcome }
}

pub fn url_matches(mode: MatchMode, pattern: &str, path: &str) -> bool {
    match mode {
        MatchMode::Exact => path == pattern,
        MatchMode::Prefix => path.starts_with(pattern),
        MatchMode::DirPrefix => {
            if pattern.ends_with('/') {
                // Strictly longer than the directory itself.
                path.len() > pattern.len() && path.starts_with(pattern)
            } else {
                path == pattern
                    || (path.starts_with(pattern)
                        && path.as_bytes().get(pattern.len()) == Some(&b'/'))
            }
        }
    }
}

// ---- Response plumbing ----

pub(crate) enum BodyPayload {
    None,
    Static(&'static [u8]),
    Owned(Vec<u8>),
}

/// Everything the dispatcher emits funnels through here so overflow
/// and transport failures uniformly mark the connection broken.
pub(crate) fn send_response(conn: &mut Conn, head: Vec<u8>, body: BodyPayload) -> bool {
    let mut parts = Vec::with_capacity(2);
    parts.push(Chunk::Give(head));
    match body {
        BodyPayload::None => {}
        BodyPayload::Static(b) => parts.push(Chunk::Static(b)),
        BodyPayload::Owned(b) => parts.push(Chunk::Give(b)),
    }
    match conn.out.enqueue(conn.fd, parts) {
        Enqueue::Sent | Enqueue::Queued => true,
        Enqueue::Overflow | Enqueue::Fatal => {
            conn.broken = true;
            false
        }
    }
}

/// Emit a status-only reply with the standard `"<code> <reason>"` body.
pub(crate) fn send_error(conn: &mut Conn, cfg: &ServerConfig, status: u16, close: bool) {
    let body = http::error_body(status);
    let mut extra: Vec<(&str, &str)> = vec![("Content-Type", "text/plain")];
    if close {
        extra.push(("Connection", "close"));
    }
    let head = http::response_head(
        conn.version,
        status,
        body.len() as u64,
        &extra,
        &cfg.extra_headers,
    );
    send_response(conn, head, BodyPayload::Owned(body));
    if close {
        conn.shutdown_pending = true;
    }
}

// ---- Handlers ----

fn serve_embedded(conn: &mut Conn, cfg: &ServerConfig, e: &Embedded) -> Outcome {
    let not_modified = match (e.etag, conn.header(b"if-none-match", 0)) {
        (Some(tag), Some(val)) => val == tag.as_bytes(),
        _ => false,
    };

    let mut extra: Vec<(&str, &str)> = vec![("Content-Type", e.mime)];
    if let Some(tag) = e.etag {
        extra.push(("ETag", tag));
    }

    if not_modified {
        let head = http::response_head(conn.version, 304, 0, &extra, &cfg.extra_headers);
        send_response(conn, head, BodyPayload::None);
        return Outcome::Ok;
    }

    let head = http::response_head(
        conn.version,
        200,
        e.body.len() as u64,
        &extra,
        &cfg.extra_headers,
    );
    let body = if conn.method == Method::Head {
        BodyPayload::None
    } else {
        BodyPayload::Static(e.body)
    };
    send_response(conn, head, body);
    Outcome::Ok
}

fn serve_dynamic(conn: &mut Conn, cfg: &ServerConfig, handler: &DynHandler) -> Outcome {
    let dispatch = {
        let view = conn.request_view();
        handler(&view)
    };

    match dispatch {
        Dispatch::NotFound => Outcome::NotFound,
        Dispatch::Close => Outcome::Close,
        Dispatch::Reply(reply) => {
            let mut extra: Vec<(&str, &str)> = vec![("Content-Type", reply.content_type)];
            for (name, value) in &reply.headers {
                extra.push((name.as_str(), value.as_str()));
            }
            let head = http::response_head(
                conn.version,
                reply.status,
                reply.body.len() as u64,
                &extra,
                &cfg.extra_headers,
            );
            let body = if conn.method == Method::Head {
                BodyPayload::None
            } else {
                BodyPayload::Owned(reply.body)
            };
            send_response(conn, head, body);
            Outcome::Ok
        }
    }
}

fn serve_redirect(conn: &mut Conn, cfg: &ServerConfig, pattern: &str, target: &str) -> Outcome {
    let location = {
        let path = conn.path_str();
        let rest = path.strip_prefix(pattern).unwrap_or("");
        format!("{target}{rest}")
    };
    let extra = [("Location", location.as_str())];
    let head = http::response_head(conn.version, 308, 0, &extra, &cfg.extra_headers);
    send_response(conn, head, BodyPayload::None);
    Outcome::Ok
}

fn check_auth(conn: &mut Conn, cfg: &ServerConfig, auth: &BasicAuth) -> Outcome {
    let authorized = match conn.header(b"authorization", 0) {
        Some(value) => {
            if value.len() > 6 && value[..5].eq_ignore_ascii_case(b"Basic") && value[5] == b' ' {
                let token = &value[6..];
                auth.tokens.iter().any(|t| t.as_bytes() == token)
            } else {
                false
            }
        }
        None => false,
    };

    if authorized {
        // Credentials are good: let the entries behind us serve.
        return Outcome::NotFound;
    }

    let body = http::error_body(401);
    let challenge = format!("Basic realm=\"{}\"", auth.realm);
    let extra = [
        ("Content-Type", "text/plain"),
        ("WWW-Authenticate", challenge.as_str()),
    ];
    let head = http::response_head(
        conn.version,
        401,
        body.len() as u64,
        &extra,
        &cfg.extra_headers,
    );
    send_response(conn, head, BodyPayload::Owned(body));
    Outcome::Ok
}
