//! Per-connection state.
//!
//! A `Conn` lives from accept to close. Between pipelined requests the
//! input buffer and output chain are retained; everything request-scoped
//! is reset. Parsed request fields are `(offset, len)` spans into the
//! input buffer so no view can outlive the buffer compaction at the end
//! of a request.

use std::net::IpAddr;
use std::os::fd::RawFd;

use crate::http::{Method, Version};
use crate::outbuf::OutChain;

/// Initial input-buffer capacity; grows on demand up to the configured
/// phase limits.
pub const READ_BUF_SIZE: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    New,
    Head,
    Body,
    Tail,
    Ready,
    Finish,
}

/// A byte range inside the connection's input buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Span {
    pub off: usize,
    pub len: usize,
}

impl Span {
    pub fn new(off: usize, len: usize) -> Self {
        Self { off, len }
    }

    pub fn slice<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        buf.get(self.off..self.off + self.len).unwrap_or(&[])
    }
}

pub struct Conn {
    pub fd: RawFd,
    pub peer: IpAddr,
    pub buf: Vec<u8>,
    pub out: OutChain,

    // Parser state
    pub phase: Phase,
    pub pos: usize,
    pub req_start: usize,
    pub head_start: usize,
    pub head_end: usize,
    pub body_len: usize,
    pub parsed: usize,
    pub content_length: Option<u64>,

    // Parsed request view
    pub method: Method,
    pub version: Version,
    pub path: Span,
    pub query: Option<Span>,
    pub headers: Vec<(Span, Span)>,
    pub trailers: Vec<(Span, Span)>,
    pub body: Span,

    // Request flags
    pub crlf: bool,
    pub chunked: bool,
    pub close_requested: bool,

    // Connection flags
    pub shutdown_pending: bool,
    pub half_closed: bool,
    pub broken: bool,

    pub last_active: u64,
    pub requests_served: u32,
}

impl Conn {
    pub fn new(fd: RawFd, peer: IpAddr, now: u64, max_wb_len: usize) -> Self {
        Self {
            fd,
            peer,
            buf: Vec::with_capacity(READ_BUF_SIZE),
            out: OutChain::new(max_wb_len),
            phase: Phase::New,
            pos: 0,
            req_start: 0,
            head_start: 0,
            head_end: 0,
            body_len: 0,
            parsed: 0,
            content_length: None,
            method: Method::Get,
            version: Version::Http11,
            path: Span::default(),
            query: None,
            headers: Vec::new(),
            trailers: Vec::new(),
            body: Span::default(),
            crlf: false,
            chunked: false,
            close_requested: false,
            shutdown_pending: false,
            half_closed: false,
            broken: false,
            last_active: now,
            requests_served: 0,
        }
    }

    /// Reset request-scoped state for the next pipelined request. The
    /// buffer itself is compacted by the parser before this runs; the
    /// output chain is untouched so earlier responses keep draining.
    pub fn reset_request(&mut self) {
        self.phase = Phase::New;
        self.pos = 0;
        self.req_start = 0;
        self.head_start = 0;
        self.head_end = 0;
        self.body_len = 0;
        self.parsed = 0;
        self.content_length = None;
        self.method = Method::Get;
        self.version = Version::Http11;
        self.path = Span::default();
        self.query = None;
        self.headers.clear();
        self.trailers.clear();
        self.body = Span::default();
        self.crlf = false;
        self.chunked = false;
        self.close_requested = false;
    }

    /// Case-insensitive header lookup over headers then trailers.
    /// Values come back with surrounding whitespace already trimmed;
    /// `skip` steps over that many earlier occurrences of the name.
    pub fn header(&self, name: &[u8], skip: usize) -> Option<&[u8]> {
        let mut remaining = skip;
        for (ns, vs) in self.headers.iter().chain(self.trailers.iter()) {
            if ns.slice(&self.buf).eq_ignore_ascii_case(name) {
                if remaining == 0 {
                    return Some(vs.slice(&self.buf));
                }
                remaining -= 1;
            }
        }
        None
    }

    pub fn path_str(&self) -> &str {
        std::str::from_utf8(self.path.slice(&self.buf)).unwrap_or("")
    }

    pub fn query_str(&self) -> Option<&str> {
        self.query
            .as_ref()
            .and_then(|q| std::str::from_utf8(q.slice(&self.buf)).ok())
    }

    pub fn body_bytes(&self) -> &[u8] {
        self.body.slice(&self.buf)
    }

    pub fn request_view(&self) -> RequestView<'_> {
        RequestView {
            method: self.method,
            version: self.version,
            path: self.path_str(),
            query: self.query_str(),
            body: self.body_bytes(),
            buf: &self.buf,
            headers: &self.headers,
            trailers: &self.trailers,
        }
    }
}

/// Borrowed view of the current request handed to dynamic handlers.
/// It cannot outlive the dispatch: the buffer it points into is
/// compacted as soon as the request finishes.
pub struct RequestView<'a> {
    pub method: Method,
    pub version: Version,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub body: &'a [u8],
    buf: &'a [u8],
    headers: &'a [(Span, Span)],
    trailers: &'a [(Span, Span)],
}

impl<'a> RequestView<'a> {
    pub fn header(&self, name: &[u8], skip: usize) -> Option<&'a [u8]> {
        let mut remaining = skip;
        for (ns, vs) in self.headers.iter().chain(self.trailers.iter()) {
            if ns.slice(self.buf).eq_ignore_ascii_case(name) {
                if remaining == 0 {
                    return Some(vs.slice(self.buf));
                }
                remaining -= 1;
            }
        }
        None
    }
}
