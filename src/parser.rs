//! Incremental HTTP/1.x request parser.
//!
//! A phase machine over the connection's input buffer: request line,
//! headers, body (identity or chunked), trailers. Parsing is in place:
//! request fields become spans into the buffer, the chunked decoder
//! compacts body data forward over its own framing, and the URL is
//! canonicalised inside the request line. No view survives the buffer
//! compaction that ends a request.

use crate::config::ServerConfig;
use crate::conn::{Conn, Phase, Span};
use crate::http::{Method, Version};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Wait for more bytes.
    NeedMore,
    /// A full request is parsed; invoke the router, then `finish`.
    Dispatch,
    /// Protocol error: reply with this status and close.
    Fail(u16),
}

/// Advance the phase machine as far as the buffered bytes allow.
pub fn advance(conn: &mut Conn, cfg: &ServerConfig) -> Progress {
    loop {
        let step = match conn.phase {
            Phase::New => request_line(conn, cfg),
            Phase::Head => head(conn, cfg),
            Phase::Body => body(conn, cfg),
            Phase::Tail => tail(conn, cfg),
            Phase::Ready => return Progress::Dispatch,
            Phase::Finish => return Progress::NeedMore,
        };
        if let Some(progress) = step {
            return progress;
        }
    }
}

/// Close out a dispatched request. Returns whether the connection may
/// carry another: HTTP/1.0 and `Connection: close` end it, otherwise
/// unparsed pipelined bytes move to the front and the view resets.
pub fn finish(conn: &mut Conn) -> bool {
    let keep = conn.version == Version::Http11
        && !conn.close_requested
        && !conn.shutdown_pending
        && !conn.broken;
    if keep {
        let parsed = conn.parsed;
        let len = conn.buf.len();
        if parsed > 0 {
            conn.buf.copy_within(parsed..len, 0);
            conn.buf.truncate(len - parsed);
        }
        conn.reset_request();
    } else {
        conn.phase = Phase::Finish;
    }
    keep
}

/// Locate the next line terminator at or after `from`. In CRLF mode
/// only `\r\n` ends a line (a stray bare `\n` is line content); in LF
/// mode `\n` alone does. Returns (content end, next line start).
fn find_line(buf: &[u8], from: usize, crlf: bool) -> Option<(usize, usize)> {
    let mut i = from;
    while i < buf.len() {
        if buf[i] == b'\n' {
            if !crlf {
                return Some((i, i + 1));
            }
            if i > from && buf[i - 1] == b'\r' {
                return Some((i - 1, i + 1));
            }
        }
        i += 1;
    }
    None
}

fn request_line(conn: &mut Conn, cfg: &ServerConfig) -> Option<Progress> {
    let len = conn.buf.len();

    // Tolerate empty lines ahead of the request line.
    let mut start = conn.pos;
    while start < len && (conn.buf[start] == b'\r' || conn.buf[start] == b'\n') {
        start += 1;
    }
    conn.pos = start;
    conn.req_start = start;

    let nl = match conn.buf[start..].iter().position(|&b| b == b'\n') {
        Some(rel) => start + rel,
        None => {
            if len - start > cfg.max_line_len {
                return Some(Progress::Fail(413));
            }
            return Some(Progress::NeedMore);
        }
    };

    // The terminator found here is the one this whole request uses.
    let crlf = nl > start && conn.buf[nl - 1] == b'\r';
    let line_end = if crlf { nl - 1 } else { nl };
    conn.crlf = crlf;

    if line_end - start > cfg.max_line_len {
        return Some(Progress::Fail(413));
    }

    // method SP request-uri SP version
    let mut tokens: [(usize, usize); 3] = [(0, 0); 3];
    let mut count = 0;
    let mut i = start;
    while i < line_end {
        if conn.buf[i] == b' ' {
            i += 1;
            continue;
        }
        let tok_start = i;
        while i < line_end && conn.buf[i] != b' ' {
            i += 1;
        }
        if count == 3 {
            return Some(Progress::Fail(400));
        }
        tokens[count] = (tok_start, i);
        count += 1;
    }
    if count != 3 {
        return Some(Progress::Fail(400));
    }

    let method = match Method::from_bytes(&conn.buf[tokens[0].0..tokens[0].1]) {
        Some(m) => m,
        None => return Some(Progress::Fail(400)),
    };
    let version = match Version::from_bytes(&conn.buf[tokens[2].0..tokens[2].1]) {
        Some(v) => v,
        None => return Some(Progress::Fail(400)),
    };

    let (uri_start, uri_end) = tokens[1];
    if std::str::from_utf8(&conn.buf[uri_start..uri_end]).is_err() {
        return Some(Progress::Fail(400));
    }

    // Split on the last '?' so queries may themselves contain '?'.
    let qmark = conn.buf[uri_start..uri_end]
        .iter()
        .rposition(|&b| b == b'?')
        .map(|rel| uri_start + rel);
    let (path_end, query) = match qmark {
        Some(q) => (q, Some(Span::new(q + 1, uri_end - q - 1))),
        None => (uri_end, None),
    };

    let mut path = Span::new(uri_start, path_end - uri_start);
    if cfg.canonicalize {
        let new_len = canonicalize_path(&mut conn.buf[path.off..path.off + path.len]);
        path.len = new_len;
    }

    conn.method = method;
    conn.version = version;
    conn.path = path;
    conn.query = query;
    conn.head_start = nl + 1;
    conn.pos = nl + 1;
    conn.phase = Phase::Head;
    None
}

/// Parse field lines (headers or trailers) up to the blank line.
/// Obsolete line folding is rejected outright.
fn field_lines(
    conn: &mut Conn,
    limit: usize,
    limit_base: usize,
    into_trailers: bool,
) -> FieldStep {
    loop {
        let (end, next) = match find_line(&conn.buf, conn.pos, conn.crlf) {
            Some(found) => found,
            None => {
                if conn.buf.len() - limit_base > limit {
                    return FieldStep::Fail(413);
                }
                return FieldStep::NeedMore;
            }
        };
        if next - limit_base > limit {
            return FieldStep::Fail(413);
        }

        if end == conn.pos {
            conn.pos = next;
            return FieldStep::Done;
        }

        let line_start = conn.pos;
        if conn.buf[line_start] == b' ' || conn.buf[line_start] == b'\t' {
            return FieldStep::Fail(400);
        }

        let colon = match conn.buf[line_start..end].iter().position(|&b| b == b':') {
            Some(rel) => line_start + rel,
            None => return FieldStep::Fail(400),
        };
        if colon == line_start {
            return FieldStep::Fail(400);
        }

        let mut val_start = colon + 1;
        while val_start < end && (conn.buf[val_start] == b' ' || conn.buf[val_start] == b'\t') {
            val_start += 1;
        }
        let mut val_end = end;
        while val_end > val_start
            && matches!(conn.buf[val_end - 1], b' ' | b'\t' | b'\r')
        {
            val_end -= 1;
        }

        let name = Span::new(line_start, colon - line_start);
        let value = Span::new(val_start, val_end - val_start);
        if into_trailers {
            conn.trailers.push((name, value));
        } else {
            conn.headers.push((name, value));
        }
        conn.pos = next;
    }
}

enum FieldStep {
    NeedMore,
    Done,
    Fail(u16),
}

fn head(conn: &mut Conn, cfg: &ServerConfig) -> Option<Progress> {
    let base = conn.head_start;
    match field_lines(conn, cfg.max_head_len, base, false) {
        FieldStep::NeedMore => return Some(Progress::NeedMore),
        FieldStep::Fail(status) => return Some(Progress::Fail(status)),
        FieldStep::Done => {}
    }
    conn.head_end = conn.pos;

    if let Some(status) = inspect_headers(conn, cfg) {
        return Some(Progress::Fail(status));
    }

    if conn.chunked {
        conn.body_len = 0;
        conn.phase = Phase::Body;
        return None;
    }

    let cl = conn.content_length.unwrap_or(0) as usize;
    if cl == 0 {
        conn.body = Span::new(conn.head_end, 0);
        conn.parsed = conn.head_end;
        conn.phase = Phase::Ready;
        return None;
    }
    conn.phase = Phase::Body;
    None
}

/// Walk the collected headers for the fields the core itself consumes.
fn inspect_headers(conn: &mut Conn, cfg: &ServerConfig) -> Option<u16> {
    let mut content_length: Option<u64> = None;
    let mut host_count = 0usize;
    let mut chunked = false;
    let mut close_requested = false;

    for (ns, vs) in &conn.headers {
        let name = ns.slice(&conn.buf);
        let value = vs.slice(&conn.buf);

        if name.eq_ignore_ascii_case(b"content-length") {
            let parsed = match parse_decimal(value) {
                Some(v) => v,
                None => return Some(400),
            };
            // equal repeats are tolerated, conflicting ones are not
            if let Some(prev) = content_length {
                if prev != parsed {
                    return Some(400);
                }
            }
            content_length = Some(parsed);
        } else if name.eq_ignore_ascii_case(b"transfer-encoding") {
            if !value.eq_ignore_ascii_case(b"chunked") {
                return Some(501);
            }
            chunked = true;
        } else if name.eq_ignore_ascii_case(b"host") {
            host_count += 1;
        } else if name.eq_ignore_ascii_case(b"connection") {
            if value.eq_ignore_ascii_case(b"close") {
                close_requested = true;
            }
        }
    }

    if conn.version == Version::Http11 && host_count != 1 {
        return Some(400);
    }
    if chunked && content_length.is_some() {
        return Some(400);
    }
    if let Some(cl) = content_length {
        if cl > cfg.max_body_len as u64 {
            return Some(413);
        }
    }

    conn.content_length = content_length;
    conn.chunked = chunked;
    if close_requested {
        conn.close_requested = true;
    }
    None
}

/// Strict decimal parse; anything but digits means a malformed frame.
fn parse_decimal(value: &[u8]) -> Option<u64> {
    if value.is_empty() {
        return None;
    }
    let mut acc: u64 = 0;
    for &b in value {
        if !b.is_ascii_digit() {
            return None;
        }
        acc = acc.checked_mul(10)?.checked_add((b - b'0') as u64)?;
    }
    Some(acc)
}

fn body(conn: &mut Conn, cfg: &ServerConfig) -> Option<Progress> {
    if conn.chunked {
        return chunked_body(conn, cfg);
    }

    let cl = conn.content_length.unwrap_or(0) as usize;
    let need = conn.head_end + cl;
    if conn.buf.len() < need {
        return Some(Progress::NeedMore);
    }
    conn.body = Span::new(conn.head_end, cl);
    conn.parsed = need;
    conn.phase = Phase::Ready;
    None
}

fn chunked_body(conn: &mut Conn, cfg: &ServerConfig) -> Option<Progress> {
    let term_len = if conn.crlf { 2 } else { 1 };

    loop {
        let (line_end, data_start) = match find_line(&conn.buf, conn.pos, conn.crlf) {
            Some(found) => found,
            None => {
                if conn.buf.len() - conn.pos > cfg.max_line_len {
                    return Some(Progress::Fail(413));
                }
                return Some(Progress::NeedMore);
            }
        };

        let size = match parse_chunk_size(&conn.buf[conn.pos..line_end]) {
            Some(size) => size,
            None => return Some(Progress::Fail(400)),
        };

        if size == 0 {
            conn.pos = data_start;
            conn.phase = Phase::Tail;
            return None;
        }

        if conn.body_len + size > cfg.max_body_len {
            return Some(Progress::Fail(413));
        }

        let need = data_start + size + term_len;
        if conn.buf.len() < need {
            return Some(Progress::NeedMore);
        }

        // Each chunk must be closed by the request's line terminator.
        let term_ok = if conn.crlf {
            conn.buf[data_start + size] == b'\r' && conn.buf[data_start + size + 1] == b'\n'
        } else {
            conn.buf[data_start + size] == b'\n'
        };
        if !term_ok {
            return Some(Progress::Fail(400));
        }

        // Compact the chunk data onto the end of the decoded body. The
        // destination always precedes the chunk's own length line, so
        // the move is strictly forward in the buffer.
        let dst = conn.head_end + conn.body_len;
        debug_assert!(dst <= data_start);
        conn.buf.copy_within(data_start..data_start + size, dst);
        conn.body_len += size;
        conn.pos = data_start + size + term_len;
    }
}

/// `hex-length [;extensions]`; extensions are tolerated and ignored.
fn parse_chunk_size(line: &[u8]) -> Option<usize> {
    let hex_end = line
        .iter()
        .position(|&b| b == b';')
        .unwrap_or(line.len());
    let hex = &line[..hex_end];
    if hex.is_empty() {
        return None;
    }
    let mut acc: usize = 0;
    for &b in hex {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => return None,
        };
        acc = acc.checked_mul(16)?.checked_add(digit as usize)?;
    }
    Some(acc)
}

fn tail(conn: &mut Conn, cfg: &ServerConfig) -> Option<Progress> {
    let base = conn.head_end;
    match field_lines(conn, cfg.max_body_len, base, true) {
        FieldStep::NeedMore => return Some(Progress::NeedMore),
        FieldStep::Fail(status) => return Some(Progress::Fail(status)),
        FieldStep::Done => {}
    }
    conn.body = Span::new(conn.head_end, conn.body_len);
    conn.parsed = conn.pos;
    conn.phase = Phase::Ready;
    None
}

/// In-place URL canonicalisation: fold `//` runs, resolve `.`, resolve
/// `..` against the already-written output. Idempotent; the result
/// never contains a `.` or `..` segment. Paths not starting with `/`
/// are left untouched (the router will 404 them).
pub fn canonicalize_path(b: &mut [u8]) -> usize {
    let len = b.len();
    if len == 0 || b[0] != b'/' {
        return len;
    }

    let mut w = 0usize;
    let mut r = 0usize;
    while r < len {
        // r sits on a '/'; fold any run of them.
        while r + 1 < len && b[r + 1] == b'/' {
            r += 1;
        }
        let seg_start = r + 1;
        let mut seg_end = seg_start;
        while seg_end < len && b[seg_end] != b'/' {
            seg_end += 1;
        }
        let seg_len = seg_end - seg_start;

        if seg_len == 1 && b[seg_start] == b'.' {
            r = seg_end;
            if r >= len {
                b[w] = b'/';
                w += 1;
            }
        } else if seg_len == 2 && b[seg_start] == b'.' && b[seg_start + 1] == b'.' {
            while w > 0 && b[w - 1] != b'/' {
                w -= 1;
            }
            if w > 0 {
                w -= 1;
            }
            r = seg_end;
            if r >= len {
                b[w] = b'/';
                w += 1;
            }
        } else {
            b[w] = b'/';
            w += 1;
            for k in seg_start..seg_end {
                b[w] = b[k];
                w += 1;
            }
            r = seg_end;
        }
    }

    if w == 0 {
        b[0] = b'/';
        w = 1;
    }
    w
}
