//! Disk-backed content: static files, directory handling, listings.
//!
//! Regular files go out through the zero-copy path; the response head
//! is enqueued as bytes and the payload as a file region. ETags are the
//! file's mtime in seconds, which is all the control panel's assets
//! need for cache revalidation.

use std::fs::{self, Metadata};
use std::os::fd::IntoRawFd;
use std::time::UNIX_EPOCH;

use crate::config::ServerConfig;
use crate::conn::Conn;
use crate::http::{self, Method};
use crate::outbuf::Enqueue;
use crate::router::{self, BodyPayload, DiskRoot, Outcome};

pub fn serve(conn: &mut Conn, cfg: &ServerConfig, disk: &DiskRoot) -> Outcome {
    let path = conn.path_str().to_string();

    // Canonicalisation already removes dot segments; this guard covers
    // configurations that turn it off.
    if path.split('/').any(|seg| seg == "..") {
        return Outcome::NotFound;
    }

    let full = format!("{}{}", disk.root, path);
    if full.len() >= libc::PATH_MAX as usize {
        return Outcome::NotFound;
    }

    let meta = match fs::metadata(&full) {
        Ok(meta) => meta,
        Err(_) => return Outcome::NotFound,
    };

    if meta.is_dir() {
        if !path.ends_with('/') {
            // Canonical directory URL carries the trailing slash.
            let location = format!("{path}/");
            let extra = [("Location", location.as_str())];
            let head = http::response_head(conn.version, 308, 0, &extra, &cfg.extra_headers);
            router::send_response(conn, head, BodyPayload::None);
            return Outcome::Ok;
        }

        if let Some(index) = &disk.index {
            let index_path = format!("{full}{index}");
            if let Ok(index_meta) = fs::metadata(&index_path) {
                if index_meta.is_file() {
                    return serve_file(conn, cfg, &index_path, &index_meta);
                }
            }
        }

        if disk.listing {
            return serve_listing(conn, cfg, &full, &path);
        }

        router::send_error(conn, cfg, 403, false);
        return Outcome::Ok;
    }

    if meta.is_file() {
        return serve_file(conn, cfg, &full, &meta);
    }

    // Sockets, fifos, device nodes: pretend they are not there.
    Outcome::NotFound
}

fn serve_file(conn: &mut Conn, cfg: &ServerConfig, path: &str, meta: &Metadata) -> Outcome {
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let etag = format!("\"{mtime}\"");

    let filename = path.rsplit('/').next().unwrap_or(path);
    let mime = cfg.mime.lookup(filename);

    let not_modified = conn
        .header(b"if-none-match", 0)
        .map(|v| v == etag.as_bytes())
        .unwrap_or(false);

    let extra = [("Content-Type", mime), ("ETag", etag.as_str())];

    if not_modified {
        let head = http::response_head(conn.version, 304, 0, &extra, &cfg.extra_headers);
        router::send_response(conn, head, BodyPayload::None);
        return Outcome::Ok;
    }

    let size = meta.len();
    let head = http::response_head(conn.version, 200, size, &extra, &cfg.extra_headers);

    if conn.method == Method::Head {
        router::send_response(conn, head, BodyPayload::None);
        return Outcome::Ok;
    }

    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(_) => return Outcome::NotFound,
    };

    if !router::send_response(conn, head, BodyPayload::None) {
        return Outcome::Close;
    }

    let file_fd = file.into_raw_fd();
    match conn
        .out
        .enqueue_file(conn.fd, file_fd, 0, size as usize, true)
    {
        Enqueue::Fatal => {
            conn.broken = true;
            Outcome::Close
        }
        _ => Outcome::Ok,
    }
}

fn serve_listing(conn: &mut Conn, cfg: &ServerConfig, dir: &str, url: &str) -> Outcome {
    let reader = match fs::read_dir(dir) {
        Ok(reader) => reader,
        Err(_) => {
            router::send_error(conn, cfg, 403, false);
            return Outcome::Ok;
        }
    };

    // read_dir never yields "." or ".."; the parent link goes back in.
    let mut names: Vec<String> = vec!["..".to_string()];
    for entry in reader.flatten() {
        let mut name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            name.push('/');
        }
        names.push(name);
    }
    names.sort();

    let mut page = String::with_capacity(256 + names.len() * 48);
    page.push_str("<!DOCTYPE html>\n<html><head><title>Index of ");
    page.push_str(url);
    page.push_str("</title></head><body>\n<h1>Index of ");
    page.push_str(url);
    page.push_str("</h1>\n");
    for name in &names {
        page.push_str("<a href=\"");
        page.push_str(name);
        page.push_str("\">");
        page.push_str(name);
        page.push_str("</a><br>\n");
    }
    page.push_str("</body></html>\n");

    let body = page.into_bytes();
    let extra = [("Content-Type", "text/html")];
    let head = http::response_head(
        conn.version,
        200,
        body.len() as u64,
        &extra,
        &cfg.extra_headers,
    );
    let payload = if conn.method == Method::Head {
        BodyPayload::None
    } else {
        BodyPayload::Owned(body)
    };
    router::send_response(conn, head, payload);
    Outcome::Ok
}
