//! Server configuration.
//!
//! Everything the core needs is decided before the loop starts: bind
//! addresses, privilege targets, limits, the ordered content table and
//! the MIME table. All of it is immutable once the server runs.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::mime::MimeTable;
use crate::router::ContentEntry;

pub struct ServerConfig {
    /// IPv4 listen address; `None` disables the v4 listener.
    pub ip4: Option<Ipv4Addr>,
    /// IPv6 listen address; `None` disables the v6 listener.
    pub ip6: Option<Ipv6Addr>,
    pub port: u16,

    /// Unprivileged user to drop to when started as root.
    pub user: Option<String>,
    /// Chroot directory, applied when started as root.
    pub chroot: Option<String>,

    pub max_conns: usize,
    pub max_client_conns: usize,
    /// Seconds without a successful read or write before a connection
    /// is half-closed.
    pub timeout_secs: u64,

    pub max_line_len: usize,
    pub max_head_len: usize,
    pub max_body_len: usize,
    /// Pending-write ceiling; reads pause above it, enqueues overflow
    /// at twice it.
    pub max_wb_len: usize,

    /// Headers appended to every response.
    pub extra_headers: Vec<(String, String)>,

    pub content: Vec<ContentEntry>,
    pub mime: MimeTable,

    pub canonicalize: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ip4: Some(Ipv4Addr::UNSPECIFIED),
            ip6: None,
            port: 8080,
            user: None,
            chroot: None,
            max_conns: 64,
            max_client_conns: 16,
            timeout_secs: 30,
            max_line_len: 2048,
            max_head_len: 8192,
            max_body_len: 64 * 1024,
            max_wb_len: 16 * 1024,
            extra_headers: vec![(
                "Server".to_string(),
                concat!("mazurka/", env!("CARGO_PKG_VERSION")).to_string(),
            )],
            content: Vec::new(),
            mime: MimeTable::default(),
            canonicalize: true,
        }
    }
}
