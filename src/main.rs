//! The control-panel daemon: CLI over the server core plus the default
//! content table (embedded panel page, player status endpoint, asset
//! docroot).

use std::net::{Ipv4Addr, Ipv6Addr};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use mazurka::{
    ContentEntry, ContentKind, DiskRoot, Dispatch, Embedded, MatchMode, Reply, Server,
    ServerConfig,
};

const PANEL_PAGE: &[u8] = include_bytes!("../assets/panel.html");
const PANEL_ETAG: &str = "\"panel-1\"";

#[derive(Parser)]
#[command(name = "mazurka")]
#[command(about = "Embedded HTTP/1.1 control panel server for the music player")]
#[command(version)]
struct Cli {
    /// Unprivileged user to run as (applied when started as root)
    #[arg(short = 'u', long)]
    user: Option<String>,

    /// Directory to chroot into (applied when started as root)
    #[arg(short = 'c', long)]
    chroot: Option<String>,

    /// IPv4 listen address
    #[arg(short = 'i', long)]
    ip: Option<Ipv4Addr>,

    /// IPv6 listen address
    #[arg(short = 'I', long)]
    ip6: Option<Ipv6Addr>,

    /// TCP port
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Maximum concurrent connections
    #[arg(short = 'C', long)]
    maxconn: Option<usize>,

    /// Maximum request body size in bytes
    #[arg(short = 'm', long)]
    maxbodylen: Option<usize>,

    /// Pending-write ceiling per connection in bytes
    #[arg(short = 'M', long)]
    maxwblen: Option<usize>,

    /// Idle timeout in seconds
    #[arg(short = 't', long)]
    timeout: Option<u64>,

    /// Directory of on-disk assets served beneath /
    #[arg(long, default_value = "./assets")]
    docroot: String,
}

fn build_config(cli: Cli) -> ServerConfig {
    let mut cfg = ServerConfig::default();

    if let Some(ip) = cli.ip {
        cfg.ip4 = Some(ip);
    }
    if let Some(ip6) = cli.ip6 {
        cfg.ip6 = Some(ip6);
    }
    if let Some(port) = cli.port {
        cfg.port = port;
    }
    cfg.user = cli.user;
    cfg.chroot = cli.chroot;
    if let Some(maxconn) = cli.maxconn {
        cfg.max_conns = maxconn;
    }
    if let Some(maxbodylen) = cli.maxbodylen {
        cfg.max_body_len = maxbodylen;
    }
    if let Some(maxwblen) = cli.maxwblen {
        cfg.max_wb_len = maxwblen;
    }
    if let Some(timeout) = cli.timeout {
        cfg.timeout_secs = timeout;
    }

    cfg.content = vec![
        ContentEntry::new(
            "/",
            MatchMode::Exact,
            ContentKind::Embedded(Embedded {
                mime: "text/html",
                etag: Some(PANEL_ETAG),
                body: PANEL_PAGE,
            }),
        ),
        ContentEntry::new(
            "/panel",
            MatchMode::Exact,
            ContentKind::Redirect {
                target: "/".to_string(),
            },
        ),
        // Stand-in for the music-daemon callback; the real daemon
        // client plugs in the same way.
        ContentEntry::new(
            "/status",
            MatchMode::Exact,
            ContentKind::Dynamic(Arc::new(|_req| {
                Dispatch::Reply(Reply::json(
                    &br#"{"state":"stopped","volume":64,"track":null}"#[..],
                ))
            })),
        ),
        ContentEntry::new(
            "/control",
            MatchMode::Exact,
            ContentKind::Dynamic(Arc::new(|req| {
                let known = [&b"play"[..], b"stop", b"next", b"prev"];
                if known.contains(&req.body) {
                    Dispatch::Reply(Reply::json(&br#"{"ok":true}"#[..]))
                } else {
                    Dispatch::Reply(Reply::new(400))
                }
            })),
        ),
        ContentEntry::new(
            "/",
            MatchMode::DirPrefix,
            ContentKind::Disk(DiskRoot {
                root: cli.docroot,
                index: Some("index.html".to_string()),
                listing: false,
            }),
        ),
    ];

    cfg
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let cfg = build_config(cli);

    match Server::new(cfg).run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "server failed");
            ExitCode::FAILURE
        }
    }
}
