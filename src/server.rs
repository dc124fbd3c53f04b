//! Server lifecycle: bind, drop privileges, run the loop, tear down.

use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::syscalls;
use crate::worker::Worker;

const LISTEN_BACKLOG: i32 = 32;

pub struct Server {
    cfg: ServerConfig,
    listeners: Vec<RawFd>,
    port: u16,
}

impl Server {
    pub fn new(cfg: ServerConfig) -> Self {
        Self {
            cfg,
            listeners: Vec::new(),
            port: 0,
        }
    }

    /// Create the configured listeners. Idempotent; `run`/`serve` call
    /// it if it has not happened yet. With port 0 the first listener's
    /// kernel-assigned port is reused for the second family.
    pub fn bind(&mut self) -> Result<()> {
        if !self.listeners.is_empty() {
            return Ok(());
        }

        let mut port = self.cfg.port;
        let mut addrs: Vec<SocketAddr> = Vec::new();
        if let Some(ip) = self.cfg.ip4 {
            addrs.push(SocketAddr::from((ip, port)));
        }
        if let Some(ip) = self.cfg.ip6 {
            addrs.push(SocketAddr::from((ip, port)));
        }
        if addrs.is_empty() {
            return Err(ServerError::Bind(
                "no listen address configured".to_string(),
            ));
        }

        for mut addr in addrs {
            addr.set_port(port);
            let fd = syscalls::create_listener(addr, LISTEN_BACKLOG)?;
            if port == 0 {
                port = syscalls::local_port(fd)?;
            }
            info!(%addr, port, "listening");
            self.listeners.push(fd);
        }
        self.port = port;
        Ok(())
    }

    /// The bound port; meaningful after `bind`.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Run until SIGINT/SIGTERM. The handler flips the shutdown flag
    /// and pokes the wake pipe so the poll wait returns immediately;
    /// nothing else in the process depends on interrupted syscalls.
    pub fn run(mut self) -> Result<()> {
        syscalls::ignore_noise_signals();
        self.bind()?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let (wake_r, wake_w) = syscalls::create_pipe()?;
        {
            let flag = shutdown.clone();
            ctrlc::set_handler(move || {
                flag.store(true, Ordering::Release);
                syscalls::notify_pipe(wake_w);
            })
            .map_err(|e| ServerError::Signal(e.to_string()))?;
        }

        self.serve_inner(&shutdown, wake_r)
    }

    /// Run with an externally owned shutdown flag and no signal
    /// handling; the loop notices the flag within one timeout period.
    pub fn serve(mut self, shutdown: Arc<AtomicBool>) -> Result<()> {
        syscalls::ignore_noise_signals();
        self.bind()?;
        let (wake_r, _wake_w) = syscalls::create_pipe()?;
        self.serve_inner(&shutdown, wake_r)
    }

    fn serve_inner(self, shutdown: &AtomicBool, wake_r: RawFd) -> Result<()> {
        if syscalls::effective_uid_is_root()
            && (self.cfg.user.is_some() || self.cfg.chroot.is_some())
        {
            syscalls::drop_privileges(self.cfg.user.as_deref(), self.cfg.chroot.as_deref())?;
            info!(
                user = self.cfg.user.as_deref().unwrap_or("-"),
                chroot = self.cfg.chroot.as_deref().unwrap_or("-"),
                "privileges dropped"
            );
        }

        let mut worker = Worker::new(&self.cfg, &self.listeners, wake_r)?;
        let result = worker.run(shutdown);
        drop(worker);

        for &fd in &self.listeners {
            syscalls::close_fd(fd);
        }
        syscalls::close_fd(wake_r);
        info!("shutdown complete");
        result.map_err(Into::into)
    }
}
