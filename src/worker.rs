//! The connection supervisor: one thread, one epoll set, every socket.
//!
//! Listener readiness feeds the accept path, connection readiness is
//! dispatched drain-first then parse, and the resulting directive maps
//! back onto epoll interest. Each wakeup also sweeps for idle
//! connections; the wait timeout is the idle timeout so the sweep is
//! never late by more than one period.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, trace, warn};

use crate::config::ServerConfig;
use crate::conn::Conn;
use crate::outbuf::Drain;
use crate::parser::{self, Progress};
use crate::router;
use crate::slab::ConnectionSlab;
use crate::syscalls::{
    self, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP, Epoll,
};

const TOKEN_WAKE: u64 = u64::MAX;
const TOKEN_LISTENER_BASE: u64 = u64::MAX - 8;
const EVENT_BATCH: usize = 256;
const READ_CHUNK: usize = 4096;

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub struct Worker<'a> {
    cfg: &'a ServerConfig,
    epoll: Epoll,
    slab: ConnectionSlab,
    listeners: Vec<(RawFd, u64)>,
    wake_fd: RawFd,
    resp_503: Vec<u8>,
}

impl<'a> Worker<'a> {
    pub fn new(cfg: &'a ServerConfig, listeners: &[RawFd], wake_fd: RawFd) -> std::io::Result<Self> {
        let epoll = Epoll::new()?;

        let mut registered = Vec::with_capacity(listeners.len());
        for (i, &fd) in listeners.iter().enumerate() {
            let token = TOKEN_LISTENER_BASE + i as u64;
            epoll.add(fd, token, EPOLLIN)?;
            registered.push((fd, token));
        }
        epoll.add(wake_fd, TOKEN_WAKE, EPOLLIN)?;

        // Rendered once: the accept path must not allocate to say no.
        let resp_503 = b"HTTP/1.1 503 Service Unavailable\r\n\
                         Content-Length: 25\r\n\
                         Connection: close\r\n\r\n\
                         503 Service Unavailable\r\n"
            .to_vec();

        Ok(Self {
            cfg,
            epoll,
            slab: ConnectionSlab::new(cfg.max_conns),
            listeners: registered,
            wake_fd,
            resp_503,
        })
    }

    pub fn run(&mut self, shutdown: &AtomicBool) -> std::io::Result<()> {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; EVENT_BATCH];
        let timeout_ms = (self.cfg.timeout_secs.max(1) * 1000).min(i32::MAX as u64) as i32;

        debug!(capacity = self.slab.capacity(), "supervisor entering event loop");

        while !shutdown.load(Ordering::Acquire) {
            let n = self.epoll.wait(&mut events, timeout_ms)?;
            let now = unix_now();

            for event in events.iter().take(n) {
                let token = event.u64;
                let revents = event.events;

                if token == TOKEN_WAKE {
                    syscalls::drain_pipe(self.wake_fd);
                } else if token >= TOKEN_LISTENER_BASE {
                    let listen_fd = self
                        .listeners
                        .iter()
                        .find(|(_, t)| *t == token)
                        .map(|&(fd, _)| fd);
                    if let Some(fd) = listen_fd {
                        self.accept_ready(fd, now);
                    }
                } else {
                    self.conn_ready(token as usize, revents, now);
                }
            }

            self.reap_idle(now);
        }

        debug!("supervisor draining remaining connections");
        self.shutdown_all();
        Ok(())
    }

    fn accept_ready(&mut self, listen_fd: RawFd, now: u64) {
        loop {
            let (fd, ip) = match syscalls::accept_connection(listen_fd) {
                Ok(Some(pair)) => pair,
                Ok(None) => break,
                Err(err) => {
                    warn!(%err, "accept failed");
                    break;
                }
            };

            let from_same_client = self
                .slab
                .iter_active()
                .filter(|(_, c)| c.peer == ip)
                .count();
            if from_same_client >= self.cfg.max_client_conns || self.slab.is_full() {
                // Resource exhaustion only ever costs the newcomer.
                let _ = syscalls::write_nonblocking(fd, &self.resp_503);
                syscalls::close_fd(fd);
                debug!(%ip, "connection refused with 503");
                continue;
            }

            let conn = Conn::new(fd, ip, now, self.cfg.max_wb_len);
            let idx = match self.slab.allocate(conn) {
                Some(idx) => idx,
                None => {
                    let _ = syscalls::write_nonblocking(fd, &self.resp_503);
                    syscalls::close_fd(fd);
                    continue;
                }
            };
            if let Err(err) = self.epoll.add(fd, idx as u64, EPOLLIN | EPOLLRDHUP) {
                warn!(%err, "epoll registration failed");
                self.slab.free(idx);
                syscalls::close_fd(fd);
                continue;
            }
            trace!(fd, %ip, "accepted");
        }
    }

    fn conn_ready(&mut self, idx: usize, revents: u32, now: u64) {
        if revents & (EPOLLERR | EPOLLHUP | EPOLLRDHUP) != 0 {
            self.close_conn(idx);
            return;
        }

        let cfg = self.cfg;
        let mut dead = false;

        {
            let conn = match self.slab.get_mut(idx) {
                Some(conn) => conn,
                None => return,
            };
            let fd = conn.fd;
            let mut progress = false;

            if revents & EPOLLOUT != 0 {
                match conn.out.drain(fd) {
                    Drain::Fatal => dead = true,
                    Drain::Pending | Drain::Empty => progress = true,
                }
                // Output drained below the limit may unpause the parser.
                if !dead && !conn.shutdown_pending && !conn.out.over_limit() {
                    pump(conn, cfg);
                }
            }

            if !dead && revents & EPOLLIN != 0 && !conn.shutdown_pending {
                let mut tmp = [0u8; READ_CHUNK];
                loop {
                    if conn.out.over_limit() || conn.shutdown_pending || conn.broken {
                        break;
                    }
                    match syscalls::read_nonblocking(fd, &mut tmp) {
                        Ok(Some(0)) => {
                            dead = true;
                            break;
                        }
                        Ok(Some(n)) => {
                            conn.buf.extend_from_slice(&tmp[..n]);
                            progress = true;
                            pump(conn, cfg);
                        }
                        Ok(None) => break,
                        Err(_) => {
                            dead = true;
                            break;
                        }
                    }
                }
            }

            if conn.broken {
                dead = true;
            }

            if !dead {
                if progress {
                    conn.last_active = now;
                }

                let pending = !conn.out.is_empty();
                let interest = if conn.shutdown_pending && !pending {
                    if !conn.half_closed {
                        syscalls::shutdown_write(fd);
                        conn.half_closed = true;
                    }
                    EPOLLRDHUP
                } else {
                    let mut interest = EPOLLRDHUP;
                    if pending {
                        interest |= EPOLLOUT;
                    }
                    if !conn.shutdown_pending && !conn.out.over_limit() {
                        interest |= EPOLLIN;
                    }
                    interest
                };
                if self.epoll.modify(fd, idx as u64, interest).is_err() {
                    dead = true;
                }
            }
        }

        if dead {
            self.close_conn(idx);
        }
    }

    /// Half-close expired connections; a connection that stays expired
    /// through a second sweep is closed outright.
    fn reap_idle(&mut self, now: u64) {
        for idx in 0..self.slab.capacity() {
            let expired = match self.slab.get(idx) {
                Some(conn) => now.saturating_sub(conn.last_active) > self.cfg.timeout_secs,
                None => false,
            };
            if !expired {
                continue;
            }

            let already_half_closed = self
                .slab
                .get(idx)
                .map(|c| c.half_closed)
                .unwrap_or(true);
            if already_half_closed {
                self.close_conn(idx);
                continue;
            }

            if let Some(conn) = self.slab.get_mut(idx) {
                let fd = conn.fd;
                trace!(fd, "idle timeout, half-closing");
                syscalls::shutdown_write(fd);
                conn.half_closed = true;
                conn.shutdown_pending = true;
                conn.last_active = now;
                let _ = self.epoll.modify(fd, idx as u64, EPOLLRDHUP);
            }
        }
    }

    fn close_conn(&mut self, idx: usize) {
        if let Some(conn) = self.slab.free(idx) {
            let _ = self.epoll.delete(conn.fd);
            syscalls::close_fd(conn.fd);
            trace!(fd = conn.fd, served = conn.requests_served, "closed");
            // Dropping the Conn releases its output chain, closing any
            // queued file descriptors flagged close-on-done.
        }
    }

    fn shutdown_all(&mut self) {
        for idx in 0..self.slab.capacity() {
            // One last push for responses already queued, then close.
            if let Some(conn) = self.slab.get_mut(idx) {
                if !conn.out.is_empty() {
                    let fd = conn.fd;
                    let _ = conn.out.drain(fd);
                }
            }
            self.close_conn(idx);
        }
    }
}

/// Run the parser over buffered bytes, dispatching every completed
/// request, until it wants more input, the connection turns, or
/// backpressure pauses it.
fn pump(conn: &mut Conn, cfg: &ServerConfig) {
    loop {
        if conn.shutdown_pending || conn.broken || conn.out.over_limit() {
            return;
        }
        match parser::advance(conn, cfg) {
            Progress::NeedMore => return,
            Progress::Fail(status) => {
                router::send_error(conn, cfg, status, true);
                conn.shutdown_pending = true;
                return;
            }
            Progress::Dispatch => {
                conn.requests_served += 1;
                let outcome = router::dispatch(conn, cfg);
                if outcome == router::Outcome::Close {
                    conn.shutdown_pending = true;
                }
                if !parser::finish(conn) {
                    conn.shutdown_pending = true;
                    return;
                }
            }
        }
    }
}
