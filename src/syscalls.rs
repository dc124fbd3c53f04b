//! Thin libc wrappers for the non-blocking socket and epoll plumbing.
//!
//! Everything here is Linux-first: the supervisor depends on
//! `EPOLLRDHUP` for half-close detection and on `sendfile(2)` for the
//! zero-copy file path.

use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::RawFd;
use std::ptr;

use libc::{c_int, c_void, socklen_t};

use crate::error::{Result, ServerError};

pub const EPOLLIN: u32 = libc::EPOLLIN as u32;
pub const EPOLLOUT: u32 = libc::EPOLLOUT as u32;
pub const EPOLLERR: u32 = libc::EPOLLERR as u32;
pub const EPOLLHUP: u32 = libc::EPOLLHUP as u32;
pub const EPOLLRDHUP: u32 = libc::EPOLLRDHUP as u32;

/// Create a non-blocking listening socket bound to `addr`.
///
/// SO_REUSEADDR is always set; v6 sockets are bound V6ONLY so the v4
/// and v6 listeners never fight over the same port.
pub fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<RawFd> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    unsafe {
        let fd = libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let one: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        if domain == libc::AF_INET6 {
            libc::setsockopt(
                fd,
                libc::IPPROTO_IPV6,
                libc::IPV6_V6ONLY,
                &one as *const _ as *const c_void,
                mem::size_of_val(&one) as socklen_t,
            );
        }

        if let Err(err) = bind_addr(fd, &addr) {
            libc::close(fd);
            return Err(err);
        }

        if libc::listen(fd, backlog) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        Ok(fd)
    }
}

fn bind_addr(fd: c_int, addr: &SocketAddr) -> io::Result<()> {
    unsafe {
        let res = match addr {
            SocketAddr::V4(a) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: a.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(a.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                )
            }
            SocketAddr::V6(a) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: a.port().to_be(),
                    sin6_flowinfo: a.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: a.ip().octets(),
                    },
                    sin6_scope_id: a.scope_id(),
                };
                libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                )
            }
        };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// The port a listener actually bound to (relevant when configured as 0).
pub fn local_port(fd: RawFd) -> io::Result<u16> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        if libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return Err(io::Error::last_os_error());
        }
        match storage.ss_family as c_int {
            libc::AF_INET => {
                let sin = &storage as *const _ as *const libc::sockaddr_in;
                Ok(u16::from_be((*sin).sin_port))
            }
            libc::AF_INET6 => {
                let sin6 = &storage as *const _ as *const libc::sockaddr_in6;
                Ok(u16::from_be((*sin6).sin6_port))
            }
            _ => Err(io::Error::new(io::ErrorKind::InvalidData, "unknown family")),
        }
    }
}

/// Accept one pending connection, non-blocking and close-on-exec.
///
/// Returns `None` when the accept queue is drained. The peer address is
/// needed for the per-client connection cap.
pub fn accept_connection(listen_fd: RawFd) -> io::Result<Option<(RawFd, IpAddr)>> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        let fd = libc::accept4(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        );

        if fd < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) | Some(libc::ECONNABORTED) => Ok(None),
                _ => Err(err),
            };
        }

        let ip = match storage.ss_family as c_int {
            libc::AF_INET => {
                let sin = &storage as *const _ as *const libc::sockaddr_in;
                IpAddr::V4(Ipv4Addr::from((*sin).sin_addr.s_addr.to_ne_bytes()))
            }
            libc::AF_INET6 => {
                let sin6 = &storage as *const _ as *const libc::sockaddr_in6;
                IpAddr::V6(Ipv6Addr::from((*sin6).sin6_addr.s6_addr))
            }
            _ => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };

        Ok(Some((fd, ip)))
    }
}

/// Non-blocking read. `Ok(None)` means try again later; `Ok(Some(0))`
/// is EOF from the peer.
pub fn read_nonblocking(fd: RawFd, buf: &mut [u8]) -> io::Result<Option<usize>> {
    unsafe {
        let res = libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len());
        if res < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(None),
                _ => Err(err),
            }
        } else {
            Ok(Some(res as usize))
        }
    }
}

/// Non-blocking send with MSG_NOSIGNAL (SIGPIPE is also ignored
/// globally, this just keeps strace output honest).
pub fn write_nonblocking(fd: RawFd, buf: &[u8]) -> io::Result<Option<usize>> {
    unsafe {
        let res = libc::send(
            fd,
            buf.as_ptr() as *const c_void,
            buf.len(),
            libc::MSG_NOSIGNAL,
        );
        if res < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(None),
                _ => Err(err),
            }
        } else {
            Ok(Some(res as usize))
        }
    }
}

pub const MAX_IOVS: usize = 8;

/// Scatter write of up to `MAX_IOVS` buffers in a single syscall.
pub fn writev_nonblocking(fd: RawFd, bufs: &[&[u8]]) -> io::Result<Option<usize>> {
    if bufs.is_empty() {
        return Ok(Some(0));
    }

    let mut iovecs: [libc::iovec; MAX_IOVS] = unsafe { mem::zeroed() };
    let iov_count = bufs.len().min(MAX_IOVS);
    for i in 0..iov_count {
        iovecs[i] = libc::iovec {
            iov_base: bufs[i].as_ptr() as *mut c_void,
            iov_len: bufs[i].len(),
        };
    }

    unsafe {
        let res = libc::writev(fd, iovecs.as_ptr(), iov_count as c_int);
        if res < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(None),
                _ => Err(err),
            }
        } else {
            Ok(Some(res as usize))
        }
    }
}

/// In-kernel file-to-socket transfer. Advances `offset` by the number
/// of bytes moved. `Ok(Some(0))` with bytes remaining means the file
/// shrank underneath us.
pub fn sendfile_nonblocking(
    sock: RawFd,
    file: RawFd,
    offset: &mut i64,
    count: usize,
) -> io::Result<Option<usize>> {
    unsafe {
        let res = libc::sendfile(sock, file, offset as *mut libc::off_t, count);
        if res < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(None),
                _ => Err(err),
            }
        } else {
            Ok(Some(res as usize))
        }
    }
}

pub fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Half-close the write side; the peer's eventual FIN arrives as RDHUP.
pub fn shutdown_write(fd: RawFd) {
    unsafe {
        libc::shutdown(fd, libc::SHUT_WR);
    }
}

// ---- Epoll ----

pub struct Epoll {
    pub fd: RawFd,
}

impl Epoll {
    pub fn new() -> io::Result<Self> {
        unsafe {
            let fd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Self { fd })
        }
    }

    /// Register `fd` level-triggered; interest is re-armed explicitly
    /// after every dispatch, so edge triggering would only lose events.
    pub fn add(&self, fd: RawFd, token: u64, interests: u32) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interests,
            u64: token,
        };
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    pub fn modify(&self, fd: RawFd, token: u64, interests: u32) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interests,
            u64: token,
        };
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_MOD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    pub fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: i32) -> io::Result<usize> {
        unsafe {
            let res = libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            );
            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err);
            }
            Ok(res as usize)
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

// ---- Shutdown wakeup pipe ----

/// Non-blocking Unix pipe, `(read_fd, write_fd)`. The signal handler
/// thread writes one byte so the epoll wait returns immediately.
pub fn create_pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        if libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok((fds[0], fds[1]))
}

pub fn notify_pipe(write_fd: RawFd) {
    let byte = [1u8];
    unsafe {
        libc::write(write_fd, byte.as_ptr() as *const c_void, 1);
    }
}

pub fn drain_pipe(read_fd: RawFd) {
    let mut buf = [0u8; 64];
    unsafe {
        while libc::read(read_fd, buf.as_mut_ptr() as *mut c_void, buf.len()) > 0 {}
    }
}

// ---- Process plumbing ----

/// SIGPIPE would kill us on a broken socket write; SIGCHLD just needs
/// to not accumulate zombies if a dynamic handler ever forks.
pub fn ignore_noise_signals() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        libc::signal(libc::SIGCHLD, libc::SIG_IGN);
    }
}

pub fn effective_uid_is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Drop root: resolve the user, shed GID and supplementary groups,
/// chroot + chdir, then shed UID last so each step is still permitted.
pub fn drop_privileges(user: Option<&str>, chroot: Option<&str>) -> Result<()> {
    let ids = match user {
        Some(name) => {
            let cname = std::ffi::CString::new(name)
                .map_err(|_| ServerError::UnknownUser(name.to_string()))?;
            let pw = unsafe { libc::getpwnam(cname.as_ptr()) };
            if pw.is_null() {
                return Err(ServerError::UnknownUser(name.to_string()));
            }
            let uid = unsafe { (*pw).pw_uid };
            let gid = unsafe { (*pw).pw_gid };
            Some((cname, uid, gid))
        }
        None => None,
    };

    if let Some((cname, _, gid)) = &ids {
        unsafe {
            if libc::setgid(*gid) < 0 {
                return Err(ServerError::Privilege(io::Error::last_os_error()));
            }
            if libc::initgroups(cname.as_ptr(), *gid as libc::gid_t) < 0 {
                return Err(ServerError::Privilege(io::Error::last_os_error()));
            }
        }
    }

    if let Some(dir) = chroot {
        let cdir = std::ffi::CString::new(dir)
            .map_err(|_| ServerError::Bind(format!("bad chroot path: {dir}")))?;
        unsafe {
            if libc::chroot(cdir.as_ptr()) < 0 {
                return Err(ServerError::Privilege(io::Error::last_os_error()));
            }
            if libc::chdir(c"/".as_ptr()) < 0 {
                return Err(ServerError::Privilege(io::Error::last_os_error()));
            }
        }
    }

    if let Some((_, uid, _)) = &ids {
        unsafe {
            if libc::setuid(*uid) < 0 {
                return Err(ServerError::Privilege(io::Error::last_os_error()));
            }
        }
    }

    Ok(())
}
