//! Buffered-output engine.
//!
//! Each connection owns a FIFO of output segments: byte ranges (owned
//! or borrowed) and file regions. Producers try an immediate scatter
//! write or in-kernel file transfer when the chain is empty and queue
//! the residual otherwise; the drainer walks the chain head-first when
//! the socket turns writable. Bytes leave the socket in exactly the
//! order they were enqueued, which is what makes pipelined responses
//! hold together.

use std::collections::VecDeque;
use std::os::fd::RawFd;

use crate::syscalls;

/// One pending output segment. Release discipline is the variant:
/// `Owned` buffers drop with the segment, `Static` ones belong to the
/// configuration and are never freed, file descriptors close on
/// completion when flagged.
enum Segment {
    Owned { buf: Vec<u8>, off: usize },
    Static { buf: &'static [u8], off: usize },
    File {
        fd: RawFd,
        off: i64,
        remaining: usize,
        close: bool,
    },
}

impl Segment {
    fn release(self) {
        if let Segment::File { fd, close: true, .. } = self {
            syscalls::close_fd(fd);
        }
    }
}

/// Producer-side memory policy for one enqueued buffer.
pub enum Chunk<'a> {
    /// Copied into the chain if it cannot be written immediately.
    Copy(&'a [u8]),
    /// Borrowed for the segment's lifetime; never freed.
    Static(&'static [u8]),
    /// Ownership moves into the chain and drops once written.
    Give(Vec<u8>),
}

impl Chunk<'_> {
    fn len(&self) -> usize {
        match self {
            Chunk::Copy(b) => b.len(),
            Chunk::Static(b) => b.len(),
            Chunk::Give(b) => b.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    /// Everything left in the opportunistic write.
    Sent,
    /// At least part of the input is now queued.
    Queued,
    /// Pending write size would exceed twice the limit; inputs were
    /// consumed but the connection must close.
    Overflow,
    /// Transport error; the connection must close.
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drain {
    /// Chain is empty.
    Empty,
    /// Socket stopped absorbing; wait for writability.
    Pending,
    /// Transport error; the connection must close.
    Fatal,
}

pub struct OutChain {
    segs: VecDeque<Segment>,
    /// Unsent bytes across byte-kind segments only; file regions are
    /// disk-resident and do not count against the memory limit.
    pending: usize,
    max_wb_len: usize,
}

impl OutChain {
    pub fn new(max_wb_len: usize) -> Self {
        Self {
            segs: VecDeque::new(),
            pending: 0,
            max_wb_len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.segs.is_empty()
    }

    /// Pending write size: the backpressure signal.
    pub fn wb_len(&self) -> usize {
        self.pending
    }

    /// While true the supervisor keeps POLLIN off this connection.
    pub fn over_limit(&self) -> bool {
        self.pending > self.max_wb_len
    }

    /// Enqueue a sequence of buffers, attempting a single scatter write
    /// first when nothing is queued ahead of them.
    pub fn enqueue(&mut self, sock: RawFd, parts: Vec<Chunk<'_>>) -> Enqueue {
        let total: usize = parts.iter().map(Chunk::len).sum();
        let mut written = 0usize;

        if self.segs.is_empty() && total > 0 {
            let slices: Vec<&[u8]> = parts
                .iter()
                .take(syscalls::MAX_IOVS)
                .map(|c| match c {
                    Chunk::Copy(b) => *b,
                    Chunk::Static(b) => *b,
                    Chunk::Give(b) => b.as_slice(),
                })
                .collect();
            match syscalls::writev_nonblocking(sock, &slices) {
                Ok(Some(n)) => written = n,
                Ok(None) => {}
                Err(_) => return Enqueue::Fatal,
            }
        }

        if written == total {
            return Enqueue::Sent;
        }

        let residual = total - written;
        if self.pending + residual > 2 * self.max_wb_len {
            // Inputs are consumed either way; Give buffers drop here.
            return Enqueue::Overflow;
        }

        // Queue whatever the kernel did not take, preserving order.
        let mut skip = written;
        for part in parts {
            let len = part.len();
            if skip >= len {
                skip -= len;
                continue;
            }
            let seg = match part {
                Chunk::Copy(b) => Segment::Owned {
                    buf: b[skip..].to_vec(),
                    off: 0,
                },
                Chunk::Static(b) => Segment::Static { buf: b, off: skip },
                Chunk::Give(b) => Segment::Owned { buf: b, off: skip },
            };
            skip = 0;
            self.segs.push_back(seg);
        }
        self.pending += residual;
        Enqueue::Queued
    }

    /// Enqueue a file region for zero-copy transfer. Never overflows:
    /// the payload lives on disk, not in memory.
    pub fn enqueue_file(
        &mut self,
        sock: RawFd,
        file: RawFd,
        offset: i64,
        len: usize,
        close: bool,
    ) -> Enqueue {
        let mut off = offset;
        let mut remaining = len;

        if self.segs.is_empty() {
            loop {
                if remaining == 0 {
                    if close {
                        syscalls::close_fd(file);
                    }
                    return Enqueue::Sent;
                }
                match syscalls::sendfile_nonblocking(sock, file, &mut off, remaining) {
                    Ok(Some(0)) => {
                        // File shrank mid-transfer; nothing sane to send.
                        if close {
                            syscalls::close_fd(file);
                        }
                        return Enqueue::Fatal;
                    }
                    Ok(Some(n)) => remaining -= n,
                    Ok(None) => break,
                    Err(_) => {
                        if close {
                            syscalls::close_fd(file);
                        }
                        return Enqueue::Fatal;
                    }
                }
            }
        }

        self.segs.push_back(Segment::File {
            fd: file,
            off,
            remaining,
            close,
        });
        Enqueue::Queued
    }

    /// Push queued segments into the socket, called on writability.
    pub fn drain(&mut self, sock: RawFd) -> Drain {
        loop {
            let seg = match self.segs.front_mut() {
                Some(seg) => seg,
                None => return Drain::Empty,
            };

            let done = match seg {
                Segment::Owned { buf, off } => match write_bytes(sock, buf, off) {
                    WriteStep::Progress(n) => {
                        self.pending -= n;
                        *off == buf.len()
                    }
                    WriteStep::Blocked => return Drain::Pending,
                    WriteStep::Failed => return Drain::Fatal,
                },
                Segment::Static { buf, off } => match write_bytes(sock, *buf, off) {
                    WriteStep::Progress(n) => {
                        self.pending -= n;
                        *off == buf.len()
                    }
                    WriteStep::Blocked => return Drain::Pending,
                    WriteStep::Failed => return Drain::Fatal,
                },
                Segment::File { fd, off, remaining, .. } => {
                    match syscalls::sendfile_nonblocking(sock, *fd, off, *remaining) {
                        Ok(Some(0)) => return Drain::Fatal,
                        Ok(Some(n)) => {
                            *remaining -= n;
                            *remaining == 0
                        }
                        Ok(None) => return Drain::Pending,
                        Err(_) => return Drain::Fatal,
                    }
                }
            };

            if done {
                if let Some(seg) = self.segs.pop_front() {
                    seg.release();
                }
            }
        }
    }
}

enum WriteStep {
    Progress(usize),
    Blocked,
    Failed,
}

fn write_bytes(sock: RawFd, buf: &[u8], off: &mut usize) -> WriteStep {
    match syscalls::write_nonblocking(sock, &buf[*off..]) {
        Ok(Some(0)) | Ok(None) => WriteStep::Blocked,
        Ok(Some(n)) => {
            *off += n;
            WriteStep::Progress(n)
        }
        Err(_) => WriteStep::Failed,
    }
}

impl Drop for OutChain {
    fn drop(&mut self) {
        for seg in self.segs.drain(..) {
            seg.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::mem;
    use std::os::fd::{FromRawFd, RawFd};
    use std::os::unix::net::UnixStream;

    /// Non-blocking socketpair with a tiny send buffer so writes go
    /// partial without megabytes of filler.
    fn tight_socketpair() -> (RawFd, UnixStream) {
        let mut fds = [0 as libc::c_int; 2];
        unsafe {
            assert_eq!(
                libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()),
                0
            );
            let flags = libc::fcntl(fds[0], libc::F_GETFL, 0);
            libc::fcntl(fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK);
            let small: libc::c_int = 4096;
            libc::setsockopt(
                fds[0],
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                &small as *const _ as *const libc::c_void,
                mem::size_of_val(&small) as libc::socklen_t,
            );
            (fds[0], UnixStream::from_raw_fd(fds[1]))
        }
    }

    fn read_all(peer: &mut UnixStream, expect: usize) -> Vec<u8> {
        let mut got = Vec::with_capacity(expect);
        let mut tmp = [0u8; 4096];
        while got.len() < expect {
            let n = peer.read(&mut tmp).unwrap();
            if n == 0 {
                break;
            }
            got.extend_from_slice(&tmp[..n]);
        }
        got
    }

    #[test]
    fn test_immediate_send_when_empty() {
        let (sock, mut peer) = tight_socketpair();
        let mut chain = OutChain::new(1 << 20);

        let status = chain.enqueue(
            sock,
            vec![Chunk::Copy(b"hello "), Chunk::Static(b"world")],
        );
        assert_eq!(status, Enqueue::Sent);
        assert!(chain.is_empty());
        assert_eq!(read_all(&mut peer, 11), b"hello world");
        syscalls::close_fd(sock);
    }

    #[test]
    fn test_ordering_across_partial_writes() {
        let (sock, mut peer) = tight_socketpair();
        let mut chain = OutChain::new(1 << 20);

        // Big enough to overrun the shrunken send buffer.
        let first: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let expected_tail = b"tail".to_vec();

        let status = chain.enqueue(sock, vec![Chunk::Give(first.clone())]);
        assert_eq!(status, Enqueue::Queued);
        assert!(chain.wb_len() > 0);
        chain.enqueue(sock, vec![Chunk::Copy(&expected_tail)]);

        let mut sent = Vec::new();
        loop {
            match chain.drain(sock) {
                Drain::Empty => break,
                Drain::Pending => {
                    sent.extend_from_slice(&read_all(&mut peer, 1));
                }
                Drain::Fatal => panic!("drain failed"),
            }
        }
        sent.extend_from_slice(&read_all(
            &mut peer,
            first.len() + expected_tail.len() - sent.len(),
        ));

        let mut expected = first;
        expected.extend_from_slice(&expected_tail);
        assert_eq!(sent, expected);
        assert_eq!(chain.wb_len(), 0);
        syscalls::close_fd(sock);
    }

    #[test]
    fn test_overflow_rejects_when_chain_is_saturated() {
        let (sock, _peer) = tight_socketpair();

        // Fill the kernel buffer so opportunistic writes take nothing.
        let filler = [0u8; 4096];
        while let Ok(Some(n)) = syscalls::write_nonblocking(sock, &filler) {
            if n == 0 {
                break;
            }
        }

        let mut chain = OutChain::new(100);
        let status = chain.enqueue(sock, vec![Chunk::Copy(&[1u8; 150])]);
        assert_eq!(status, Enqueue::Queued);
        assert_eq!(chain.wb_len(), 150);
        assert!(chain.over_limit());

        // 150 pending + 100 more crosses 2 * max_wb_len.
        let status = chain.enqueue(sock, vec![Chunk::Copy(&[2u8; 100])]);
        assert_eq!(status, Enqueue::Overflow);
        assert_eq!(chain.wb_len(), 150);
        syscalls::close_fd(sock);
    }

    #[test]
    fn test_file_enqueue_and_drain() {
        use std::io::{Seek, SeekFrom, Write};
        use std::os::fd::IntoRawFd;

        let (sock, mut peer) = tight_socketpair();
        let mut chain = OutChain::new(1 << 20);

        let mut tmp = tempfile::tempfile().unwrap();
        let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 199) as u8).collect();
        tmp.write_all(&payload).unwrap();
        tmp.seek(SeekFrom::Start(0)).unwrap();
        let file_fd = tmp.into_raw_fd();

        chain.enqueue(sock, vec![Chunk::Copy(b"HEAD")]);
        chain.enqueue_file(sock, file_fd, 0, payload.len(), true);

        let mut sent = Vec::new();
        loop {
            match chain.drain(sock) {
                Drain::Empty => break,
                Drain::Pending => sent.extend_from_slice(&read_all(&mut peer, 1)),
                Drain::Fatal => panic!("drain failed"),
            }
        }
        sent.extend_from_slice(&read_all(&mut peer, 4 + payload.len() - sent.len()));

        assert_eq!(&sent[..4], b"HEAD");
        assert_eq!(&sent[4..], payload.as_slice());
        // File fd counts for nothing against the byte backlog.
        assert_eq!(chain.wb_len(), 0);
        syscalls::close_fd(sock);
    }
}
