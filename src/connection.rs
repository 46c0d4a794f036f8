// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Per-client connection state machine (§4.4): inbound framing with at most
//! one pending received fd, and a bounded outbound ring queue with a
//! drop-on-full slow-consumer policy.

use std::collections::VecDeque;
use std::io::{self, IoSlice, Read};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use log::{debug, warn};
use mio::net::UnixStream;
use mio::{Interest, Registry, Token};

use crate::fdio;
use crate::message::Message;
use crate::wire::{self, Header, HEADER_LEN, PREFIX_LEN};

/// Fixed outbound queue depth (§4.4, §9 "per-client outbound buffering").
/// Enqueueing past this drops the message rather than growing unbounded.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 32;

enum RxState {
    /// Reading the 8-byte header plus its 4-byte body-length prefix.
    Prefix { buf: [u8; PREFIX_LEN], have: usize, pending_fd: Option<OwnedFd> },
    /// Reading the body once its length is known. fds never arrive in this
    /// phase (§4.4 point 2): only plain reads are issued here.
    Body { header: Header, body: Vec<u8>, have: usize, fd: Option<OwnedFd> },
}

/// What happened after driving readiness on a connection.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Alive,
    Disconnected,
}

pub struct Connection {
    stream: UnixStream,
    token: Token,
    rx: RxState,
    max_body_len: usize,
    outbound: VecDeque<Message>,
    /// Byte offset already written of the head-of-queue frame.
    write_offset: usize,
    writable_armed: bool,
}

impl Connection {
    pub fn new(stream: UnixStream, token: Token, max_body_len: usize) -> Connection {
        Connection {
            stream,
            token,
            rx: RxState::Prefix { buf: [0u8; PREFIX_LEN], have: 0, pending_fd: None },
            max_body_len,
            outbound: VecDeque::with_capacity(OUTBOUND_QUEUE_CAPACITY),
            write_offset: 0,
            writable_armed: false,
        }
    }

    pub fn register(&mut self, registry: &Registry) -> io::Result<()> {
        registry.register(&mut self.stream, self.token, Interest::READABLE)
    }

    fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Drains every complete frame currently available, invoking `on_frame`
    /// for each. Returns whether the connection is still usable afterward.
    pub fn readable<F: FnMut(Message)>(&mut self, mut on_frame: F) -> Outcome {
        loop {
            match self.read_one() {
                Ok(Some(msg)) => on_frame(msg),
                Ok(None) => return Outcome::Alive,
                Err(e) => {
                    if e.kind() != io::ErrorKind::UnexpectedEof {
                        debug!("connection read error: {e}");
                    }
                    return Outcome::Disconnected;
                }
            }
        }
    }

    fn read_one(&mut self) -> io::Result<Option<Message>> {
        loop {
            match &mut self.rx {
                RxState::Prefix { buf, have, pending_fd } => {
                    while *have < PREFIX_LEN {
                        match fdio::recv_with_fd(self.raw_fd(), &mut buf[*have..]) {
                            Ok((0, _)) => return Err(eof()),
                            Ok((n, fd)) => {
                                *have += n;
                                if let Some(new_fd) = fd {
                                    // Closes any previously-pending fd by
                                    // simply dropping it (§4.4 point 1, §9
                                    // open question: displaced fds are
                                    // closed, not fatal).
                                    *pending_fd = Some(new_fd);
                                }
                            }
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                            Err(e) => return Err(e),
                        }
                    }

                    let mut header_bytes = [0u8; HEADER_LEN];
                    header_bytes.copy_from_slice(&buf[..HEADER_LEN]);
                    let header = Header::decode(&header_bytes);

                    let mut len_bytes = [0u8; 4];
                    len_bytes.copy_from_slice(&buf[HEADER_LEN..PREFIX_LEN]);
                    let body_len = wire::decode_body_len(&len_bytes) as usize;

                    if body_len > self.max_body_len.min(wire::MAX_BODY_LEN) {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "frame body exceeds the configured maximum",
                        ));
                    }

                    let fd = pending_fd.take();
                    self.rx = RxState::Body { header, body: vec![0u8; body_len], have: 0, fd };
                }

                RxState::Body { header, body, have, fd } => {
                    while *have < body.len() {
                        match self.stream.read(&mut body[*have..]) {
                            Ok(0) => return Err(eof()),
                            Ok(n) => *have += n,
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                            Err(e) => return Err(e),
                        }
                    }

                    let header = *header;
                    let body = std::mem::take(body);
                    let fd = fd.take();
                    self.rx = RxState::Prefix { buf: [0u8; PREFIX_LEN], have: 0, pending_fd: None };

                    return Ok(Some(match fd {
                        Some(fd) => Message::with_fd(header, body, fd),
                        None => Message::new(header, body),
                    }));
                }
            }
        }
    }

    /// Enqueues `msg` for delivery, attempting an immediate write first
    /// (§4.4 "Outbound"). Silently drops it if the queue is already full —
    /// the slow-consumer policy the router must tolerate.
    pub fn send(&mut self, registry: &Registry, msg: Message) -> Outcome {
        if self.outbound.is_empty() {
            match self.write_now(&msg) {
                Ok(n) if n == HEADER_LEN + msg.payload().len() => return Outcome::Alive,
                Ok(n) => {
                    self.write_offset = n;
                    self.outbound.push_back(msg);
                    return self.arm_writable(registry);
                }
                Err(e) => {
                    debug!("connection write error: {e}");
                    return Outcome::Disconnected;
                }
            }
        }

        if self.outbound.len() >= OUTBOUND_QUEUE_CAPACITY {
            warn!("outbound queue full, dropping frame for slow consumer");
            return Outcome::Alive;
        }

        self.outbound.push_back(msg);
        self.arm_writable(registry)
    }

    /// Attempts to write as much of `msg` as the kernel will take right now.
    fn write_now(&mut self, msg: &Message) -> io::Result<usize> {
        let mut header_bytes = [0u8; HEADER_LEN];
        msg.header.encode(&mut header_bytes);

        let iov = [IoSlice::new(&header_bytes), IoSlice::new(msg.payload())];
        let fd = msg.fd().map(|f| f.as_raw_fd());

        match fdio::send_vectored_with_fd(self.raw_fd(), &iov, fd) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Flushes the head of the outbound queue; call on a writable event.
    pub fn writable(&mut self, registry: &Registry) -> Outcome {
        while let Some(msg) = self.outbound.front() {
            let mut header_bytes = [0u8; HEADER_LEN];
            msg.header.encode(&mut header_bytes);
            let frame_len = HEADER_LEN + msg.payload().len();

            let (iov, fd) = if self.write_offset < HEADER_LEN {
                let iov = [
                    IoSlice::new(&header_bytes[self.write_offset..]),
                    IoSlice::new(msg.payload()),
                ];
                // Only attach the fd on the very first write attempt for
                // this frame (offset 0): SCM_RIGHTS is handed to the kernel
                // once per sendmsg call, and a resumed partial write must
                // not hand the same fd over a second time.
                let fd = if self.write_offset == 0 { msg.fd().map(|f| f.as_raw_fd()) } else { None };
                (iov, fd)
            } else {
                let body_offset = self.write_offset - HEADER_LEN;
                ([IoSlice::new(&msg.payload()[body_offset..]), IoSlice::new(&[])], None)
            };

            match fdio::send_vectored_with_fd(self.raw_fd(), &iov, fd) {
                Ok(n) => {
                    self.write_offset += n;
                    if self.write_offset >= frame_len {
                        self.write_offset = 0;
                        self.outbound.pop_front();
                    } else {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("connection flush error: {e}");
                    return Outcome::Disconnected;
                }
            }
        }

        if self.outbound.is_empty() {
            self.disarm_writable(registry);
        }
        Outcome::Alive
    }

    fn arm_writable(&mut self, registry: &Registry) -> Outcome {
        if !self.writable_armed {
            if let Err(e) =
                registry.reregister(&mut self.stream, self.token, Interest::READABLE | Interest::WRITABLE)
            {
                debug!("failed to arm writable interest: {e}");
                return Outcome::Disconnected;
            }
            self.writable_armed = true;
        }
        Outcome::Alive
    }

    fn disarm_writable(&mut self, registry: &Registry) {
        if self.writable_armed {
            let _ = registry.reregister(&mut self.stream, self.token, Interest::READABLE);
            self.writable_armed = false;
        }
    }

    pub fn deregister(&mut self, registry: &Registry) {
        let _ = registry.deregister(&mut self.stream);
    }
}

fn eof() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed the connection")
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::Poll;

    /// A registered connection wired to a real, never-read-from peer socket:
    /// once the kernel's own socket buffer fills, every further `send` must
    /// queue rather than write.
    fn connected() -> (Connection, std::os::unix::net::UnixStream, Poll) {
        let (here, peer) = std::os::unix::net::UnixStream::pair().unwrap();
        here.set_nonblocking(true).unwrap();
        peer.set_nonblocking(true).unwrap();

        let poll = Poll::new().unwrap();
        let mut conn = Connection::new(UnixStream::from_std(here), Token(0), 64 * 1024);
        conn.register(poll.registry()).unwrap();
        (conn, peer, poll)
    }

    #[test]
    fn outbound_queue_drops_beyond_capacity_for_a_slow_consumer() {
        let (mut conn, peer, poll) = connected();

        let big_payload = vec![0u8; 64 * 1024];
        for _ in 0..256 {
            let msg = Message::new(Header::new(wire::FrameType::Data, 0, 0), big_payload.clone());
            assert_eq!(Outcome::Alive, conn.send(poll.registry(), msg));
        }

        assert_eq!(
            OUTBOUND_QUEUE_CAPACITY,
            conn.outbound.len(),
            "queue must cap at capacity once the kernel buffer and queue are both saturated"
        );

        drop(peer); // keep the peer alive until here so the socket isn't torn down mid-test
    }

    #[test]
    fn draining_the_peer_lets_queued_frames_flush() {
        let (mut conn, mut peer, poll) = connected();

        let big_payload = vec![0u8; 64 * 1024];
        for _ in 0..16 {
            let msg = Message::new(Header::new(wire::FrameType::Data, 0, 0), big_payload.clone());
            assert_eq!(Outcome::Alive, conn.send(poll.registry(), msg));
        }

        let queued_before = conn.outbound.len();
        assert!(queued_before > 0, "16 frames of 64KiB should overflow a typical socket buffer");

        let mut sink = vec![0u8; 64 * 1024];
        while peer.read(&mut sink).is_ok() {}

        assert_eq!(Outcome::Alive, conn.writable(poll.registry()));
        assert!(conn.outbound.len() < queued_before, "draining the peer must let the queue shrink");
    }
}
