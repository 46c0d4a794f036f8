// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Edge-triggered readiness loop over the listener and every connected
//! client (§2 "Event loop glue", §5). Single-threaded: one `mio::Poll`
//! drives accepts, reads and writes one readiness batch at a time, exactly
//! like the original's `uloop_run` in `ubusd.c`.

use std::collections::HashMap;
use std::io;
use std::mem;
use std::os::fd::FromRawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;

use log::{debug, info, warn};
use mio::net::{UnixListener, UnixStream};
use mio::{Events, Interest, Poll, Token};

use crate::connection::{Connection, Outcome};
use crate::error::{BrokerError, Result};
use crate::message::Message;
use crate::registry::{ClientId, Registry};
use crate::router::Router;

const LISTENER_TOKEN: Token = Token(0);
const BACKLOG: i32 = 32;

/// Binds the listening socket (§6): unlinks any stale socket file first,
/// applies the restrictive creation umask, and listens with the spec's
/// fixed backlog. Neither `std::os::unix::net::UnixListener` nor `mio`
/// expose a way to set the backlog, so the socket is built by hand with
/// raw `libc` calls the same way `fdio` builds `sendmsg`/`recvmsg` calls.
fn bind_listener(path: &Path) -> io::Result<UnixListener> {
    let _ = std::fs::remove_file(path);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let path_bytes = path.as_os_str().as_bytes();
    let max_len = mem::size_of::<libc::sockaddr_un>() - mem::size_of::<libc::sa_family_t>() - 1;
    if path_bytes.len() > max_len {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "socket path too long"));
    }

    unsafe {
        let fd = libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut addr: libc::sockaddr_un = mem::zeroed();
        addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
        ptr::copy_nonoverlapping(path_bytes.as_ptr(), addr.sun_path.as_mut_ptr() as *mut u8, path_bytes.len());
        let addr_len = (mem::size_of::<libc::sa_family_t>() + path_bytes.len() + 1) as libc::socklen_t;

        // §6: "creation umask 0177" so only the owning user may connect.
        libc::umask(0o177);

        if libc::bind(fd, &addr as *const _ as *const libc::sockaddr, addr_len) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }
        if libc::listen(fd, BACKLOG) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        let std_listener = std::os::unix::net::UnixListener::from_raw_fd(fd);
        Ok(UnixListener::from_std(std_listener))
    }
}

/// Per-connection bookkeeping the router doesn't need to know about: which
/// mio token backs which client, in both directions.
struct Broker {
    registry: Registry,
    router: Router,
    connections: HashMap<Token, (ClientId, Connection)>,
    client_tokens: HashMap<ClientId, Token>,
    next_token: usize,
}

impl Broker {
    fn new(max_body_len: usize) -> Broker {
        Broker {
            registry: Registry::new(),
            router: Router::new(max_body_len),
            connections: HashMap::new(),
            client_tokens: HashMap::new(),
            next_token: 1,
        }
    }

    fn next_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Drains every pending connection (§4's "accept loop"), mirroring the
    /// original's `get_next_connection` retrying on `EINTR`/`ECONNABORTED`.
    fn accept_all(&mut self, listener: &mut UnixListener, poll: &Poll) {
        loop {
            match listener.accept() {
                Ok((stream, _addr)) => self.accept_one(stream, poll),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted || e.kind() == io::ErrorKind::ConnectionAborted => {
                    continue
                }
                Err(e) => {
                    warn!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    fn accept_one(&mut self, stream: UnixStream, poll: &Poll) {
        let client = self.registry.create_client();
        let token = self.next_token();
        let mut conn = Connection::new(stream, token, self.router.max_body_len());

        if let Err(e) = conn.register(poll.registry()) {
            warn!("failed to register connection for client {}: {e}", client.0);
            self.registry.free_client(client);
            return;
        }

        self.client_tokens.insert(client, token);
        self.connections.insert(token, (client, conn));
        debug!("client {} connected", client.0);

        let hello = Router::hello(client);
        self.send_to(poll, client, hello);
    }

    /// Looks a client up by id and flushes one outbound message to it.
    /// A client id that no longer resolves is a silent drop (§5, §7:
    /// "client id no longer resolves").
    fn send_to(&mut self, poll: &Poll, client: ClientId, msg: Message) {
        let token = match self.client_tokens.get(&client) {
            Some(t) => *t,
            None => return,
        };

        let disconnected = match self.connections.get_mut(&token) {
            Some((_, conn)) => conn.send(poll.registry(), msg) == Outcome::Disconnected,
            None => return,
        };

        if disconnected {
            self.drop_connection(poll, token);
        }
    }

    fn handle_readable(&mut self, poll: &Poll, token: Token) {
        let (client, mut conn) = match self.connections.remove(&token) {
            Some(v) => v,
            None => return,
        };

        let mut frames = Vec::new();
        let outcome = conn.readable(|msg| frames.push(msg));

        let mut outgoing: Vec<(ClientId, Message)> = Vec::new();
        for frame in frames {
            self.router.dispatch(&mut self.registry, client, frame, &mut |to, msg| outgoing.push((to, msg)));
        }

        match outcome {
            Outcome::Alive => {
                self.connections.insert(token, (client, conn));
            }
            Outcome::Disconnected => {
                conn.deregister(poll.registry());
                self.client_tokens.remove(&client);
                debug!("client {} disconnected", client.0);
                for free_outcome in self.registry.free_client(client) {
                    self.router.notify_free_outcome(&free_outcome, &mut |to, msg| outgoing.push((to, msg)));
                }
            }
        }

        for (to, msg) in outgoing {
            self.send_to(poll, to, msg);
        }
    }

    fn handle_writable(&mut self, poll: &Poll, token: Token) {
        let disconnected = match self.connections.get_mut(&token) {
            Some((_, conn)) => conn.writable(poll.registry()) == Outcome::Disconnected,
            None => return,
        };

        if disconnected {
            self.drop_connection(poll, token);
        }
    }

    /// Tears down a connection outside of `handle_readable`'s own flow
    /// (i.e. a fatal write error). Frees the client's objects and forwards
    /// whatever NOTIFY/UNSUBSCRIBE frames that free owes to survivors.
    fn drop_connection(&mut self, poll: &Poll, token: Token) {
        let (client, mut conn) = match self.connections.remove(&token) {
            Some(v) => v,
            None => return,
        };
        conn.deregister(poll.registry());
        self.client_tokens.remove(&client);
        debug!("client {} disconnected", client.0);

        let mut outgoing: Vec<(ClientId, Message)> = Vec::new();
        for free_outcome in self.registry.free_client(client) {
            self.router.notify_free_outcome(&free_outcome, &mut |to, msg| outgoing.push((to, msg)));
        }
        for (to, msg) in outgoing {
            self.send_to(poll, to, msg);
        }
    }

    #[cfg(test)]
    fn live_client_count(&self) -> usize {
        self.connections.len()
    }
}

/// Runs the broker forever, bound to `socket_path`. Only returns on a fatal
/// setup failure (bind, poll registration) — per-connection errors never
/// propagate out of the loop (§7).
pub fn run(socket_path: &Path, max_body_len: usize) -> Result<()> {
    let mut listener = bind_listener(socket_path)
        .map_err(|e| BrokerError::Bind { path: socket_path.display().to_string(), source: e })?;

    let mut poll = Poll::new().map_err(BrokerError::Poll)?;
    poll.registry()
        .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
        .map_err(BrokerError::Poll)?;

    let mut broker = Broker::new(max_body_len);
    let mut events = Events::with_capacity(128);

    info!("listening on {}", socket_path.display());

    loop {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(BrokerError::Poll(e));
        }

        for event in events.iter() {
            if event.token() == LISTENER_TOKEN {
                broker.accept_all(&mut listener, &poll);
                continue;
            }

            let token = event.token();
            if event.is_readable() {
                broker.handle_readable(&poll, token);
            }
            if event.is_writable() {
                broker.handle_writable(&poll, token);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_starts_with_no_connections() {
        let broker = Broker::new(4096);
        assert_eq!(0, broker.live_client_count());
    }
}
