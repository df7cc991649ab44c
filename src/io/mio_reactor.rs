//! Readiness-based transport on top of mio
//!
//! - Non-blocking TCP connects with per-attempt deadlines
//! - Buffered writes, flushed as soon as possible and again on writability
//! - Reads drained until `WouldBlock` and reported as [`IoEvent::Data`]
//!
//! Session negotiation is not performed here; every socket is reported as
//! already negotiated with default features.

use std::collections::HashMap;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};

use mio::event::Event;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, trace, warn};

use super::{ConnectFailure, ConnectId, Features, IoEvent, SocketId, Transport};
use crate::cluster::HostPort;
use crate::utils::ErrorCode;

const READ_CHUNK: usize = 16 * 1024;

struct PendingConnect {
    id: ConnectId,
    stream: TcpStream,
    peer: HostPort,
    deadline: Instant,
}

struct Socket {
    stream: TcpStream,
    peer: HostPort,
    wbuf: Vec<u8>,
    wpos: usize,
    /// Minimum bytes the owner is waiting for (0: no read interest)
    want_read: usize,
}

impl Socket {
    fn pending_write(&self) -> usize {
        self.wbuf.len() - self.wpos
    }

    /// Drop unsent bytes; a failed socket never flushes them
    fn discard_pending(&mut self) {
        self.wbuf.clear();
        self.wpos = 0;
    }

    /// Write as much as possible. Ok(true) once the buffer is empty.
    fn try_write(&mut self) -> io::Result<bool> {
        while self.wpos < self.wbuf.len() {
            match self.stream.write(&self.wbuf[self.wpos..]) {
                Ok(0) => {
                    return Err(io::Error::new(ErrorKind::WriteZero, "Connection closed"));
                }
                Ok(n) => self.wpos += n,
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.wbuf.clear();
        self.wpos = 0;
        Ok(true)
    }

    /// Read everything currently available
    fn try_read(&mut self) -> io::Result<Vec<u8>> {
        let mut data = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    if data.is_empty() {
                        return Err(io::Error::new(ErrorKind::UnexpectedEof, "Connection closed"));
                    }
                    break;
                }
                Ok(n) => data.extend_from_slice(&chunk[..n]),
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(data)
    }
}

/// Single-threaded mio event loop implementing [`Transport`]
pub struct MioReactor {
    poll: Poll,
    events: Events,
    next_token: usize,
    connecting: HashMap<Token, PendingConnect>,
    sockets: HashMap<Token, Socket>,
    /// Completions produced outside of `poll`, reported on the next call
    ready: Vec<IoEvent>,
}

impl MioReactor {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(1024),
            next_token: 1,
            connecting: HashMap::new(),
            sockets: HashMap::new(),
            ready: Vec::new(),
        })
    }

    fn allocate(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Wait up to `timeout` for readiness and return every completion
    pub fn poll(&mut self, timeout: Duration) -> io::Result<Vec<IoEvent>> {
        let now = Instant::now();
        let mut wait = if self.ready.is_empty() {
            timeout
        } else {
            Duration::ZERO
        };
        for pending in self.connecting.values() {
            wait = wait.min(pending.deadline.saturating_duration_since(now));
        }

        match self.poll.poll(&mut self.events, Some(wait)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }

        let mut out = std::mem::take(&mut self.ready);
        let fired: Vec<(Token, bool, bool, bool)> = self
            .events
            .iter()
            .map(|ev: &Event| {
                (
                    ev.token(),
                    ev.is_readable() || ev.is_read_closed(),
                    ev.is_writable(),
                    ev.is_error(),
                )
            })
            .collect();

        for (token, readable, writable, errored) in fired {
            if self.connecting.contains_key(&token) {
                self.finish_connect(token, &mut out);
                continue;
            }
            let sock = SocketId(token.0 as u64);
            let Some(socket) = self.sockets.get_mut(&token) else {
                continue;
            };

            if writable && socket.pending_write() > 0 {
                match socket.try_write() {
                    Ok(true) => out.push(IoEvent::Flushed { sock }),
                    Ok(false) => {}
                    Err(e) => {
                        socket.discard_pending();
                        out.push(IoEvent::Failed {
                            sock,
                            error: ErrorCode::from_io(&e),
                        });
                        continue;
                    }
                }
            }

            if readable || errored {
                match socket.try_read() {
                    Ok(data) if !data.is_empty() => {
                        trace!("{} read {} bytes", sock, data.len());
                        out.push(IoEvent::Data { sock, data });
                    }
                    Ok(_) => {}
                    Err(e) => {
                        socket.discard_pending();
                        out.push(IoEvent::Failed {
                            sock,
                            error: ErrorCode::from_io(&e),
                        });
                    }
                }
            }
        }

        self.expire_connects(Instant::now(), &mut out);
        Ok(out)
    }

    fn finish_connect(&mut self, token: Token, out: &mut Vec<IoEvent>) {
        let Some(pending) = self.connecting.get(&token) else {
            return;
        };

        let result = match pending.stream.take_error() {
            Ok(Some(e)) | Err(e) => Err(e),
            Ok(None) => match pending.stream.peer_addr() {
                Ok(_) => Ok(()),
                // Spurious wakeup; still connecting
                Err(ref e) if e.kind() == ErrorKind::NotConnected => return,
                Err(e) => Err(e),
            },
        };

        let Some(mut pending) = self.connecting.remove(&token) else {
            return;
        };
        match result {
            Ok(()) => {
                if let Err(e) = self.poll.registry().reregister(
                    &mut pending.stream,
                    token,
                    Interest::READABLE | Interest::WRITABLE,
                ) {
                    out.push(connect_failed(pending.id, &e));
                    return;
                }
                let _ = pending.stream.set_nodelay(true);
                let sock = SocketId(token.0 as u64);
                debug!("<{}> connected ({})", pending.peer, sock);
                self.sockets.insert(
                    token,
                    Socket {
                        stream: pending.stream,
                        peer: pending.peer,
                        wbuf: Vec::new(),
                        wpos: 0,
                        want_read: 0,
                    },
                );
                out.push(IoEvent::Connected {
                    id: pending.id,
                    result: Ok(sock),
                });
            }
            Err(e) => {
                warn!("<{}> connect failed: {}", pending.peer, e);
                let _ = self.poll.registry().deregister(&mut pending.stream);
                out.push(connect_failed(pending.id, &e));
            }
        }
    }

    fn expire_connects(&mut self, now: Instant, out: &mut Vec<IoEvent>) {
        let expired: Vec<Token> = self
            .connecting
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(t, _)| *t)
            .collect();

        for token in expired {
            if let Some(mut pending) = self.connecting.remove(&token) {
                warn!("<{}> connect timed out", pending.peer);
                let _ = self.poll.registry().deregister(&mut pending.stream);
                out.push(IoEvent::Connected {
                    id: pending.id,
                    result: Err(ConnectFailure::new(ErrorCode::Timeout)),
                });
            }
        }
    }
}

fn connect_failed(id: ConnectId, err: &io::Error) -> IoEvent {
    IoEvent::Connected {
        id,
        result: Err(ConnectFailure {
            error: match ErrorCode::from_io(err) {
                ErrorCode::Timeout => ErrorCode::Timeout,
                _ => ErrorCode::ConnectError,
            },
            os_error: err.raw_os_error(),
        }),
    }
}

fn resolve(host: &HostPort) -> io::Result<SocketAddr> {
    (host.host.as_str(), host.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(ErrorKind::NotFound, format!("no address for {}", host)))
}

impl Transport for MioReactor {
    fn connect(&mut self, host: &HostPort, timeout: Duration) -> ConnectId {
        let token = self.allocate();
        let id = ConnectId(token.0 as u64);

        let started = resolve(host).and_then(TcpStream::connect).and_then(|mut stream| {
            self.poll
                .registry()
                .register(&mut stream, token, Interest::WRITABLE)?;
            Ok(stream)
        });

        match started {
            Ok(stream) => {
                debug!("<{}> connecting (attempt {})", host, id.0);
                self.connecting.insert(
                    token,
                    PendingConnect {
                        id,
                        stream,
                        peer: host.clone(),
                        deadline: Instant::now() + timeout,
                    },
                );
            }
            Err(e) => {
                warn!("<{}> connect failed: {}", host, e);
                self.ready.push(connect_failed(id, &e));
            }
        }
        id
    }

    fn cancel_connect(&mut self, id: ConnectId) {
        let token = Token(id.0 as usize);
        if let Some(mut pending) = self.connecting.remove(&token) {
            let _ = self.poll.registry().deregister(&mut pending.stream);
        }
        self.ready.retain(|ev| !matches!(ev, IoEvent::Connected { id: done, .. } if *done == id));
    }

    fn session(&self, sock: SocketId) -> Option<Features> {
        self.sockets
            .get(&Token(sock.0 as usize))
            .map(|_| Features::default())
    }

    fn negotiate(&mut self, sock: SocketId, _timeout: Duration) -> ConnectId {
        let id = ConnectId(self.allocate().0 as u64);
        self.ready.push(IoEvent::Connected { id, result: Ok(sock) });
        id
    }

    fn write(&mut self, sock: SocketId, data: &[u8]) {
        let Some(socket) = self.sockets.get_mut(&Token(sock.0 as usize)) else {
            return;
        };
        socket.wbuf.extend_from_slice(data);
        match socket.try_write() {
            Ok(true) => self.ready.push(IoEvent::Flushed { sock }),
            Ok(false) => {}
            Err(e) => {
                socket.discard_pending();
                self.ready.push(IoEvent::Failed {
                    sock,
                    error: ErrorCode::from_io(&e),
                });
            }
        }
    }

    fn want_read(&mut self, sock: SocketId, min: usize) {
        if let Some(socket) = self.sockets.get_mut(&Token(sock.0 as usize)) {
            socket.want_read = min;
        }
    }

    fn shutdown(&mut self, sock: SocketId) {
        if let Some(socket) = self.sockets.get_mut(&Token(sock.0 as usize)) {
            let _ = socket.stream.shutdown(Shutdown::Both);
            socket.discard_pending();
            self.ready.push(IoEvent::Failed {
                sock,
                error: ErrorCode::Shutdown,
            });
        }
    }

    fn close(&mut self, sock: SocketId) {
        if let Some(mut socket) = self.sockets.remove(&Token(sock.0 as usize)) {
            let _ = self.poll.registry().deregister(&mut socket.stream);
            trace!("<{}> closed {} (read interest {})", socket.peer, sock, socket.want_read);
        }
        self.ready.retain(|ev| match ev {
            IoEvent::Data { sock: s, .. }
            | IoEvent::Flushed { sock: s }
            | IoEvent::Failed { sock: s, .. } => *s != sock,
            IoEvent::Connected { .. } => true,
        });
    }

    fn peer(&self, sock: SocketId) -> Option<HostPort> {
        self.sockets
            .get(&Token(sock.0 as usize))
            .map(|s| s.peer.clone())
    }

    fn in_flight(&self, sock: SocketId) -> usize {
        self.sockets
            .get(&Token(sock.0 as usize))
            .map(|s| usize::from(s.pending_write() > 0))
            .unwrap_or(0)
    }
}
