//! Echo service for secured connections.
//!
//! Each connection handed over by the acceptor gets a readable subscription;
//! whatever plaintext arrives is written straight back.  Output the socket
//! cannot take yet stays queued and a writable subscription, enabled only
//! while that backlog exists, finishes the job.  The connection is dropped
//! once the peer closes it or an I/O error occurs.

use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::rc::Rc;

use tracing::{debug, info};

use tickwire_core::{Reactor, Subscription};

use crate::infrastructure::network::SecureConnection;

const READ_CHUNK: usize = 4096;

/// Counters shared by every echo session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EchoStats {
    /// Sessions started since the service was created.
    pub accepted: u64,
    /// Sessions currently open.
    pub open: usize,
    pub bytes_echoed: u64,
}

/// Hands secured connections to per-connection echo sessions.
#[derive(Clone)]
pub struct EchoService {
    reactor: Reactor,
    stats: Rc<RefCell<EchoStats>>,
}

impl EchoService {
    pub fn new(reactor: &Reactor) -> Self {
        Self {
            reactor: reactor.clone(),
            stats: Rc::new(RefCell::new(EchoStats::default())),
        }
    }

    pub fn stats(&self) -> EchoStats {
        *self.stats.borrow()
    }

    /// A connection handler suitable for
    /// [`TcpCryptoAcceptor::listen`](crate::infrastructure::network::TcpCryptoAcceptor::listen).
    pub fn handler(&self) -> impl FnMut(SecureConnection, SocketAddr, SocketAddr) + 'static {
        let service = self.clone();
        move |conn, peer, server| service.accept(conn, peer, server)
    }

    /// Starts echoing on `conn`.
    pub fn accept(&self, conn: SecureConnection, peer: SocketAddr, server: SocketAddr) {
        info!(connection = %conn.id(), %peer, %server, "echo session opened");
        {
            let mut stats = self.stats.borrow_mut();
            stats.accepted += 1;
            stats.open += 1;
        }

        let fd = conn.as_raw_fd();
        let session = Rc::new(RefCell::new(EchoSession {
            conn,
            outbox: Vec::new(),
            stats: Rc::clone(&self.stats),
        }));

        // Application data may already sit in the TLS buffers.
        if !session.borrow_mut().pump_logged() {
            return;
        }

        let writable = {
            let session = Rc::clone(&session);
            self.reactor.on_writable(fd, None, move |sub, _| {
                let mut session = session.borrow_mut();
                if session.flush_logged() {
                    session.watch_writable(sub);
                } else {
                    sub.disable();
                }
                Ok(())
            })
        };
        session.borrow().watch_writable(&writable);

        self.reactor.on_readable(fd, None, move |sub, _| {
            let mut session = session.borrow_mut();
            if session.pump_logged() {
                session.watch_writable(&writable);
            } else {
                writable.cancel();
                sub.cancel();
            }
            Ok(())
        });
    }
}

struct EchoSession {
    conn: SecureConnection,
    outbox: Vec<u8>,
    stats: Rc<RefCell<EchoStats>>,
}

impl EchoSession {
    /// Pumps the connection and returns whether it is still open.
    fn pump_logged(&mut self) -> bool {
        let open = match self.pump() {
            Ok(open) => open,
            Err(e) => {
                debug!(connection = %self.conn.id(), error = %e, "echo session failed");
                false
            }
        };
        if !open {
            self.stats.borrow_mut().open -= 1;
            info!(connection = %self.conn.id(), "echo session closed");
        }
        open
    }

    /// Flushes pending output.  On failure the session is closed and the
    /// readable side learns about it on its next read.
    fn flush_logged(&mut self) -> bool {
        match self.flush_outbox() {
            Ok(()) => true,
            Err(e) => {
                debug!(connection = %self.conn.id(), error = %e, "echo flush failed");
                false
            }
        }
    }

    /// `true` while echoed bytes wait for socket space.
    fn has_backlog(&self) -> bool {
        !self.outbox.is_empty() || self.conn.wants_write()
    }

    /// Keeps `writable` enabled exactly while there is a backlog.
    fn watch_writable(&self, writable: &Subscription) {
        if self.has_backlog() {
            writable.enable();
        } else {
            writable.disable();
        }
    }

    fn pump(&mut self) -> io::Result<bool> {
        let mut buf = [0u8; READ_CHUNK];
        let mut open = true;
        loop {
            match self.conn.read(&mut buf) {
                Ok(0) => {
                    open = false;
                    break;
                }
                Ok(n) => self.outbox.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        self.flush_outbox()?;
        Ok(open)
    }

    fn flush_outbox(&mut self) -> io::Result<()> {
        while !self.outbox.is_empty() {
            match self.conn.write(&self.outbox) {
                Ok(0) => break,
                Ok(n) => {
                    self.outbox.drain(..n);
                    self.stats.borrow_mut().bytes_echoed += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        match self.conn.flush() {
            Err(e) if e.kind() != io::ErrorKind::WouldBlock => Err(e),
            _ => Ok(()),
        }
    }
}
