//! Per-connection types of the TLS acceptor.
//!
//! A connection lives first as a [`PendingHandshake`] while the TLS
//! negotiation runs, then (on success) as a [`SecureConnection`] handed to
//! the caller.  Each handshake attempt reports a three-valued
//! [`HandshakeOutcome`].

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use rustls::ServerConnection;
use thiserror::Error;
use tracing::trace;
use uuid::Uuid;

use tickwire_core::Subscription;

// ── Identity ──────────────────────────────────────────────────────────────────

/// Unique identity of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ── Outcomes ──────────────────────────────────────────────────────────────────

/// Why a handshake did not complete.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake not completed within {0:?}")]
    TimedOut(Duration),

    #[error("peer closed the connection during the handshake")]
    PeerClosed,

    #[error("socket error during the handshake: {0}")]
    Io(#[from] io::Error),

    #[error("TLS negotiation failed: {0}")]
    Tls(#[from] rustls::Error),
}

/// Result of one handshake attempt.
#[derive(Debug)]
pub enum HandshakeOutcome {
    /// More bytes are needed from the peer.
    Pending,
    /// The connection is encrypted and ready for application data.
    Secured,
    Failed(HandshakeError),
}

// ── Pending handshake ─────────────────────────────────────────────────────────

/// Reactor subscriptions that drive one handshake.
///
/// The readable watch runs for the whole negotiation, the writable watch only
/// while encrypted records are stuck in the session, and the expiry timer
/// fires once at the absolute handshake deadline.
pub(crate) struct HandshakeWatch {
    pub(crate) readable: Subscription,
    pub(crate) writable: Subscription,
    pub(crate) expiry: Subscription,
}

impl HandshakeWatch {
    fn cancel(&self) {
        self.readable.cancel();
        self.writable.cancel();
        self.expiry.cancel();
    }
}

/// A connection mid-negotiation, owned by the acceptor.
pub struct PendingHandshake {
    pub(crate) id: ConnectionId,
    pub(crate) watch: HandshakeWatch,
    pub(crate) peer_addr: SocketAddr,
    pub(crate) server_addr: SocketAddr,
    pub(crate) stream: TcpStream,
    pub(crate) session: ServerConnection,
}

impl PendingHandshake {
    /// Runs one non-blocking handshake attempt.
    ///
    /// While the outcome is `Pending`, the writable watch is enabled exactly
    /// when queued handshake records still wait for socket space.
    pub fn advance(&mut self) -> HandshakeOutcome {
        match self.try_advance() {
            Ok(HandshakeOutcome::Pending) => {
                if self.session.wants_write() {
                    self.watch.writable.enable();
                } else {
                    self.watch.writable.disable();
                }
                HandshakeOutcome::Pending
            }
            Ok(outcome) => outcome,
            Err(HandshakeError::Tls(err)) => {
                // Best effort: let the peer see the alert rustls queued.
                let _ = self.session.write_tls(&mut self.stream);
                HandshakeOutcome::Failed(HandshakeError::Tls(err))
            }
            Err(err) => HandshakeOutcome::Failed(err),
        }
    }

    fn try_advance(&mut self) -> Result<HandshakeOutcome, HandshakeError> {
        loop {
            if !self.flush_tls()? {
                return Ok(HandshakeOutcome::Pending);
            }
            if !self.session.is_handshaking() {
                return Ok(HandshakeOutcome::Secured);
            }

            match self.session.read_tls(&mut self.stream) {
                Ok(0) => return Err(HandshakeError::PeerClosed),
                Ok(n) => trace!(connection = %self.id, bytes = n, "handshake bytes received"),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(HandshakeOutcome::Pending)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
            self.session.process_new_packets()?;
        }
    }

    /// Writes queued handshake records.  `false` when the socket is full.
    fn flush_tls(&mut self) -> Result<bool, HandshakeError> {
        while self.session.wants_write() {
            match self.session.write_tls(&mut self.stream) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub(crate) fn into_secure(self) -> SecureConnection {
        self.watch.cancel();
        SecureConnection {
            id: self.id,
            stream: self.stream,
            session: self.session,
            peer_addr: self.peer_addr,
            local_addr: self.server_addr,
        }
    }

    /// Cancels the watches and drops the socket without a close-notify.
    pub(crate) fn abort(self) {
        self.watch.cancel();
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl fmt::Debug for PendingHandshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingHandshake")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("server_addr", &self.server_addr)
            .field("handshaking", &self.session.is_handshaking())
            .finish()
    }
}

// ── Secured connection ────────────────────────────────────────────────────────

/// An encrypted connection whose handshake completed.
///
/// `Read` and `Write` carry plaintext; the socket stays non-blocking, so
/// both may return [`io::ErrorKind::WouldBlock`].  Register the
/// [`AsRawFd`] descriptor with a reactor to learn when to retry.
pub struct SecureConnection {
    id: ConnectionId,
    stream: TcpStream,
    session: ServerConnection,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
}

impl SecureConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// ALPN protocol agreed during the handshake, if any.
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        self.session.alpn_protocol()
    }

    /// `true` while encrypted bytes are queued for the socket.
    pub fn wants_write(&self) -> bool {
        self.session.wants_write()
    }

    /// Sends a close-notify and shuts the socket down.
    pub fn close(mut self) -> io::Result<()> {
        self.session.send_close_notify();
        let _ = self.flush_tls();
        self.stream.shutdown(Shutdown::Both)
    }

    fn flush_tls(&mut self) -> io::Result<()> {
        while self.session.wants_write() {
            match self.session.write_tls(&mut self.stream) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl Read for SecureConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.session.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }

            match self.session.read_tls(&mut self.stream)? {
                0 => return Ok(0),
                _ => {
                    self.session
                        .process_new_packets()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                    // Key updates and alerts may need answering.
                    match self.flush_tls() {
                        Err(e) if e.kind() != io::ErrorKind::WouldBlock => return Err(e),
                        _ => {}
                    }
                }
            }
        }
    }
}

impl Write for SecureConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.session.writer().write(buf)?;
        match self.flush_tls() {
            Err(e) if e.kind() != io::ErrorKind::WouldBlock => Err(e),
            _ => Ok(n),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.session.writer().flush()?;
        self.flush_tls()
    }
}

impl AsRawFd for SecureConnection {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl fmt::Debug for SecureConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureConnection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
