//! TLS-upgrading TCP acceptor.
//!
//! # Lifecycle of a connection (for beginners)
//!
//! ```text
//!  listener readable
//!        │  accept() until WouldBlock
//!        ▼
//!   ACCEPTED ──► HANDSHAKING ──► SECURED  → handler(conn, peer, server)
//!                    │
//!                    ├─────────► FAILED   (TLS error, peer hung up)
//!                    └─────────► FAILED   (handshake timeout)
//! ```
//!
//! Every accepted socket gets a readable subscription, a writable
//! subscription that is only enabled while handshake records wait for socket
//! space, and a one-shot timer set to the handshake timeout.  The timer is
//! armed once at accept time, so bytes trickling in never extend the
//! deadline.  Each time a socket subscription fires, exactly one handshake
//! attempt runs and yields a [`HandshakeOutcome`]:
//!
//! - `Pending`: nothing changes, the watches stay armed;
//! - `Secured`: the watches are cancelled, the entry removed and the handler
//!   invoked with the secured connection;
//! - `Failed` (or the timer fired): the watches are cancelled, the entry
//!   removed and the socket closed without a TLS close-notify.
//!
//! Whichever of these resolves first removes the entry; later events for the
//! same connection find nothing and are ignored.
//!
//! # Example
//!
//! ```no_run
//! use tickwire_core::Reactor;
//! use tickwire_server::infrastructure::network::TcpCryptoAcceptor;
//!
//! # fn main() -> anyhow::Result<()> {
//! let reactor = Reactor::new();
//! let mut acceptor = TcpCryptoAcceptor::new(&reactor, "127.0.0.1", 8443);
//! acceptor
//!     .set_option("pemCertFile", "server.pem")?
//!     .set_option("pemCertPassphrase", "secret")?;
//! acceptor.listen(|conn, peer, _server| {
//!     println!("secured {} from {peer}", conn.id());
//! })?;
//! reactor.run()?;
//! # Ok(())
//! # }
//! ```

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::AsRawFd;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::{ServerConfig, ServerConnection};
use thiserror::Error;
use tracing::{debug, info, warn};

use tickwire_core::{Reactor, Subscription, Trigger};

use super::connection::{
    ConnectionId, HandshakeError, HandshakeOutcome, HandshakeWatch, PendingHandshake,
    SecureConnection,
};
use crate::infrastructure::tls::{build_server_config, CryptoOptions, OptionError, OptionValue, TlsError};

/// Receives every secured connection with its peer and server addresses.
pub type ConnectionHandler = Box<dyn FnMut(SecureConnection, SocketAddr, SocketAddr)>;

/// Errors raised while configuring or starting the acceptor.
#[derive(Debug, Error)]
pub enum AcceptorError {
    #[error("acceptor configuration error: {0}")]
    Configuration(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

impl From<OptionError> for AcceptorError {
    fn from(err: OptionError) -> Self {
        AcceptorError::Configuration(err.to_string())
    }
}

impl From<TlsError> for AcceptorError {
    fn from(err: TlsError) -> Self {
        AcceptorError::Configuration(err.to_string())
    }
}

// ── Shared state ──────────────────────────────────────────────────────────────

/// State reachable from reactor callbacks through a `Weak`.
#[derive(Default)]
struct AcceptorState {
    listener: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
    accept_watch: Option<Subscription>,
    pending: HashMap<ConnectionId, Deadlined>,
    tls: Option<Arc<ServerConfig>>,
    timeout: Duration,
    handler: Option<Rc<RefCell<ConnectionHandler>>>,
}

/// A pending handshake plus the instant its expiry timer fires.
struct Deadlined {
    handshake: PendingHandshake,
    deadline: Option<Instant>,
}

// ── Acceptor ──────────────────────────────────────────────────────────────────

/// Accepts TCP connections and upgrades each to TLS before handing it on.
pub struct TcpCryptoAcceptor {
    reactor: Reactor,
    address: String,
    port: u16,
    options: CryptoOptions,
    state: Rc<RefCell<AcceptorState>>,
}

impl TcpCryptoAcceptor {
    /// Creates an unbound acceptor for `address:port`.  Port 0 picks a free
    /// port at [`listen`](Self::listen) time.
    pub fn new(reactor: &Reactor, address: impl Into<String>, port: u16) -> Self {
        Self {
            reactor: reactor.clone(),
            address: address.into(),
            port,
            options: CryptoOptions::default(),
            state: Rc::new(RefCell::new(AcceptorState::default())),
        }
    }

    pub fn options(&self) -> &CryptoOptions {
        &self.options
    }

    /// Sets one crypto option by name.
    ///
    /// # Errors
    ///
    /// [`AcceptorError::Configuration`] once the acceptor is listening, or
    /// when the value has the wrong shape.
    pub fn set_option(
        &mut self,
        name: &str,
        value: impl Into<OptionValue>,
    ) -> Result<&mut Self, AcceptorError> {
        self.ensure_unbound()?;
        self.options.set_option(name, value.into())?;
        Ok(self)
    }

    /// Applies every non-null entry of `options`.
    ///
    /// # Errors
    ///
    /// Same as [`set_option`](Self::set_option).
    pub fn set_all_options<I, K>(&mut self, options: I) -> Result<&mut Self, AcceptorError>
    where
        I: IntoIterator<Item = (K, OptionValue)>,
        K: AsRef<str>,
    {
        self.ensure_unbound()?;
        self.options.set_all_options(options)?;
        Ok(self)
    }

    fn ensure_unbound(&self) -> Result<(), AcceptorError> {
        match self.local_addr() {
            Some(addr) => Err(AcceptorError::Configuration(format!(
                "crypto options cannot change while bound to {addr}"
            ))),
            None => Ok(()),
        }
    }

    /// Binds the listening socket and starts accepting.
    ///
    /// Returns the bound address.
    ///
    /// # Errors
    ///
    /// - [`AcceptorError::Configuration`] if already bound, if `pemCertFile`
    ///   or `pemCertPassphrase` is unset, or if the certificate material is
    ///   unusable;
    /// - [`AcceptorError::Bind`] if the socket cannot be bound.
    pub fn listen<H>(&mut self, handler: H) -> Result<SocketAddr, AcceptorError>
    where
        H: FnMut(SecureConnection, SocketAddr, SocketAddr) + 'static,
    {
        if let Some(addr) = self.local_addr() {
            return Err(AcceptorError::Configuration(format!(
                "acceptor is already bound to {addr}"
            )));
        }
        if self.options.pem_cert_file.is_none() {
            return Err(AcceptorError::Configuration(
                "the `pemCertFile` option must be specified".to_string(),
            ));
        }
        if self.options.pem_cert_passphrase.is_none() {
            return Err(AcceptorError::Configuration(
                "the `pemCertPassphrase` option must be specified".to_string(),
            ));
        }

        let tls = build_server_config(&self.options)?;
        let timeout = self.options.handshake_timeout_at(self.reactor.resolution());

        let target = format!("{}:{}", self.address, self.port);
        let listener = TcpListener::bind((self.address.as_str(), self.port))
            .and_then(|l| l.set_nonblocking(true).map(|()| l))
            .map_err(|source| AcceptorError::Bind {
                addr: target.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| AcceptorError::Bind {
            addr: target,
            source,
        })?;

        let weak = Rc::downgrade(&self.state);
        let reactor = self.reactor.clone();
        let accept_watch = self
            .reactor
            .on_readable(listener.as_raw_fd(), None, move |_, _| {
                accept_ready(&weak, &reactor);
                Ok(())
            });

        let handler: ConnectionHandler = Box::new(handler);
        let mut state = self.state.borrow_mut();
        state.listener = Some(listener);
        state.local_addr = Some(local_addr);
        state.accept_watch = Some(accept_watch);
        state.tls = Some(tls);
        state.timeout = timeout;
        state.handler = Some(Rc::new(RefCell::new(handler)));

        info!(address = %local_addr, ?timeout, "TLS acceptor listening");
        Ok(local_addr)
    }

    /// Stops listening and drops every connection still negotiating.
    pub fn close(&self) {
        let (listener, watch, pending) = {
            let mut state = self.state.borrow_mut();
            state.local_addr = None;
            state.tls = None;
            state.handler = None;
            (
                state.listener.take(),
                state.accept_watch.take(),
                std::mem::take(&mut state.pending),
            )
        };
        if let Some(watch) = watch {
            watch.cancel();
        }
        let dropped = pending.len();
        for (_, entry) in pending {
            entry.handshake.abort();
        }
        if let Some(listener) = listener {
            debug!(
                address = ?listener.local_addr().ok(),
                dropped_handshakes = dropped,
                "TLS acceptor closed"
            );
        }
    }

    /// Bound address, or `None` before [`listen`](Self::listen) / after
    /// [`close`](Self::close).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.borrow().local_addr
    }

    pub fn is_bound(&self) -> bool {
        self.local_addr().is_some()
    }

    /// Number of connections still negotiating.
    pub fn pending_count(&self) -> usize {
        self.state.borrow().pending.len()
    }
}

impl Drop for TcpCryptoAcceptor {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for TcpCryptoAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpCryptoAcceptor")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("local_addr", &self.local_addr())
            .field("pending", &self.pending_count())
            .finish()
    }
}

// ── Reactor callbacks ─────────────────────────────────────────────────────────

/// Drains the listener's accept queue.
fn accept_ready(weak: &Weak<RefCell<AcceptorState>>, reactor: &Reactor) {
    let Some(state) = weak.upgrade() else {
        return;
    };

    loop {
        let accepted = match &state.borrow().listener {
            Some(listener) => listener.accept(),
            None => return,
        };
        let (stream, peer_addr) = match accepted {
            Ok(pair) => pair,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "accept failed");
                break;
            }
        };

        if let Err(e) = stream.set_nonblocking(true) {
            warn!(%peer_addr, error = %e, "could not make accepted socket non-blocking");
            continue;
        }

        let (tls, timeout, listen_addr) = {
            let state = state.borrow();
            (state.tls.clone(), state.timeout, state.local_addr)
        };
        let (Some(tls), Some(listen_addr)) = (tls, listen_addr) else {
            return;
        };
        let server_addr = stream.local_addr().unwrap_or(listen_addr);

        let session = match ServerConnection::new(tls) {
            Ok(session) => session,
            Err(e) => {
                warn!(%peer_addr, error = %e, "could not start a TLS session");
                continue;
            }
        };

        let id = ConnectionId::new();
        let fd = stream.as_raw_fd();
        let watch = {
            let (on_read, on_write, on_expiry) =
                (Rc::downgrade(&state), Rc::downgrade(&state), Rc::downgrade(&state));
            let readable = reactor.on_readable(fd, None, move |_, trigger| {
                attempt_handshake(&on_read, id, trigger);
                Ok(())
            });
            let writable = reactor.on_writable(fd, None, move |_, trigger| {
                attempt_handshake(&on_write, id, trigger);
                Ok(())
            });
            writable.disable();
            let expiry = reactor.once(timeout, move |_, _| {
                attempt_handshake(&on_expiry, id, Trigger::Timeout);
                Ok(())
            });
            HandshakeWatch {
                readable,
                writable,
                expiry,
            }
        };

        state.borrow_mut().pending.insert(
            id,
            Deadlined {
                handshake: PendingHandshake {
                    id,
                    watch,
                    peer_addr,
                    server_addr,
                    stream,
                    session,
                },
                deadline: Instant::now().checked_add(timeout),
            },
        );
        debug!(connection = %id, %peer_addr, "connection accepted, handshake started");

        attempt_handshake(weak, id, Trigger::Readable);
    }
}

/// Runs one handshake attempt for `id` and resolves the entry if it
/// finished.
fn attempt_handshake(weak: &Weak<RefCell<AcceptorState>>, id: ConnectionId, trigger: Trigger) {
    let Some(state) = weak.upgrade() else {
        return;
    };

    let outcome = {
        let mut guard = state.borrow_mut();
        let st = &mut *guard;
        let Some(entry) = st.pending.get_mut(&id) else {
            return;
        };
        let expired = entry.deadline.is_some_and(|at| Instant::now() >= at);
        if trigger == Trigger::Timeout || expired {
            HandshakeOutcome::Failed(HandshakeError::TimedOut(st.timeout))
        } else {
            entry.handshake.advance()
        }
    };

    match outcome {
        HandshakeOutcome::Pending => {}
        HandshakeOutcome::Secured => {
            let (entry, handler) = {
                let mut st = state.borrow_mut();
                (st.pending.remove(&id), st.handler.clone())
            };
            let Some(entry) = entry else {
                return;
            };
            let conn = entry.handshake.into_secure();
            let (peer_addr, server_addr) = (conn.peer_addr(), conn.local_addr());
            debug!(connection = %id, %peer_addr, "handshake complete");
            match handler {
                Some(handler) => (&mut *handler.borrow_mut())(conn, peer_addr, server_addr),
                None => debug!(connection = %id, "no handler installed, dropping connection"),
            }
        }
        HandshakeOutcome::Failed(err) => {
            let entry = state.borrow_mut().pending.remove(&id);
            if let Some(entry) = entry {
                let peer_addr = entry.handshake.peer_addr();
                entry.handshake.abort();
                debug!(connection = %id, %peer_addr, error = %err, "handshake failed, connection closed");
            }
        }
    }
}
