//! TCP acceptance and per-connection TLS negotiation.

pub mod connection;
pub mod crypto_acceptor;

pub use connection::{ConnectionId, HandshakeError, HandshakeOutcome, PendingHandshake, SecureConnection};
pub use crypto_acceptor::{AcceptorError, ConnectionHandler, TcpCryptoAcceptor};
