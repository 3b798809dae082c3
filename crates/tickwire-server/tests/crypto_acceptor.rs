//! Integration tests for TcpCryptoAcceptor: real sockets, a real reactor on
//! the test thread, and TLS clients on helper threads.

use std::cell::RefCell;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore};
use tickwire_core::Reactor;
use tickwire_server::application::EchoService;
use tickwire_server::infrastructure::network::{AcceptorError, ConnectionId, TcpCryptoAcceptor};

const FIXTURE_PASSPHRASE: &str = "tickwire-test";

type Secured = Rc<RefCell<Vec<(ConnectionId, SocketAddr, SocketAddr)>>>;

// ── Helpers ───────────────────────────────────────────────────────────────────

fn fixture_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/encrypted-bundle.pem")
}

/// Writes a fresh self-signed `localhost` certificate and its unencrypted key
/// into one PEM file.
fn self_signed_pem(dir: &tempfile::TempDir) -> PathBuf {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let path = dir.path().join("server.pem");
    let mut file = File::create(&path).unwrap();
    file.write_all(cert.serialize_pem().unwrap().as_bytes()).unwrap();
    file.write_all(cert.serialize_private_key_pem().as_bytes()).unwrap();
    path
}

fn first_certificate(pem: &Path) -> CertificateDer<'static> {
    let mut reader = BufReader::new(File::open(pem).unwrap());
    let cert = rustls_pemfile::certs(&mut reader).next().unwrap().unwrap();
    cert
}

fn client_config(trusted: CertificateDer<'static>) -> Arc<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.add(trusted).unwrap();
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    Arc::new(
        ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

/// A TLS client that completes the handshake, then hands its socket back so
/// the test controls when it closes.
fn spawn_handshaking_client(
    addr: SocketAddr,
    config: Arc<ClientConfig>,
) -> JoinHandle<io::Result<(ClientConnection, TcpStream)>> {
    thread::spawn(move || {
        let mut sock = TcpStream::connect(addr)?;
        sock.set_read_timeout(Some(Duration::from_secs(5)))?;
        let name = ServerName::try_from("localhost").map_err(io::Error::other)?;
        let mut conn = ClientConnection::new(config, name).map_err(io::Error::other)?;
        while conn.is_handshaking() {
            conn.complete_io(&mut sock)?;
        }
        Ok((conn, sock))
    })
}

/// A TLS client that sends `payload` and reads back as many bytes.
fn spawn_echo_client(
    addr: SocketAddr,
    config: Arc<ClientConfig>,
    payload: &'static [u8],
) -> JoinHandle<io::Result<Vec<u8>>> {
    thread::spawn(move || {
        let mut sock = TcpStream::connect(addr)?;
        sock.set_read_timeout(Some(Duration::from_secs(5)))?;
        let name = ServerName::try_from("localhost").map_err(io::Error::other)?;
        let mut conn = ClientConnection::new(config, name).map_err(io::Error::other)?;
        let mut tls = rustls::Stream::new(&mut conn, &mut sock);
        tls.write_all(payload)?;
        let mut echoed = vec![0u8; payload.len()];
        tls.read_exact(&mut echoed)?;
        Ok(echoed)
    })
}

/// Ticks `reactor` until `done` holds or `limit` elapses.  Returns whether
/// `done` was reached.
fn drive_until(reactor: &Reactor, limit: Duration, mut done: impl FnMut() -> bool) -> bool {
    let heartbeat = reactor.schedule(Duration::from_millis(5), |_, _| Ok(()));
    let deadline = Instant::now() + limit;
    let mut reached = done();
    while !reached && Instant::now() < deadline {
        reactor.tick().expect("reactor tick");
        reached = done();
    }
    heartbeat.cancel();
    reached
}

fn recording_acceptor(reactor: &Reactor, pem: &Path) -> (TcpCryptoAcceptor, Secured, SocketAddr) {
    let secured: Secured = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&secured);
    let mut acceptor = TcpCryptoAcceptor::new(reactor, "127.0.0.1", 0);
    acceptor
        .set_option("pemCertFile", pem)
        .unwrap()
        .set_option("pemCertPassphrase", "unused")
        .unwrap();
    let addr = acceptor
        .listen(move |conn, peer, server| sink.borrow_mut().push((conn.id(), peer, server)))
        .expect("listen");
    (acceptor, secured, addr)
}

// ── Successful handshakes ─────────────────────────────────────────────────────

#[test]
fn test_completed_handshake_invokes_handler_exactly_once() {
    // Arrange
    let dir = tempfile::tempdir().unwrap();
    let pem = self_signed_pem(&dir);
    let reactor = Reactor::new();
    let (acceptor, secured, addr) = recording_acceptor(&reactor, &pem);

    // Act
    let client = spawn_handshaking_client(addr, client_config(first_certificate(&pem)));
    let done = drive_until(&reactor, Duration::from_secs(5), || secured.borrow().len() == 1);
    let (_conn, sock) = client.join().unwrap().expect("client handshake");
    drive_until(&reactor, Duration::from_millis(50), || false);

    // Assert
    assert!(done, "handler was not invoked");
    let secured = secured.borrow();
    assert_eq!(secured.len(), 1);
    let (_, peer, server) = secured[0];
    assert_eq!(peer, sock.local_addr().unwrap());
    assert_eq!(server, addr);
    assert_eq!(acceptor.pending_count(), 0);
}

#[test]
fn test_encrypted_key_with_correct_passphrase_serves_tls() {
    // Arrange
    let reactor = Reactor::new();
    let echo = EchoService::new(&reactor);
    let mut acceptor = TcpCryptoAcceptor::new(&reactor, "127.0.0.1", 0);
    acceptor
        .set_option("pemCertFile", fixture_path().as_path())
        .unwrap()
        .set_option("pemCertPassphrase", FIXTURE_PASSPHRASE)
        .unwrap();
    let addr = acceptor.listen(echo.handler()).expect("listen");

    // Act
    let client = spawn_echo_client(
        addr,
        client_config(first_certificate(&fixture_path())),
        b"hello over tls",
    );
    let done = drive_until(&reactor, Duration::from_secs(5), || {
        echo.stats().bytes_echoed >= 14
    });
    let echoed = client.join().unwrap().expect("echo client");

    // Assert
    assert!(done);
    assert_eq!(echoed, b"hello over tls");
    assert_eq!(echo.stats().accepted, 1);
}

#[test]
fn test_echo_session_closes_when_client_disconnects() {
    let dir = tempfile::tempdir().unwrap();
    let pem = self_signed_pem(&dir);
    let reactor = Reactor::new();
    let echo = EchoService::new(&reactor);
    let mut acceptor = TcpCryptoAcceptor::new(&reactor, "127.0.0.1", 0);
    acceptor
        .set_option("pemCertFile", pem.as_path())
        .unwrap()
        .set_option("pemCertPassphrase", "unused")
        .unwrap();
    let addr = acceptor.listen(echo.handler()).unwrap();

    let client = spawn_echo_client(addr, client_config(first_certificate(&pem)), b"ping");
    let echoed = {
        let done = drive_until(&reactor, Duration::from_secs(5), || echo.stats().bytes_echoed >= 4);
        assert!(done);
        client.join().unwrap().unwrap()
    };
    let closed = drive_until(&reactor, Duration::from_secs(5), || echo.stats().open == 0);

    assert_eq!(echoed, b"ping");
    assert!(closed, "session still open after client went away");
}

#[test]
fn test_echo_backlog_drains_after_client_stops_sending() {
    // Arrange – far more data than the socket buffers hold, so echoes back up
    // while the client is still writing.
    let dir = tempfile::tempdir().unwrap();
    let pem = self_signed_pem(&dir);
    let reactor = Reactor::new();
    let echo = EchoService::new(&reactor);
    let mut acceptor = TcpCryptoAcceptor::new(&reactor, "127.0.0.1", 0);
    acceptor
        .set_option("pemCertFile", pem.as_path())
        .unwrap()
        .set_option("pemCertPassphrase", "unused")
        .unwrap();
    let addr = acceptor.listen(echo.handler()).unwrap();
    let payload: Vec<u8> = (0..8 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();
    let config = client_config(first_certificate(&pem));

    // Act – write everything first, read only afterwards
    let client = thread::spawn(move || -> io::Result<Vec<u8>> {
        let mut sock = TcpStream::connect(addr)?;
        sock.set_read_timeout(Some(Duration::from_secs(5)))?;
        let name = ServerName::try_from("localhost").map_err(io::Error::other)?;
        let mut conn = ClientConnection::new(config, name).map_err(io::Error::other)?;
        let mut tls = rustls::Stream::new(&mut conn, &mut sock);
        tls.write_all(&payload)?;
        let mut echoed = vec![0u8; payload.len()];
        tls.read_exact(&mut echoed)?;
        Ok(echoed)
    });
    let finished = drive_until(&reactor, Duration::from_secs(20), || client.is_finished());
    let echoed = client.join().unwrap().expect("echo client");

    // Assert
    assert!(finished);
    assert_eq!(echoed.len(), expected.len());
    assert!(echoed == expected, "echoed bytes differ from the payload");
}

// ── Failed handshakes ─────────────────────────────────────────────────────────

#[test]
fn test_silent_client_times_out_and_is_closed() {
    // Arrange
    let dir = tempfile::tempdir().unwrap();
    let pem = self_signed_pem(&dir);
    let reactor = Reactor::new();
    let secured: Secured = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&secured);
    let mut acceptor = TcpCryptoAcceptor::new(&reactor, "127.0.0.1", 0);
    acceptor
        .set_option("pemCertFile", pem.as_path())
        .unwrap()
        .set_option("pemCertPassphrase", "unused")
        .unwrap()
        .set_option("handshakeTimeout", 0.2)
        .unwrap();
    let addr = acceptor
        .listen(move |conn, peer, server| sink.borrow_mut().push((conn.id(), peer, server)))
        .unwrap();

    // Act – connect and never speak
    let mut silent = TcpStream::connect(addr).unwrap();
    assert!(drive_until(&reactor, Duration::from_secs(2), || acceptor.pending_count() == 1));
    let accepted_at = Instant::now();
    let resolved = drive_until(&reactor, Duration::from_secs(2), || acceptor.pending_count() == 0);
    let elapsed = accepted_at.elapsed();

    // Assert
    assert!(resolved, "silent client was never dropped");
    assert!(elapsed < Duration::from_secs(1), "timed out after {elapsed:?}");
    assert!(secured.borrow().is_empty());
    silent.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(silent.read(&mut buf).unwrap(), 0, "server must close the socket");
}

#[test]
fn test_trickling_client_cannot_extend_handshake_deadline() {
    // Arrange
    let dir = tempfile::tempdir().unwrap();
    let pem = self_signed_pem(&dir);
    let reactor = Reactor::new();
    let mut acceptor = TcpCryptoAcceptor::new(&reactor, "127.0.0.1", 0);
    acceptor
        .set_option("pemCertFile", pem.as_path())
        .unwrap()
        .set_option("pemCertPassphrase", "unused")
        .unwrap()
        .set_option("handshakeTimeout", 0.4)
        .unwrap();
    let addr = acceptor.listen(|_, _, _| panic!("handler must not run")).unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    assert!(drive_until(&reactor, Duration::from_secs(2), || acceptor.pending_count() == 1));
    let accepted_at = Instant::now();
    // accept watch, readable watch and expiry timer; the writable watch idles
    assert_eq!(reactor.active_count(), 3);

    // Act – three bytes of a record header shortly before the deadline
    drive_until(&reactor, Duration::from_millis(300), || false);
    client.write_all(&[0x16, 0x03, 0x01]).unwrap();
    let resolved = drive_until(&reactor, Duration::from_secs(2), || acceptor.pending_count() == 0);
    let elapsed = accepted_at.elapsed();

    // Assert – a deadline re-armed by the bytes would land near 700ms
    assert!(resolved, "trickling client was never dropped");
    assert!(elapsed < Duration::from_millis(600), "resolved after {elapsed:?}");
    assert_eq!(reactor.active_count(), 1);
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(client.read(&mut buf).unwrap(), 0, "server must close the socket");
}

#[test]
fn test_non_tls_client_fails_without_invoking_handler() {
    // Arrange
    let dir = tempfile::tempdir().unwrap();
    let pem = self_signed_pem(&dir);
    let reactor = Reactor::new();
    let (acceptor, secured, addr) = recording_acceptor(&reactor, &pem);

    // Act
    let mut garbage = TcpStream::connect(addr).unwrap();
    garbage.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();
    drive_until(&reactor, Duration::from_millis(300), || false);

    // Assert – resolved well before the 1s default timeout
    assert_eq!(acceptor.pending_count(), 0);
    assert!(secured.borrow().is_empty());
    garbage.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut rest = Vec::new();
    if let Err(e) = garbage.read_to_end(&mut rest) {
        assert!(
            !matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut),
            "server left the connection open"
        );
    }
}

#[test]
fn test_close_drops_pending_handshakes() {
    let dir = tempfile::tempdir().unwrap();
    let pem = self_signed_pem(&dir);
    let reactor = Reactor::new();
    let (acceptor, _secured, addr) = recording_acceptor(&reactor, &pem);

    let _silent = TcpStream::connect(addr).unwrap();
    assert!(drive_until(&reactor, Duration::from_secs(2), || acceptor.pending_count() == 1));

    acceptor.close();

    assert_eq!(acceptor.pending_count(), 0);
    assert!(!acceptor.is_bound());
    assert_eq!(acceptor.local_addr(), None);
    assert_eq!(reactor.active_count(), 0);
}

// ── Configuration errors ──────────────────────────────────────────────────────

#[test]
fn test_listen_without_certificate_is_configuration_error() {
    let reactor = Reactor::new();
    let mut acceptor = TcpCryptoAcceptor::new(&reactor, "127.0.0.1", 0);
    acceptor.set_option("pemCertPassphrase", "secret").unwrap();

    let err = acceptor.listen(|_, _, _| {}).unwrap_err();

    assert!(matches!(&err, AcceptorError::Configuration(msg) if msg.contains("pemCertFile")));
    assert!(!acceptor.is_bound());
}

#[test]
fn test_listen_without_passphrase_is_configuration_error() {
    let reactor = Reactor::new();
    let mut acceptor = TcpCryptoAcceptor::new(&reactor, "127.0.0.1", 0);
    acceptor.set_option("pemCertFile", fixture_path().as_path()).unwrap();

    let err = acceptor.listen(|_, _, _| {}).unwrap_err();

    assert!(matches!(&err, AcceptorError::Configuration(msg) if msg.contains("pemCertPassphrase")));
}

#[test]
fn test_wrong_passphrase_is_configuration_error() {
    let reactor = Reactor::new();
    let mut acceptor = TcpCryptoAcceptor::new(&reactor, "127.0.0.1", 0);
    acceptor
        .set_option("pemCertFile", fixture_path().as_path())
        .unwrap()
        .set_option("pemCertPassphrase", "not-the-passphrase")
        .unwrap();

    let err = acceptor.listen(|_, _, _| {}).unwrap_err();

    assert!(matches!(err, AcceptorError::Configuration(_)));
    assert!(!acceptor.is_bound());
}

#[test]
fn test_second_listen_is_configuration_error_naming_address() {
    // Arrange
    let dir = tempfile::tempdir().unwrap();
    let pem = self_signed_pem(&dir);
    let reactor = Reactor::new();
    let (mut acceptor, _secured, addr) = recording_acceptor(&reactor, &pem);

    // Act
    let err = acceptor.listen(|_, _, _| {}).unwrap_err();

    // Assert
    match err {
        AcceptorError::Configuration(msg) => {
            assert!(msg.contains("already bound"));
            assert!(msg.contains(&addr.to_string()));
        }
        other => panic!("expected a configuration error, got {other:?}"),
    }
}

#[test]
fn test_options_are_frozen_once_bound() {
    let dir = tempfile::tempdir().unwrap();
    let pem = self_signed_pem(&dir);
    let reactor = Reactor::new();
    let (mut acceptor, _secured, _addr) = recording_acceptor(&reactor, &pem);

    let err = acceptor.set_option("verifyPeer", true).unwrap_err();

    assert!(matches!(err, AcceptorError::Configuration(_)));
    assert!(!acceptor.options().verify_peer);
}

#[test]
fn test_port_in_use_is_bind_error() {
    // Arrange
    let dir = tempfile::tempdir().unwrap();
    let pem = self_signed_pem(&dir);
    let occupied = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupied.local_addr().unwrap().port();
    let reactor = Reactor::new();
    let mut acceptor = TcpCryptoAcceptor::new(&reactor, "127.0.0.1", port);
    acceptor
        .set_option("pemCertFile", pem.as_path())
        .unwrap()
        .set_option("pemCertPassphrase", "unused")
        .unwrap();

    // Act
    let err = acceptor.listen(|_, _, _| {}).unwrap_err();

    // Assert
    assert!(matches!(err, AcceptorError::Bind { .. }));
    assert_eq!(reactor.active_count(), 0);
}

#[test]
fn test_set_all_options_skips_nulls() {
    use tickwire_server::infrastructure::tls::OptionValue;

    let reactor = Reactor::new();
    let mut acceptor = TcpCryptoAcceptor::new(&reactor, "127.0.0.1", 0);
    acceptor
        .set_all_options([
            ("verifyPeer", OptionValue::Bool(true)),
            ("ciphers", OptionValue::Null),
            ("alpn_protocols", OptionValue::Text("h2".into())),
        ])
        .unwrap();

    assert!(acceptor.options().verify_peer);
    assert_eq!(acceptor.options().ciphers, None);
    assert_eq!(
        acceptor.options().extensions.get("alpn_protocols"),
        Some(&OptionValue::Text("h2".into()))
    );
}
