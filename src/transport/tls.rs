//! # TLS Session
//!
//! Wraps a rustls server or client connection so the read and write lanes of a
//! [`Connection`](crate::connection::Connection) can share it.
//!
//! rustls is driven by hand rather than through a stream adapter, so that
//! handshake records can be interleaved with the connection's own queue:
//! - the read lane feeds ciphertext in and takes plaintext out
//!   ([`TlsSession::process_inbound`])
//! - the write lane seals plaintext into records ([`TlsSession::seal`]) and
//!   flushes handshake output ([`TlsSession::flush_into`])
//!
//! The engine mutex is only held for synchronous engine calls, never across
//! an await point.
//!
//! ## Configuration
//! [`TlsServerConfig`] and [`TlsClientConfig`] load PEM material from disk and
//! build rustls configs on the ring provider.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{BufMut, BytesMut};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection};
use tracing::{debug, trace};

use crate::error::{constants, ProtocolError, Result};

/// Plaintext drained from the engine per read call
const PLAINTEXT_CHUNK: usize = 16 * 1024;

/// Where the handshake stands after the last engine call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// The engine is waiting for peer records
    NeedInput,
    /// The engine has records to send
    NeedOutput,
    /// The handshake finished during the last call
    Complete,
    /// No handshake in progress
    NotHandshaking,
}

/// Result of feeding one read completion into the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inbound {
    /// Plaintext bytes appended to the framing buffer
    pub plaintext: usize,
    pub status: HandshakeStatus,
    /// The engine has records waiting to be written
    pub wants_write: bool,
    /// The peer sent close_notify
    pub peer_closed: bool,
}

enum Engine {
    Server(ServerConnection),
    Client(ClientConnection),
}

impl Engine {
    fn read_tls(&mut self, rd: &mut dyn Read) -> io::Result<usize> {
        match self {
            Engine::Server(conn) => conn.read_tls(rd),
            Engine::Client(conn) => conn.read_tls(rd),
        }
    }

    fn write_tls(&mut self, wr: &mut dyn Write) -> io::Result<usize> {
        match self {
            Engine::Server(conn) => conn.write_tls(wr),
            Engine::Client(conn) => conn.write_tls(wr),
        }
    }

    fn process_new_packets(&mut self) -> std::result::Result<rustls::IoState, rustls::Error> {
        match self {
            Engine::Server(conn) => conn.process_new_packets(),
            Engine::Client(conn) => conn.process_new_packets(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            Engine::Server(conn) => conn.wants_write(),
            Engine::Client(conn) => conn.wants_write(),
        }
    }

    fn is_handshaking(&self) -> bool {
        match self {
            Engine::Server(conn) => conn.is_handshaking(),
            Engine::Client(conn) => conn.is_handshaking(),
        }
    }

    fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            Engine::Server(conn) => conn.writer(),
            Engine::Client(conn) => conn.writer(),
        }
    }

    fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            Engine::Server(conn) => conn.reader(),
            Engine::Client(conn) => conn.reader(),
        }
    }
}

/// A TLS engine shared by both lanes of one connection.
pub struct TlsSession {
    engine: Mutex<Engine>,
    client: bool,
}

impl std::fmt::Debug for TlsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSession")
            .field("client", &self.client)
            .field("status", &self.status())
            .finish()
    }
}

impl TlsSession {
    pub fn server(config: Arc<ServerConfig>) -> Result<Self> {
        let conn = ServerConnection::new(config)?;
        Ok(Self {
            engine: Mutex::new(Engine::Server(conn)),
            client: false,
        })
    }

    /// Client session for `server_name`. The ClientHello is ready to flush
    /// as soon as this returns.
    pub fn client(config: Arc<ClientConfig>, server_name: &str) -> Result<Self> {
        let name = ServerName::try_from(server_name.to_owned())
            .map_err(|e| ProtocolError::TlsError(format!("Invalid server name: {e}")))?;
        let conn = ClientConnection::new(config, name)?;
        Ok(Self {
            engine: Mutex::new(Engine::Client(conn)),
            client: true,
        })
    }

    pub fn is_client(&self) -> bool {
        self.client
    }

    fn engine(&self) -> Result<MutexGuard<'_, Engine>> {
        self.engine
            .lock()
            .map_err(|_| ProtocolError::TlsError(constants::ERR_TLS_SESSION_LOCK.into()))
    }

    pub fn is_handshaking(&self) -> bool {
        self.engine().map(|e| e.is_handshaking()).unwrap_or(false)
    }

    pub fn status(&self) -> HandshakeStatus {
        match self.engine() {
            Ok(engine) => status_of(&engine),
            Err(_) => HandshakeStatus::NotHandshaking,
        }
    }

    /// Feed `cipher` through the engine, appending any decrypted application
    /// data to `plain`.
    ///
    /// Engine errors raised while the handshake is still running come back as
    /// [`ProtocolError::HandshakeError`].
    pub fn process_inbound(&self, mut cipher: &[u8], plain: &mut BytesMut) -> Result<Inbound> {
        let mut engine = self.engine()?;
        let was_handshaking = engine.is_handshaking();
        let mut plaintext = 0;
        let mut peer_closed = false;

        while !cipher.is_empty() {
            let consumed = engine.read_tls(&mut cipher)?;
            if consumed == 0 {
                break;
            }
            let handshaking = engine.is_handshaking();
            let state = engine.process_new_packets().map_err(|e| {
                if handshaking {
                    ProtocolError::handshake(e)
                } else {
                    ProtocolError::from(e)
                }
            })?;
            peer_closed |= state.peer_has_closed();
            plaintext += drain_plaintext(&mut engine, plain)?;
        }

        let mut status = status_of(&engine);
        if was_handshaking && !engine.is_handshaking() {
            status = HandshakeStatus::Complete;
        }
        trace!(plaintext, ?status, "Processed inbound TLS records");

        Ok(Inbound {
            plaintext,
            status,
            wants_write: engine.wants_write(),
            peer_closed,
        })
    }

    /// Encrypt `plain` and append the resulting records to `out`.
    ///
    /// Plaintext is fed in as far as the engine's send buffer allows, with
    /// records drained in between, so packets larger than that buffer seal too.
    pub fn seal(&self, mut plain: &[u8], out: &mut BytesMut) -> Result<usize> {
        let mut engine = self.engine()?;
        let mut total = 0;
        while !plain.is_empty() {
            let accepted = engine.writer().write(plain)?;
            let flushed = write_pending(&mut engine, out)?;
            if accepted == 0 && flushed == 0 {
                return Err(ProtocolError::TlsError(
                    "TLS engine accepted no plaintext".into(),
                ));
            }
            plain = &plain[accepted..];
            total += flushed;
        }
        Ok(total)
    }

    /// Append every record the engine has queued to `out`.
    pub fn flush_into(&self, out: &mut BytesMut) -> Result<usize> {
        let mut engine = self.engine()?;
        write_pending(&mut engine, out)
    }
}

fn status_of(engine: &Engine) -> HandshakeStatus {
    if !engine.is_handshaking() {
        HandshakeStatus::NotHandshaking
    } else if engine.wants_write() {
        HandshakeStatus::NeedOutput
    } else {
        HandshakeStatus::NeedInput
    }
}

fn drain_plaintext(engine: &mut Engine, plain: &mut BytesMut) -> Result<usize> {
    let mut chunk = [0u8; PLAINTEXT_CHUNK];
    let mut total = 0;
    loop {
        match engine.reader().read(&mut chunk) {
            Ok(0) => return Ok(total),
            Ok(n) => {
                plain.extend_from_slice(&chunk[..n]);
                total += n;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(total),
            // Peer closed without close_notify; surfaces as EOF on the socket
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(total),
            Err(e) => return Err(e.into()),
        }
    }
}

fn write_pending(engine: &mut Engine, out: &mut BytesMut) -> Result<usize> {
    let mut total = 0;
    let mut sink = out.writer();
    while engine.wants_write() {
        total += engine.write_tls(&mut sink)?;
    }
    Ok(total)
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn open(path: &Path, what: &str) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| ProtocolError::TlsError(format!("Failed to open {what} file: {e}")))
}

/// Read every certificate from a PEM file.
pub fn load_certs<P: AsRef<Path>>(path: P) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = open(path.as_ref(), "certificate")?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<io::Result<Vec<_>>>()
        .map_err(|e| ProtocolError::TlsError(format!("Failed to parse certificate: {e}")))?;

    if certs.is_empty() {
        return Err(ProtocolError::TlsError(constants::ERR_NO_CERTIFICATES.into()));
    }
    Ok(certs)
}

/// Read the first private key (PKCS#8, PKCS#1 or SEC1) from a PEM file.
pub fn load_private_key<P: AsRef<Path>>(path: P) -> Result<PrivateKeyDer<'static>> {
    let mut reader = open(path.as_ref(), "key")?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ProtocolError::TlsError(format!("Failed to parse private key: {e}")))?
        .ok_or_else(|| ProtocolError::TlsError(constants::ERR_NO_PRIVATE_KEY.into()))
}

fn root_store(certs: Vec<CertificateDer<'static>>) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots.add(cert)?;
    }
    Ok(roots)
}

/// Server config from an already-loaded chain and key.
pub fn build_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ServerConfig> {
    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(config)
}

/// Client config trusting exactly `roots`.
pub fn build_client_config(roots: Vec<CertificateDer<'static>>) -> Result<ClientConfig> {
    let config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(root_store(roots)?)
        .with_no_client_auth();
    Ok(config)
}

/// TLS server configuration
#[derive(Debug, Clone)]
pub struct TlsServerConfig {
    cert_path: PathBuf,
    key_path: PathBuf,
    /// CA bundle used to verify client certificates (mTLS)
    client_ca_path: Option<PathBuf>,
}

impl TlsServerConfig {
    pub fn new<P: AsRef<Path>>(cert_path: P, key_path: P) -> Self {
        Self {
            cert_path: cert_path.as_ref().to_path_buf(),
            key_path: key_path.as_ref().to_path_buf(),
            client_ca_path: None,
        }
    }

    /// Require client certificates signed by the CAs in `client_ca_path`
    pub fn with_client_auth<P: AsRef<Path>>(mut self, client_ca_path: P) -> Self {
        self.client_ca_path = Some(client_ca_path.as_ref().to_path_buf());
        self
    }

    /// Load the rustls server configuration from disk
    pub fn load_server_config(&self) -> Result<ServerConfig> {
        let certs = load_certs(&self.cert_path)?;
        let key = load_private_key(&self.key_path)?;

        let Some(ca_path) = &self.client_ca_path else {
            return build_server_config(certs, key);
        };

        let roots = root_store(load_certs(ca_path)?)?;
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider())
            .build()
            .map_err(|e| ProtocolError::TlsError(format!("Invalid client CA: {e}")))?;

        let config = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)?;
        debug!("mTLS enabled with client certificate verification required");
        Ok(config)
    }
}

/// TLS client configuration
#[derive(Debug, Clone)]
pub struct TlsClientConfig {
    server_name: String,
    ca_path: Option<PathBuf>,
    /// Client certificate and key presented for mTLS
    client_identity: Option<(PathBuf, PathBuf)>,
}

impl TlsClientConfig {
    pub fn new<S: Into<String>>(server_name: S) -> Self {
        Self {
            server_name: server_name.into(),
            ca_path: None,
            client_identity: None,
        }
    }

    /// Trust the CAs in `ca_path`
    pub fn with_ca_file<P: AsRef<Path>>(mut self, ca_path: P) -> Self {
        self.ca_path = Some(ca_path.as_ref().to_path_buf());
        self
    }

    /// Present a client certificate
    pub fn with_client_certificate<P: AsRef<Path>>(mut self, cert_path: P, key_path: P) -> Self {
        self.client_identity = Some((
            cert_path.as_ref().to_path_buf(),
            key_path.as_ref().to_path_buf(),
        ));
        self
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Load the rustls client configuration from disk
    pub fn load_client_config(&self) -> Result<ClientConfig> {
        let ca_path = self.ca_path.as_ref().ok_or_else(|| {
            ProtocolError::ConfigError("TLS client requires a CA file".to_string())
        })?;
        let roots = root_store(load_certs(ca_path)?)?;

        let builder = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots);

        match &self.client_identity {
            Some((cert_path, key_path)) => {
                let certs = load_certs(cert_path)?;
                let key = load_private_key(key_path)?;
                Ok(builder.with_client_auth_cert(certs, key)?)
            }
            None => Ok(builder.with_no_client_auth()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::pki_types::PrivatePkcs8KeyDer;

    fn configs() -> (Arc<ServerConfig>, Arc<ClientConfig>) {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let cert = certified.cert.der().clone();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            certified.key_pair.serialize_der(),
        ));
        let server = build_server_config(vec![cert.clone()], key).unwrap();
        let client = build_client_config(vec![cert]).unwrap();
        (Arc::new(server), Arc::new(client))
    }

    /// Shuttle records between two sessions until both are idle.
    fn pump(from: &TlsSession, to: &TlsSession, plain: &mut BytesMut) -> Inbound {
        let mut records = BytesMut::new();
        from.flush_into(&mut records).unwrap();
        to.process_inbound(&records, plain).unwrap()
    }

    #[test]
    fn test_in_memory_handshake_and_data() {
        let (server_cfg, client_cfg) = configs();
        let server = TlsSession::server(server_cfg).unwrap();
        let client = TlsSession::client(client_cfg, "localhost").unwrap();

        assert!(client.is_client());
        assert_eq!(client.status(), HandshakeStatus::NeedOutput);
        assert_eq!(server.status(), HandshakeStatus::NeedInput);

        let mut sink = BytesMut::new();
        let mut completed = false;
        for _ in 0..6 {
            let s = pump(&client, &server, &mut sink);
            let c = pump(&server, &client, &mut sink);
            completed |= s.status == HandshakeStatus::Complete || c.status == HandshakeStatus::Complete;
            if !client.is_handshaking() && !server.is_handshaking() {
                break;
            }
        }
        assert!(completed);
        assert_eq!(client.status(), HandshakeStatus::NotHandshaking);
        assert!(format!("{server:?}").contains("NotHandshaking"));
        assert!(!client.is_handshaking());
        assert!(!server.is_handshaking());
        assert!(sink.is_empty());

        let mut records = BytesMut::new();
        client.seal(b"\x00\x05hey", &mut records).unwrap();
        let mut plain = BytesMut::new();
        let inbound = server.process_inbound(&records, &mut plain).unwrap();
        assert_eq!(inbound.plaintext, 5);
        assert_eq!(&plain[..], b"\x00\x05hey");
    }

    #[test]
    fn test_garbage_records_fail() {
        let (server_cfg, _) = configs();
        let server = TlsSession::server(server_cfg).unwrap();
        let mut plain = BytesMut::new();
        let result = server.process_inbound(b"definitely not a tls record", &mut plain);
        assert!(matches!(result, Err(ProtocolError::HandshakeError(_))));
    }

    #[test]
    fn test_pem_loading() {
        let dir = tempfile::tempdir().unwrap();
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        std::fs::write(&cert_path, certified.cert.pem()).unwrap();
        std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();

        assert!(TlsServerConfig::new(&cert_path, &key_path)
            .load_server_config()
            .is_ok());
        assert!(TlsClientConfig::new("localhost")
            .with_ca_file(&cert_path)
            .load_client_config()
            .is_ok());

        // Key file holds no certificate
        assert!(load_certs(&key_path).is_err());
        assert!(TlsClientConfig::new("localhost").load_client_config().is_err());
    }
}
