//! # TLS Transport Layer
//!
//! rustls configuration builders and the non-blocking [`TlsSession`] the
//! tunnel engine drives.
//!
//! ## Responsibilities
//! - Build server and client configurations from certificate files
//! - Certificate pinning and (development only) unverified clients
//! - Drive a rustls connection over a non-blocking socket and report every
//!   call as a [`TlsIo`] outcome the engine can wait on
//!
//! The session never blocks. Each call moves as many bytes as the socket
//! accepts and otherwise reports which readiness it needs.

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{
    ClientConfig, ClientConnection, DigitallySignedStruct, HandshakeKind, RootCertStore,
    ServerConfig, ServerConnection, SignatureScheme, SupportedProtocolVersion,
};
use sha2::{Digest, Sha256};
use tracing::{debug, trace, warn};

use crate::error::{constants, Result, TunnelError};
use crate::transport::session_cache::SessionCache;

/// TLS protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersion {
    /// TLS 1.2
    TLS12,
    /// TLS 1.3
    TLS13,
    /// Both TLS 1.2 and 1.3
    All,
}

impl TlsVersion {
    /// Parse a configured version name (`"1.2"`, `"1.3"`, `"all"`)
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "1.2" | "tls1.2" | "tlsv1.2" => Some(TlsVersion::TLS12),
            "1.3" | "tls1.3" | "tlsv1.3" => Some(TlsVersion::TLS13),
            "all" => Some(TlsVersion::All),
            _ => None,
        }
    }
}

fn protocol_versions(versions: Option<&[TlsVersion]>) -> Vec<&'static SupportedProtocolVersion> {
    let Some(versions) = versions else {
        return rustls::ALL_VERSIONS.to_vec();
    };
    let (mut tls12, mut tls13) = (false, false);
    for v in versions {
        match v {
            TlsVersion::TLS12 => tls12 = true,
            TlsVersion::TLS13 => tls13 = true,
            TlsVersion::All => {
                tls12 = true;
                tls13 = true;
            }
        }
    }
    debug!("TLS versions requested: TLS1.2={}, TLS1.3={}", tls12, tls13);
    let mut out = Vec::with_capacity(2);
    if tls13 {
        out.push(&rustls::version::TLS13);
    }
    if tls12 {
        out.push(&rustls::version::TLS12);
    }
    out
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Load every certificate from a PEM file
pub fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| TunnelError::TlsError(format!("Failed to open cert file {path}: {e}")))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<io::Result<Vec<_>>>()
        .map_err(|e| TunnelError::TlsError(format!("Failed to parse certificate {path}: {e}")))?;
    if certs.is_empty() {
        return Err(TunnelError::TlsError(format!(
            "{}: {path}",
            constants::ERR_NO_CERTIFICATES
        )));
    }
    Ok(certs)
}

/// Load the first private key (PKCS#8, PKCS#1 or SEC1) from a PEM file
pub fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| TunnelError::TlsError(format!("Failed to open key file {path}: {e}")))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| TunnelError::TlsError(format!("Failed to parse private key {path}: {e}")))?
        .ok_or_else(|| TunnelError::TlsError(format!("{}: {path}", constants::ERR_NO_PRIVATE_KEY)))
}

fn load_root_store(path: &str) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| TunnelError::TlsError(format!("Failed to add CA cert: {e}")))?;
    }
    Ok(roots)
}

/// TLS server configuration
pub struct TlsServerConfig {
    cert_path: String,
    key_path: String,
    /// Optional path to client CA certificates for mTLS
    client_ca_path: Option<String>,
    /// Whether to require client certificates (mTLS)
    require_client_auth: bool,
    /// Allowed TLS protocol versions (None = all supported)
    tls_versions: Option<Vec<TlsVersion>>,
    /// Server-side session store for resumption
    session_cache: Option<Arc<SessionCache>>,
}

impl TlsServerConfig {
    /// Create a new TLS server configuration
    pub fn new<P: AsRef<Path>>(cert_path: P, key_path: P) -> Self {
        Self {
            cert_path: cert_path.as_ref().to_string_lossy().to_string(),
            key_path: key_path.as_ref().to_string_lossy().to_string(),
            client_ca_path: None,
            require_client_auth: false,
            tls_versions: None,
            session_cache: None,
        }
    }

    /// Set allowed TLS protocol versions
    pub fn with_tls_versions(mut self, versions: Vec<TlsVersion>) -> Self {
        self.tls_versions = Some(versions);
        self
    }

    /// Enable mutual TLS authentication by providing a CA certificate path
    pub fn with_client_auth<S: Into<String>>(mut self, client_ca_path: S) -> Self {
        self.client_ca_path = Some(client_ca_path.into());
        self.require_client_auth = true;
        self
    }

    /// Set whether client authentication is required (true) or optional (false)
    pub fn require_client_auth(mut self, required: bool) -> Self {
        self.require_client_auth = required;
        self
    }

    /// Resume sessions through `cache`
    pub fn with_session_cache(mut self, cache: Arc<SessionCache>) -> Self {
        self.session_cache = Some(cache);
        self
    }

    /// Load the TLS configuration from files
    pub fn load_server_config(&self) -> Result<ServerConfig> {
        let cert_chain = load_certs(&self.cert_path)?;
        let private_key = load_private_key(&self.key_path)?;
        let provider = crypto_provider();

        let builder = ServerConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&protocol_versions(self.tls_versions.as_deref()))?;

        let builder = match &self.client_ca_path {
            Some(client_ca_path) => {
                let roots = load_root_store(client_ca_path)?;
                let mut verifier =
                    WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider);
                if !self.require_client_auth {
                    verifier = verifier.allow_unauthenticated();
                }
                let verifier = verifier
                    .build()
                    .map_err(|e| TunnelError::TlsError(format!("Client verifier: {e}")))?;
                debug!(
                    required = self.require_client_auth,
                    "mTLS enabled with client certificate verification"
                );
                builder.with_client_cert_verifier(verifier)
            }
            None => builder.with_no_client_auth(),
        };

        let mut config = builder.with_single_cert(cert_chain, private_key)?;
        if let Some(cache) = &self.session_cache {
            config.session_storage = cache.clone();
        }
        Ok(config)
    }
}

/// TLS Client Configuration
pub struct TlsClientConfig {
    server_name: String,
    insecure: bool,
    /// Optional certificate hash to pin (SHA-256 fingerprint)
    pinned_cert_hash: Option<Vec<u8>>,
    /// Trust anchors; system roots when unset
    ca_path: Option<String>,
    /// Optional client certificate path for mTLS
    client_cert_path: Option<String>,
    /// Optional client key path for mTLS
    client_key_path: Option<String>,
    /// Allowed TLS protocol versions (None = all supported)
    tls_versions: Option<Vec<TlsVersion>>,
}

impl TlsClientConfig {
    /// Create a new TLS client configuration
    pub fn new<S: Into<String>>(server_name: S) -> Self {
        Self {
            server_name: server_name.into(),
            insecure: false,
            pinned_cert_hash: None,
            ca_path: None,
            client_cert_path: None,
            client_key_path: None,
            tls_versions: None,
        }
    }

    /// Set allowed TLS protocol versions
    pub fn with_tls_versions(mut self, versions: Vec<TlsVersion>) -> Self {
        self.tls_versions = Some(versions);
        self
    }

    /// Verify the server against the CA certificates in `ca_path`
    pub fn with_ca_file<S: Into<String>>(mut self, ca_path: S) -> Self {
        self.ca_path = Some(ca_path.into());
        self
    }

    /// Configure client authentication for mTLS
    pub fn with_client_certificate<S: Into<String>>(mut self, cert_path: S, key_path: S) -> Self {
        self.client_cert_path = Some(cert_path.into());
        self.client_key_path = Some(key_path.into());
        self
    }

    /// Skip certificate verification entirely.
    ///
    /// Only for development; a pinned hash takes precedence when both are set.
    pub fn insecure(mut self) -> Self {
        warn!("INSECURE MODE ENABLED: Certificate verification is disabled. This should only be used for development/testing.");
        self.insecure = true;
        self
    }

    /// Accept only a server whose end-entity certificate has this SHA-256 hash
    pub fn with_pinned_cert_hash(mut self, hash: Vec<u8>) -> Self {
        if hash.len() != 32 {
            warn!(
                "Certificate hash has unexpected length: {} (expected 32 bytes for SHA-256)",
                hash.len()
            );
        }
        self.pinned_cert_hash = Some(hash);
        self
    }

    /// Calculate SHA-256 hash for a certificate to use with pinning
    pub fn calculate_cert_hash(cert: &CertificateDer<'_>) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(cert.as_ref());
        hasher.finalize().to_vec()
    }

    /// Load the TLS client configuration
    pub fn load_client_config(&self) -> Result<ClientConfig> {
        let provider = crypto_provider();
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&protocol_versions(self.tls_versions.as_deref()))?;

        let builder = if let Some(hash) = &self.pinned_cert_hash {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(PinnedCertVerifier {
                    fingerprint: hash.clone(),
                    provider,
                }))
        } else if self.insecure {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }))
        } else {
            let roots = match &self.ca_path {
                Some(path) => load_root_store(path)?,
                None => {
                    let native = rustls_native_certs::load_native_certs();
                    for err in &native.errors {
                        warn!(error = %err, "Failed to load a native certificate");
                    }
                    let mut roots = RootCertStore::empty();
                    let (added, ignored) = roots.add_parsable_certificates(native.certs);
                    debug!(added, ignored, "Loaded native root certificates");
                    roots
                }
            };
            builder.with_root_certificates(roots)
        };

        match (&self.client_cert_path, &self.client_key_path) {
            (Some(cert_path), Some(key_path)) => {
                let chain = load_certs(cert_path)?;
                let key = load_private_key(key_path)?;
                builder.with_client_auth_cert(chain, key).map_err(|e| {
                    TunnelError::TlsError(format!("Failed to set client certificate: {e}"))
                })
            }
            _ => Ok(builder.with_no_client_auth()),
        }
    }

    /// Get the server name as a rustls ServerName
    pub fn server_name(&self) -> Result<ServerName<'static>> {
        ServerName::try_from(self.server_name.clone())
            .map_err(|_| TunnelError::TlsError(format!("Invalid server name: {}", self.server_name)))
    }
}

/// Parse a SHA-256 pin written as 64 hex digits, optionally colon separated
pub fn parse_pin(text: &str) -> Result<Vec<u8>> {
    let digits: String = text.chars().filter(|c| *c != ':').collect();
    if digits.len() != 64 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(TunnelError::ConfigError(format!(
            "pinned_sha256 must be 64 hex digits, got {text:?}"
        )));
    }
    (0..64)
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|e| TunnelError::ConfigError(format!("pinned_sha256: {e}")))
        })
        .collect()
}

/// Lowercase hex of a certificate's SHA-256 fingerprint
pub fn fingerprint_hex(cert: &CertificateDer<'_>) -> String {
    TlsClientConfig::calculate_cert_hash(cert)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// One line per certificate: depth and SHA-256 fingerprint
pub fn describe_chain(chain: &[CertificateDer<'_>]) -> String {
    chain
        .iter()
        .enumerate()
        .map(|(depth, cert)| format!("depth={depth} sha256={}\n", fingerprint_hex(cert)))
        .collect()
}

#[derive(Debug)]
struct PinnedCertVerifier {
    fingerprint: Vec<u8>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        if TlsClientConfig::calculate_cert_hash(end_entity) == self.fingerprint {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(
                "Pinned certificate hash mismatch".into(),
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Outcome of a non-blocking TLS call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsIo {
    /// Moved this many plaintext bytes (0 for handshake and shutdown)
    Done(usize),
    /// Retry once the socket is readable
    WantRead,
    /// Retry once the socket is writable
    WantWrite,
    /// The peer sent close-notify
    ZeroReturn,
    /// The socket closed without close-notify
    Eof,
}

/// Close-notify bookkeeping
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownState {
    pub sent: bool,
    pub received: bool,
}

enum Fill {
    Data,
    WouldBlock,
    Eof,
}

enum TlsConnection {
    Client(ClientConnection),
    Server(ServerConnection),
}

macro_rules! with_conn {
    ($conn:expr, $c:ident => $body:expr) => {
        match $conn {
            TlsConnection::Client($c) => $body,
            TlsConnection::Server($c) => $body,
        }
    };
}

/// rustls connection bound to a non-blocking socket
pub struct TlsSession {
    conn: TlsConnection,
    sock: TcpStream,
    shutdown: ShutdownState,
    eof: bool,
    peer_closed: bool,
    pending: usize,
    wire_in: u64,
    wire_out: u64,
}

impl TlsSession {
    /// Client side of a new session over a connected socket
    pub fn client(
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
        sock: TcpStream,
    ) -> Result<Self> {
        let conn = ClientConnection::new(config, server_name)?;
        Ok(Self::with_connection(TlsConnection::Client(conn), sock))
    }

    /// Server side of a new session over an accepted or dialled socket
    pub fn server(config: Arc<ServerConfig>, sock: TcpStream) -> Result<Self> {
        let conn = ServerConnection::new(config)?;
        Ok(Self::with_connection(TlsConnection::Server(conn), sock))
    }

    fn with_connection(conn: TlsConnection, sock: TcpStream) -> Self {
        Self {
            conn,
            sock,
            shutdown: ShutdownState::default(),
            eof: false,
            peer_closed: false,
            pending: 0,
            wire_in: 0,
            wire_out: 0,
        }
    }

    pub fn socket(&self) -> &TcpStream {
        &self.sock
    }

    pub fn is_handshaking(&self) -> bool {
        with_conn!(&self.conn, c => c.is_handshaking())
    }

    /// TLS records are queued for the socket
    pub fn wants_flush(&self) -> bool {
        with_conn!(&self.conn, c => c.wants_write())
    }

    /// Decrypted bytes buffered inside the session
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// A read would return without touching the socket: plaintext is
    /// buffered, or close-notify was processed but not yet reported
    pub fn has_buffered_input(&self) -> bool {
        self.pending > 0 || (self.peer_closed && !self.shutdown.received)
    }

    pub fn shutdown_state(&self) -> ShutdownState {
        self.shutdown
    }

    /// Treat close-notify as exchanged in both directions
    pub fn mark_shutdown(&mut self) {
        self.shutdown = ShutdownState {
            sent: true,
            received: true,
        };
    }

    /// Nothing more can be sent; input already buffered is still readable
    pub fn mark_sent(&mut self) {
        self.shutdown.sent = true;
    }

    /// Ciphertext bytes read from and written to the socket
    pub fn wire_bytes(&self) -> (u64, u64) {
        (self.wire_in, self.wire_out)
    }

    pub fn peer_chain(&self) -> Option<Vec<CertificateDer<'static>>> {
        with_conn!(&self.conn, c => c.peer_certificates().map(|certs| certs.to_vec()))
    }

    /// The handshake resumed an earlier session
    pub fn resumed(&self) -> bool {
        let kind = with_conn!(&self.conn, c => c.handshake_kind());
        kind == Some(HandshakeKind::Resumed)
    }

    pub fn protocol_version(&self) -> Option<rustls::ProtocolVersion> {
        with_conn!(&self.conn, c => c.protocol_version())
    }

    pub fn cipher_suite(&self) -> Option<rustls::CipherSuite> {
        let suite = with_conn!(&self.conn, c => c.negotiated_cipher_suite());
        suite.map(|s| s.suite())
    }

    /// Read ciphertext from the socket once and decrypt it
    fn fill(&mut self) -> Result<Fill> {
        let read = loop {
            match with_conn!(&mut self.conn, c => c.read_tls(&mut self.sock)) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };
        match read {
            Ok(0) => {
                self.eof = true;
                Ok(Fill::Eof)
            }
            Ok(n) => {
                self.wire_in += n as u64;
                match with_conn!(&mut self.conn, c => c.process_new_packets()) {
                    Ok(state) => {
                        self.pending = state.plaintext_bytes_to_read();
                        self.peer_closed |= state.peer_has_closed();
                        trace!(bytes = n, pending = self.pending, "TLS records processed");
                        Ok(Fill::Data)
                    }
                    Err(e) => {
                        // deliver the alert rustls queued before failing
                        let _ = self.flush();
                        Err(e.into())
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Fill::WouldBlock),
            Err(e) => Err(TunnelError::socket("read_tls", e)),
        }
    }

    /// Write queued records to the socket; true once nothing is left queued
    pub fn flush(&mut self) -> Result<bool> {
        while self.wants_flush() {
            match with_conn!(&mut self.conn, c => c.write_tls(&mut self.sock)) {
                Ok(n) => self.wire_out += n as u64,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(TunnelError::socket("write_tls", e)),
            }
        }
        Ok(true)
    }

    /// Advance the handshake as far as the socket allows
    pub fn handshake(&mut self) -> Result<TlsIo> {
        loop {
            if self.wants_flush() && !self.flush()? {
                return Ok(TlsIo::WantWrite);
            }
            if !self.is_handshaking() {
                return Ok(TlsIo::Done(0));
            }
            match self.fill()? {
                Fill::Data => continue,
                Fill::WouldBlock => return Ok(TlsIo::WantRead),
                Fill::Eof => {
                    return Err(TunnelError::HandshakeError(
                        constants::ERR_HANDSHAKE_EOF.into(),
                    ))
                }
            }
        }
    }

    /// Read decrypted bytes into `buf` (which must not be empty)
    pub fn read(&mut self, buf: &mut [u8]) -> Result<TlsIo> {
        loop {
            let result = with_conn!(&mut self.conn, c => c.reader().read(buf));
            match result {
                Ok(0) => {
                    self.pending = 0;
                    self.shutdown.received = true;
                    return Ok(TlsIo::ZeroReturn);
                }
                Ok(n) => {
                    self.pending = self.pending.saturating_sub(n);
                    return Ok(TlsIo::Done(n));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.pending = 0;
                    if self.eof {
                        return Ok(TlsIo::Eof);
                    }
                    match self.fill()? {
                        Fill::Data | Fill::Eof => continue,
                        Fill::WouldBlock => return Ok(TlsIo::WantRead),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    self.pending = 0;
                    return Ok(TlsIo::Eof);
                }
                Err(e) => return Err(TunnelError::socket("SSL_read", e)),
            }
        }
    }

    /// Encrypt bytes from `buf`; accepts nothing while older records are unsent
    pub fn write(&mut self, buf: &[u8]) -> Result<TlsIo> {
        if !self.flush()? {
            return Ok(TlsIo::WantWrite);
        }
        let written = with_conn!(&mut self.conn, c => c.writer().write(buf));
        let n = written.map_err(|e| TunnelError::socket("SSL_write", e))?;
        self.flush()?;
        if n == 0 && !buf.is_empty() {
            return Ok(TlsIo::WantWrite);
        }
        Ok(TlsIo::Done(n))
    }

    /// Queue close-notify (once) and push it out
    pub fn shutdown(&mut self) -> Result<TlsIo> {
        if !self.shutdown.sent {
            with_conn!(&mut self.conn, c => c.send_close_notify());
            self.shutdown.sent = true;
        }
        if self.flush()? {
            Ok(TlsIo::Done(0))
        } else {
            Ok(TlsIo::WantWrite)
        }
    }
}

impl AsRawFd for TlsSession {
    fn as_raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }
}

impl fmt::Debug for TlsSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSession")
            .field("fd", &self.sock.as_raw_fd())
            .field("server", &matches!(self.conn, TlsConnection::Server(_)))
            .field("shutdown", &self.shutdown)
            .field("pending", &self.pending)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pin() {
        let hex = "AB".repeat(32);
        assert_eq!(parse_pin(&hex).expect("pin"), vec![0xab; 32]);
        let colons = vec!["0f"; 32].join(":");
        assert_eq!(parse_pin(&colons).expect("pin"), vec![0x0f; 32]);
        assert!(parse_pin("abcd").is_err());
        assert!(parse_pin(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn test_versions() {
        assert_eq!(TlsVersion::parse("1.2"), Some(TlsVersion::TLS12));
        assert_eq!(TlsVersion::parse("TLSv1.3"), Some(TlsVersion::TLS13));
        assert_eq!(TlsVersion::parse("ssl3"), None);
        assert_eq!(protocol_versions(Some(&[TlsVersion::TLS13])).len(), 1);
        assert_eq!(protocol_versions(Some(&[TlsVersion::All])).len(), 2);
        assert_eq!(protocol_versions(None).len(), 2);
    }

    #[test]
    fn test_describe_chain() {
        let cert = CertificateDer::from(vec![1u8, 2, 3]);
        let text = describe_chain(&[cert.clone(), cert]);
        assert_eq!(text.lines().count(), 2);
        assert!(text.starts_with("depth=0 sha256="));
        assert_eq!(text.lines().next().map(str::len), Some("depth=0 sha256=".len() + 64));
    }

    #[test]
    fn test_missing_files_are_tls_errors() {
        let err = load_certs("/nonexistent/cert.pem");
        assert!(matches!(err, Err(TunnelError::TlsError(_))));
        assert!(TlsServerConfig::new("/nonexistent/a", "/nonexistent/b")
            .load_server_config()
            .is_err());
    }

    #[test]
    fn test_insecure_client_config_builds() {
        let config = TlsClientConfig::new("localhost").insecure();
        assert!(config.load_client_config().is_ok());
        assert!(config.server_name().is_ok());
    }
}
