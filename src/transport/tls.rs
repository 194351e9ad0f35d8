//! # TLS Provisioning
//!
//! Turns PEM files on disk into rustls trust and key material, and wraps
//! the TLS handshakes used by clients and servers.
//!
//! Every built config enables exactly one protocol version
//! ([`TlsVersion::TLS13`] unless configured otherwise). Failures are
//! reported as [`ProtocolError::ProvisioningFailure`] so they surface from
//! the builders before any socket is opened.
//!
//! ## Layout
//! - CA directory: every regular file is read in name order, each may hold
//!   one or more PEM certificates
//! - Identity directory: `cert.pem` (chain) and `key.pem` (PKCS#8, RSA or
//!   SEC1 EC key)

use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rustls::server::{AllowAnyAnonymousOrAuthenticatedClient, AllowAnyAuthenticatedClient};
use rustls::{
    Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig, ServerName,
    SupportedProtocolVersion,
};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::server::TlsStream as ServerTlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, instrument};

use crate::config::{ClientTlsSettings, ServerTlsSettings};
use crate::error::{constants, ProtocolError, Result};
use crate::utils::timeout::with_timeout_or;

/// File name of the certificate chain inside an identity directory.
pub const IDENTITY_CERT_FILE: &str = "cert.pem";

/// File name of the private key inside an identity directory.
pub const IDENTITY_KEY_FILE: &str = "key.pem";

/// TLS protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TlsVersion {
    /// TLS 1.2
    #[serde(rename = "tls12")]
    TLS12,
    /// TLS 1.3
    #[default]
    #[serde(rename = "tls13")]
    TLS13,
}

impl TlsVersion {
    fn protocol(self) -> &'static SupportedProtocolVersion {
        match self {
            TlsVersion::TLS12 => &rustls::version::TLS12,
            TlsVersion::TLS13 => &rustls::version::TLS13,
        }
    }
}

fn provisioning(context: impl std::fmt::Display, err: impl std::fmt::Display) -> ProtocolError {
    ProtocolError::ProvisioningFailure(format!("{context}: {err}"))
}

/// Read every PEM certificate in `path`. An empty or unparseable file fails.
pub fn load_certificates<P: AsRef<Path>>(path: P) -> Result<Vec<Certificate>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| provisioning(path.display(), e))?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader).map_err(|e| provisioning(path.display(), e))?;
    if certs.is_empty() {
        return Err(provisioning(path.display(), constants::ERR_NO_CERTIFICATES));
    }

    Ok(certs.into_iter().map(Certificate).collect())
}

/// Read the first private key in `path` (PKCS#8, RSA or SEC1 EC).
pub fn load_private_key<P: AsRef<Path>>(path: P) -> Result<PrivateKey> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| provisioning(path.display(), e))?;
    let mut reader = BufReader::new(file);

    let items = rustls_pemfile::read_all(&mut reader).map_err(|e| provisioning(path.display(), e))?;
    for item in items {
        match item {
            rustls_pemfile::Item::PKCS8Key(der)
            | rustls_pemfile::Item::RSAKey(der)
            | rustls_pemfile::Item::ECKey(der) => return Ok(PrivateKey(der)),
            _ => continue,
        }
    }

    Err(provisioning(path.display(), constants::ERR_NO_PRIVATE_KEY))
}

/// Build a root store from every file in `dir`.
///
/// Files are read in name order. Any unreadable or certificate-free file
/// fails the whole load, as does a directory without files.
pub fn load_ca_dir<P: AsRef<Path>>(dir: P) -> Result<RootCertStore> {
    let dir = dir.as_ref();
    let mut files: Vec<PathBuf> = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| provisioning(dir.display(), e))? {
        let entry = entry.map_err(|e| provisioning(dir.display(), e))?;
        let file_type = entry.file_type().map_err(|e| provisioning(dir.display(), e))?;
        if file_type.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();

    if files.is_empty() {
        return Err(provisioning(dir.display(), constants::ERR_EMPTY_CA_DIR));
    }

    let mut store = RootCertStore::empty();
    for file in &files {
        add_ca_file(&mut store, file)?;
    }

    debug!(dir = %dir.display(), files = files.len(), anchors = store.len(), "Loaded CA directory");
    Ok(store)
}

fn add_ca_file(store: &mut RootCertStore, path: &Path) -> Result<()> {
    for cert in load_certificates(path)? {
        store.add(&cert).map_err(|e| provisioning(path.display(), e))?;
    }
    Ok(())
}

/// Load `cert.pem` and `key.pem` from `dir`.
pub fn load_identity_dir<P: AsRef<Path>>(dir: P) -> Result<(Vec<Certificate>, PrivateKey)> {
    let dir = dir.as_ref();
    let chain = load_certificates(dir.join(IDENTITY_CERT_FILE))?;
    let key = load_private_key(dir.join(IDENTITY_KEY_FILE))?;
    Ok((chain, key))
}

#[derive(Debug, Clone)]
enum Identity {
    Files { cert: PathBuf, key: PathBuf },
    Dir(PathBuf),
}

impl Identity {
    fn load(&self) -> Result<(Vec<Certificate>, PrivateKey)> {
        match self {
            Identity::Files { cert, key } => Ok((load_certificates(cert)?, load_private_key(key)?)),
            Identity::Dir(dir) => load_identity_dir(dir),
        }
    }
}

#[derive(Debug, Clone)]
enum TrustSource {
    Dir(PathBuf),
    File(PathBuf),
}

/// TLS client configuration
#[derive(Debug, Clone)]
pub struct TlsClientConfig {
    server_name: String,
    trust: Vec<TrustSource>,
    identity: Option<Identity>,
    version: TlsVersion,
}

impl TlsClientConfig {
    /// `server_name` is the name the server certificate must be valid for.
    pub fn new<S: Into<String>>(server_name: S) -> Self {
        Self {
            server_name: server_name.into(),
            trust: Vec::new(),
            identity: None,
            version: TlsVersion::default(),
        }
    }

    /// Trust every CA certificate in `dir`.
    pub fn with_ca_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.trust.push(TrustSource::Dir(dir.into()));
        self
    }

    /// Trust the CA certificates in a single PEM file.
    pub fn with_ca_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.trust.push(TrustSource::File(path.into()));
        self
    }

    /// Present this certificate chain and key to the server.
    pub fn with_client_certificate<P: Into<PathBuf>>(mut self, cert_path: P, key_path: P) -> Self {
        self.identity = Some(Identity::Files {
            cert: cert_path.into(),
            key: key_path.into(),
        });
        self
    }

    /// Present the identity stored in `dir` (`cert.pem` + `key.pem`).
    pub fn with_identity_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.identity = Some(Identity::Dir(dir.into()));
        self
    }

    pub fn with_version(mut self, version: TlsVersion) -> Self {
        self.version = version;
        self
    }

    pub fn version(&self) -> TlsVersion {
        self.version
    }

    pub fn load_client_config(&self) -> Result<ClientConfig> {
        let mut roots = RootCertStore::empty();
        for source in &self.trust {
            match source {
                TrustSource::Dir(dir) => {
                    let store = load_ca_dir(dir)?;
                    roots.roots.extend(store.roots);
                }
                TrustSource::File(path) => add_ca_file(&mut roots, path)?,
            }
        }
        if roots.is_empty() {
            return Err(provisioning(&self.server_name, "no trusted CA certificates configured"));
        }

        let builder = ClientConfig::builder()
            .with_safe_default_cipher_suites()
            .with_safe_default_kx_groups()
            .with_protocol_versions(&[self.version.protocol()])
            .map_err(|e| provisioning("protocol version", e))?
            .with_root_certificates(roots);

        let config = match &self.identity {
            Some(identity) => {
                let (chain, key) = identity.load()?;
                builder
                    .with_client_auth_cert(chain, key)
                    .map_err(|e| provisioning("client certificate", e))?
            }
            None => builder.with_no_client_auth(),
        };

        debug!(server_name = %self.server_name, version = ?self.version, mtls = self.identity.is_some(), "Built TLS client config");
        Ok(config)
    }

    pub fn connector(&self) -> Result<TlsConnector> {
        Ok(TlsConnector::from(Arc::new(self.load_client_config()?)))
    }

    /// Get the server name as a rustls::ServerName
    pub fn server_name(&self) -> Result<ServerName> {
        ServerName::try_from(self.server_name.as_str())
            .map_err(|e| provisioning(&self.server_name, e))
    }
}

impl From<&ClientTlsSettings> for TlsClientConfig {
    fn from(settings: &ClientTlsSettings) -> Self {
        let mut config = TlsClientConfig::new(settings.server_name.clone())
            .with_ca_dir(&settings.ca_dir)
            .with_version(settings.version);
        if let Some(dir) = &settings.identity_dir {
            config = config.with_identity_dir(dir);
        }
        config
    }
}

/// TLS server configuration
#[derive(Debug, Clone)]
pub struct TlsServerConfig {
    cert_path: PathBuf,
    key_path: PathBuf,
    client_ca_dir: Option<PathBuf>,
    require_client_auth: bool,
    version: TlsVersion,
}

impl TlsServerConfig {
    pub fn new<P: Into<PathBuf>>(cert_path: P, key_path: P) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            client_ca_dir: None,
            require_client_auth: false,
            version: TlsVersion::default(),
        }
    }

    /// Verify client certificates against the CAs in `dir`, and require one.
    pub fn with_client_auth<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.client_ca_dir = Some(dir.into());
        self.require_client_auth = true;
        self
    }

    /// With `false`, clients without a certificate are admitted; presented
    /// certificates are still verified.
    pub fn require_client_auth(mut self, required: bool) -> Self {
        self.require_client_auth = required;
        self
    }

    pub fn with_version(mut self, version: TlsVersion) -> Self {
        self.version = version;
        self
    }

    pub fn version(&self) -> TlsVersion {
        self.version
    }

    /// Generate a self-signed `localhost` certificate for development and
    /// write it to the given paths.
    pub fn generate_self_signed<P: Into<PathBuf>>(cert_path: P, key_path: P) -> Result<Self> {
        let cert_path = cert_path.into();
        let key_path = key_path.into();

        let generated = rcgen::generate_simple_self_signed(vec!["localhost".into()])
            .map_err(|e| provisioning("certificate generation", e))?;

        fs::write(&cert_path, generated.cert.pem())
            .map_err(|e| provisioning(cert_path.display(), e))?;
        fs::write(&key_path, generated.key_pair.serialize_pem())
            .map_err(|e| provisioning(key_path.display(), e))?;

        Ok(Self::new(cert_path, key_path))
    }

    pub fn load_server_config(&self) -> Result<ServerConfig> {
        let chain = load_certificates(&self.cert_path)?;
        let key = load_private_key(&self.key_path)?;

        let builder = ServerConfig::builder()
            .with_safe_default_cipher_suites()
            .with_safe_default_kx_groups()
            .with_protocol_versions(&[self.version.protocol()])
            .map_err(|e| provisioning("protocol version", e))?;

        let builder = match &self.client_ca_dir {
            Some(dir) => {
                let roots = load_ca_dir(dir)?;
                let verifier = if self.require_client_auth {
                    AllowAnyAuthenticatedClient::new(roots).boxed()
                } else {
                    AllowAnyAnonymousOrAuthenticatedClient::new(roots).boxed()
                };
                builder.with_client_cert_verifier(verifier)
            }
            None if self.require_client_auth => {
                return Err(provisioning(
                    self.cert_path.display(),
                    "client authentication required but no client CA directory configured",
                ));
            }
            None => builder.with_no_client_auth(),
        };

        let config = builder
            .with_single_cert(chain, key)
            .map_err(|e| provisioning("server certificate", e))?;

        debug!(version = ?self.version, mtls = self.client_ca_dir.is_some(), "Built TLS server config");
        Ok(config)
    }

    pub fn acceptor(&self) -> Result<TlsAcceptor> {
        Ok(TlsAcceptor::from(Arc::new(self.load_server_config()?)))
    }
}

impl From<&ServerTlsSettings> for TlsServerConfig {
    fn from(settings: &ServerTlsSettings) -> Self {
        let mut config = TlsServerConfig::new(&settings.cert_path, &settings.key_path)
            .with_version(settings.version);
        if let Some(dir) = &settings.client_ca_dir {
            config = config.with_client_auth(dir);
        }
        config.require_client_auth(settings.require_client_auth)
    }
}

/// Client side of the handshake, bounded by `limit`.
#[instrument(level = "debug", skip(connector, stream))]
pub async fn client_handshake<S>(
    connector: &TlsConnector,
    server_name: ServerName,
    stream: S,
    limit: Duration,
) -> Result<ClientTlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    with_timeout_or(
        async {
            connector
                .connect(server_name, stream)
                .await
                .map_err(|e| ProtocolError::HandshakeFailure(e.to_string()))
        },
        limit,
        ProtocolError::HandshakeFailure("handshake timed out".into()),
    )
    .await
}

/// Server side of the handshake, bounded by `limit`.
pub async fn server_handshake<S>(
    acceptor: &TlsAcceptor,
    stream: S,
    limit: Duration,
) -> Result<ServerTlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    with_timeout_or(
        async {
            acceptor
                .accept(stream)
                .await
                .map_err(|e| ProtocolError::HandshakeFailure(e.to_string()))
        },
        limit,
        ProtocolError::HandshakeFailure("handshake timed out".into()),
    )
    .await
}
