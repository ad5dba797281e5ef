use std::error::Error as StdError;
use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};

#[derive(Debug)]
pub enum TlsMaterialError {
    CertificateGeneration(rcgen::Error),
    ConfigBuild(rustls::Error),
    Io(std::io::Error),
    LockPoisoned,
    InvalidMaterial(String),
}

impl fmt::Display for TlsMaterialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CertificateGeneration(error) => {
                write!(f, "certificate generation failed: {error}")
            }
            Self::ConfigBuild(error) => write!(f, "TLS config build failed: {error}"),
            Self::Io(error) => write!(f, "I/O error: {error}"),
            Self::LockPoisoned => write!(f, "certificate authority lock poisoned"),
            Self::InvalidMaterial(reason) => {
                write!(f, "invalid certificate authority material: {reason}")
            }
        }
    }
}

impl StdError for TlsMaterialError {}

impl From<rcgen::Error> for TlsMaterialError {
    fn from(value: rcgen::Error) -> Self {
        Self::CertificateGeneration(value)
    }
}

impl From<rustls::Error> for TlsMaterialError {
    fn from(value: rustls::Error) -> Self {
        Self::ConfigBuild(value)
    }
}

impl From<std::io::Error> for TlsMaterialError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaOptions {
    pub common_name: String,
    pub organization: String,
}

impl Default for CaOptions {
    fn default() -> Self {
        Self {
            common_name: "marten Local CA".to_string(),
            organization: "marten".to_string(),
        }
    }
}

impl CaOptions {
    fn validate(&self) -> Result<(), TlsMaterialError> {
        if self.common_name.trim().is_empty() {
            return Err(TlsMaterialError::InvalidMaterial(
                "common_name must not be empty".to_string(),
            ));
        }
        if self.organization.trim().is_empty() {
            return Err(TlsMaterialError::InvalidMaterial(
                "organization must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// A signing authority for on-the-fly leaf certificates. The proxy frontend
/// presents these leaves to clients whose TLS handshakes it intercepts.
#[derive(Debug)]
pub struct CertificateAuthority {
    issuer: Mutex<Issuer<'static, KeyPair>>,
    cert_pem: String,
    cert_der: CertificateDer<'static>,
    key_pem: String,
}

impl CertificateAuthority {
    pub fn generate(options: &CaOptions) -> Result<Self, TlsMaterialError> {
        options.validate()?;
        let ca_key = KeyPair::generate()?;
        let key_pem = ca_key.serialize_pem();
        let ca_params = build_ca_params(options);
        let ca_cert = ca_params.self_signed(&ca_key)?;
        let cert_pem = ca_cert.pem();
        let cert_der = ca_cert.der().clone();
        let issuer = Issuer::new(ca_params, ca_key);

        Ok(Self {
            issuer: Mutex::new(issuer),
            cert_pem,
            cert_der,
            key_pem,
        })
    }

    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, TlsMaterialError> {
        if cert_pem.is_empty() {
            return Err(TlsMaterialError::InvalidMaterial(
                "certificate PEM must not be empty".to_string(),
            ));
        }
        if key_pem.is_empty() {
            return Err(TlsMaterialError::InvalidMaterial(
                "private key PEM must not be empty".to_string(),
            ));
        }

        let cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes()).map_err(|error| {
            TlsMaterialError::InvalidMaterial(format!("failed to parse CA certificate PEM: {error}"))
        })?;
        let ca_key = KeyPair::from_pem(key_pem)?;
        let issuer = Issuer::from_ca_cert_der(&cert_der, ca_key).map_err(|error| {
            TlsMaterialError::InvalidMaterial(format!(
                "failed to parse issuer metadata from CA certificate: {error}"
            ))
        })?;

        Ok(Self {
            issuer: Mutex::new(issuer),
            cert_pem: cert_pem.to_string(),
            cert_der,
            key_pem: key_pem.to_string(),
        })
    }

    /// Loads the CA from the given paths, or generates and persists a fresh
    /// one when neither file exists yet.
    pub fn load_or_generate(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
        options: &CaOptions,
    ) -> Result<Self, TlsMaterialError> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        match (cert_path.exists(), key_path.exists()) {
            (true, true) => {
                let cert_pem = fs::read_to_string(cert_path)?;
                let key_pem = fs::read_to_string(key_path)?;
                Self::from_pem(&cert_pem, &key_pem)
            }
            (false, false) => {
                let generated = Self::generate(options)?;
                generated.persist(cert_path, key_path)?;
                Ok(generated)
            }
            _ => Err(TlsMaterialError::InvalidMaterial(
                "CA cert and key files must both exist or both be absent".to_string(),
            )),
        }
    }

    pub fn persist(
        &self,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<(), TlsMaterialError> {
        ensure_parent_exists(cert_path.as_ref())?;
        ensure_parent_exists(key_path.as_ref())?;

        fs::write(cert_path.as_ref(), self.cert_pem.as_bytes())?;
        fs::write(key_path.as_ref(), self.key_pem.as_bytes())?;
        Ok(())
    }

    /// The trust anchor clients must install to accept intercepted sessions.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Mints a fresh leaf certificate for `host` and packs it into a server
    /// config that presents the leaf chained to this CA. No client auth is
    /// requested and `http/1.1` is the only advertised protocol.
    pub fn server_config_for_host(&self, host: &str) -> Result<IssuedLeaf, TlsMaterialError> {
        let normalized_host = normalize_host(host);
        let leaf_params = build_leaf_params(&normalized_host)?;
        let leaf_key = KeyPair::generate()?;
        let leaf_key_der = PrivatePkcs8KeyDer::from(leaf_key.serialize_der());

        let issuer = self.issuer.lock().map_err(|_| TlsMaterialError::LockPoisoned)?;
        let leaf_cert = leaf_params.signed_by(&leaf_key, &issuer)?;
        drop(issuer);

        let leaf_cert_der = leaf_cert.der().clone();
        let chain = vec![leaf_cert_der.clone(), self.cert_der.clone()];
        let private_key = PrivateKeyDer::from(leaf_key_der);

        let mut server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, private_key)?;
        server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(IssuedLeaf {
            server_config: Arc::new(server_config),
            leaf_cert_der,
        })
    }
}

/// A freshly signed leaf plus the server config that presents it.
#[derive(Debug, Clone)]
pub struct IssuedLeaf {
    pub server_config: Arc<ServerConfig>,
    pub leaf_cert_der: CertificateDer<'static>,
}

/// A client config that accepts any server certificate. Used by tests that
/// handshake against the minted leaves without installing the CA.
pub fn insecure_client_config() -> Arc<ClientConfig> {
    let mut config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureSkipVerifyServerCertVerifier))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

fn build_ca_params(options: &CaOptions) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, options.common_name.clone());
    distinguished_name.push(DnType::OrganizationName, options.organization.clone());
    params.distinguished_name = distinguished_name;
    params
}

fn build_leaf_params(host: &str) -> Result<CertificateParams, TlsMaterialError> {
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params.use_authority_key_identifier_extension = true;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, host.to_string());
    params.distinguished_name = distinguished_name;

    if let Ok(ip) = host.parse::<IpAddr>() {
        params.subject_alt_names.push(SanType::IpAddress(ip));
    } else {
        params
            .subject_alt_names
            .push(SanType::DnsName(host.try_into()?));
    }

    Ok(params)
}

fn normalize_host(host: &str) -> String {
    match host.parse::<IpAddr>() {
        Ok(_) => host.to_string(),
        Err(_) => host.to_ascii_lowercase(),
    }
}

fn ensure_parent_exists(path: &Path) -> Result<(), TlsMaterialError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

#[derive(Debug)]
struct InsecureSkipVerifyServerCertVerifier;

impl ServerCertVerifier for InsecureSkipVerifyServerCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
        ]
    }
}
