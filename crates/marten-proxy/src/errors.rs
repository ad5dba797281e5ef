use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddrParseError {
    #[error("malformed address tag: {0:?}")]
    MalformedAddressTag(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum TlsStartError {
    #[error("TLS sniff failed: {0}")]
    SniffFailed(#[source] std::io::Error),
    #[error("no CA certificate installed for TLS interception")]
    MissingCaCertificate,
    #[error("certificate signing failed: {0}")]
    CertificateSigning(#[from] marten_tls::TlsMaterialError),
    #[error("server-side TLS handshake failed: {0}")]
    AcceptFailed(#[source] std::io::Error),
    #[error("TLS can only be started on a raw client stream")]
    InvalidStreamState,
}

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("could not read first request: {0}")]
    ReadRequestFailed(#[source] std::io::Error),
    #[error("could not parse hostname: invalid port in {0:?}")]
    HostnameParseFailed(String),
    #[error("could not write CONNECT response: {0}")]
    ConnectResponseWriteFailed(#[source] std::io::Error),
    #[error(transparent)]
    TlsStart(#[from] TlsStartError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AcceptError {
    #[error("proxy listener is closed")]
    ListenerClosed,
}
