mod addr;
mod config;
mod conn;
mod errors;
mod http_head;
mod listener;
mod observe;
mod peek;
mod translate;

pub use addr::ProxyAddr;
pub use config::ProxyListenerConfig;
pub use conn::ProxyConn;
pub use errors::{
    AcceptError, AddrParseError, ConfigError, TlsStartError, TranslateError,
};
pub use listener::{ListenerId, ListenerState, ProxyListener};
pub use marten_tls::{CaOptions, CertificateAuthority};
pub use observe::{EventKind, EventSink, NoopEventSink, TranslateEvent, VecEventSink};
pub use peek::PeekStream;
