use std::fmt;

use crate::errors::AddrParseError;

/// The destination a proxied connection was headed for, carried as
/// `host/port/tlsbit` through the remote-address slot of the connection.
///
/// The host must not contain `/`; the tag grammar cannot represent it and the
/// encoder passes the host through verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyAddr {
    pub host: String,
    pub port: i32,
    pub use_tls: bool,
}

impl ProxyAddr {
    /// Port value before translation has resolved one.
    pub const UNRESOLVED_PORT: i32 = -1;

    pub fn new(host: impl Into<String>, port: i32, use_tls: bool) -> Self {
        Self {
            host: host.into(),
            port,
            use_tls,
        }
    }

    pub(crate) fn unresolved() -> Self {
        Self {
            host: String::new(),
            port: Self::UNRESOLVED_PORT,
            use_tls: false,
        }
    }

    pub fn encode(&self) -> String {
        let tls_bit = if self.use_tls { 1 } else { 0 };
        format!("{}/{}/{}", self.host, self.port, tls_bit)
    }

    pub fn decode(tag: &str) -> Result<Self, AddrParseError> {
        let parts = tag.split('/').collect::<Vec<_>>();
        let [host, port_text, tls_text] = parts.as_slice() else {
            return Err(AddrParseError::MalformedAddressTag(tag.to_string()));
        };

        let port = port_text
            .parse::<i32>()
            .map_err(|_| AddrParseError::MalformedAddressTag(tag.to_string()))?;
        let tls_value = tls_text
            .parse::<i32>()
            .map_err(|_| AddrParseError::MalformedAddressTag(tag.to_string()))?;

        Ok(Self {
            host: host.to_string(),
            port,
            use_tls: tls_value != 0,
        })
    }
}

impl fmt::Display for ProxyAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::ProxyAddr;
    use crate::errors::AddrParseError;

    #[test]
    fn encodes_host_port_and_tls_bit() {
        assert_eq!(
            ProxyAddr::new("example.com", 443, true).encode(),
            "example.com/443/1"
        );
        assert_eq!(
            ProxyAddr::new("internal.svc", 9000, false).encode(),
            "internal.svc/9000/0"
        );
    }

    #[test]
    fn decode_round_trips_well_formed_tags() {
        for addr in [
            ProxyAddr::new("example.com", 80, false),
            ProxyAddr::new("example.com", 443, true),
            ProxyAddr::new("", ProxyAddr::UNRESOLVED_PORT, false),
        ] {
            assert_eq!(ProxyAddr::decode(&addr.encode()).expect("decode"), addr);
        }
    }

    #[test]
    fn decode_rejects_wrong_field_counts() {
        for tag in ["example.com/80", "example.com/80/0/extra", ""] {
            let error = ProxyAddr::decode(tag).expect_err("must reject");
            assert_eq!(error, AddrParseError::MalformedAddressTag(tag.to_string()));
        }
    }

    #[test]
    fn decode_rejects_non_numeric_fields() {
        assert!(ProxyAddr::decode("example.com/eighty/0").is_err());
        assert!(ProxyAddr::decode("example.com/80/yes").is_err());
    }

    #[test]
    fn any_nonzero_tls_field_decodes_as_tls() {
        let addr = ProxyAddr::decode("example.com/443/2").expect("decode");
        assert!(addr.use_tls);
    }

    #[test]
    fn display_matches_encode() {
        let addr = ProxyAddr::new("example.com", 8080, false);
        assert_eq!(addr.to_string(), addr.encode());
    }
}
