use std::sync::Arc;

use marten_tls::CertificateAuthority;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::addr::ProxyAddr;
use crate::conn::ProxyConn;
use crate::errors::TranslateError;
use crate::http_head::{parse_request_head, read_request_head};

/// Written verbatim to the client after a CONNECT request, before any TLS or
/// replay state exists on the connection. No extra headers.
pub(crate) const CONNECT_ESTABLISHED_RESPONSE: &[u8] =
    b"HTTP/1.1 200 Connection established\r\n\r\n";

/// A raw accepted connection plus the transparent destination its listener
/// was registered with, if any.
pub(crate) struct InputConn {
    pub stream: TcpStream,
    pub transparent_addr: Option<ProxyAddr>,
}

/// Runs the per-connection translation state machine exactly once: read the
/// first request, handle CONNECT and the TLS sniff, resolve the destination,
/// and hand back a connection ready for a consumer.
pub(crate) async fn translate_conn(
    input: InputConn,
    ca: Option<Arc<CertificateAuthority>>,
    max_request_head_bytes: usize,
) -> Result<ProxyConn, TranslateError> {
    let mut pconn = ProxyConn::new(input.stream);
    if let Some(ca) = ca {
        pconn.set_ca_certificate(ca);
    }
    if let Some(addr) = input.transparent_addr {
        pconn.set_transparent_destination(addr);
    }

    let raw_head = read_request_head(&mut pconn, max_request_head_bytes)
        .await
        .map_err(TranslateError::ReadRequestFailed)?;
    let head = parse_request_head(&raw_head).map_err(TranslateError::ReadRequestFailed)?;

    let authority = request_authority(&head.method, &head.target);
    let (host, mut port) = split_host_port(&authority)?;

    let use_tls = if head.method == "CONNECT" {
        // The 200 must reach the client before the sniff: the client will not
        // start its handshake until the tunnel is acknowledged.
        pconn
            .write_all(CONNECT_ESTABLISHED_RESPONSE)
            .await
            .map_err(TranslateError::ConnectResponseWriteFailed)?;
        pconn.start_maybe_tls(&host).await?
    } else {
        pconn.return_request(raw_head);
        false
    };

    if port == ProxyAddr::UNRESOLVED_PORT {
        port = if use_tls { 443 } else { 80 };
    }

    if !pconn.transparent_mode() {
        pconn.set_destination(ProxyAddr::new(host, port, use_tls));
    }

    tracing::debug!(
        conn = pconn.id(),
        destination = %pconn.remote_addr_tag(),
        "connection translated"
    );
    Ok(pconn)
}

/// The authority portion of a request target: the target itself for CONNECT,
/// the host[:port] of an absolute-form URL otherwise. Origin-form targets
/// carry no authority.
fn request_authority(method: &str, target: &str) -> String {
    if method == "CONNECT" {
        return target.to_string();
    }
    if let Some((_, after_scheme)) = target.split_once("://") {
        let end = after_scheme
            .find(['/', '?'])
            .unwrap_or(after_scheme.len());
        return after_scheme[..end].to_string();
    }
    String::new()
}

fn split_host_port(authority: &str) -> Result<(String, i32), TranslateError> {
    if authority.is_empty() {
        return Ok((String::new(), ProxyAddr::UNRESOLVED_PORT));
    }

    if let Some(rest) = authority.strip_prefix('[') {
        let Some(close) = rest.find(']') else {
            return Ok((authority.to_string(), ProxyAddr::UNRESOLVED_PORT));
        };
        let host = &rest[..close];
        let suffix = &rest[close + 1..];
        let Some(port_text) = suffix.strip_prefix(':') else {
            return Ok((host.to_string(), ProxyAddr::UNRESOLVED_PORT));
        };
        let port = parse_port(port_text, authority)?;
        return Ok((host.to_string(), port));
    }

    let Some((host, port_text)) = authority.rsplit_once(':') else {
        return Ok((authority.to_string(), ProxyAddr::UNRESOLVED_PORT));
    };
    if host.contains(':') {
        // Unbracketed IPv6 literal; the whole authority is the host.
        return Ok((authority.to_string(), ProxyAddr::UNRESOLVED_PORT));
    }
    let port = parse_port(port_text, authority)?;
    Ok((host.to_string(), port))
}

fn parse_port(raw: &str, authority: &str) -> Result<i32, TranslateError> {
    let port = raw
        .parse::<u16>()
        .map_err(|_| TranslateError::HostnameParseFailed(authority.to_string()))?;
    Ok(i32::from(port))
}
