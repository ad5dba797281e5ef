use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use marten_tls::CertificateAuthority;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

use crate::addr::ProxyAddr;
use crate::errors::TlsStartError;
use crate::peek::PeekStream;

/// First byte of a TLS handshake record. The sniff is deliberately coarse:
/// a binary payload whose first byte happens to be 0x16 will be mistaken
/// for a ClientHello.
const TLS_HANDSHAKE_RECORD_BYTE: u8 = 0x16;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

fn next_conn_id() -> u64 {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

/// The client stream in its current stage of unwrapping. Transitions only
/// move forward: raw -> peeked -> TLS. `Inactive` is what a failed
/// mid-transition swap leaves behind; I/O against it fails.
enum ConnStream {
    Raw(TcpStream),
    Peeked(PeekStream<TcpStream>),
    Tls(Box<tokio_rustls::server::TlsStream<PeekStream<TcpStream>>>),
    Inactive,
}

impl ConnStream {
    fn inactive_error() -> io::Error {
        io::Error::new(
            io::ErrorKind::NotConnected,
            "proxy connection does not have an active stream",
        )
    }
}

impl AsyncRead for ConnStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Raw(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Peeked(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            Self::Inactive => Poll::Ready(Err(Self::inactive_error())),
        }
    }
}

impl AsyncWrite for ConnStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Raw(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Peeked(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            Self::Inactive => Poll::Ready(Err(Self::inactive_error())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Raw(stream) => Pin::new(stream).poll_flush(cx),
            Self::Peeked(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            Self::Inactive => Poll::Ready(Err(Self::inactive_error())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Raw(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Peeked(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            Self::Inactive => Poll::Ready(Err(Self::inactive_error())),
        }
    }
}

struct ReplayBuffer {
    bytes: Vec<u8>,
    cursor: usize,
}

struct ConnMeta {
    addr: ProxyAddr,
    transparent_mode: bool,
    ca: Option<Arc<CertificateAuthority>>,
}

/// A translated client connection. Reads produce the replayed first request
/// (if any) followed by the client's remaining bytes, decrypted when TLS was
/// intercepted. The destination the client intended is carried alongside the
/// byte stream.
pub struct ProxyConn {
    id: u64,
    stream: ConnStream,
    replay: Option<ReplayBuffer>,
    meta: Mutex<ConnMeta>,
}

impl ProxyConn {
    pub(crate) fn new(stream: TcpStream) -> Self {
        Self {
            id: next_conn_id(),
            stream: ConnStream::Raw(stream),
            replay: None,
            meta: Mutex::new(ConnMeta {
                addr: ProxyAddr::unresolved(),
                transparent_mode: false,
                ca: None,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The destination this connection was headed for.
    pub fn destination(&self) -> ProxyAddr {
        self.lock_meta().addr.clone()
    }

    /// The destination rendered as the `host/port/tlsbit` address tag, for
    /// consumers that can only carry a string in the remote-address slot.
    pub fn remote_addr_tag(&self) -> String {
        self.lock_meta().addr.encode()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match &self.stream {
            ConnStream::Raw(stream) => stream.local_addr(),
            ConnStream::Peeked(stream) => stream.get_ref().local_addr(),
            ConnStream::Tls(stream) => stream.get_ref().0.get_ref().local_addr(),
            ConnStream::Inactive => Err(ConnStream::inactive_error()),
        }
    }

    pub fn set_ca_certificate(&self, ca: Arc<CertificateAuthority>) {
        self.lock_meta().ca = Some(ca);
    }

    /// Pins the destination regardless of what the client's requests claim.
    pub fn set_transparent_mode(&self, host: &str, port: u16, use_tls: bool) {
        self.set_transparent_destination(ProxyAddr::new(host, i32::from(port), use_tls));
    }

    pub(crate) fn set_transparent_destination(&self, addr: ProxyAddr) {
        let mut meta = self.lock_meta();
        meta.addr = addr;
        meta.transparent_mode = true;
    }

    /// Clears transparent mode and the destination it installed.
    pub fn end_transparent_mode(&self) {
        let mut meta = self.lock_meta();
        meta.transparent_mode = false;
        meta.addr = ProxyAddr::unresolved();
    }

    pub(crate) fn transparent_mode(&self) -> bool {
        self.lock_meta().transparent_mode
    }

    pub(crate) fn set_destination(&self, addr: ProxyAddr) {
        self.lock_meta().addr = addr;
    }

    /// Schedules an already-parsed request's wire bytes to be re-emitted by
    /// subsequent reads, ahead of anything still in the stream. The bytes
    /// drain across as many reads as the caller's buffers require.
    pub(crate) fn return_request(&mut self, wire_bytes: Vec<u8>) {
        if wire_bytes.is_empty() {
            return;
        }
        self.replay = Some(ReplayBuffer {
            bytes: wire_bytes,
            cursor: 0,
        });
    }

    /// Sniffs the stream for a client-initiated TLS handshake and terminates
    /// it when present, minting a leaf certificate for `hostname` signed by
    /// the installed CA. Returns whether TLS was started. When the first
    /// byte is not a handshake byte the stream is left with that byte intact
    /// for subsequent reads.
    pub async fn start_maybe_tls(&mut self, hostname: &str) -> Result<bool, TlsStartError> {
        let ca = self.lock_meta().ca.clone();

        let raw = match std::mem::replace(&mut self.stream, ConnStream::Inactive) {
            ConnStream::Raw(raw) => raw,
            other => {
                self.stream = other;
                return Err(TlsStartError::InvalidStreamState);
            }
        };

        let mut peeked = PeekStream::new(raw);
        let sniff = peeked.peek(1).await.map(|bytes| bytes.first().copied());
        let first = match sniff {
            Ok(Some(first)) => first,
            Ok(None) => {
                self.stream = ConnStream::Peeked(peeked);
                return Err(TlsStartError::SniffFailed(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "client closed before sending any bytes",
                )));
            }
            Err(error) => {
                self.stream = ConnStream::Peeked(peeked);
                return Err(TlsStartError::SniffFailed(error));
            }
        };

        if first != TLS_HANDSHAKE_RECORD_BYTE {
            self.stream = ConnStream::Peeked(peeked);
            return Ok(false);
        }

        let Some(ca) = ca else {
            self.stream = ConnStream::Peeked(peeked);
            return Err(TlsStartError::MissingCaCertificate);
        };

        let issued = match ca.server_config_for_host(hostname) {
            Ok(issued) => issued,
            Err(error) => {
                self.stream = ConnStream::Peeked(peeked);
                return Err(TlsStartError::CertificateSigning(error));
            }
        };

        // The acceptor reads the handshake through the peeked stream, so the
        // sniffed byte is replayed to the TLS layer.
        let acceptor = TlsAcceptor::from(issued.server_config);
        match acceptor.accept(peeked).await {
            Ok(tls) => {
                self.stream = ConnStream::Tls(Box::new(tls));
                Ok(true)
            }
            Err(error) => Err(TlsStartError::AcceptFailed(error)),
        }
    }

    pub async fn close(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }

    fn lock_meta(&self) -> std::sync::MutexGuard<'_, ConnMeta> {
        self.meta.lock().expect("proxy conn metadata lock poisoned")
    }
}

impl fmt::Debug for ProxyConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConn")
            .field("id", &self.id)
            .field("addr", &self.lock_meta().addr)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for ProxyConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(replay) = this.replay.as_mut() {
            let remaining = &replay.bytes[replay.cursor..];
            let take = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..take]);
            replay.cursor += take;
            if replay.cursor == replay.bytes.len() {
                this.replay = None;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for ProxyConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}
