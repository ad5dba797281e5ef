use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// A byte stream with lookahead: `peek` reads ahead into a front buffer
/// without consuming, and reads drain that buffer before touching the inner
/// stream. Bytes come out in exactly the order the inner stream produced
/// them, so the wrapper is invisible to whatever parses the stream next.
#[derive(Debug)]
pub struct PeekStream<S> {
    buffer: BytesMut,
    stream: S,
}

impl<S> PeekStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            buffer: BytesMut::new(),
            stream,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }
}

impl<S: AsyncRead + Unpin> PeekStream<S> {
    /// Returns up to `n` bytes without advancing the read cursor. Fewer than
    /// `n` bytes means the stream ended first.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        while self.buffer.len() < n {
            let mut chunk = [0_u8; 256];
            let want = (n - self.buffer.len()).min(chunk.len());
            let read = self.stream.read(&mut chunk[..want]).await?;
            if read == 0 {
                break;
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }
        let available = self.buffer.len().min(n);
        Ok(&self.buffer[..available])
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.buffer.is_empty() {
            let take = this.buffer.len().min(buf.remaining());
            let drained = this.buffer.split_to(take);
            buf.put_slice(&drained);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekStream<S> {
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

#[cfg(test)]
mod tests {
    use super::PeekStream;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let client = TcpStream::connect(addr).await.expect("connect");
        let (server, _) = listener.accept().await.expect("accept");
        (client, server)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn peeked_bytes_are_not_consumed() {
        let (mut client, server) = socket_pair().await;
        client.write_all(b"hello world").await.expect("write");

        let mut peeked = PeekStream::new(server);
        assert_eq!(peeked.peek(1).await.expect("peek"), b"h");
        assert_eq!(peeked.peek(5).await.expect("peek again"), b"hello");

        let mut out = vec![0_u8; 11];
        peeked.read_exact(&mut out).await.expect("read");
        assert_eq!(&out, b"hello world");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reads_concatenate_in_stream_order() {
        let (mut client, server) = socket_pair().await;
        client.write_all(b"abcdef").await.expect("write");

        let mut peeked = PeekStream::new(server);
        let _ = peeked.peek(3).await.expect("peek");

        let mut first = [0_u8; 2];
        peeked.read_exact(&mut first).await.expect("read first");
        let mut rest = [0_u8; 4];
        peeked.read_exact(&mut rest).await.expect("read rest");
        assert_eq!(&first, b"ab");
        assert_eq!(&rest, b"cdef");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn peek_stops_short_at_eof() {
        let (mut client, server) = socket_pair().await;
        client.write_all(b"xy").await.expect("write");
        client.shutdown().await.expect("shutdown");

        let mut peeked = PeekStream::new(server);
        assert_eq!(peeked.peek(8).await.expect("peek"), b"xy");
    }
}
