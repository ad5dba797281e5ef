use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RequestHead {
    pub raw: Vec<u8>,
    pub method: String,
    pub target: String,
}

/// Reads one request head off the stream, one byte at a time so that nothing
/// past the `\r\n\r\n` terminator is consumed. The bytes that follow the head
/// (a body, or a TLS ClientHello after CONNECT) stay in the stream.
pub(crate) async fn read_request_head<S: AsyncRead + Unpin>(
    stream: &mut S,
    max_head_bytes: usize,
) -> io::Result<Vec<u8>> {
    let mut data = Vec::with_capacity(1024);
    let mut byte = [0_u8; 1];

    while !data.ends_with(b"\r\n\r\n") {
        let read = stream.read(&mut byte).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "client closed before request headers completed",
            ));
        }

        data.push(byte[0]);
        if data.len() > max_head_bytes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "request head exceeded configured limit",
            ));
        }
    }

    Ok(data)
}

pub(crate) fn parse_request_head(raw: &[u8]) -> io::Result<RequestHead> {
    let text = std::str::from_utf8(raw).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "request headers were not valid UTF-8",
        )
    })?;
    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "request line is missing"))?;

    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "request method is missing"))?;
    let target = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "request target is missing"))?;
    let version = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "HTTP version is missing"))?;
    if parts.next().is_some() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "request line had too many fields",
        ));
    }
    if !version.starts_with("HTTP/") {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "request version is not HTTP",
        ));
    }

    for line in lines {
        if line.is_empty() {
            break;
        }
        if !line.contains(':') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "malformed header line",
            ));
        }
    }

    Ok(RequestHead {
        raw: raw.to_vec(),
        method: method.to_string(),
        target: target.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::{parse_request_head, read_request_head};
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reads_exactly_the_head_and_leaves_the_rest() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let mut client = TcpStream::connect(addr).await.expect("connect");
        let (mut server, _) = listener.accept().await.expect("accept");

        client
            .write_all(b"POST /submit HTTP/1.1\r\nHost: example.com\r\n\r\nbody-bytes")
            .await
            .expect("write");

        let head = read_request_head(&mut server, 64 * 1024)
            .await
            .expect("read head");
        assert!(head.ends_with(b"\r\n\r\n"));
        assert!(head.starts_with(b"POST /submit HTTP/1.1\r\n"));

        let mut rest = [0_u8; 10];
        use tokio::io::AsyncReadExt;
        server.read_exact(&mut rest).await.expect("read body");
        assert_eq!(&rest, b"body-bytes");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rejects_oversized_head() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let mut client = TcpStream::connect(addr).await.expect("connect");
        let (mut server, _) = listener.accept().await.expect("accept");

        client
            .write_all(b"GET / HTTP/1.1\r\nPadding: aaaaaaaaaaaaaaaa\r\n\r\n")
            .await
            .expect("write");

        let error = read_request_head(&mut server, 16)
            .await
            .expect_err("oversized head must fail");
        assert_eq!(error.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn parses_method_and_target() {
        let raw = b"GET http://example.com/path HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let head = parse_request_head(raw).expect("parse");
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "http://example.com/path");
        assert_eq!(head.raw, raw);
    }

    #[test]
    fn parses_connect_authority_target() {
        let raw = b"CONNECT example.com:443 HTTP/1.1\r\n\r\n";
        let head = parse_request_head(raw).expect("parse");
        assert_eq!(head.method, "CONNECT");
        assert_eq!(head.target, "example.com:443");
    }

    #[test]
    fn rejects_missing_version() {
        let raw = b"GET /\r\n\r\n";
        assert!(parse_request_head(raw).is_err());
    }

    #[test]
    fn rejects_header_line_without_colon() {
        let raw = b"GET / HTTP/1.1\r\nnot-a-header\r\n\r\n";
        assert!(parse_request_head(raw).is_err());
    }
}
