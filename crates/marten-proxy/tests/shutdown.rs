use std::sync::Arc;
use std::time::Duration;

use marten_proxy::{
    AcceptError, EventKind, ListenerState, ProxyListener, ProxyListenerConfig, VecEventSink,
};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

fn build_listener(sink: VecEventSink) -> ProxyListener {
    ProxyListener::new(ProxyListenerConfig::default(), Arc::new(sink)).expect("build listener")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn accept_after_close_returns_listener_closed() {
    let proxy = build_listener(VecEventSink::default());
    assert_eq!(proxy.state(), ListenerState::Running);

    proxy.close().await;
    assert_eq!(proxy.state(), ListenerState::Stopped);
    assert_eq!(proxy.accept().await.expect_err("must be closed"), AcceptError::ListenerClosed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn blocked_accept_wakes_with_listener_closed() {
    let proxy = Arc::new(build_listener(VecEventSink::default()));

    let waiter = {
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move { proxy.accept().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    proxy.close().await;
    let result = waiter.await.expect("accept task join");
    assert_eq!(result.expect_err("must be closed"), AcceptError::ListenerClosed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn close_is_idempotent() {
    let proxy = build_listener(VecEventSink::default());
    proxy.close().await;
    proxy.close().await;
    assert_eq!(proxy.state(), ListenerState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn close_closes_registered_child_listeners() {
    let proxy = build_listener(VecEventSink::default());
    let child = TcpListener::bind("127.0.0.1:0").await.expect("bind child");
    let child_addr = child.local_addr().expect("child addr");
    proxy.add_listener(child);

    proxy.close().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(
        TcpStream::connect(child_addr).await.is_err(),
        "child socket should be closed after listener close"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remove_listener_closes_only_that_child() {
    let proxy = build_listener(VecEventSink::default());
    let first = TcpListener::bind("127.0.0.1:0").await.expect("bind first");
    let first_addr = first.local_addr().expect("first addr");
    let second = TcpListener::bind("127.0.0.1:0").await.expect("bind second");
    let second_addr = second.local_addr().expect("second addr");

    let first_id = proxy.add_listener(first);
    proxy.add_listener(second);

    assert!(proxy.remove_listener(first_id));
    assert!(!proxy.remove_listener(first_id), "second removal must be a no-op");
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(
        TcpStream::connect(first_addr).await.is_err(),
        "removed child socket should be closed"
    );
    let mut survivor = TcpStream::connect(second_addr)
        .await
        .expect("remaining child still accepts");
    survivor
        .write_all(b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .expect("write request");
    let conn = proxy.accept().await.expect("translated connection");
    assert_eq!(conn.remote_addr_tag(), "example.com/80/0");

    proxy.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn late_translator_publish_after_close_is_swallowed() {
    let sink = VecEventSink::default();
    let proxy = build_listener(sink.clone());
    let child = TcpListener::bind("127.0.0.1:0").await.expect("bind child");
    let child_addr = child.local_addr().expect("child addr");
    proxy.add_listener(child);

    // The translator blocks reading the first request head.
    let mut client = TcpStream::connect(child_addr).await.expect("connect");
    tokio::time::sleep(Duration::from_millis(50)).await;

    proxy.close().await;

    // Now the translation completes against a closed listener; its publish
    // must be dropped without a panic.
    client
        .write_all(b"GET http://late.example.com/ HTTP/1.1\r\nHost: late.example.com\r\n\r\n")
        .await
        .expect("write request");

    let mut translated_after_close = false;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(25)).await;
        if sink
            .snapshot()
            .iter()
            .any(|event| event.kind == EventKind::ConnTranslated)
        {
            translated_after_close = true;
            break;
        }
    }
    assert!(
        translated_after_close,
        "in-flight translation should complete after close"
    );
    assert_eq!(
        proxy.accept().await.expect_err("must be closed"),
        AcceptError::ListenerClosed
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn close_while_translator_waits_in_tls_sniff() {
    let proxy = build_listener(VecEventSink::default());
    let child = TcpListener::bind("127.0.0.1:0").await.expect("bind child");
    let child_addr = child.local_addr().expect("child addr");
    proxy.add_listener(child);

    let mut client = TcpStream::connect(child_addr).await.expect("connect");
    client
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
        .await
        .expect("write CONNECT");
    // Never send the first tunneled byte; the translator stays parked in the
    // sniff while the listener shuts down.
    tokio::time::sleep(Duration::from_millis(50)).await;

    proxy.close().await;
    assert_eq!(
        proxy.accept().await.expect_err("must be closed"),
        AcceptError::ListenerClosed
    );
}
