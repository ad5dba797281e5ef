use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use marten_tls::CertificateAuthority;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::addr::ProxyAddr;
use crate::config::ProxyListenerConfig;
use crate::conn::ProxyConn;
use crate::errors::{AcceptError, ConfigError};
use crate::observe::{EventKind, EventSink, NoopEventSink, TranslateEvent};
use crate::translate::{translate_conn, InputConn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Stopped,
    Starting,
    Running,
}

/// Handle for a registered child listener, returned by `add_listener` and
/// consumed by `remove_listener`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct ChildHandle {
    stop: watch::Sender<bool>,
}

struct SharedState {
    state: ListenerState,
    ca: Option<Arc<CertificateAuthority>>,
    children: HashMap<ListenerId, ChildHandle>,
    tasks: Vec<JoinHandle<()>>,
}

/// Fans in connections from any number of registered TCP listeners, runs a
/// translator over each, and yields translated connections from `accept`.
///
/// Closing the listener stops the acceptors and the dispatcher but leaves
/// already-yielded connections alone; in-flight translations run to
/// completion and their results are dropped.
pub struct ProxyListener {
    config: ProxyListenerConfig,
    sink: Arc<dyn EventSink>,
    shared: Arc<Mutex<SharedState>>,
    input_tx: mpsc::Sender<InputConn>,
    output_rx: tokio::sync::Mutex<Option<mpsc::Receiver<ProxyConn>>>,
    shutdown: watch::Sender<bool>,
    next_listener_id: AtomicU64,
}

impl ProxyListener {
    pub fn new(config: ProxyListenerConfig, sink: Arc<dyn EventSink>) -> Result<Self, ConfigError> {
        config.validate()?;

        let (input_tx, input_rx) = mpsc::channel(config.queue_capacity);
        let (output_tx, output_rx) = mpsc::channel(config.queue_capacity);
        let (shutdown, _) = watch::channel(false);

        let shared = Arc::new(Mutex::new(SharedState {
            state: ListenerState::Starting,
            ca: None,
            children: HashMap::new(),
            tasks: Vec::new(),
        }));

        let dispatcher = tokio::spawn(run_dispatcher(
            input_rx,
            output_tx,
            shutdown.subscribe(),
            Arc::clone(&shared),
            Arc::clone(&sink),
            config.max_request_head_bytes,
        ));

        {
            let mut guard = shared.lock().expect("listener state lock poisoned");
            guard.tasks.push(dispatcher);
            guard.state = ListenerState::Running;
        }
        tracing::debug!("proxy listener started");

        Ok(Self {
            config,
            sink,
            shared,
            input_tx,
            output_rx: tokio::sync::Mutex::new(Some(output_rx)),
            shutdown,
            next_listener_id: AtomicU64::new(1),
        })
    }

    pub fn with_defaults() -> Self {
        Self::new(ProxyListenerConfig::default(), Arc::new(NoopEventSink))
            .expect("default listener config is valid")
    }

    pub fn state(&self) -> ListenerState {
        self.shared.lock().expect("listener state lock poisoned").state
    }

    pub fn config(&self) -> &ProxyListenerConfig {
        &self.config
    }

    /// Registers a child listener. Connections accepted from it resolve
    /// their destination from the client's first request.
    pub fn add_listener(&self, listener: TcpListener) -> ListenerId {
        self.register(listener, None)
    }

    /// Registers a child listener whose connections all carry the given
    /// destination, regardless of what the client asks for.
    pub fn add_transparent_listener(
        &self,
        listener: TcpListener,
        host: &str,
        port: u16,
        use_tls: bool,
    ) -> ListenerId {
        self.register(listener, Some(ProxyAddr::new(host, i32::from(port), use_tls)))
    }

    /// Stops the child's acceptor and closes its socket. Connections already
    /// accepted from it, and their translators, are unaffected.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let removed = {
            let mut shared = self.shared.lock().expect("listener state lock poisoned");
            shared.children.remove(&id)
        };
        match removed {
            Some(child) => {
                let _ = child.stop.send(true);
                self.sink.emit(TranslateEvent::new(
                    EventKind::ListenerRemoved,
                    None,
                    format!("listener {} removed", id.0),
                ));
                tracing::debug!(listener = id.0, "child listener removed");
                true
            }
            None => false,
        }
    }

    /// Waits for the next translated connection, or for shutdown.
    pub async fn accept(&self) -> Result<ProxyConn, AcceptError> {
        let mut shutdown_rx = self.shutdown.subscribe();
        if *shutdown_rx.borrow() {
            return Err(AcceptError::ListenerClosed);
        }

        let mut guard = self.output_rx.lock().await;
        let Some(output) = guard.as_mut() else {
            return Err(AcceptError::ListenerClosed);
        };

        tokio::select! {
            _ = shutdown_rx.changed() => Err(AcceptError::ListenerClosed),
            translated = output.recv() => match translated {
                Some(conn) => {
                    tracing::debug!(conn = conn.id(), "connection accepted from proxy listener");
                    Ok(conn)
                }
                None => Err(AcceptError::ListenerClosed),
            }
        }
    }

    /// Stops every acceptor and the dispatcher, closes the queues, and waits
    /// for those tasks to drain. The shutdown signal fires before the output
    /// queue is torn down so blocked `accept` callers wake with
    /// `ListenerClosed` rather than an ambiguous empty read. Idempotent.
    pub async fn close(&self) {
        let tasks = {
            let mut shared = self.shared.lock().expect("listener state lock poisoned");
            if shared.state == ListenerState::Stopped {
                return;
            }
            shared.state = ListenerState::Stopped;
            for (id, child) in shared.children.drain() {
                let _ = child.stop.send(true);
                tracing::debug!(listener = id.0, "child listener stopped");
            }
            std::mem::take(&mut shared.tasks)
        };

        let _ = self.shutdown.send(true);
        // Dropping the receiver is what makes a late translator's publish
        // fail instead of blocking forever.
        self.output_rx.lock().await.take();

        for task in tasks {
            let _ = task.await;
        }

        self.sink.emit(TranslateEvent::new(
            EventKind::ListenerClosed,
            None,
            "proxy listener closed",
        ));
        tracing::debug!("proxy listener closed");
    }

    pub fn set_ca_certificate(&self, ca: Arc<CertificateAuthority>) {
        self.shared.lock().expect("listener state lock poisoned").ca = Some(ca);
    }

    pub fn ca_certificate(&self) -> Option<Arc<CertificateAuthority>> {
        self.shared
            .lock()
            .expect("listener state lock poisoned")
            .ca
            .clone()
    }

    fn register(&self, listener: TcpListener, transparent_addr: Option<ProxyAddr>) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        let (stop, stop_rx) = watch::channel(false);
        let acceptor = tokio::spawn(run_acceptor(
            id,
            listener,
            transparent_addr,
            self.input_tx.clone(),
            stop_rx,
            self.shutdown.subscribe(),
            Arc::clone(&self.sink),
        ));

        {
            let mut shared = self.shared.lock().expect("listener state lock poisoned");
            shared.children.insert(id, ChildHandle { stop });
            shared.tasks.push(acceptor);
        }

        self.sink.emit(TranslateEvent::new(
            EventKind::ListenerAdded,
            None,
            format!("listener {} added", id.0),
        ));
        tracing::debug!(listener = id.0, "child listener added");
        id
    }
}

/// Accepts connections from one child listener and feeds them to the
/// dispatcher. Exits on its private stop signal, on listener shutdown, or on
/// the first accept error; its socket closes when the task drops it.
async fn run_acceptor(
    id: ListenerId,
    listener: TcpListener,
    transparent_addr: Option<ProxyAddr>,
    input_tx: mpsc::Sender<InputConn>,
    mut stop_rx: watch::Receiver<bool>,
    mut shutdown_rx: watch::Receiver<bool>,
    sink: Arc<dyn EventSink>,
) {
    if *stop_rx.borrow() || *shutdown_rx.borrow() {
        return;
    }
    loop {
        tokio::select! {
            _ = stop_rx.changed() => return,
            _ = shutdown_rx.changed() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    sink.emit(TranslateEvent::new(
                        EventKind::ConnAccepted,
                        None,
                        format!("listener {} accepted {}", id.0, peer_addr),
                    ));
                    tracing::debug!(listener = id.0, peer = %peer_addr, "connection received from child listener");
                    let input = InputConn {
                        stream,
                        transparent_addr: transparent_addr.clone(),
                    };
                    if input_tx.send(input).await.is_err() {
                        return;
                    }
                }
                Err(error) => {
                    tracing::info!(listener = id.0, %error, "child listener accept failed, stopping acceptor");
                    return;
                }
            }
        }
    }
}

/// The fan-in task: one translator task is spawned per input connection.
/// Translators are fire-and-forget; their failures are logged and the raw
/// connection drops.
async fn run_dispatcher(
    mut input_rx: mpsc::Receiver<InputConn>,
    output_tx: mpsc::Sender<ProxyConn>,
    mut shutdown_rx: watch::Receiver<bool>,
    shared: Arc<Mutex<SharedState>>,
    sink: Arc<dyn EventSink>,
    max_request_head_bytes: usize,
) {
    tracing::debug!("connection translator started");
    if *shutdown_rx.borrow() {
        return;
    }
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                tracing::debug!("shutdown signalled, stopping connection translator");
                return;
            }
            received = input_rx.recv() => {
                let Some(input) = received else { return; };
                let ca = shared
                    .lock()
                    .expect("listener state lock poisoned")
                    .ca
                    .clone();
                let output_tx = output_tx.clone();
                let sink = Arc::clone(&sink);
                tokio::spawn(async move {
                    match translate_conn(input, ca, max_request_head_bytes).await {
                        Ok(pconn) => {
                            sink.emit(TranslateEvent::new(
                                EventKind::ConnTranslated,
                                Some(pconn.id()),
                                pconn.remote_addr_tag(),
                            ));
                            if output_tx.send(pconn).await.is_err() {
                                tracing::debug!(
                                    "listener closed before translated connection could be delivered"
                                );
                            }
                        }
                        Err(error) => {
                            tracing::info!(%error, "could not translate connection");
                            sink.emit(TranslateEvent::new(
                                EventKind::TranslateFailed,
                                None,
                                error.to_string(),
                            ));
                        }
                    }
                });
            }
        }
    }
}
