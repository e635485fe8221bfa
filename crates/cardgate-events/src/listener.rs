//! Protocol Listener - one TLS listener per device
//!
//! Each accepted connection runs TLS handshake, then the frame decoder, and
//! hands decoded events to the device's dispatch queue. A device whose TLS
//! identity cannot be loaded or whose port cannot be bound is logged and
//! skipped; the other devices still start.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use cardgate_core::ListenerSettings;
use cardgate_devices::{DeviceConfig, DeviceKey};
use futures::StreamExt;
use socket2::SockRef;
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::codec::EventCodec;
use crate::dispatcher::EventDispatcher;
use crate::event::Event;
use crate::relay::RelayClient;
use crate::tls::KeystoreProvider;

/// Pending connection backlog of each listener socket.
pub const BACKLOG: u32 = 128;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Bind a listening socket with address reuse.
pub async fn bind(host: &str, port: u16) -> io::Result<TcpListener> {
    let addr = lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, host.to_string()))?;
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(BACKLOG)
}

/// Accept loop of one device.
struct ProtocolListener {
    key: DeviceKey,
    listener: TcpListener,
    acceptor: TlsAcceptor,
    relay: Arc<dyn RelayClient>,
    queue: async_channel::Sender<Event>,
    connections: TaskTracker,
}

impl ProtocolListener {
    async fn run(self, cancel: CancellationToken) {
        info!(device = %self.key, "Protocol listener started");
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(device = %self.key, "Accept failed: {}", e);
                    continue;
                }
            };
            if let Err(e) = SockRef::from(&stream).set_keepalive(true) {
                debug!(device = %self.key, "Could not enable keep-alive: {}", e);
            }

            let connection = Connection {
                key: self.key.clone(),
                peer,
                acceptor: self.acceptor.clone(),
                relay: self.relay.clone(),
                queue: self.queue.clone(),
            };
            self.connections.spawn(connection.run(stream, cancel.clone()));
        }
        info!(device = %self.key, "Protocol listener stopped");
    }
}

/// One pushed-event connection.
struct Connection {
    key: DeviceKey,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    relay: Arc<dyn RelayClient>,
    queue: async_channel::Sender<Event>,
}

impl Connection {
    async fn run(self, stream: TcpStream, cancel: CancellationToken) {
        let handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, self.acceptor.accept(stream));
        let stream = match handshake.await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(device = %self.key, peer = %self.peer, "TLS handshake failed: {}", e);
                return;
            }
            Err(_) => {
                warn!(device = %self.key, peer = %self.peer, "TLS handshake timed out");
                return;
            }
        };
        debug!(device = %self.key, peer = %self.peer, "Connection accepted");

        if !self.relay.is_connected() {
            let relay = self.relay.clone();
            let key = self.key.clone();
            tokio::spawn(async move {
                if let Err(e) = relay.open().await {
                    warn!(device = %key, "Could not open relay session: {}", e);
                }
            });
        }

        let mut frames = FramedRead::new(stream, EventCodec::new());
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = frames.next() => frame,
            };
            match frame {
                Some(Ok(event)) => {
                    debug!(device = %self.key, topic = %event.topic, "Event received");
                    if self.queue.send(event).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!(device = %self.key, peer = %self.peer, "Connection error: {}", e);
                    break;
                }
                None => break,
            }
        }
        debug!(device = %self.key, peer = %self.peer, "Connection closed");
    }
}

/// Running listener of one device.
struct RunningListener {
    key: DeviceKey,
    local_addr: SocketAddr,
    accept: JoinHandle<()>,
    queue: async_channel::Sender<Event>,
    workers: Vec<JoinHandle<()>>,
}

/// Listeners of all devices, started and stopped together.
pub struct ListenerGroup {
    cancel: CancellationToken,
    connections: TaskTracker,
    listeners: Vec<RunningListener>,
    grace: Duration,
}

impl ListenerGroup {
    /// Start one listener per device.
    ///
    /// `make_dispatcher` builds the dispatcher of a device; its relay is
    /// opened in the background when a connection arrives.
    pub async fn start<F>(
        devices: &[Arc<DeviceConfig>],
        keystore: &dyn KeystoreProvider,
        settings: &ListenerSettings,
        make_dispatcher: F,
    ) -> Self
    where
        F: Fn(&DeviceConfig) -> Arc<EventDispatcher>,
    {
        let cancel = CancellationToken::new();
        let connections = TaskTracker::new();
        let mut listeners = Vec::with_capacity(devices.len());

        for device in devices {
            let key = device.key().clone();
            let server_config = match keystore.server_config(device.as_ref()) {
                Ok(config) => config,
                Err(e) => {
                    error!(device = %key, "TLS setup failed, listener not started: {}", e);
                    continue;
                }
            };
            let listener = match bind(&settings.bind_host, device.port()).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!(device = %key, "Could not bind {}:{}: {}", settings.bind_host, device.port(), e);
                    continue;
                }
            };
            let local_addr = match listener.local_addr() {
                Ok(addr) => addr,
                Err(e) => {
                    error!(device = %key, "Listener has no local address: {}", e);
                    continue;
                }
            };

            let dispatcher = make_dispatcher(device.as_ref());
            let (queue, receiver) = async_channel::bounded(settings.dispatch_queue_capacity);
            let workers = dispatcher
                .clone()
                .spawn_workers(receiver, settings.dispatch_workers);

            let protocol_listener = ProtocolListener {
                key: key.clone(),
                listener,
                acceptor: TlsAcceptor::from(server_config),
                relay: dispatcher.relay().clone(),
                queue: queue.clone(),
                connections: connections.clone(),
            };
            let accept = tokio::spawn(protocol_listener.run(cancel.child_token()));
            info!(device = %key, addr = %local_addr, "Listening for device events");

            listeners.push(RunningListener {
                key,
                local_addr,
                accept,
                queue,
                workers,
            });
        }

        Self {
            cancel,
            connections,
            listeners,
            grace: settings.shutdown_grace(),
        }
    }

    pub fn local_addrs(&self) -> Vec<(DeviceKey, SocketAddr)> {
        self.listeners
            .iter()
            .map(|l| (l.key.clone(), l.local_addr))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Stop accepting, close connections and drain the dispatch queues,
    /// waiting at most the grace period for each stage.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.connections.close();

        let mut accepts = Vec::with_capacity(self.listeners.len());
        let mut workers = Vec::new();
        let mut queues = Vec::with_capacity(self.listeners.len());
        for listener in self.listeners {
            accepts.push(listener.accept);
            workers.extend(listener.workers);
            queues.push(listener.queue);
        }

        if tokio::time::timeout(self.grace, futures::future::join_all(accepts))
            .await
            .is_err()
        {
            warn!("Listeners did not stop within the grace period");
        }
        if tokio::time::timeout(self.grace, self.connections.wait())
            .await
            .is_err()
        {
            warn!("Connections did not close within the grace period");
        }

        for queue in queues {
            queue.close();
        }
        if tokio::time::timeout(self.grace, futures::future::join_all(workers))
            .await
            .is_err()
        {
            warn!("Dispatch workers did not finish within the grace period");
        }
        info!("Protocol listeners stopped");
    }
}
