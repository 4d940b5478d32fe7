//! Server Messenger: accepts connections and dispatches to structures.
//!
//! One accept loop turns sockets into endpoints. Everything else (creating
//! structures, client messages, structure events, connection teardown) is an
//! item on one [`SequentialQueue`], which gives a total order over all
//! connections. The connection registry lives inside the queue's processor
//! and is only touched by the dispatch worker.

use crate::structure::{Structure, StructureContext, StructureEvents, StructureFactory};
use gms_core::endpoint::{ConnectionEndpoint, ConnectionId, EndpointConfig};
use gms_core::queue::{ItemProcessor, QueueSender, SequentialQueue};
use gms_core::transport::{RawConnection, ServerSocket, ServerSocketConfig};
use gms_core::{GmsError, GmsResult};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Pause after a failed accept before polling again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

type MessageOf<S> = <S as Structure>::Message;

/// Work items of the dispatch queue.
pub(crate) enum ServerEvent<S: Structure> {
    Accepted {
        endpoint: Arc<ConnectionEndpoint<MessageOf<S>>>,
    },
    ClientMessage {
        id: ConnectionId,
        message: MessageOf<S>,
    },
    ClientClosed {
        id: ConnectionId,
        error: GmsError,
    },
    Structure {
        id: ConnectionId,
        event: S::Event,
    },
    CountConnections {
        reply: oneshot::Sender<usize>,
    },
    Teardown,
}

struct Connection<S: Structure> {
    structure: S,
    context: StructureContext<S::Message, S::Event>,
}

impl<S: Structure> Connection<S> {
    async fn close(mut self) {
        self.structure.dispose().await;
        self.context.client().dispose().await;
    }
}

/// Owns every live connection; runs on the dispatch worker.
struct Registry<F: StructureFactory> {
    factory: Arc<F>,
    queue: QueueSender<ServerEvent<F::Structure>>,
    connections: HashMap<ConnectionId, Connection<F::Structure>>,
}

impl<F: StructureFactory> Registry<F> {
    fn accept(&mut self, endpoint: Arc<ConnectionEndpoint<MessageOf<F::Structure>>>) {
        let id = endpoint.id();
        let structure = self.factory.create_structure(id);

        let queue = self.queue.clone();
        let events = StructureEvents::new(id, move |event: <F::Structure as Structure>::Event| {
            queue.enqueue(ServerEvent::Structure { id, event })
        });
        let context = StructureContext::new(endpoint.clone(), events);

        let messages = self.queue.clone();
        let closes = self.queue.clone();
        let registered = endpoint.on_receive(
            move |message| {
                if messages
                    .enqueue(ServerEvent::ClientMessage { id, message })
                    .is_err()
                {
                    debug!(connection = %id, "dispatch queue closed, dropping message");
                }
            },
            move |error| {
                let _ = closes.enqueue(ServerEvent::ClientClosed { id, error });
            },
        );
        if let Err(e) = registered {
            warn!(connection = %id, error = %e, "cannot start receiving, dropping connection");
            return;
        }

        info!(connection = %id, remote = %endpoint.peer_addr(), "client connected");
        self.connections.insert(id, Connection { structure, context });
    }

    async fn close(&mut self, id: ConnectionId, error: GmsError) {
        let Some(connection) = self.connections.remove(&id) else {
            debug!(connection = %id, "close for unknown connection");
            return;
        };
        match error {
            GmsError::ConnectionClosed => info!(connection = %id, "client disconnected"),
            e => warn!(connection = %id, error = %e, "client connection failed"),
        }
        connection.close().await;
    }

    async fn teardown(&mut self) {
        let count = self.connections.len();
        for (_, connection) in self.connections.drain() {
            connection.close().await;
        }
        debug!(count, "all connections torn down");
    }
}

impl<F: StructureFactory> ItemProcessor<ServerEvent<F::Structure>> for Registry<F> {
    async fn process(&mut self, item: ServerEvent<F::Structure>) -> GmsResult<()> {
        match item {
            ServerEvent::Accepted { endpoint } => self.accept(endpoint),
            ServerEvent::ClientMessage { id, message } => match self.connections.get_mut(&id) {
                Some(c) => c.structure.on_client_message(message, &c.context).await?,
                None => debug!(connection = %id, "message for closed connection dropped"),
            },
            ServerEvent::Structure { id, event } => match self.connections.get_mut(&id) {
                Some(c) => c.structure.on_event(event, &c.context).await?,
                None => debug!(connection = %id, "event for closed connection dropped"),
            },
            ServerEvent::ClientClosed { id, error } => self.close(id, error).await,
            ServerEvent::CountConnections { reply } => {
                let _ = reply.send(self.connections.len());
            }
            ServerEvent::Teardown => self.teardown().await,
        }
        Ok(())
    }
}

struct AcceptLoop {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// The top-level service: accept loop, connection registry and lifecycle.
pub struct ServerMessenger<F: StructureFactory> {
    socket_config: ServerSocketConfig,
    endpoint_config: EndpointConfig,
    queue: SequentialQueue<ServerEvent<F::Structure>>,
    accept_loop: Mutex<Option<AcceptLoop>>,
    disposed: AtomicBool,
}

impl<F: StructureFactory> ServerMessenger<F> {
    /// Validate `factory` and start the dispatch worker. Must be called
    /// inside a tokio runtime.
    pub fn new(
        socket_config: ServerSocketConfig,
        endpoint_config: EndpointConfig,
        factory: F,
    ) -> GmsResult<Self> {
        factory.validate().map_err(|e| match e {
            GmsError::Construction(_) => e,
            other => GmsError::Construction(other.to_string()),
        })?;

        let factory = Arc::new(factory);
        let queue = SequentialQueue::spawn_with(|queue| Registry {
            factory,
            queue,
            connections: HashMap::new(),
        });

        Ok(Self {
            socket_config,
            endpoint_config,
            queue,
            accept_loop: Mutex::new(None),
            disposed: AtomicBool::new(false),
        })
    }

    /// Bind and start the accept loop, returning the bound address.
    /// Calling it again while running returns the same address.
    pub async fn start_receiving(&self) -> GmsResult<SocketAddr> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(GmsError::Disposed);
        }
        let mut guard = self.accept_loop.lock().await;
        if let Some(running) = guard.as_ref() {
            return Ok(running.local_addr);
        }

        let socket = ServerSocket::bind(&self.socket_config).await?;
        let local_addr = socket.local_addr()?;
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(
            socket,
            self.socket_config.accept_timeout,
            self.endpoint_config,
            self.queue.sender(),
            stop_rx,
        ));

        info!(addr = %local_addr, "listening");
        *guard = Some(AcceptLoop {
            stop,
            task,
            local_addr,
        });
        Ok(local_addr)
    }

    /// Stop accepting new connections and wait for the accept loop to exit.
    /// Existing connections stay up.
    pub async fn stop_receiving(&self) {
        let Some(running) = self.accept_loop.lock().await.take() else {
            return;
        };
        running.stop.send_replace(true);
        if let Err(e) = running.task.await {
            warn!(error = %e, "accept loop ended abnormally");
        }
        info!(addr = %running.local_addr, "stopped listening");
    }

    /// The bound address while the accept loop runs.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.accept_loop.lock().await.as_ref().map(|l| l.local_addr)
    }

    /// Number of live connections, as seen by the dispatch worker.
    pub async fn active_connections(&self) -> GmsResult<usize> {
        let (reply, rx) = oneshot::channel();
        self.queue.enqueue(ServerEvent::CountConnections { reply })?;
        rx.await.map_err(|_| GmsError::Disposed)
    }

    /// Stop receiving, tear down every connection and its structure, then
    /// stop the dispatch worker. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_receiving().await;
        let _ = self.queue.enqueue(ServerEvent::Teardown);
        self.queue.shutdown().await;
        info!("server disposed");
    }
}

async fn accept_loop<S: Structure>(
    socket: ServerSocket,
    accept_timeout: Duration,
    endpoint_config: EndpointConfig,
    queue: QueueSender<ServerEvent<S>>,
    mut stop: watch::Receiver<bool>,
) {
    // TLS handshakes run in their own tasks so a silent peer cannot hold up
    // accepting the others.
    let mut handshakes = JoinSet::new();
    loop {
        let accepted = tokio::select! {
            biased;
            _ = stop.wait_for(|s| *s) => break,
            Some(done) = handshakes.join_next(), if !handshakes.is_empty() => {
                if let Err(e) = done {
                    warn!(error = %e, "handshake task ended abnormally");
                }
                continue;
            }
            accepted = socket.accept_pending(accept_timeout) => accepted,
        };
        match accepted {
            Ok(None) => {}
            Ok(Some(pending)) if pending.needs_handshake() => {
                let queue = queue.clone();
                handshakes.spawn(async move {
                    let remote = pending.peer_addr();
                    match pending.establish().await {
                        Ok(raw) => {
                            register(raw, endpoint_config, &queue);
                        }
                        Err(e) => warn!(remote = %remote, error = %e, "handshake failed"),
                    }
                });
            }
            Ok(Some(pending)) => match pending.establish().await {
                Ok(raw) => {
                    if !register(raw, endpoint_config, &queue) {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    handshakes.shutdown().await;
    debug!("accept loop exited");
}

/// Wrap an established connection and hand it to the dispatch worker.
/// Returns `false` once the queue is closed.
fn register<S: Structure>(
    raw: RawConnection,
    endpoint_config: EndpointConfig,
    queue: &QueueSender<ServerEvent<S>>,
) -> bool {
    let endpoint = Arc::new(ConnectionEndpoint::new(
        ConnectionId::next(),
        raw,
        endpoint_config,
    ));
    debug!(connection = %endpoint.id(), remote = %endpoint.peer_addr(), "accepted");
    queue.enqueue(ServerEvent::Accepted { endpoint }).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gms_client::{ClientMessenger, ClientMessengerFactory};
    use gms_core::codec::{read_packet, write_packet};
    use gms_core::messages::GameManagerMessage;
    use gms_core::tls::{load_client_tls, load_server_tls};
    use gms_core::transport::{connect, ClientSocketConfig, HostPointer};
    use std::collections::HashSet;
    use tokio::sync::mpsc;
    use tokio::time::{sleep, timeout};

    /// Echoes every client message back, and answers an `ErrorResponse`
    /// with a round trip through a structure event.
    struct Echo {
        disposed: mpsc::UnboundedSender<ConnectionId>,
        id: ConnectionId,
    }

    impl Structure for Echo {
        type Message = GameManagerMessage;
        type Event = String;

        async fn on_client_message(
            &mut self,
            message: GameManagerMessage,
            ctx: &StructureContext<GameManagerMessage, String>,
        ) -> GmsResult<()> {
            match message {
                GameManagerMessage::ErrorResponse { message } => ctx.events().emit(message),
                other => ctx.send_to_client(&other).await,
            }
        }

        async fn on_event(
            &mut self,
            event: String,
            ctx: &StructureContext<GameManagerMessage, String>,
        ) -> GmsResult<()> {
            ctx.send_to_client(&GameManagerMessage::ErrorResponse {
                message: format!("event: {event}"),
            })
            .await
        }

        async fn dispose(&mut self) {
            let _ = self.disposed.send(self.id);
        }
    }

    struct EchoFactory {
        disposed: mpsc::UnboundedSender<ConnectionId>,
        valid: bool,
    }

    impl StructureFactory for EchoFactory {
        type Structure = Echo;

        fn validate(&self) -> GmsResult<()> {
            if self.valid {
                Ok(())
            } else {
                Err(GmsError::Config("echo misconfigured".into()))
            }
        }

        fn create_structure(&self, id: ConnectionId) -> Echo {
            Echo {
                disposed: self.disposed.clone(),
                id,
            }
        }
    }

    async fn start() -> (
        ServerMessenger<EchoFactory>,
        SocketAddr,
        mpsc::UnboundedReceiver<ConnectionId>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut socket = ServerSocketConfig::new(HostPointer::new("127.0.0.1", 0));
        socket.accept_timeout = Duration::from_millis(50);
        let server = ServerMessenger::new(
            socket,
            EndpointConfig::default(),
            EchoFactory {
                disposed: tx,
                valid: true,
            },
        )
        .unwrap();
        let addr = server.start_receiving().await.unwrap();
        (server, addr, rx)
    }

    async fn client(
        addr: SocketAddr,
    ) -> (
        ClientMessenger<GameManagerMessage>,
        mpsc::UnboundedReceiver<GameManagerMessage>,
    ) {
        let factory = ClientMessengerFactory::new(
            HostPointer::new("127.0.0.1", addr.port()),
            ClientSocketConfig::default(),
            EndpointConfig::default(),
        );
        let messenger = factory.get_client_messenger();
        messenger.connect().await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        messenger
            .on_receive(move |m| drop(tx.send(m)), |_| {})
            .unwrap();
        (messenger, rx)
    }

    async fn wait_for_connections<F: StructureFactory>(server: &ServerMessenger<F>, n: usize) {
        for _ in 0..200 {
            if server.active_connections().await.unwrap() == n {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {n} active connections");
    }

    #[tokio::test]
    async fn invalid_factory_is_construction_error() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = ServerMessenger::new(
            ServerSocketConfig::new(HostPointer::new("127.0.0.1", 0)),
            EndpointConfig::default(),
            EchoFactory {
                disposed: tx,
                valid: false,
            },
        );
        assert!(matches!(result, Err(GmsError::Construction(_))));
    }

    #[tokio::test]
    async fn start_receiving_is_idempotent() {
        let (server, addr, _rx) = start().await;
        assert_eq!(server.start_receiving().await.unwrap(), addr);
        assert_eq!(server.local_addr().await, Some(addr));
        server.stop_receiving().await;
        assert_eq!(server.local_addr().await, None);
        server.dispose().await;
    }

    #[tokio::test]
    async fn messages_and_events_route_to_own_connection() {
        let (server, addr, _rx) = start().await;
        let (a, mut a_rx) = client(addr).await;
        let (b, mut b_rx) = client(addr).await;

        a.send(&GameManagerMessage::AuthenticateClientResponse { accepted: true })
            .await
            .unwrap();
        b.send(&GameManagerMessage::ErrorResponse {
            message: "ping".into(),
        })
        .await
        .unwrap();

        assert_eq!(
            a_rx.recv().await.unwrap(),
            GameManagerMessage::AuthenticateClientResponse { accepted: true }
        );
        assert_eq!(
            b_rx.recv().await.unwrap(),
            GameManagerMessage::ErrorResponse {
                message: "event: ping".into()
            }
        );
        assert!(a_rx.try_recv().is_err());

        server.dispose().await;
    }

    #[tokio::test]
    async fn client_disconnect_disposes_structure() {
        let (server, addr, mut disposed) = start().await;
        let (a, _a_rx) = client(addr).await;
        wait_for_connections(&server, 1).await;

        let id = timeout(Duration::from_secs(5), async {
            a.dispose().await;
            disposed.recv().await.unwrap()
        })
        .await
        .unwrap();
        assert!(id.as_u64() > 0);
        wait_for_connections(&server, 0).await;

        server.dispose().await;
    }

    #[tokio::test]
    async fn dispose_tears_down_live_connections() {
        let (server, addr, mut disposed) = start().await;
        let (_a, mut a_rx) = client(addr).await;
        let (_b, _b_rx) = client(addr).await;
        wait_for_connections(&server, 2).await;

        timeout(Duration::from_secs(5), server.dispose())
            .await
            .expect("dispose must not hang");
        assert!(disposed.recv().await.is_some());
        assert!(disposed.recv().await.is_some());

        // The client side sees its connection end.
        let ended = timeout(Duration::from_secs(5), a_rx.recv()).await.unwrap();
        assert!(ended.is_none());
        assert!(matches!(
            server.active_connections().await,
            Err(GmsError::Disposed)
        ));
        assert!(matches!(
            server.start_receiving().await,
            Err(GmsError::Disposed)
        ));
        server.dispose().await;
    }

    #[tokio::test]
    async fn stop_then_dispose_with_no_connections() {
        let (server, _addr, _rx) = start().await;
        server.stop_receiving().await;
        server.stop_receiving().await;
        timeout(Duration::from_secs(5), server.dispose())
            .await
            .expect("dispose must not hang");
    }

    #[tokio::test]
    async fn malformed_packets_only_close_their_own_connection() {
        let (server, addr, mut disposed) = start().await;
        let (good, mut good_rx) = client(addr).await;
        let pointer = HostPointer::new("127.0.0.1", addr.port());
        let mut garbage = connect(&pointer, &ClientSocketConfig::default())
            .await
            .unwrap();
        let mut oversized = connect(&pointer, &ClientSocketConfig::default())
            .await
            .unwrap();
        wait_for_connections(&server, 3).await;

        write_packet(&mut garbage.writer, &[0xde, 0xad, 0xbe, 0xef])
            .await
            .unwrap();
        let limit = EndpointConfig::default().max_packet_bytes;
        write_packet(&mut oversized.writer, &vec![0u8; limit + 1])
            .await
            .unwrap();

        let mut closed = HashSet::new();
        for _ in 0..2 {
            let id = timeout(Duration::from_secs(5), disposed.recv())
                .await
                .expect("bad connection should be closed")
                .unwrap();
            closed.insert(id);
        }
        assert_eq!(closed.len(), 2);
        wait_for_connections(&server, 1).await;
        assert!(disposed.try_recv().is_err());

        // The server hung up on both offenders.
        for conn in [&mut garbage, &mut oversized] {
            let ended = timeout(Duration::from_secs(5), read_packet(&mut conn.reader, 64))
                .await
                .unwrap();
            assert!(!matches!(ended, Ok(Some(_))));
        }

        good.send(&GameManagerMessage::AuthenticateClientResponse { accepted: false })
            .await
            .unwrap();
        assert_eq!(
            timeout(Duration::from_secs(5), good_rx.recv())
                .await
                .unwrap()
                .unwrap(),
            GameManagerMessage::AuthenticateClientResponse { accepted: false }
        );

        good.dispose().await;
        server.dispose().await;
    }

    struct TlsFiles {
        _dir: tempfile::TempDir,
        root: std::path::PathBuf,
        cert: std::path::PathBuf,
        key: std::path::PathBuf,
    }

    fn tls_files() -> TlsFiles {
        let mut ca_params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca_key = rcgen::KeyPair::generate().unwrap();
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let leaf_params = rcgen::CertificateParams::new(vec!["127.0.0.1".to_string()]).unwrap();
        let leaf_key = rcgen::KeyPair::generate().unwrap();
        let leaf = leaf_params.signed_by(&leaf_key, &ca, &ca_key).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let files = TlsFiles {
            root: dir.path().join("root.pem"),
            cert: dir.path().join("cert.pem"),
            key: dir.path().join("key.pem"),
            _dir: dir,
        };
        std::fs::write(&files.root, ca.pem()).unwrap();
        std::fs::write(&files.cert, leaf.pem()).unwrap();
        std::fs::write(&files.key, leaf_key.serialize_pem()).unwrap();
        files
    }

    #[tokio::test]
    async fn silent_peer_does_not_delay_tls_clients() {
        let files = tls_files();
        let (tx, mut disposed) = mpsc::unbounded_channel();
        let mut socket = ServerSocketConfig::new(HostPointer::new("127.0.0.1", 0));
        socket.accept_timeout = Duration::from_millis(50);
        socket.handshake_timeout = Duration::from_secs(5);
        socket.tls = Some(load_server_tls(&files.cert, &files.key).unwrap());
        let server = ServerMessenger::new(
            socket,
            EndpointConfig::default(),
            EchoFactory {
                disposed: tx,
                valid: true,
            },
        )
        .unwrap();
        let addr = server.start_receiving().await.unwrap();

        // Connects but never starts the handshake.
        let _silent = tokio::net::TcpStream::connect(addr).await.unwrap();
        sleep(Duration::from_millis(100)).await;

        let factory = ClientMessengerFactory::new(
            HostPointer::new("127.0.0.1", addr.port()),
            ClientSocketConfig {
                tls: Some(load_client_tls(&files.root).unwrap()),
                ..Default::default()
            },
            EndpointConfig::default(),
        );
        let messenger: ClientMessenger<GameManagerMessage> = factory.get_client_messenger();
        timeout(Duration::from_secs(1), messenger.connect())
            .await
            .expect("handshake must not wait behind the silent peer")
            .unwrap();
        let (reply_tx, mut replies) = mpsc::unbounded_channel();
        messenger
            .on_receive(move |m| drop(reply_tx.send(m)), |_| {})
            .unwrap();

        messenger
            .send(&GameManagerMessage::AuthenticateClientResponse { accepted: true })
            .await
            .unwrap();
        assert_eq!(
            timeout(Duration::from_secs(1), replies.recv())
                .await
                .unwrap()
                .unwrap(),
            GameManagerMessage::AuthenticateClientResponse { accepted: true }
        );
        // Only the finished handshake became a connection.
        wait_for_connections(&server, 1).await;

        messenger.dispose().await;
        assert!(timeout(Duration::from_secs(5), disposed.recv())
            .await
            .unwrap()
            .is_some());
        timeout(Duration::from_secs(5), server.dispose())
            .await
            .expect("dispose must not hang on a pending handshake");
    }
}
