//! Connection Endpoint: one framed, typed, disposable connection.
//!
//! Both sides of every connection (inbound on the server, outbound from a
//! client messenger) use the same endpoint:
//!
//! - `send` encodes one message and writes it as one packet.
//! - `on_receive` starts the single background receive task, which decodes
//!   every inbound packet and hands it to a callback.
//! - `dispose` signals cancellation, closes the socket and joins the task.
//!
//! Any transport or decode failure ends the receive task after it is
//! reported once through the exception callback.

use crate::codec::{read_packet, write_packet};
use crate::error::{GmsError, GmsResult};
use crate::message::Message;
use crate::transport::{BoxedReader, BoxedWriter, RawConnection};
use std::fmt;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, trace, warn};

/// Upper bound for closing the socket and joining the receive task.
const DISPOSE_GRACE: Duration = Duration::from_secs(2);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EndpointConfig {
    /// Largest packet accepted or produced, in bytes.
    pub max_packet_bytes: usize,
    /// Bound on one `send`; `None` waits for the transport indefinitely.
    pub send_timeout: Option<Duration>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            max_packet_bytes: 4096,
            send_timeout: Some(Duration::from_secs(10)),
        }
    }
}

fn lock<T>(m: &StdMutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A typed connection speaking message family `M`.
pub struct ConnectionEndpoint<M: Message> {
    id: ConnectionId,
    peer_addr: SocketAddr,
    config: EndpointConfig,
    writer: Mutex<Option<BoxedWriter>>,
    reader: StdMutex<Option<BoxedReader>>,
    receive_task: StdMutex<Option<JoinHandle<()>>>,
    disposed: watch::Sender<bool>,
    _family: PhantomData<fn() -> M>,
}

impl<M: Message> ConnectionEndpoint<M> {
    pub fn new(id: ConnectionId, conn: RawConnection, config: EndpointConfig) -> Self {
        let (disposed, _) = watch::channel(false);
        Self {
            id,
            peer_addr: conn.peer_addr,
            config,
            writer: Mutex::new(Some(conn.writer)),
            reader: StdMutex::new(Some(conn.reader)),
            receive_task: StdMutex::new(None),
            disposed,
            _family: PhantomData,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_disposed(&self) -> bool {
        *self.disposed.borrow()
    }

    /// Encode and write one message.
    ///
    /// Returns `Disposed` promptly if the endpoint is disposed before or
    /// during the write, even when the write is stuck on backpressure.
    pub async fn send(&self, message: &M) -> GmsResult<()> {
        if self.is_disposed() {
            return Err(GmsError::Disposed);
        }
        let payload = message.encode()?;
        if payload.len() > self.config.max_packet_bytes {
            return Err(GmsError::Encode(format!(
                "message of {} bytes exceeds packet limit of {}",
                payload.len(),
                self.config.max_packet_bytes
            )));
        }

        let mut disposed = self.disposed.subscribe();
        let write = async {
            let mut guard = self.writer.lock().await;
            let Some(writer) = guard.as_mut() else {
                return Err(if self.is_disposed() {
                    GmsError::Disposed
                } else {
                    GmsError::Transport("connection unusable after an earlier failed send".into())
                });
            };
            let result = match self.config.send_timeout {
                Some(limit) => time::timeout(limit, write_packet(writer, &payload))
                    .await
                    .unwrap_or(Err(GmsError::Timeout)),
                None => write_packet(writer, &payload).await,
            };
            if result.is_err() {
                // A partially written frame leaves the stream unframed.
                *guard = None;
            }
            result
        };

        let result = tokio::select! {
            result = write => result,
            _ = disposed.wait_for(|d| *d) => Err(GmsError::Disposed),
        };
        if result.is_ok() {
            trace!(connection = %self.id, kind = ?message.kind(), "sent");
        }
        result
    }

    /// Start the background receive task.
    ///
    /// `on_message` is called for every decoded message in arrival order.
    /// `on_exception` is called at most once, with the failure that ended the
    /// task, and never after `dispose()`.
    pub fn on_receive<R, E>(&self, mut on_message: R, mut on_exception: E) -> GmsResult<()>
    where
        R: FnMut(M) + Send + 'static,
        E: FnMut(GmsError) + Send + 'static,
    {
        if self.is_disposed() {
            return Err(GmsError::Disposed);
        }
        let mut reader = lock(&self.reader).take().ok_or_else(|| {
            GmsError::InvalidState(format!("{} already has a receive handler", self.id))
        })?;

        let mut disposed = self.disposed.subscribe();
        let max_len = self.config.max_packet_bytes;
        let id = self.id;

        let task = tokio::spawn(async move {
            loop {
                let packet = tokio::select! {
                    biased;
                    _ = disposed.wait_for(|d| *d) => break,
                    packet = read_packet(&mut reader, max_len) => packet,
                };
                let decoded = match packet {
                    Ok(Some(bytes)) => M::decode(&bytes),
                    Ok(None) => Err(GmsError::ConnectionClosed),
                    Err(e) => Err(e),
                };
                match decoded {
                    Ok(message) => {
                        trace!(connection = %id, kind = ?message.kind(), "received");
                        on_message(message);
                    }
                    Err(e) => {
                        if !*disposed.borrow() {
                            debug!(connection = %id, error = %e, "receive loop ending");
                            on_exception(e);
                        }
                        break;
                    }
                }
            }
        });

        *lock(&self.receive_task) = Some(task);
        Ok(())
    }

    /// Close the connection and stop the receive task. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.send_replace(true) {
            return;
        }
        debug!(connection = %self.id, "disposing endpoint");

        // In-flight sends observe the signal and release the writer lock.
        if let Ok(mut guard) = time::timeout(DISPOSE_GRACE, self.writer.lock()).await {
            if let Some(mut writer) = guard.take() {
                let _ = time::timeout(DISPOSE_GRACE, writer.shutdown()).await;
            }
        }
        lock(&self.reader).take();

        let task = lock(&self.receive_task).take();
        if let Some(mut task) = task {
            if time::timeout(DISPOSE_GRACE, &mut task).await.is_err() {
                warn!(connection = %self.id, "receive task did not stop, aborting");
                task.abort();
            }
        }
    }
}

impl<M: Message> Drop for ConnectionEndpoint<M> {
    fn drop(&mut self) {
        self.disposed.send_replace(true);
        if let Some(task) = lock(&self.receive_task).take() {
            task.abort();
        }
    }
}

impl<M: Message> fmt::Debug for ConnectionEndpoint<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionEndpoint")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
