//! Outbound messengers.
//!
//! A [`ClientMessengerFactory`] is configured once (target server, socket and
//! endpoint settings) and handed around; every call to
//! [`ClientMessengerFactory::get_client_messenger`] yields an independent,
//! not yet connected [`ClientMessenger`].

use gms_core::endpoint::{ConnectionEndpoint, ConnectionId, EndpointConfig};
use gms_core::transport::{self, ClientSocketConfig, HostPointer};
use gms_core::{GmsError, GmsResult, Message};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

/// Produces messengers that speak family `M` to one server.
pub struct ClientMessengerFactory<M: Message> {
    server: HostPointer,
    socket: ClientSocketConfig,
    endpoint: EndpointConfig,
    _family: PhantomData<fn() -> M>,
}

impl<M: Message> Clone for ClientMessengerFactory<M> {
    fn clone(&self) -> Self {
        Self {
            server: self.server.clone(),
            socket: self.socket.clone(),
            endpoint: self.endpoint,
            _family: PhantomData,
        }
    }
}

impl<M: Message> fmt::Debug for ClientMessengerFactory<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientMessengerFactory")
            .field("server", &self.server)
            .field("tls", &self.socket.tls.is_some())
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl<M: Message> ClientMessengerFactory<M> {
    pub fn new(server: HostPointer, socket: ClientSocketConfig, endpoint: EndpointConfig) -> Self {
        Self {
            server,
            socket,
            endpoint,
            _family: PhantomData,
        }
    }

    pub fn server(&self) -> &HostPointer {
        &self.server
    }

    /// A fresh messenger. No I/O happens until [`ClientMessenger::connect`].
    pub fn get_client_messenger(&self) -> ClientMessenger<M> {
        ClientMessenger {
            server: self.server.clone(),
            socket: self.socket.clone(),
            endpoint_config: self.endpoint,
            endpoint: OnceLock::new(),
            disposed: AtomicBool::new(false),
        }
    }
}

/// One outbound connection speaking family `M`.
///
/// Every operation takes `&self`, so a messenger shared between tasks can be
/// disposed while another task is blocked in [`ClientMessenger::send`].
pub struct ClientMessenger<M: Message> {
    server: HostPointer,
    socket: ClientSocketConfig,
    endpoint_config: EndpointConfig,
    endpoint: OnceLock<Arc<ConnectionEndpoint<M>>>,
    disposed: AtomicBool,
}

impl<M: Message> ClientMessenger<M> {
    /// Open the connection. Fails with `InvalidState` if already connected
    /// and with `Disposed` after [`ClientMessenger::dispose`].
    pub async fn connect(&self) -> GmsResult<()> {
        if self.is_disposed() {
            return Err(GmsError::Disposed);
        }
        if self.endpoint.get().is_some() {
            return Err(already_connected(&self.server));
        }

        let raw = transport::connect(&self.server, &self.socket).await?;
        let id = ConnectionId::next();
        let endpoint = Arc::new(ConnectionEndpoint::new(id, raw, self.endpoint_config));
        if let Err(lost) = self.endpoint.set(endpoint) {
            lost.dispose().await;
            return Err(already_connected(&self.server));
        }
        if self.is_disposed() {
            // dispose() ran while the connection was being opened.
            if let Some(endpoint) = self.endpoint.get() {
                endpoint.dispose().await;
            }
            return Err(GmsError::Disposed);
        }
        info!(connection = %id, server = %self.server, "connected");
        Ok(())
    }

    fn connected(&self) -> GmsResult<&Arc<ConnectionEndpoint<M>>> {
        if self.is_disposed() {
            return Err(GmsError::Disposed);
        }
        self.endpoint
            .get()
            .ok_or_else(|| GmsError::InvalidState("messenger is not connected".into()))
    }

    /// Send one message. Returns `Disposed` promptly when the messenger is
    /// disposed during a send stalled on backpressure.
    pub async fn send(&self, message: &M) -> GmsResult<()> {
        self.connected()?.send(message).await
    }

    /// Register the receive callbacks; see [`ConnectionEndpoint::on_receive`].
    pub fn on_receive<R, E>(&self, on_message: R, on_exception: E) -> GmsResult<()>
    where
        R: FnMut(M) + Send + 'static,
        E: FnMut(GmsError) + Send + 'static,
    {
        self.connected()?.on_receive(on_message, on_exception)
    }

    /// Close the connection, if any. Idempotent and safe to call while a
    /// send is in flight.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(endpoint) = self.endpoint.get() {
            debug!(connection = %endpoint.id(), "disposing client messenger");
            endpoint.dispose().await;
        }
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.endpoint.get().map(|e| e.id())
    }

    pub fn is_connected(&self) -> bool {
        !self.is_disposed() && self.endpoint.get().is_some()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn server(&self) -> &HostPointer {
        &self.server
    }
}

fn already_connected(server: &HostPointer) -> GmsError {
    GmsError::InvalidState(format!("already connected to {server}"))
}

impl<M: Message> fmt::Debug for ClientMessenger<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientMessenger")
            .field("server", &self.server)
            .field("connection", &self.connection_id())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
