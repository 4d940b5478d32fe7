//! Per-connection protocol state machines and the factory that builds them.
//!
//! The server creates one [`Structure`] per accepted connection and drives it
//! exclusively from the dispatch worker, so structures are plain `&mut self`
//! state with no locking. Work a structure starts in the background (an
//! outbound relay, a timer) re-enters the worker as a structure event through
//! [`StructureEvents`].

use gms_core::endpoint::{ConnectionEndpoint, ConnectionId};
use gms_core::{GmsResult, Message};
use std::future::Future;
use std::sync::Arc;

/// The state machine of one inbound connection.
pub trait Structure: Send + 'static {
    /// Messages exchanged with the connected client.
    type Message: Message;
    /// Events the structure schedules for itself.
    type Event: Send + 'static;

    fn on_client_message(
        &mut self,
        message: Self::Message,
        ctx: &StructureContext<Self::Message, Self::Event>,
    ) -> impl Future<Output = GmsResult<()>> + Send;

    fn on_event(
        &mut self,
        event: Self::Event,
        ctx: &StructureContext<Self::Message, Self::Event>,
    ) -> impl Future<Output = GmsResult<()>> + Send;

    /// Release everything the structure opened. Called once, when the
    /// client connection goes away or the server is disposed.
    fn dispose(&mut self) -> impl Future<Output = ()> + Send;
}

/// Builds structures. Construction is pure; any I/O belongs to the structure.
pub trait StructureFactory: Send + Sync + 'static {
    type Structure: Structure;

    /// Check the factory's configuration. A failure aborts server start-up.
    fn validate(&self) -> GmsResult<()> {
        Ok(())
    }

    fn create_structure(&self, connection_id: ConnectionId) -> Self::Structure;
}

/// Schedules events back onto the dispatch queue for one connection.
pub struct StructureEvents<E> {
    connection_id: ConnectionId,
    emit: Arc<dyn Fn(E) -> GmsResult<()> + Send + Sync>,
}

impl<E> Clone for StructureEvents<E> {
    fn clone(&self) -> Self {
        Self {
            connection_id: self.connection_id,
            emit: self.emit.clone(),
        }
    }
}

impl<E> StructureEvents<E> {
    pub fn new<F>(connection_id: ConnectionId, emit: F) -> Self
    where
        F: Fn(E) -> GmsResult<()> + Send + Sync + 'static,
    {
        Self {
            connection_id,
            emit: Arc::new(emit),
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Queue `event` for the owning structure. Fails with `Disposed` once
    /// the server has shut its queue down.
    pub fn emit(&self, event: E) -> GmsResult<()> {
        (self.emit)(event)
    }
}

/// What a structure can reach while handling one item.
pub struct StructureContext<M: Message, E> {
    client: Arc<ConnectionEndpoint<M>>,
    events: StructureEvents<E>,
}

impl<M: Message, E> StructureContext<M, E> {
    pub fn new(client: Arc<ConnectionEndpoint<M>>, events: StructureEvents<E>) -> Self {
        Self { client, events }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.client.id()
    }

    pub async fn send_to_client(&self, message: &M) -> GmsResult<()> {
        self.client.send(message).await
    }

    pub fn events(&self) -> &StructureEvents<E> {
        &self.events
    }

    pub(crate) fn client(&self) -> &Arc<ConnectionEndpoint<M>> {
        &self.client
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gms_core::GmsError;
    use std::sync::Mutex;

    #[test]
    fn events_reach_the_emitter() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = ConnectionId::next();
        let events = StructureEvents::new(id, move |e: u8| {
            sink.lock().unwrap().push(e);
            Ok(())
        });

        let copy = events.clone();
        events.emit(1).unwrap();
        copy.emit(2).unwrap();
        assert_eq!(copy.connection_id(), id);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn emitter_errors_propagate() {
        let events = StructureEvents::new(ConnectionId::next(), |_: u8| Err(GmsError::Disposed));
        assert!(matches!(events.emit(0), Err(GmsError::Disposed)));
    }
}
