//! One outbound relay session to the client authentication server.

use super::GameManagerEvent;
use crate::structure::StructureEvents;
use gms_client::{ClientMessenger, ClientMessengerFactory};
use gms_core::expectations::{Expectation, ExpectationTable};
use gms_core::messages::{ClientAuthKind, ClientAuthMessage};
use gms_core::GmsResult;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

type RelayMessenger = Arc<ClientMessenger<ClientAuthMessage>>;

/// What to do with the next expected reply from the authentication server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RelayStep {
    /// Forward the navigation URL to the client.
    ForwardNavigation,
    /// Forward the final decision to the client and end the session.
    ForwardResult,
}

pub(crate) struct RelaySession {
    attempt: u64,
    messenger: RelayMessenger,
    connected: bool,
    opener: Option<JoinHandle<()>>,
    expectations: ExpectationTable<ClientAuthKind, RelayStep>,
    timer: Option<JoinHandle<()>>,
    timer_seq: u64,
}

impl RelaySession {
    /// Start opening the relay in the background.
    ///
    /// The opener connects, registers the receive callbacks, reports
    /// [`GameManagerEvent::RelayOpened`] and then sends the request. A failure
    /// on the way is reported as [`GameManagerEvent::RelayUnavailable`].
    /// The session owns the messenger from the start, so closing it also
    /// cancels a connect still in progress.
    pub(crate) fn open(
        attempt: u64,
        factory: &ClientMessengerFactory<ClientAuthMessage>,
        events: &StructureEvents<GameManagerEvent>,
    ) -> Self {
        let messenger: RelayMessenger = Arc::new(factory.get_client_messenger());
        let relay = messenger.clone();
        let events = events.clone();
        let opener = tokio::spawn(async move {
            if let Err(error) = open_relay(attempt, &relay, &events).await {
                relay.dispose().await;
                let _ = events.emit(GameManagerEvent::RelayUnavailable { attempt, error });
            }
        });

        Self {
            attempt,
            messenger,
            connected: false,
            opener: Some(opener),
            expectations: ExpectationTable::new(),
            timer: None,
            timer_seq: 0,
        }
    }

    pub(crate) fn attempt(&self) -> u64 {
        self.attempt
    }

    pub(crate) fn mark_connected(&mut self) {
        self.connected = true;
    }

    /// Whether the connection to the authentication server is up.
    pub(crate) fn is_connected(&self) -> bool {
        self.connected
    }

    /// Expect `kind` next, replacing whatever was expected before, and
    /// restart the reply timer.
    pub(crate) fn await_reply(
        &mut self,
        kind: ClientAuthKind,
        step: RelayStep,
        timeout: Duration,
        events: &StructureEvents<GameManagerEvent>,
    ) {
        self.expectations.clear();
        self.expectations.expect(kind, step, Expectation::Once);
        self.arm_timer(timeout, events);
    }

    /// The step registered for a reply of `kind`, consuming it.
    pub(crate) fn take_step(&mut self, kind: ClientAuthKind) -> Option<RelayStep> {
        self.expectations.take(&kind)
    }

    fn arm_timer(&mut self, timeout: Duration, events: &StructureEvents<GameManagerEvent>) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.timer_seq += 1;
        let attempt = self.attempt;
        let timer = self.timer_seq;
        let events = events.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events.emit(GameManagerEvent::RelayTimedOut { attempt, timer });
        }));
    }

    /// Whether `timer` is the currently armed reply timer.
    pub(crate) fn is_current_timer(&self, timer: u64) -> bool {
        self.timer.is_some() && self.timer_seq == timer
    }

    /// Cancel the opener and the timer and close the outbound connection.
    pub(crate) async fn close(mut self) {
        if let Some(opener) = self.opener.take() {
            opener.abort();
        }
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.expectations.clear();
        debug!(attempt = self.attempt, connected = self.connected, "closing relay session");
        self.messenger.dispose().await;
    }
}

async fn open_relay(
    attempt: u64,
    messenger: &RelayMessenger,
    events: &StructureEvents<GameManagerEvent>,
) -> GmsResult<()> {
    messenger.connect().await?;
    let on_message = events.clone();
    let on_failure = events.clone();
    messenger.on_receive(
        move |message| {
            let _ = on_message.emit(GameManagerEvent::Relay { attempt, message });
        },
        move |error| {
            let _ = on_failure.emit(GameManagerEvent::RelayFailed { attempt, error });
        },
    )?;
    events.emit(GameManagerEvent::RelayOpened { attempt })?;
    messenger
        .send(&ClientAuthMessage::AuthenticateClientRequest)
        .await
}
