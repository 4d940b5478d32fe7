//! Game manager structure: relays client authentication upstream.
//!
//! For each `AuthenticateClientRequest` a client sends, the structure opens a
//! fresh connection to the client authentication server, forwards the
//! request, and relays the two replies back: first the URL the client must
//! visit, then the final decision. The connection is opened by a background
//! task, never by the dispatch worker. Its outcome, replies, relay failures
//! and reply timeouts all come back as [`GameManagerEvent`]s on the dispatch
//! queue, so they are serialized with the client's own messages.
//!
//! The first reply timer starts with the attempt, so it also bounds the time
//! spent connecting.
//!
//! ```text
//!   Idle ─request─▶ AwaitingUrlNavigation ─url─▶ AwaitingAuthenticationResult ─result─▶ Authenticated
//!    ▲                      │                               │                                 | Rejected
//!    └─── failure/timeout ──┴───────────────────────────────┘
//! ```
//!
//! A request while a relay is pending is answered with
//! `AuthenticationFailed { reason: AlreadyInProgress }` and the pending
//! attempt carries on. A new attempt may start from `Idle`, `Authenticated`
//! or `Rejected`.

mod relay;

use crate::structure::{Structure, StructureContext, StructureFactory};
use gms_client::ClientMessengerFactory;
use gms_core::codec::MAX_STRING_LEN;
use gms_core::endpoint::ConnectionId;
use gms_core::messages::{ClientAuthKind, ClientAuthMessage, FailureReason, GameManagerMessage};
use gms_core::{GmsError, GmsResult, Message};
use relay::{RelaySession, RelayStep};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_RELAY_TIMEOUT: Duration = Duration::from_secs(120);

type Context = StructureContext<GameManagerMessage, GameManagerEvent>;

/// Authentication progress of one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Idle,
    AwaitingUrlNavigation,
    AwaitingAuthenticationResult,
    Authenticated,
    Rejected,
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::AwaitingUrlNavigation => "awaiting_url_navigation",
            Self::AwaitingAuthenticationResult => "awaiting_authentication_result",
            Self::Authenticated => "authenticated",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Background outcomes of a relay session, tagged with the attempt that
/// produced them. Events of an attempt that is no longer current are stale
/// and ignored.
#[derive(Debug)]
pub enum GameManagerEvent {
    /// The relay connection is up and about to send the request.
    RelayOpened { attempt: u64 },
    /// The relay could not be opened or the request could not be sent.
    RelayUnavailable { attempt: u64, error: GmsError },
    /// The authentication server sent a message.
    Relay {
        attempt: u64,
        message: ClientAuthMessage,
    },
    /// The connection to the authentication server failed or closed.
    RelayFailed { attempt: u64, error: GmsError },
    /// A reply timer fired.
    RelayTimedOut { attempt: u64, timer: u64 },
}

#[derive(Debug, Clone)]
pub struct GameManagerStructureFactory {
    client_authentication: ClientMessengerFactory<ClientAuthMessage>,
    relay_timeout: Duration,
}

impl GameManagerStructureFactory {
    pub fn builder() -> GameManagerStructureFactoryBuilder {
        GameManagerStructureFactoryBuilder::default()
    }
}

#[derive(Debug)]
pub struct GameManagerStructureFactoryBuilder {
    client_authentication: Option<ClientMessengerFactory<ClientAuthMessage>>,
    relay_timeout: Duration,
}

impl Default for GameManagerStructureFactoryBuilder {
    fn default() -> Self {
        Self {
            client_authentication: None,
            relay_timeout: DEFAULT_RELAY_TIMEOUT,
        }
    }
}

impl GameManagerStructureFactoryBuilder {
    /// Messenger factory for the client authentication server. Required.
    pub fn client_authentication(
        mut self,
        factory: ClientMessengerFactory<ClientAuthMessage>,
    ) -> Self {
        self.client_authentication = Some(factory);
        self
    }

    /// How long to wait for each reply of the authentication server.
    pub fn relay_timeout(mut self, timeout: Duration) -> Self {
        self.relay_timeout = timeout;
        self
    }

    pub fn build(self) -> GmsResult<GameManagerStructureFactory> {
        let client_authentication = self.client_authentication.ok_or_else(|| {
            GmsError::Construction("client authentication messenger factory is required".into())
        })?;
        if self.relay_timeout.is_zero() {
            return Err(GmsError::Construction(
                "relay timeout must be greater than zero".into(),
            ));
        }
        Ok(GameManagerStructureFactory {
            client_authentication,
            relay_timeout: self.relay_timeout,
        })
    }
}

impl StructureFactory for GameManagerStructureFactory {
    type Structure = GameManagerStructure;

    fn create_structure(&self, connection_id: ConnectionId) -> GameManagerStructure {
        GameManagerStructure {
            connection_id,
            client_authentication: self.client_authentication.clone(),
            relay_timeout: self.relay_timeout,
            state: AuthState::Idle,
            attempts: 0,
            relay: None,
        }
    }
}

pub struct GameManagerStructure {
    connection_id: ConnectionId,
    client_authentication: ClientMessengerFactory<ClientAuthMessage>,
    relay_timeout: Duration,
    state: AuthState,
    attempts: u64,
    relay: Option<RelaySession>,
}

impl GameManagerStructure {
    pub fn state(&self) -> AuthState {
        self.state
    }

    /// The relay session of `attempt`, if that attempt is still pending.
    fn current_relay(&mut self, attempt: u64) -> Option<&mut RelaySession> {
        self.relay.as_mut().filter(|r| r.attempt() == attempt)
    }

    /// Begin an attempt without waiting on the authentication server: the
    /// relay opens in the background and the first reply timer already runs.
    fn start_attempt(&mut self, ctx: &Context) {
        self.attempts += 1;
        let attempt = self.attempts;
        info!(connection = %self.connection_id, attempt, server = %self.client_authentication.server(), "relaying authentication");

        let mut session = RelaySession::open(attempt, &self.client_authentication, ctx.events());
        session.await_reply(
            ClientAuthKind::UrlNavigationNeededResponse,
            RelayStep::ForwardNavigation,
            self.relay_timeout,
            ctx.events(),
        );
        self.relay = Some(session);
        self.state = AuthState::AwaitingUrlNavigation;
    }

    async fn on_relay_message(
        &mut self,
        attempt: u64,
        message: ClientAuthMessage,
        ctx: &Context,
    ) -> GmsResult<()> {
        let relay_timeout = self.relay_timeout;
        let Some(session) = self.current_relay(attempt) else {
            debug!(connection = %ctx.connection_id(), attempt, "stale relay message ignored");
            return Ok(());
        };
        let kind = message.kind();

        match (session.take_step(kind), message) {
            (
                Some(RelayStep::ForwardNavigation),
                ClientAuthMessage::UrlNavigationNeededResponse { url },
            ) => {
                session.await_reply(
                    ClientAuthKind::AuthenticateClientResponse,
                    RelayStep::ForwardResult,
                    relay_timeout,
                    ctx.events(),
                );
                self.state = AuthState::AwaitingAuthenticationResult;
                debug!(connection = %ctx.connection_id(), attempt, "forwarding navigation url");
                ctx.send_to_client(&GameManagerMessage::UrlNavigationNeededResponse { url })
                    .await
            }
            (
                Some(RelayStep::ForwardResult),
                ClientAuthMessage::AuthenticateClientResponse { accepted },
            ) => {
                if let Some(session) = self.relay.take() {
                    session.close().await;
                }
                self.state = if accepted {
                    AuthState::Authenticated
                } else {
                    AuthState::Rejected
                };
                info!(connection = %ctx.connection_id(), attempt, accepted, "authentication finished");
                ctx.send_to_client(&GameManagerMessage::AuthenticateClientResponse { accepted })
                    .await
            }
            (_, ClientAuthMessage::ErrorResponse { message }) => {
                self.fail_relay(
                    FailureReason::Unavailable,
                    format!("authentication server error: {message}"),
                    ctx,
                )
                .await
            }
            (_, other) => {
                self.fail_relay(
                    FailureReason::ProtocolViolation,
                    format!(
                        "unexpected {:?} from authentication server while {}",
                        other.kind(),
                        self.state
                    ),
                    ctx,
                )
                .await
            }
        }
    }

    /// End the pending attempt and tell the client why.
    async fn fail_relay(
        &mut self,
        reason: FailureReason,
        detail: String,
        ctx: &Context,
    ) -> GmsResult<()> {
        if let Some(session) = self.relay.take() {
            session.close().await;
        }
        warn!(connection = %ctx.connection_id(), from = %self.state, %reason, %detail, "authentication relay failed");
        self.state = AuthState::Idle;
        ctx.send_to_client(&failure(reason, detail)).await
    }
}

fn failure(reason: FailureReason, detail: String) -> GameManagerMessage {
    GameManagerMessage::AuthenticationFailed {
        reason,
        detail: clip(detail),
    }
}

/// Truncate to the wire string limit on a char boundary.
fn clip(mut s: String) -> String {
    if s.len() > MAX_STRING_LEN {
        let mut end = MAX_STRING_LEN;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
    s
}

impl Structure for GameManagerStructure {
    type Message = GameManagerMessage;
    type Event = GameManagerEvent;

    async fn on_client_message(&mut self, message: GameManagerMessage, ctx: &Context) -> GmsResult<()> {
        match message {
            GameManagerMessage::AuthenticateClientRequest if self.relay.is_some() => {
                debug!(connection = %ctx.connection_id(), state = %self.state, "authentication already pending");
                ctx.send_to_client(&failure(
                    FailureReason::AlreadyInProgress,
                    format!("authentication attempt pending ({})", self.state),
                ))
                .await
            }
            GameManagerMessage::AuthenticateClientRequest => {
                self.start_attempt(ctx);
                Ok(())
            }
            other => {
                debug!(connection = %ctx.connection_id(), kind = ?other.kind(), "unexpected client message");
                ctx.send_to_client(&GameManagerMessage::ErrorResponse {
                    message: format!("unexpected message kind {:?}", other.kind()),
                })
                .await
            }
        }
    }

    async fn on_event(&mut self, event: GameManagerEvent, ctx: &Context) -> GmsResult<()> {
        match event {
            GameManagerEvent::RelayOpened { attempt } => {
                match self.current_relay(attempt) {
                    Some(session) => {
                        debug!(connection = %ctx.connection_id(), attempt, "relay connected");
                        session.mark_connected();
                    }
                    None => debug!(connection = %ctx.connection_id(), attempt, "stale relay open ignored"),
                }
                Ok(())
            }
            GameManagerEvent::RelayUnavailable { attempt, error } => {
                if self.current_relay(attempt).is_none() {
                    debug!(connection = %ctx.connection_id(), attempt, "stale relay failure ignored");
                    return Ok(());
                }
                self.fail_relay(FailureReason::Unavailable, error.to_string(), ctx)
                    .await
            }
            GameManagerEvent::Relay { attempt, message } => {
                self.on_relay_message(attempt, message, ctx).await
            }
            GameManagerEvent::RelayFailed { attempt, error } => {
                if self.current_relay(attempt).is_none() {
                    debug!(connection = %ctx.connection_id(), attempt, "stale relay failure ignored");
                    return Ok(());
                }
                let reason = match error {
                    GmsError::Decode(_) => FailureReason::ProtocolViolation,
                    _ => FailureReason::Disconnected,
                };
                self.fail_relay(reason, error.to_string(), ctx).await
            }
            GameManagerEvent::RelayTimedOut { attempt, timer } => {
                let current = self
                    .current_relay(attempt)
                    .is_some_and(|r| r.is_current_timer(timer));
                if !current {
                    debug!(connection = %ctx.connection_id(), attempt, timer, "stale relay timer ignored");
                    return Ok(());
                }
                let connected = self.relay.as_ref().is_some_and(|r| r.is_connected());
                let detail = if connected {
                    GmsError::RelayTimeout.to_string()
                } else {
                    format!("{} (connection not established)", GmsError::RelayTimeout)
                };
                self.fail_relay(FailureReason::Timeout, detail, ctx).await
            }
        }
    }

    async fn dispose(&mut self) {
        if let Some(session) = self.relay.take() {
            debug!(connection = %self.connection_id, state = %self.state, "closing pending relay on teardown");
            session.close().await;
        }
        self.state = AuthState::Idle;
    }
}
