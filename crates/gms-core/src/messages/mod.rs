//! Message families spoken by the game manager service.
//!
//! - [`game_manager`]: between game clients and the game manager server.
//! - [`client_auth`]: between the game manager server and the client
//!   authentication server it relays to.

pub mod client_auth;
pub mod game_manager;

use serde::{Deserialize, Serialize};

pub use client_auth::{ClientAuthKind, ClientAuthMessage};
pub use game_manager::{FailureReason, GameManagerKind, GameManagerMessage};

/// Body of kinds without fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmptyPayload {}

/// Body carrying a navigation URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UrlPayload {
    pub url: String,
}

/// Body carrying a final authentication decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AcceptedPayload {
    pub accepted: bool,
}

/// Body carrying a free-form error description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorPayload {
    pub message: String,
}
