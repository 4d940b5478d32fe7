//! Messages exchanged with the client authentication server.
//!
//! The game manager server speaks this family as a client while relaying an
//! authentication attempt on behalf of one of its own connections.

use super::{AcceptedPayload, EmptyPayload, ErrorPayload, UrlPayload};
use crate::codec::{check_string_len, decode_body, encode_message, split_header};
use crate::error::{GmsError, GmsResult};
use crate::message::Message;

/// Numeric kind tags of the client authentication family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ClientAuthKind {
    AuthenticateClientRequest = 0x01,
    UrlNavigationNeededResponse = 0x02,
    AuthenticateClientResponse = 0x03,
    ErrorResponse = 0x20,
}

impl From<ClientAuthKind> for u8 {
    fn from(k: ClientAuthKind) -> u8 {
        k as u8
    }
}

impl TryFrom<u8> for ClientAuthKind {
    type Error = String;
    fn try_from(v: u8) -> Result<Self, String> {
        match v {
            0x01 => Ok(Self::AuthenticateClientRequest),
            0x02 => Ok(Self::UrlNavigationNeededResponse),
            0x03 => Ok(Self::AuthenticateClientResponse),
            0x20 => Ok(Self::ErrorResponse),
            _ => Err(format!("unknown client authentication message kind: 0x{v:02x}")),
        }
    }
}

/// A message of the client authentication family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAuthMessage {
    AuthenticateClientRequest,
    UrlNavigationNeededResponse { url: String },
    AuthenticateClientResponse { accepted: bool },
    ErrorResponse { message: String },
}

impl ClientAuthMessage {
    fn validate(&self) -> Result<(), String> {
        match self {
            Self::UrlNavigationNeededResponse { url } => check_string_len("url", url),
            Self::ErrorResponse { message } => check_string_len("message", message),
            Self::AuthenticateClientRequest | Self::AuthenticateClientResponse { .. } => Ok(()),
        }
    }
}

impl Message for ClientAuthMessage {
    type Kind = ClientAuthKind;

    fn kind(&self) -> ClientAuthKind {
        match self {
            Self::AuthenticateClientRequest => ClientAuthKind::AuthenticateClientRequest,
            Self::UrlNavigationNeededResponse { .. } => ClientAuthKind::UrlNavigationNeededResponse,
            Self::AuthenticateClientResponse { .. } => ClientAuthKind::AuthenticateClientResponse,
            Self::ErrorResponse { .. } => ClientAuthKind::ErrorResponse,
        }
    }

    fn encode(&self) -> GmsResult<Vec<u8>> {
        self.validate().map_err(GmsError::Encode)?;
        let kind = u8::from(self.kind());
        match self {
            Self::AuthenticateClientRequest => encode_message(kind, &EmptyPayload {}),
            Self::UrlNavigationNeededResponse { url } => {
                encode_message(kind, &UrlPayload { url: url.clone() })
            }
            Self::AuthenticateClientResponse { accepted } => {
                encode_message(kind, &AcceptedPayload { accepted: *accepted })
            }
            Self::ErrorResponse { message } => encode_message(
                kind,
                &ErrorPayload {
                    message: message.clone(),
                },
            ),
        }
    }

    fn decode(data: &[u8]) -> GmsResult<Self> {
        let (tag, body) = split_header(data)?;
        let kind = ClientAuthKind::try_from(tag).map_err(GmsError::Decode)?;

        let message = match kind {
            ClientAuthKind::AuthenticateClientRequest => {
                decode_body::<EmptyPayload>(body)?;
                Self::AuthenticateClientRequest
            }
            ClientAuthKind::UrlNavigationNeededResponse => {
                let p: UrlPayload = decode_body(body)?;
                Self::UrlNavigationNeededResponse { url: p.url }
            }
            ClientAuthKind::AuthenticateClientResponse => {
                let p: AcceptedPayload = decode_body(body)?;
                Self::AuthenticateClientResponse {
                    accepted: p.accepted,
                }
            }
            ClientAuthKind::ErrorResponse => {
                let p: ErrorPayload = decode_body(body)?;
                Self::ErrorResponse { message: p.message }
            }
        };

        message.validate().map_err(GmsError::Decode)?;
        Ok(message)
    }
}
