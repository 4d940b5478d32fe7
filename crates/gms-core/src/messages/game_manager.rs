//! Messages exchanged between game clients and the game manager server.

use super::{AcceptedPayload, EmptyPayload, ErrorPayload, UrlPayload};
use crate::codec::{check_string_len, decode_body, encode_message, split_header};
use crate::error::{GmsError, GmsResult};
use crate::message::Message;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric kind tags of the game manager family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum GameManagerKind {
    AuthenticateClientRequest = 0x01,
    UrlNavigationNeededResponse = 0x02,
    AuthenticateClientResponse = 0x03,
    AuthenticationFailed = 0x04,
    ErrorResponse = 0x20,
}

impl From<GameManagerKind> for u8 {
    fn from(k: GameManagerKind) -> u8 {
        k as u8
    }
}

impl TryFrom<u8> for GameManagerKind {
    type Error = String;
    fn try_from(v: u8) -> Result<Self, String> {
        match v {
            0x01 => Ok(Self::AuthenticateClientRequest),
            0x02 => Ok(Self::UrlNavigationNeededResponse),
            0x03 => Ok(Self::AuthenticateClientResponse),
            0x04 => Ok(Self::AuthenticationFailed),
            0x20 => Ok(Self::ErrorResponse),
            _ => Err(format!("unknown game manager message kind: 0x{v:02x}")),
        }
    }
}

/// Why an authentication attempt ended without a result from the
/// authentication server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Another attempt is still pending on this connection.
    AlreadyInProgress,
    /// The authentication server could not be reached.
    Unavailable,
    /// The authentication server did not answer in time.
    Timeout,
    /// The authentication server sent something out of sequence.
    ProtocolViolation,
    /// The authentication server dropped the relay connection.
    Disconnected,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AlreadyInProgress => "already_in_progress",
            Self::Unavailable => "unavailable",
            Self::Timeout => "timeout",
            Self::ProtocolViolation => "protocol_violation",
            Self::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct FailurePayload {
    reason: FailureReason,
    detail: String,
}

/// A message of the game manager family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GameManagerMessage {
    /// Client asks to be authenticated.
    AuthenticateClientRequest,
    /// Client must visit `url` out-of-band to continue authenticating.
    UrlNavigationNeededResponse { url: String },
    /// Final outcome of an authentication attempt.
    AuthenticateClientResponse { accepted: bool },
    /// The attempt ended without an outcome from the authentication server.
    AuthenticationFailed { reason: FailureReason, detail: String },
    /// The server could not handle a message.
    ErrorResponse { message: String },
}

impl GameManagerMessage {
    fn validate(&self) -> Result<(), String> {
        match self {
            Self::UrlNavigationNeededResponse { url } => check_string_len("url", url),
            Self::AuthenticationFailed { detail, .. } => check_string_len("detail", detail),
            Self::ErrorResponse { message } => check_string_len("message", message),
            Self::AuthenticateClientRequest | Self::AuthenticateClientResponse { .. } => Ok(()),
        }
    }
}

impl Message for GameManagerMessage {
    type Kind = GameManagerKind;

    fn kind(&self) -> GameManagerKind {
        match self {
            Self::AuthenticateClientRequest => GameManagerKind::AuthenticateClientRequest,
            Self::UrlNavigationNeededResponse { .. } => GameManagerKind::UrlNavigationNeededResponse,
            Self::AuthenticateClientResponse { .. } => GameManagerKind::AuthenticateClientResponse,
            Self::AuthenticationFailed { .. } => GameManagerKind::AuthenticationFailed,
            Self::ErrorResponse { .. } => GameManagerKind::ErrorResponse,
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
            Self::AuthenticationFailed { reason, detail } => encode_message(
                kind,
                &FailurePayload {
                    reason: *reason,
                    detail: detail.clone(),
                },
            ),
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
        let kind = GameManagerKind::try_from(tag).map_err(GmsError::Decode)?;

        let message = match kind {
            GameManagerKind::AuthenticateClientRequest => {
                decode_body::<EmptyPayload>(body)?;
                Self::AuthenticateClientRequest
            }
            GameManagerKind::UrlNavigationNeededResponse => {
                let p: UrlPayload = decode_body(body)?;
                Self::UrlNavigationNeededResponse { url: p.url }
            }
            GameManagerKind::AuthenticateClientResponse => {
                let p: AcceptedPayload = decode_body(body)?;
                Self::AuthenticateClientResponse {
                    accepted: p.accepted,
                }
            }
            GameManagerKind::AuthenticationFailed => {
                let p: FailurePayload = decode_body(body)?;
                Self::AuthenticationFailed {
                    reason: p.reason,
                    detail: p.detail,
                }
            }
            GameManagerKind::ErrorResponse => {
                let p: ErrorPayload = decode_body(body)?;
                Self::ErrorResponse { message: p.message }
            }
        };

        message.validate().map_err(GmsError::Decode)?;
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{MAX_STRING_LEN, WIRE_VERSION};

    fn all_kinds() -> Vec<GameManagerMessage> {
        vec![
            GameManagerMessage::AuthenticateClientRequest,
            GameManagerMessage::UrlNavigationNeededResponse {
                url: "https://auth.example/x".into(),
            },
            GameManagerMessage::UrlNavigationNeededResponse { url: String::new() },
            GameManagerMessage::UrlNavigationNeededResponse {
                url: "u".repeat(MAX_STRING_LEN),
            },
            GameManagerMessage::AuthenticateClientResponse { accepted: true },
            GameManagerMessage::AuthenticateClientResponse { accepted: false },
            GameManagerMessage::AuthenticationFailed {
                reason: FailureReason::Timeout,
                detail: "no answer".into(),
            },
            GameManagerMessage::AuthenticationFailed {
                reason: FailureReason::AlreadyInProgress,
                detail: String::new(),
            },
            GameManagerMessage::ErrorResponse {
                message: "unexpected".into(),
            },
        ]
    }

    #[test]
    fn round_trip_every_kind() {
        for msg in all_kinds() {
            let encoded = msg.encode().unwrap();
            assert_eq!(encoded[1], u8::from(msg.kind()));
            let decoded = GameManagerMessage::decode(&encoded).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn kind_tags_round_trip() {
        for tag in [0x01u8, 0x02, 0x03, 0x04, 0x20] {
            let kind = GameManagerKind::try_from(tag).unwrap();
            assert_eq!(u8::from(kind), tag);
        }
        assert!(GameManagerKind::try_from(0x05).is_err());
    }

    #[test]
    fn unknown_kind_is_decode_error() {
        let data = [WIRE_VERSION, 0x7f, 0xa0];
        assert!(matches!(
            GameManagerMessage::decode(&data),
            Err(GmsError::Decode(_))
        ));
    }

    #[test]
    fn body_of_wrong_kind_rejected() {
        let mut relabelled = encode_message(0x02, &UrlPayload { url: "x".into() }).unwrap();
        relabelled[1] = u8::from(GameManagerKind::AuthenticateClientResponse);
        assert!(matches!(
            GameManagerMessage::decode(&relabelled),
            Err(GmsError::Decode(_))
        ));

        relabelled[1] = u8::from(GameManagerKind::AuthenticateClientRequest);
        assert!(GameManagerMessage::decode(&relabelled).is_err());
    }

    #[test]
    fn overlong_string_rejected_both_ways() {
        let msg = GameManagerMessage::ErrorResponse {
            message: "m".repeat(MAX_STRING_LEN + 1),
        };
        assert!(matches!(msg.encode(), Err(GmsError::Encode(_))));

        let raw = encode_message(
            0x02,
            &UrlPayload {
                url: "u".repeat(MAX_STRING_LEN + 1),
            },
        )
        .unwrap();
        assert!(matches!(
            GameManagerMessage::decode(&raw),
            Err(GmsError::Decode(_))
        ));
    }

    #[test]
    fn unknown_failure_reason_rejected() {
        #[derive(Serialize)]
        struct Raw {
            reason: &'static str,
            detail: &'static str,
        }
        let raw = encode_message(
            0x04,
            &Raw {
                reason: "cosmic_rays",
                detail: "",
            },
        )
        .unwrap();
        assert!(GameManagerMessage::decode(&raw).is_err());
    }

    #[test]
    fn failure_reason_display_matches_wire_name() {
        assert_eq!(FailureReason::AlreadyInProgress.to_string(), "already_in_progress");
        assert_eq!(FailureReason::Disconnected.to_string(), "disconnected");
    }
}
