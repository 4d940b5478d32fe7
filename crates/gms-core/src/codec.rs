//! Message body encoding and length-prefixed packet framing.
//!
//! Message layout: `[wire version][kind][CBOR body]`
//! Packet layout on the stream: `[4-byte big-endian length][message]`

use crate::error::{GmsError, GmsResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Version byte leading every encoded message.
pub const WIRE_VERSION: u8 = 1;

/// Longest string any message field may carry, in bytes.
pub const MAX_STRING_LEN: usize = 8192;

/// Encode a message body behind its version and kind bytes.
pub fn encode_message<T: Serialize>(kind: u8, body: &T) -> GmsResult<Vec<u8>> {
    let mut out = Vec::with_capacity(32);
    out.push(WIRE_VERSION);
    out.push(kind);
    ciborium::into_writer(body, &mut out)?;
    Ok(out)
}

/// Split an encoded message into its kind byte and CBOR body.
pub fn split_header(data: &[u8]) -> GmsResult<(u8, &[u8])> {
    match data {
        [] => Err(GmsError::Decode("empty message".into())),
        [_] => Err(GmsError::Decode("truncated message header".into())),
        [version, kind, body @ ..] => {
            if *version != WIRE_VERSION {
                return Err(GmsError::Decode(format!(
                    "unsupported wire version: {version} (expected {WIRE_VERSION})"
                )));
            }
            Ok((*kind, body))
        }
    }
}

/// Decode a CBOR body, rejecting anything left over after it.
pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> GmsResult<T> {
    let mut remaining = body;
    let value: T = ciborium::from_reader(&mut remaining)?;
    if !remaining.is_empty() {
        return Err(GmsError::Decode(format!(
            "{} trailing bytes after message body",
            remaining.len()
        )));
    }
    Ok(value)
}

/// Check a string field against [`MAX_STRING_LEN`].
pub fn check_string_len(field: &str, value: &str) -> Result<(), String> {
    if value.len() > MAX_STRING_LEN {
        return Err(format!(
            "field `{field}` is {} bytes (max {MAX_STRING_LEN})",
            value.len()
        ));
    }
    Ok(())
}

/// Prefix a payload with its big-endian `u32` length.
pub fn frame_encode(payload: &[u8]) -> GmsResult<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .map_err(|_| GmsError::Encode(format!("payload too large: {} bytes", payload.len())))?;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Write one length-prefixed packet and flush.
pub async fn write_packet<W>(writer: &mut W, payload: &[u8]) -> GmsResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = frame_encode(payload)?;
    writer
        .write_all(&frame)
        .await
        .map_err(|e| GmsError::Transport(format!("write failed: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| GmsError::Transport(format!("flush failed: {e}")))
}

/// Read one length-prefixed packet.
///
/// Returns `None` when the stream ends cleanly before a new length prefix.
/// A stream that ends partway through the prefix is a transport error.
pub async fn read_packet<R>(reader: &mut R, max_len: usize) -> GmsResult<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader
            .read(&mut len_buf[filled..])
            .await
            .map_err(|e| GmsError::Transport(format!("read length failed: {e}")))?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(GmsError::Transport(format!(
                "stream ended after {filled} of 4 length bytes"
            )));
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_len {
        return Err(GmsError::Decode(format!(
            "packet too large: {len} bytes (max {max_len})"
        )));
    }

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| GmsError::Transport(format!("read payload failed: {e}")))?;

    Ok(Some(buf))
}
