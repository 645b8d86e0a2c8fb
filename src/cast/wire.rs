//! Length-prefixed frame I/O for the Cast v2 protocol.
//!
//! Every message on the wire is a 4-byte big-endian length `N` followed by
//! `N` bytes of a protobuf-encoded [`CastMessage`]. Short reads are errors;
//! `AsyncReadExt::read_exact` already surfaces those as `UnexpectedEof`.

use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::proto::CastMessage;
use crate::error::{CastforgeError, Result};

/// Upper bound on a single frame's payload size. Not specified by the
/// protocol itself; a sane ambient limit against a malicious or buggy peer.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

pub const PROTOCOL_CASTV2_1_0: i32 = 0;
pub const PAYLOAD_STRING: i32 = 0;
pub const PAYLOAD_BINARY: i32 = 1;
pub const HASH_SHA1: i32 = 0;
pub const HASH_SHA256: i32 = 1;
pub const SIG_PKCS1V15: i32 = 0;
pub const SIG_PSS: i32 = 1;

/// Read one length-prefixed `CastMessage` frame.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<CastMessage> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(CastforgeError::Format(format!(
            "frame length {len} exceeds maximum {MAX_FRAME_SIZE}"
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    CastMessage::decode(payload.as_slice())
        .map_err(|e| CastforgeError::Format(format!("failed to decode CastMessage: {e}")))
}

/// Write one length-prefixed `CastMessage` frame.
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, msg: &CastMessage) -> Result<()> {
    let mut buf = Vec::with_capacity(msg.encoded_len());
    msg.encode(&mut buf)
        .map_err(|e| CastforgeError::Format(format!("failed to encode CastMessage: {e}")))?;

    if buf.len() > MAX_FRAME_SIZE {
        return Err(CastforgeError::Format(format!(
            "encoded frame {} exceeds maximum {MAX_FRAME_SIZE}",
            buf.len()
        )));
    }

    writer.write_all(&(buf.len() as u32).to_be_bytes()).await?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Build a JSON (`STRING` payload type) `CastMessage`.
pub fn json_message(source_id: &str, destination_id: &str, namespace: &str, json: &str) -> CastMessage {
    CastMessage {
        protocol_version: PROTOCOL_CASTV2_1_0,
        source_id: source_id.to_string(),
        destination_id: destination_id.to_string(),
        namespace: namespace.to_string(),
        payload_type: PAYLOAD_STRING,
        payload_utf8: Some(json.to_string()),
        payload_binary: None,
    }
}

/// Build a binary `CastMessage`.
pub fn binary_message(source_id: &str, destination_id: &str, namespace: &str, payload: Vec<u8>) -> CastMessage {
    CastMessage {
        protocol_version: PROTOCOL_CASTV2_1_0,
        source_id: source_id.to_string(),
        destination_id: destination_id.to_string(),
        namespace: namespace.to_string(),
        payload_type: PAYLOAD_BINARY,
        payload_utf8: None,
        payload_binary: Some(payload),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trips() {
        let original = json_message("receiver-0", "*", "urn:x-cast:com.google.cast.tp.heartbeat", r#"{"type":"PONG"}"#);

        let (mut a, mut b) = tokio::io::duplex(8192);
        write_message(&mut a, &original).await.unwrap();
        let decoded = read_message(&mut b).await.unwrap();

        assert_eq!(decoded, original);
    }

    #[tokio::test]
    async fn oversized_frame_rejected_on_read() {
        let (mut a, mut b) = tokio::io::duplex(16);
        let too_big = (MAX_FRAME_SIZE as u32 + 1).to_be_bytes();
        a.write_all(&too_big).await.unwrap();
        drop(a);

        let result = read_message(&mut b).await;
        assert!(matches!(result, Err(CastforgeError::Format(_))));
    }

    #[tokio::test]
    async fn short_read_is_an_error() {
        let (mut a, mut b) = tokio::io::duplex(16);
        a.write_all(&[0, 0, 0, 10]).await.unwrap();
        drop(a);

        let result = read_message(&mut b).await;
        assert!(result.is_err());
    }
}
