//! Shared-secret identity proof exchanged when a connection opens.
//!
//! The initiator sends a `HANDSHAKE` frame whose payload is
//! `"<identity>:<hex(sha256(identity-decimal ++ secret))>"`. The acceptor
//! recomputes the digest with its own secret and, on a match, answers with an
//! empty `HANDSHAKE` frame. Anything else ends the attempt without a reply.

use super::frame::{Flags, Frame};
use super::protocol::FrameCodec;
use crate::{IpcError, Result};
use bytes::BytesMut;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncWrite};

/// Hex digest proving knowledge of `secret` for `identity`.
pub fn digest(identity: u64, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identity.to_string().as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Fill `dest` with the initiator's handshake request.
pub fn build_request(identity: u64, secret: &str, dest: &mut Frame) {
    dest.reset();
    dest.flags.insert(Flags::HANDSHAKE);
    dest.payload
        .extend_from_slice(format!("{}:{}", identity, digest(identity, secret)).as_bytes());
}

/// Check a handshake request against our secret.
///
/// Returns the declared identity when the frame is flagged as a handshake,
/// parses as `<identity>:<digest>` and the digest matches.
pub fn verify_request(frame: &Frame, secret: &str) -> Option<u64> {
    if !frame.is_handshake() {
        return None;
    }
    let text = std::str::from_utf8(&frame.payload).ok()?;
    let (id, proof) = text.split_once(':')?;
    let identity: u64 = id.parse().ok()?;
    // Reject non-canonical spellings such as "+12" or "012".
    if identity.to_string() != id {
        return None;
    }
    (digest(identity, secret) == proof).then_some(identity)
}

/// Run the initiator side: send the proof and wait for the acceptor's reply.
pub async fn initiate<R, W>(
    codec: &FrameCodec,
    reader: &mut R,
    writer: &mut W,
    frame: &mut Frame,
    identity: u64,
    secret: &str,
    reply_timeout: Duration,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    build_request(identity, secret, frame);
    let mut scratch = BytesMut::new();
    codec.write_frame(writer, frame, &mut scratch).await?;

    tokio::time::timeout(reply_timeout, codec.read_frame(reader, frame))
        .await
        .map_err(|_| IpcError::HandshakeFailed {
            reason: format!("no reply within {:?}", reply_timeout),
        })??;

    if !frame.is_handshake() {
        return Err(IpcError::HandshakeFailed {
            reason: "reply is not a handshake frame".to_string(),
        });
    }
    Ok(())
}

/// Read and verify the initiator's request within `wait`.
///
/// Returns the proven identity. Nothing is written, so the caller decides
/// when to confirm with [`reply`].
pub async fn read_request<R>(
    codec: &FrameCodec,
    reader: &mut R,
    frame: &mut Frame,
    secret: &str,
    wait: Duration,
) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    tokio::time::timeout(wait, codec.read_frame(reader, frame))
        .await
        .map_err(|_| IpcError::HandshakeFailed {
            reason: format!("no handshake within {:?}", wait),
        })??;

    verify_request(frame, secret).ok_or_else(|| IpcError::HandshakeFailed {
        reason: "invalid identity proof".to_string(),
    })
}

/// Confirm an accepted handshake with an empty `HANDSHAKE` frame.
pub async fn reply<W>(codec: &FrameCodec, writer: &mut W, frame: &mut Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    frame.reset();
    frame.flags.insert(Flags::HANDSHAKE);
    let mut scratch = BytesMut::new();
    codec.write_frame(writer, frame, &mut scratch).await
}

/// Run the whole acceptor side and return the verified peer identity.
///
/// A rejected or late request gets no reply.
pub async fn accept<R, W>(
    codec: &FrameCodec,
    reader: &mut R,
    writer: &mut W,
    frame: &mut Frame,
    secret: &str,
    wait: Duration,
) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let identity = read_request(codec, reader, frame, secret, wait).await?;
    reply(codec, writer, frame).await?;
    Ok(identity)
}
