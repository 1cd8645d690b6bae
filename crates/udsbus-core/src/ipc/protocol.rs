//! Wire codec.
//!
//! Frame format:
//!
//! ```text
//! [u8 flags][event name bytes][0x00][u16 BE len | u64 BE len][payload of len]
//! ```
//!
//! The 8-byte length field is used (and `LONG_LENGTH` set) only when the
//! payload on the wire exceeds 65535 bytes. With compression enabled, payloads
//! above the threshold are gzipped, `COMPRESSED` is set and the length field
//! carries the compressed size.
//!
//! `Frame` values handled by callers are always logical frames: the payload
//! is uncompressed and the transport flags (`COMPRESSED`, `LONG_LENGTH`) are
//! computed on encode and stripped on decode.

use super::frame::{Flags, Frame};
use crate::config::{IpcConfig, IpcOptions};
use crate::{IpcError, Result};
use bytes::{BufMut, BytesMut};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Flags that describe the encoding rather than the frame itself.
const TRANSPORT_FLAGS: Flags = Flags::from_bits(Flags::COMPRESSED.bits() | Flags::LONG_LENGTH.bits());

/// Encoder/decoder for frames, parameterized by compression and size limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    compression_threshold: Option<usize>,
    max_payload: u64,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(None, IpcConfig::MAX_PAYLOAD_SIZE)
    }
}

impl FrameCodec {
    pub fn new(compression_threshold: Option<usize>, max_payload: u64) -> Self {
        Self {
            compression_threshold,
            max_payload,
        }
    }

    pub fn from_options(opts: &IpcOptions) -> Self {
        Self::new(opts.compression(), opts.max_payload_size)
    }

    /// Append the wire form of `frame` to `out`.
    pub fn encode(&self, frame: &Frame, out: &mut BytesMut) -> Result<()> {
        let name = frame.event.as_bytes();
        if name.contains(&0) {
            return Err(IpcError::PacketEncodeFailed {
                message: format!("event name {:?} contains a NUL byte", frame.event),
            });
        }
        if name.len() > IpcConfig::MAX_EVENT_NAME_LEN {
            return Err(IpcError::PacketEncodeFailed {
                message: format!(
                    "event name is {} bytes, limit is {}",
                    name.len(),
                    IpcConfig::MAX_EVENT_NAME_LEN
                ),
            });
        }

        let mut flags = frame.flags;
        flags.remove(TRANSPORT_FLAGS);

        let compressed;
        let body: &[u8] = match self.compression_threshold {
            Some(threshold) if frame.payload.len() > threshold => {
                compressed = gzip(&frame.payload)?;
                flags.insert(Flags::COMPRESSED);
                &compressed
            }
            _ => &frame.payload,
        };

        if body.len() as u64 > self.max_payload {
            return Err(IpcError::MessageTooLarge {
                size: body.len() as u64,
                limit: self.max_payload,
            });
        }

        let long = body.len() > IpcConfig::SHORT_LENGTH_MAX;
        flags.set(Flags::LONG_LENGTH, long);

        out.reserve(1 + name.len() + 1 + if long { 8 } else { 2 } + body.len());
        out.put_u8(flags.bits());
        out.put_slice(name);
        out.put_u8(0);
        if long {
            out.put_u64(body.len() as u64);
        } else {
            out.put_u16(body.len() as u16);
        }
        out.put_slice(body);
        Ok(())
    }

    /// Encode `frame` into `scratch` and write it out, ending with a flush.
    pub async fn write_frame<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        frame: &Frame,
        scratch: &mut BytesMut,
    ) -> Result<()> {
        scratch.clear();
        self.encode(frame, scratch)?;
        write_encoded(writer, scratch).await
    }

    /// Read one frame into `dest`, which is reset first.
    ///
    /// Short reads are looped over until the declared payload length has been
    /// consumed. A compressed payload is inflated before returning.
    pub async fn read_frame<R: AsyncBufRead + Unpin>(
        &self,
        reader: &mut R,
        dest: &mut Frame,
    ) -> Result<()> {
        dest.reset();

        let mut flags = Flags::from_bits(reader.read_u8().await.map_err(IpcError::read)?);

        let mut name = std::mem::take(&mut dest.event).into_bytes();
        let limit = (IpcConfig::MAX_EVENT_NAME_LEN + 1) as u64;
        let mut bounded = AsyncReadExt::take(&mut *reader, limit);
        bounded
            .read_until(0, &mut name)
            .await
            .map_err(IpcError::read)?;
        match name.last() {
            Some(0) => {
                name.pop();
            }
            _ if name.len() as u64 >= limit => {
                return Err(IpcError::MalformedFrame {
                    message: format!(
                        "event name exceeds {} bytes",
                        IpcConfig::MAX_EVENT_NAME_LEN
                    ),
                });
            }
            _ => {
                return Err(IpcError::read(std::io::Error::from(
                    std::io::ErrorKind::UnexpectedEof,
                )));
            }
        }
        dest.event = String::from_utf8(name).map_err(|_| IpcError::MalformedFrame {
            message: "event name is not valid UTF-8".to_string(),
        })?;

        let declared = if flags.contains(Flags::LONG_LENGTH) {
            reader.read_u64().await.map_err(IpcError::read)?
        } else {
            u64::from(reader.read_u16().await.map_err(IpcError::read)?)
        };
        let len = usize::try_from(declared)
            .ok()
            .filter(|_| declared <= self.max_payload)
            .ok_or(IpcError::MessageTooLarge {
                size: declared,
                limit: self.max_payload,
            })?;

        dest.payload.reserve(len.min(IpcConfig::IO_BUFFER_SIZE * 16));
        let mut remaining = len;
        while remaining > 0 {
            let chunk = reader.fill_buf().await.map_err(IpcError::read)?;
            if chunk.is_empty() {
                return Err(IpcError::read(std::io::Error::from(
                    std::io::ErrorKind::UnexpectedEof,
                )));
            }
            let n = chunk.len().min(remaining);
            dest.payload.extend_from_slice(&chunk[..n]);
            reader.consume(n);
            remaining -= n;
        }

        if flags.contains(Flags::COMPRESSED) {
            let inflated = gunzip(&dest.payload, self.max_payload)?;
            dest.payload.clear();
            dest.payload.extend_from_slice(&inflated);
        }

        flags.remove(TRANSPORT_FLAGS);
        dest.flags = flags;
        Ok(())
    }
}

/// Write pre-encoded frame bytes and flush.
pub async fn write_encoded<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    writer.write_all(bytes).await.map_err(IpcError::write)?;
    writer.flush().await.map_err(IpcError::write)?;
    Ok(())
}

fn gzip(payload: &[u8]) -> Result<Vec<u8>> {
    let failed = |e: std::io::Error| IpcError::PacketEncodeFailed {
        message: format!("gzip failed: {}", e),
    };
    let mut encoder = GzEncoder::new(Vec::with_capacity(payload.len() / 2), Compression::default());
    encoder.write_all(payload).map_err(failed)?;
    encoder.finish().map_err(failed)
}

fn gunzip(payload: &[u8], max: u64) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(payload.len() * 2);
    Read::take(GzDecoder::new(payload), max.saturating_add(1))
        .read_to_end(&mut out)
        .map_err(|e| IpcError::MalformedFrame {
            message: format!("invalid gzip payload: {}", e),
        })?;
    if out.len() as u64 > max {
        return Err(IpcError::MessageTooLarge {
            size: out.len() as u64,
            limit: max,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::BufReader;

    async fn roundtrip(codec: &FrameCodec, frame: &Frame) -> (BytesMut, Frame) {
        let mut wire = BytesMut::new();
        codec.encode(frame, &mut wire).unwrap();

        let mut reader = std::io::Cursor::new(wire.to_vec());
        let mut decoded = Frame::new();
        codec.read_frame(&mut reader, &mut decoded).await.unwrap();
        (wire, decoded)
    }

    fn random_payload(len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        rand::rng().fill_bytes(&mut buf);
        buf
    }

    #[test]
    fn test_exact_wire_layout() {
        let codec = FrameCodec::default();
        let mut wire = BytesMut::new();
        codec.encode(&Frame::message("ab", b"xyz"), &mut wire).unwrap();
        assert_eq!(&wire[..], &[0x00, b'a', b'b', 0x00, 0x00, 0x03, b'x', b'y', b'z']);
    }

    #[test]
    fn test_ping_encodes_to_four_bytes() {
        let codec = FrameCodec::default();
        let mut wire = BytesMut::new();
        codec.encode(&Frame::ping(), &mut wire).unwrap();
        assert_eq!(&wire[..], &[Flags::PING.bits(), 0x00, 0x00, 0x00]);
    }

    #[tokio::test]
    async fn test_roundtrip_small_frame() {
        let codec = FrameCodec::default();
        let mut frame = Frame::message("app::Chat", b"hello world");
        frame.flags.insert(Flags::SELF_RECEIVE);

        let (_, decoded) = roundtrip(&codec, &frame).await;
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn test_length_field_boundary() {
        let codec = FrameCodec::default();

        let at_limit = Frame::message("e", &random_payload(65535));
        let (wire, decoded) = roundtrip(&codec, &at_limit).await;
        assert!(!Flags::from_bits(wire[0]).contains(Flags::LONG_LENGTH));
        assert_eq!(&wire[2..5], &[0x00, 0xFF, 0xFF]);
        assert_eq!(wire.len(), 1 + 2 + 2 + 65535);
        assert_eq!(decoded, at_limit);

        let over_limit = Frame::message("e", &random_payload(65536));
        let (wire, decoded) = roundtrip(&codec, &over_limit).await;
        assert!(Flags::from_bits(wire[0]).contains(Flags::LONG_LENGTH));
        assert_eq!(&wire[3..11], &65536u64.to_be_bytes());
        assert_eq!(wire.len(), 1 + 2 + 8 + 65536);
        assert_eq!(decoded, over_limit);
    }

    #[tokio::test]
    async fn test_compression_shrinks_length_field() {
        let codec = FrameCodec::new(Some(1024), IpcConfig::MAX_PAYLOAD_SIZE);
        let frame = Frame::message("bulk", &vec![b'a'; 70_000]);

        let (wire, decoded) = roundtrip(&codec, &frame).await;
        let flags = Flags::from_bits(wire[0]);
        assert!(flags.contains(Flags::COMPRESSED));
        assert!(!flags.contains(Flags::LONG_LENGTH));
        assert!(wire.len() < 70_000);
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn test_incompressible_payload_keeps_long_length() {
        let codec = FrameCodec::new(Some(1024), IpcConfig::MAX_PAYLOAD_SIZE);
        let frame = Frame::message("noise", &random_payload(70_000));

        let (wire, decoded) = roundtrip(&codec, &frame).await;
        let flags = Flags::from_bits(wire[0]);
        assert!(flags.contains(Flags::COMPRESSED));
        assert!(flags.contains(Flags::LONG_LENGTH));
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn test_payload_below_threshold_is_not_compressed() {
        let codec = FrameCodec::new(Some(1024), IpcConfig::MAX_PAYLOAD_SIZE);
        let frame = Frame::message("small", &[7u8; 1024]);

        let (wire, decoded) = roundtrip(&codec, &frame).await;
        assert!(!Flags::from_bits(wire[0]).contains(Flags::COMPRESSED));
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn test_decode_loops_over_short_reads() {
        let codec = FrameCodec::default();
        let frame = Frame::message("trickle", &random_payload(3000));
        let mut wire = BytesMut::new();
        codec.encode(&frame, &mut wire).unwrap();

        let mut reader = BufReader::with_capacity(1, std::io::Cursor::new(wire.to_vec()));
        let mut decoded = Frame::new();
        codec.read_frame(&mut reader, &mut decoded).await.unwrap();
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn test_consecutive_frames_on_one_stream() {
        let codec = FrameCodec::default();
        let mut wire = BytesMut::new();
        codec.encode(&Frame::message("one", b"1"), &mut wire).unwrap();
        codec.encode(&Frame::ping(), &mut wire).unwrap();
        codec.encode(&Frame::message("two", b"22"), &mut wire).unwrap();

        let mut reader = std::io::Cursor::new(wire.to_vec());
        let mut frame = Frame::new();
        codec.read_frame(&mut reader, &mut frame).await.unwrap();
        assert_eq!(frame.event, "one");
        codec.read_frame(&mut reader, &mut frame).await.unwrap();
        assert!(frame.is_ping());
        assert!(frame.event.is_empty());
        codec.read_frame(&mut reader, &mut frame).await.unwrap();
        assert_eq!(frame.event, "two");
        assert_eq!(&frame.payload[..], b"22");
    }

    #[tokio::test]
    async fn test_declared_length_over_limit_is_rejected() {
        let codec = FrameCodec::new(None, 1024);
        let mut wire = vec![Flags::LONG_LENGTH.bits(), b'x', 0];
        wire.extend_from_slice(&u64::MAX.to_be_bytes());

        let mut reader = std::io::Cursor::new(wire);
        let mut frame = Frame::new();
        let result = codec.read_frame(&mut reader, &mut frame).await;
        assert!(matches!(result, Err(IpcError::MessageTooLarge { .. })));
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let codec = FrameCodec::new(None, 16);
        let mut wire = BytesMut::new();
        let result = codec.encode(&Frame::message("e", &[0u8; 17]), &mut wire);
        assert!(matches!(result, Err(IpcError::MessageTooLarge { size: 17, limit: 16 })));
    }

    #[test]
    fn test_encode_rejects_nul_in_event_name() {
        let codec = FrameCodec::default();
        let mut wire = BytesMut::new();
        let result = codec.encode(&Frame::message("bad\0name", b""), &mut wire);
        assert!(matches!(result, Err(IpcError::PacketEncodeFailed { .. })));
        assert!(wire.is_empty());
    }

    #[tokio::test]
    async fn test_truncated_payload_is_read_error() {
        let codec = FrameCodec::default();
        let mut wire = BytesMut::new();
        codec.encode(&Frame::message("cut", &[1u8; 100]), &mut wire).unwrap();
        wire.truncate(50);

        let mut reader = std::io::Cursor::new(wire.to_vec());
        let mut frame = Frame::new();
        let result = codec.read_frame(&mut reader, &mut frame).await;
        assert!(matches!(result, Err(IpcError::ConnectionReadFailed { .. })));
    }

    #[tokio::test]
    async fn test_unterminated_event_name_is_malformed() {
        let codec = FrameCodec::default();
        let mut wire = vec![0u8];
        wire.extend(std::iter::repeat(b'n').take(IpcConfig::MAX_EVENT_NAME_LEN + 10));

        let mut reader = std::io::Cursor::new(wire);
        let mut frame = Frame::new();
        let result = codec.read_frame(&mut reader, &mut frame).await;
        assert!(matches!(result, Err(IpcError::MalformedFrame { .. })));
    }

    #[tokio::test]
    async fn test_read_resets_destination() {
        let codec = FrameCodec::default();
        let mut wire = BytesMut::new();
        codec.encode(&Frame::ping(), &mut wire).unwrap();

        let mut dest = Frame::message("stale", b"leftover bytes");
        dest.flags.insert(Flags::SELF_RECEIVE);
        let mut reader = std::io::Cursor::new(wire.to_vec());
        codec.read_frame(&mut reader, &mut dest).await.unwrap();
        assert_eq!(dest, Frame::ping());
    }

    struct FailingFlush(Vec<u8>);

    impl AsyncWrite for FailingFlush {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            self.0.extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe)))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_failed_flush_is_write_error() {
        let codec = FrameCodec::default();
        let mut writer = FailingFlush(Vec::new());
        let mut scratch = BytesMut::new();
        let result = codec
            .write_frame(&mut writer, &Frame::message("e", b"data"), &mut scratch)
            .await;
        assert!(matches!(result, Err(IpcError::ConnectionWriteFailed { .. })));
        assert!(!writer.0.is_empty());
    }
}
