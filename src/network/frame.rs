//! Wire framing.
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │ SIGNATURE: [u8; 4] = "CGRD"                │
//! ├────────────────────────────────────────────┤
//! │ MAGIC: u16                                 │
//! ├────────────────────────────────────────────┤
//! │ VERSION: u8                                │
//! ├────────────────────────────────────────────┤
//! │ PAYLOAD_TYPE: u8                           │
//! │   1 = handshake                            │
//! │   2 = message                              │
//! │   3 = message, LZ4 compressed              │
//! ├────────────────────────────────────────────┤
//! │ PAYLOAD_LEN: u32                           │
//! ├────────────────────────────────────────────┤
//! │ PAYLOAD                                    │
//! ├────────────────────────────────────────────┤
//! │ CRC32: u32 (header + payload)              │
//! └────────────────────────────────────────────┘
//! ```
//!
//! All integers are big-endian. The same frame is used on TCP streams and
//! as a single UDP datagram.

use crate::error::NetworkError;
use bytes::{BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_32_ISCSI};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame signature.
pub const SIGNATURE: [u8; 4] = *b"CGRD";

/// Magic number following the signature.
pub const MAGIC: u16 = 0xCA5E;

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: u8 = 1;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 12;

/// Trailing checksum size in bytes.
pub const TRAILER_SIZE: usize = 4;

/// Message payloads larger than this are compressed when it pays off.
pub const COMPRESSION_THRESHOLD: usize = 1024;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// What the payload of a frame holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadType {
    Handshake,
    Message,
    CompressedMessage,
}

impl PayloadType {
    fn to_u8(self) -> u8 {
        match self {
            PayloadType::Handshake => 1,
            PayloadType::Message => 2,
            PayloadType::CompressedMessage => 3,
        }
    }

    fn from_u8(value: u8) -> Result<Self, NetworkError> {
        match value {
            1 => Ok(PayloadType::Handshake),
            2 => Ok(PayloadType::Message),
            3 => Ok(PayloadType::CompressedMessage),
            other => Err(NetworkError::MalformedFrame(format!(
                "unknown payload type {other}"
            ))),
        }
    }
}

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub payload_type: PayloadType,
    pub payload_len: usize,
}

impl FrameHeader {
    /// Size of the frame this header starts, checksum included.
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.payload_len + TRAILER_SIZE
    }
}

/// A decoded frame. Compressed payloads are already inflated, so
/// `payload_type` is never [`PayloadType::CompressedMessage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload_type: PayloadType,
    pub payload: Bytes,
}

/// Encode a payload into a frame of at most `max_frame_size` bytes.
pub fn encode_frame(
    payload_type: PayloadType,
    payload: &[u8],
    max_frame_size: usize,
) -> Result<Bytes, NetworkError> {
    let compressed;
    let (payload_type, body) =
        if payload_type == PayloadType::Message && payload.len() > COMPRESSION_THRESHOLD {
            compressed = lz4_flex::compress_prepend_size(payload);
            if compressed.len() < payload.len() {
                (PayloadType::CompressedMessage, compressed.as_slice())
            } else {
                (payload_type, payload)
            }
        } else {
            (payload_type, payload)
        };

    let frame_len = HEADER_SIZE + body.len() + TRAILER_SIZE;
    if frame_len > max_frame_size {
        return Err(NetworkError::FrameTooLarge {
            size: frame_len,
            max: max_frame_size,
        });
    }
    let payload_len = u32::try_from(body.len()).map_err(|_| NetworkError::FrameTooLarge {
        size: frame_len,
        max: max_frame_size,
    })?;

    let mut buf = BytesMut::with_capacity(frame_len);
    buf.put_slice(&SIGNATURE);
    buf.put_u16(MAGIC);
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u8(payload_type.to_u8());
    buf.put_u32(payload_len);
    buf.put_slice(body);
    let crc = CRC32.checksum(&buf);
    buf.put_u32(crc);

    Ok(buf.freeze())
}

/// Validate and parse the first [`HEADER_SIZE`] bytes of a frame.
pub fn decode_header(buf: &[u8]) -> Result<FrameHeader, NetworkError> {
    if buf.len() < HEADER_SIZE {
        return Err(NetworkError::MalformedFrame("header too short".into()));
    }
    if buf[0..4] != SIGNATURE {
        return Err(NetworkError::MalformedFrame("bad signature".into()));
    }
    let magic = u16::from_be_bytes([buf[4], buf[5]]);
    if magic != MAGIC {
        return Err(NetworkError::MalformedFrame(format!("bad magic {magic:#06x}")));
    }
    let version = buf[6];
    if version != PROTOCOL_VERSION {
        return Err(NetworkError::ProtocolMismatch(format!(
            "protocol version {version}, expected {PROTOCOL_VERSION}"
        )));
    }
    let payload_type = PayloadType::from_u8(buf[7])?;
    let payload_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;

    Ok(FrameHeader {
        version,
        payload_type,
        payload_len,
    })
}

/// Decode one complete frame.
pub fn decode_frame(buf: &[u8], max_frame_size: usize) -> Result<Frame, NetworkError> {
    let header = decode_header(buf)?;
    let frame_len = header.frame_len();
    if frame_len > max_frame_size {
        return Err(NetworkError::FrameTooLarge {
            size: frame_len,
            max: max_frame_size,
        });
    }
    if buf.len() != frame_len {
        return Err(NetworkError::MalformedFrame(format!(
            "frame is {} bytes, header says {frame_len}",
            buf.len()
        )));
    }

    let crc_offset = frame_len - TRAILER_SIZE;
    let stored = u32::from_be_bytes([
        buf[crc_offset],
        buf[crc_offset + 1],
        buf[crc_offset + 2],
        buf[crc_offset + 3],
    ]);
    let computed = CRC32.checksum(&buf[..crc_offset]);
    if stored != computed {
        return Err(NetworkError::MalformedFrame(format!(
            "checksum mismatch: expected {stored:#010x}, got {computed:#010x}"
        )));
    }

    let body = &buf[HEADER_SIZE..crc_offset];
    match header.payload_type {
        PayloadType::CompressedMessage => {
            // The sender states the inflated size; never allocate past the frame limit.
            let declared = match body.get(..4) {
                Some(prefix) => u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize,
                None => return Err(NetworkError::MalformedFrame("compressed payload too short".into())),
            };
            if declared > max_frame_size {
                return Err(NetworkError::FrameTooLarge {
                    size: declared,
                    max: max_frame_size,
                });
            }
            let inflated = lz4_flex::decompress_size_prepended(body)
                .map_err(|e| NetworkError::MalformedFrame(format!("decompression failed: {e}")))?;
            Ok(Frame {
                payload_type: PayloadType::Message,
                payload: Bytes::from(inflated),
            })
        }
        payload_type => Ok(Frame {
            payload_type,
            payload: Bytes::copy_from_slice(body),
        }),
    }
}

/// Read one frame from a stream. Returns `None` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> Result<Option<Frame>, NetworkError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(NetworkError::Io(e)),
    }

    let parsed = decode_header(&header)?;
    let frame_len = parsed.frame_len();
    if frame_len > max_frame_size {
        return Err(NetworkError::FrameTooLarge {
            size: frame_len,
            max: max_frame_size,
        });
    }

    let mut buf = vec![0u8; frame_len];
    buf[..HEADER_SIZE].copy_from_slice(&header);
    reader.read_exact(&mut buf[HEADER_SIZE..]).await?;

    decode_frame(&buf, max_frame_size).map(Some)
}

/// Write an encoded frame and flush.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<(), NetworkError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 16 * 1024 * 1024;

    #[test]
    fn test_small_payload_is_not_compressed() {
        let frame = encode_frame(PayloadType::Message, b"hello", MAX).unwrap();
        assert_eq!(frame.len(), HEADER_SIZE + 5 + TRAILER_SIZE);

        let header = decode_header(&frame).unwrap();
        assert_eq!(header.payload_type, PayloadType::Message);
        assert_eq!(header.payload_len, 5);

        let decoded = decode_frame(&frame, MAX).unwrap();
        assert_eq!(decoded.payload, Bytes::from_static(b"hello"));
    }

    #[test]
    fn test_large_payload_is_compressed() {
        let payload = vec![7u8; 64 * 1024];
        let frame = encode_frame(PayloadType::Message, &payload, MAX).unwrap();
        assert!(frame.len() < payload.len());
        assert_eq!(
            decode_header(&frame).unwrap().payload_type,
            PayloadType::CompressedMessage
        );

        let decoded = decode_frame(&frame, MAX).unwrap();
        assert_eq!(decoded.payload_type, PayloadType::Message);
        assert_eq!(decoded.payload.as_ref(), payload.as_slice());
    }

    #[test]
    fn test_handshake_is_never_compressed() {
        let payload = vec![0u8; 4096];
        let frame = encode_frame(PayloadType::Handshake, &payload, MAX).unwrap();
        assert_eq!(decode_header(&frame).unwrap().payload_type, PayloadType::Handshake);
    }

    #[test]
    fn test_rejects_corruption() {
        let frame = encode_frame(PayloadType::Message, b"payload", MAX).unwrap();

        let mut flipped = frame.to_vec();
        flipped[HEADER_SIZE] ^= 0xff;
        assert!(matches!(
            decode_frame(&flipped, MAX),
            Err(NetworkError::MalformedFrame(_))
        ));

        let mut bad_signature = frame.to_vec();
        bad_signature[0] = b'X';
        assert!(matches!(
            decode_header(&bad_signature),
            Err(NetworkError::MalformedFrame(_))
        ));

        let mut bad_version = frame.to_vec();
        bad_version[6] = PROTOCOL_VERSION + 1;
        assert!(matches!(
            decode_header(&bad_version),
            Err(NetworkError::ProtocolMismatch(_))
        ));

        assert!(decode_frame(&frame[..frame.len() - 1], MAX).is_err());
    }

    #[test]
    fn test_frame_size_limit() {
        let payload = vec![1u8; 2000];
        let result = encode_frame(PayloadType::Handshake, &payload, 1460);
        assert!(matches!(result, Err(NetworkError::FrameTooLarge { max: 1460, .. })));
    }

    #[test]
    fn test_rejects_forged_inflated_size() {
        let payload = vec![7u8; 64 * 1024];
        let frame = encode_frame(PayloadType::Message, &payload, MAX).unwrap();
        assert_eq!(decode_header(&frame).unwrap().payload_type, PayloadType::CompressedMessage);

        // Claim a 3 GB payload and fix up the checksum.
        let mut forged = frame.to_vec();
        forged[HEADER_SIZE..HEADER_SIZE + 4].copy_from_slice(&(3u32 << 30).to_le_bytes());
        let crc_offset = forged.len() - TRAILER_SIZE;
        let crc = CRC32.checksum(&forged[..crc_offset]);
        forged[crc_offset..].copy_from_slice(&crc.to_be_bytes());

        assert!(matches!(
            decode_frame(&forged, MAX),
            Err(NetworkError::FrameTooLarge { max: MAX, .. })
        ));
    }

    #[tokio::test]
    async fn test_stream_read_write() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let first = encode_frame(PayloadType::Handshake, b"hi", MAX).unwrap();
        let second = encode_frame(PayloadType::Message, b"there", MAX).unwrap();

        write_frame(&mut client, &first).await.unwrap();
        write_frame(&mut client, &second).await.unwrap();
        drop(client);

        let a = read_frame(&mut server, MAX).await.unwrap().unwrap();
        let b = read_frame(&mut server, MAX).await.unwrap().unwrap();
        assert_eq!(a.payload_type, PayloadType::Handshake);
        assert_eq!(b.payload, Bytes::from_static(b"there"));
        assert!(read_frame(&mut server, MAX).await.unwrap().is_none());
    }
}
