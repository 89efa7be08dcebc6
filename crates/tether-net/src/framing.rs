//! Length-prefixed framing for TCP streams.
//!
//! Every message on the wire is a frame made of a variable-width length header
//! followed by the payload:
//!
//! ```text
//! short:  +-----------------+-------------------+
//!         | len (1 byte)    |   payload         |
//!         | 0..=254         |   (len bytes)     |
//!         +-----------------+-------------------+
//!
//! long:   +------+--------------------+-------------------+
//!         | 0xFF | len (4 bytes)      |   payload         |
//!         |      | i32 little-endian  |   (len bytes)     |
//!         +------+--------------------+-------------------+
//! ```
//!
//! Payloads shorter than 255 bytes use the single-byte header, everything else
//! uses the sentinel byte followed by the exact length. The length never
//! includes the header bytes. A length of 0 is a valid empty frame.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Maximum payload size of a single frame: 128 MiB.
pub const MAX_MESSAGE_LENGTH: usize = 128 * 1024 * 1024;

/// Header byte announcing that a 4-byte length follows.
pub const LONG_LENGTH_SENTINEL: u8 = 255;

/// Number of bytes in the extended length field.
pub const LONG_LENGTH_BYTES: usize = std::mem::size_of::<i32>();

/// Errors that can occur during framing operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// An outgoing payload cannot be represented in a frame.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// The actual payload size.
        size: usize,
        /// The enforced maximum.
        max: usize,
    },

    /// An incoming header declared a payload larger than the maximum. The
    /// stream cannot be resynchronized after this.
    #[error("declared message length {size} exceeds maximum {max}")]
    MessageTooLarge {
        /// The declared payload size.
        size: usize,
        /// The enforced maximum.
        max: usize,
    },

    /// An incoming extended header carried a negative length.
    #[error("declared message length {0} is negative")]
    NegativeLength(i32),

    /// An earlier framing error left the stream without a frame boundary.
    #[error("stream is corrupt after an earlier framing error")]
    StreamCorrupted,

    /// The sentinel byte was seen without the 4-byte length behind it.
    #[error("length header is truncated")]
    TruncatedHeader,

    /// The connection was closed before a complete frame was received.
    #[error("connection closed")]
    ConnectionClosed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Total header size announced by the first header byte.
pub fn header_len(first_byte: u8) -> usize {
    if first_byte == LONG_LENGTH_SENTINEL {
        1 + LONG_LENGTH_BYTES
    } else {
        1
    }
}

/// Append the length header for a payload of `len` bytes to `out`.
///
/// Lengths of 2^31 and above cannot be carried by the signed 32-bit field and
/// are rejected like any other oversized payload.
pub fn write_length_header(out: &mut Vec<u8>, len: usize) -> Result<(), FrameError> {
    if len > MAX_MESSAGE_LENGTH || len > i32::MAX as usize {
        return Err(FrameError::PayloadTooLarge {
            size: len,
            max: MAX_MESSAGE_LENGTH,
        });
    }

    if len < LONG_LENGTH_SENTINEL as usize {
        out.push(len as u8);
    } else {
        out.push(LONG_LENGTH_SENTINEL);
        out.extend_from_slice(&(len as i32).to_le_bytes());
    }
    Ok(())
}

/// Decode a payload length from the first header byte and, for long headers,
/// the 4 bytes that follow it.
pub fn decode_length(
    first_byte: u8,
    long_length: Option<[u8; LONG_LENGTH_BYTES]>,
) -> Result<usize, FrameError> {
    if first_byte < LONG_LENGTH_SENTINEL {
        return Ok(first_byte as usize);
    }

    let raw = i32::from_le_bytes(long_length.ok_or(FrameError::TruncatedHeader)?);
    if raw < 0 {
        return Err(FrameError::NegativeLength(raw));
    }

    let len = raw as usize;
    if len > MAX_MESSAGE_LENGTH {
        return Err(FrameError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_LENGTH,
        });
    }
    Ok(len)
}

/// Build a complete frame (header followed by payload).
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::with_capacity(header_len_for(payload.len()) + payload.len());
    write_length_header(&mut out, payload.len())?;
    out.extend_from_slice(payload);
    Ok(out)
}

fn header_len_for(len: usize) -> usize {
    if len < LONG_LENGTH_SENTINEL as usize {
        1
    } else {
        1 + LONG_LENGTH_BYTES
    }
}

fn map_eof(e: std::io::Error) -> FrameError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        FrameError::ConnectionClosed
    } else {
        FrameError::Io(e)
    }
}

/// Read a single frame from the stream.
///
/// Returns the payload bytes. Blocks until the full frame is available.
/// Returns [`FrameError::ConnectionClosed`] if the peer closes the connection
/// before the frame is complete.
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Vec<u8>, FrameError> {
    let first = reader.read_u8().await.map_err(map_eof)?;

    let long_length = if first == LONG_LENGTH_SENTINEL {
        let mut len_buf = [0u8; LONG_LENGTH_BYTES];
        reader.read_exact(&mut len_buf).await.map_err(map_eof)?;
        Some(len_buf)
    } else {
        None
    };

    let payload_len = decode_length(first, long_length)?;

    let mut payload = vec![0u8; payload_len];
    if payload_len > 0 {
        reader.read_exact(&mut payload).await.map_err(map_eof)?;
    }

    Ok(payload)
}

/// Write a single frame to the stream.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), FrameError> {
    let frame = encode_frame(payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn test_short_header_is_single_byte() {
        let frame = encode_frame(&[7u8; 6]).unwrap();
        assert_eq!(frame.len(), 7);
        assert_eq!(frame[0], 6);
        assert_eq!(&frame[1..], &[7u8; 6]);
    }

    #[test]
    fn test_length_254_uses_short_header() {
        let payload = vec![0xAB; 254];
        let frame = encode_frame(&payload).unwrap();
        assert_eq!(frame.len(), 255);
        assert_eq!(frame[0], 254);
        assert_eq!(&frame[1..], payload.as_slice());
    }

    #[test]
    fn test_length_255_uses_long_header() {
        let payload = vec![0xCD; 255];
        let frame = encode_frame(&payload).unwrap();
        assert_eq!(frame.len(), 260);
        assert_eq!(&frame[..5], &[0xFF, 0xFF, 0x00, 0x00, 0x00]);
        assert_eq!(&frame[5..], payload.as_slice());
    }

    #[test]
    fn test_long_length_is_little_endian() {
        let mut header = Vec::new();
        write_length_header(&mut header, 0x0102_0304).unwrap();
        assert_eq!(header, vec![0xFF, 0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_empty_payload_frame() {
        let frame = encode_frame(&[]).unwrap();
        assert_eq!(frame, vec![0]);
    }

    #[test]
    fn test_decode_inverts_header_rule() {
        for len in [0usize, 1, 200, 254, 255, 256, 70_000, MAX_MESSAGE_LENGTH] {
            let mut header = Vec::new();
            write_length_header(&mut header, len).unwrap();
            let long = (header.len() == 5).then(|| [header[1], header[2], header[3], header[4]]);
            assert_eq!(header.len(), header_len(header[0]));
            assert_eq!(decode_length(header[0], long).unwrap(), len);
        }
    }

    #[test]
    fn test_max_length_plus_one_rejected_on_decode() {
        let declared = (MAX_MESSAGE_LENGTH as i32 + 1).to_le_bytes();
        let result = decode_length(LONG_LENGTH_SENTINEL, Some(declared));
        assert!(matches!(
            result,
            Err(FrameError::MessageTooLarge { size: 134_217_729, .. })
        ));
    }

    #[test]
    fn test_max_length_plus_one_rejected_on_encode() {
        let mut header = Vec::new();
        let result = write_length_header(&mut header, MAX_MESSAGE_LENGTH + 1);
        assert!(matches!(result, Err(FrameError::PayloadTooLarge { .. })));
        assert!(header.is_empty(), "Nothing should be written on failure");
    }

    #[test]
    fn test_lengths_beyond_i32_never_wrap() {
        let mut header = Vec::new();
        let result = write_length_header(&mut header, 1usize << 31);
        assert!(matches!(result, Err(FrameError::PayloadTooLarge { .. })));
    }

    #[test]
    fn test_negative_length_rejected() {
        let result = decode_length(LONG_LENGTH_SENTINEL, Some((-5i32).to_le_bytes()));
        assert!(matches!(result, Err(FrameError::NegativeLength(-5))));
    }

    #[test]
    fn test_sentinel_without_length_is_truncated() {
        let result = decode_length(LONG_LENGTH_SENTINEL, None);
        assert!(matches!(result, Err(FrameError::TruncatedHeader)));
    }

    #[tokio::test]
    async fn test_single_message_roundtrip() {
        let (mut client, mut server) = duplex(8192);
        let payload = b"hello world";

        write_frame(&mut client, payload).await.unwrap();
        let received = read_frame(&mut server).await.unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_long_message_roundtrip() {
        let (mut client, mut server) = duplex(64);
        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();

        let expected = payload.clone();
        let write_task = tokio::spawn(async move {
            write_frame(&mut client, &payload).await.unwrap();
        });

        let received = read_frame(&mut server).await.unwrap();
        write_task.await.unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_back_to_back_messages_dont_merge() {
        let (mut client, mut server) = duplex(8192);

        write_frame(&mut client, b"aaa").await.unwrap();
        write_frame(&mut client, b"bbb").await.unwrap();

        assert_eq!(read_frame(&mut server).await.unwrap(), b"aaa");
        assert_eq!(read_frame(&mut server).await.unwrap(), b"bbb");
    }

    #[tokio::test]
    async fn test_oversized_header_rejected_on_read() {
        let (mut client, mut server) = duplex(8192);
        client.write_u8(LONG_LENGTH_SENTINEL).await.unwrap();
        client
            .write_all(&(MAX_MESSAGE_LENGTH as i32 + 1).to_le_bytes())
            .await
            .unwrap();
        client.flush().await.unwrap();

        let result = read_frame(&mut server).await;
        assert!(matches!(result, Err(FrameError::MessageTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_connection_closed_during_header_read() {
        let (client, mut server) = duplex(8192);
        drop(client);

        let result = read_frame(&mut server).await;
        assert!(matches!(result, Err(FrameError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_connection_closed_during_payload_read() {
        let (mut client, mut server) = duplex(8192);
        client.write_all(&[10, 1, 2, 3]).await.unwrap();
        drop(client);

        let result = read_frame(&mut server).await;
        assert!(matches!(result, Err(FrameError::ConnectionClosed)));
    }
}
