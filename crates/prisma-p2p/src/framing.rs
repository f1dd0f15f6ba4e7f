//! Wire framing: `<len>:<bytes>,` netstrings where the bytes are
//! zlib-compressed JSON. MAX_FRAME_LENGTH bounds the decimal prefix, the
//! compressed payload and the decompressed payload; breaking any of those
//! bounds is a protocol error and the connection is closed.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use prisma_core::constants::MAX_FRAME_LENGTH;
use prisma_core::error::PrismaError;

/// Digits needed to express MAX_FRAME_LENGTH, the longest legal prefix.
const MAX_PREFIX_DIGITS: usize = 9;

/// Compress and send one frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
    zlib_level: u32,
) -> Result<(), PrismaError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(zlib_level));
    encoder.write_all(payload).map_err(PrismaError::Io)?;
    let compressed = encoder.finish().map_err(PrismaError::Io)?;
    if compressed.len() > MAX_FRAME_LENGTH {
        return Err(PrismaError::FrameTooLarge {
            len: compressed.len(),
            max: MAX_FRAME_LENGTH,
        });
    }

    let prefix = format!("{}:", compressed.len());
    writer.write_all(prefix.as_bytes()).await?;
    writer.write_all(&compressed).await?;
    writer.write_all(b",").await?;
    writer.flush().await?;
    Ok(())
}

/// Receive and decompress one frame.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, PrismaError> {
    // Length prefix: decimal digits terminated by ':'.
    let mut digits = Vec::new();
    loop {
        let byte = reader.read_u8().await.map_err(PrismaError::Io)?;
        if byte == b':' {
            break;
        }
        if !byte.is_ascii_digit() {
            return Err(PrismaError::MalformedFrame("non-digit in length prefix".into()));
        }
        digits.push(byte);
        if digits.len() > MAX_PREFIX_DIGITS {
            return Err(PrismaError::FrameTooLarge {
                len: usize::MAX,
                max: MAX_FRAME_LENGTH,
            });
        }
    }
    if digits.is_empty() {
        return Err(PrismaError::MalformedFrame("empty length prefix".into()));
    }
    let len: usize = String::from_utf8_lossy(&digits)
        .parse()
        .map_err(|_| PrismaError::MalformedFrame("bad length prefix".into()))?;
    if len > MAX_FRAME_LENGTH {
        return Err(PrismaError::FrameTooLarge { len, max: MAX_FRAME_LENGTH });
    }

    let mut compressed = vec![0u8; len];
    reader
        .read_exact(&mut compressed)
        .await
        .map_err(PrismaError::Io)?;
    let trailer = reader.read_u8().await.map_err(PrismaError::Io)?;
    if trailer != b',' {
        return Err(PrismaError::MalformedFrame("missing frame trailer".into()));
    }

    let mut payload = Vec::new();
    let mut decoder = ZlibDecoder::new(&compressed[..]).take(MAX_FRAME_LENGTH as u64 + 1);
    decoder
        .read_to_end(&mut payload)
        .map_err(|e| PrismaError::MalformedFrame(format!("zlib: {e}")))?;
    if payload.len() > MAX_FRAME_LENGTH {
        return Err(PrismaError::FrameTooLarge {
            len: payload.len(),
            max: MAX_FRAME_LENGTH,
        });
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let payload = br#"{"method":"get_state","last_round":-1}"#.to_vec();
        write_frame(&mut client, &payload, 6).await.unwrap();
        let got = read_frame(&mut server).await.unwrap();
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn back_to_back_frames() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        write_frame(&mut client, b"first", 6).await.unwrap();
        write_frame(&mut client, b"second", 6).await.unwrap();
        assert_eq!(read_frame(&mut server).await.unwrap(), b"first");
        assert_eq!(read_frame(&mut server).await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn oversized_prefix_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        tokio::io::AsyncWriteExt::write_all(&mut client, b"99999999999:")
            .await
            .unwrap();
        assert!(matches!(
            read_frame(&mut server).await,
            Err(PrismaError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn garbage_prefix_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        tokio::io::AsyncWriteExt::write_all(&mut client, b"12x:")
            .await
            .unwrap();
        assert!(matches!(
            read_frame(&mut server).await,
            Err(PrismaError::MalformedFrame(_))
        ));
    }

    #[tokio::test]
    async fn missing_trailer_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        // A valid zlib body for b"x" but with the trailing ',' replaced.
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(6));
        std::io::Write::write_all(&mut encoder, b"x").unwrap();
        let body = encoder.finish().unwrap();
        let mut frame = format!("{}:", body.len()).into_bytes();
        frame.extend_from_slice(&body);
        frame.push(b';');
        tokio::io::AsyncWriteExt::write_all(&mut client, &frame)
            .await
            .unwrap();
        assert!(matches!(
            read_frame(&mut server).await,
            Err(PrismaError::MalformedFrame(_))
        ));
    }

    #[tokio::test]
    async fn compression_shrinks_repetitive_payloads() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let payload = vec![b'a'; 10_000];
        write_frame(&mut client, &payload, 6).await.unwrap();
        assert_eq!(read_frame(&mut server).await.unwrap(), payload);
    }
}
