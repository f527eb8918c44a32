//! Frame codec: the on-wire layout of nanolink messages.
//!
//! Messages are serialized with MessagePack (named fields) and wrapped in one
//! of two frame shapes. All length fields are big-endian unsigned integers of
//! the configured width (8 bytes by default):
//!
//! ```text
//! plain:   PREAMBLE(7) | LEN       | payload[LEN]
//! sealed:  PREAMBLE(7) | TAGLEN    | CIPHERLEN | ciphertext[CIPHERLEN]
//! ```
//!
//! The sealed shape is produced when a [`SessionKeys`] pair is supplied; see
//! [`crate::crypto`] for the ciphertext layout.

use crate::crypto;
use crate::keys::SessionKeys;
use nanolink_types::config::DEFAULT_MAX_FRAME_SIZE;
use nanolink_types::{DescriptorBatch, TransportConfig, WireError, WireResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Fixed preamble opening every frame.
pub const PREAMBLE: [u8; 7] = [0x01, 0x02, 0x03, 0xFF, 0x03, 0x02, 0x01];

/// Serialize a message to its payload bytes.
pub fn encode_message<M: Serialize>(msg: &M) -> WireResult<Vec<u8>> {
    rmp_serde::to_vec_named(msg).map_err(|e| WireError::Encoding(e.to_string()))
}

/// Deserialize payload bytes into a message.
pub fn decode_message<M: DeserializeOwned>(bytes: &[u8]) -> WireResult<M> {
    rmp_serde::from_slice(bytes).map_err(|e| WireError::Encoding(e.to_string()))
}

/// Serialize a registration batch. Registration payloads are not framed.
pub fn encode_batch(batch: &DescriptorBatch) -> WireResult<Vec<u8>> {
    encode_message(batch)
}

pub fn decode_batch(bytes: &[u8]) -> WireResult<DescriptorBatch> {
    decode_message(bytes)
}

/// Write a frame produced by [`FrameCodec::encode`] and flush.
///
/// Only socket failures surface here; encoding problems are caught by
/// `encode` before any byte reaches the stream.
pub async fn write_encoded<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> WireResult<()> {
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Builds and parses frames with a fixed length-field width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    length_width: usize,
    max_frame_size: u64,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            length_width: 8,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl FrameCodec {
    pub fn new(length_width: usize, max_frame_size: u64) -> WireResult<Self> {
        if !(1..=8).contains(&length_width) {
            return Err(WireError::Configuration(format!(
                "length_width must be between 1 and 8 bytes, got {length_width}"
            )));
        }
        Ok(Self {
            length_width,
            max_frame_size,
        })
    }

    pub fn from_config(config: &TransportConfig) -> WireResult<Self> {
        Self::new(config.length_width, config.max_frame_size)
    }

    pub fn length_width(&self) -> usize {
        self.length_width
    }

    /// Size of the fixed part of a frame (preamble plus length fields).
    pub fn header_len(&self, sealed: bool) -> usize {
        PREAMBLE.len() + self.length_width * if sealed { 2 } else { 1 }
    }

    fn push_length(&self, len: usize, out: &mut Vec<u8>) -> WireResult<()> {
        let len = len as u64;
        if len > self.max_frame_size {
            return Err(WireError::Protocol(format!(
                "frame body of {len} bytes exceeds maximum of {}",
                self.max_frame_size
            )));
        }
        if self.length_width < 8 && len >> (8 * self.length_width) != 0 {
            return Err(WireError::Protocol(format!(
                "length {len} does not fit a {}-byte length field",
                self.length_width
            )));
        }
        out.extend_from_slice(&len.to_be_bytes()[8 - self.length_width..]);
        Ok(())
    }

    /// Build the complete frame for `msg`, sealed when `keys` are given.
    pub fn encode<M: Serialize>(&self, msg: &M, keys: Option<&SessionKeys>) -> WireResult<Vec<u8>> {
        let payload = encode_message(msg)?;
        match keys {
            Some(keys) => {
                let (tag_len, ciphertext) = crypto::seal(keys, &payload)?;
                let mut frame = Vec::with_capacity(self.header_len(true) + ciphertext.len());
                frame.extend_from_slice(&PREAMBLE);
                self.push_length(tag_len, &mut frame)?;
                self.push_length(ciphertext.len(), &mut frame)?;
                frame.extend_from_slice(&ciphertext);
                Ok(frame)
            }
            None => {
                let mut frame = Vec::with_capacity(self.header_len(false) + payload.len());
                frame.extend_from_slice(&PREAMBLE);
                self.push_length(payload.len(), &mut frame)?;
                frame.extend_from_slice(&payload);
                Ok(frame)
            }
        }
    }

    /// Write one frame and flush.
    pub async fn write_frame<W, M>(
        &self,
        writer: &mut W,
        msg: &M,
        keys: Option<&SessionKeys>,
    ) -> WireResult<()>
    where
        W: AsyncWrite + Unpin,
        M: Serialize,
    {
        let frame = self.encode(msg, keys)?;
        write_encoded(writer, &frame).await
    }

    /// Read one frame and decode it as `M`.
    ///
    /// A clean EOF before the first byte yields [`WireError::ConnectionClosed`];
    /// an EOF anywhere inside the frame is a transport error.
    pub async fn read_frame<R, M>(&self, reader: &mut R, keys: Option<&SessionKeys>) -> WireResult<M>
    where
        R: AsyncRead + Unpin,
        M: DeserializeOwned,
    {
        let mut preamble = [0u8; PREAMBLE.len()];
        if reader.read(&mut preamble[..1]).await? == 0 {
            return Err(WireError::ConnectionClosed);
        }
        reader.read_exact(&mut preamble[1..]).await?;
        if preamble != PREAMBLE {
            return Err(WireError::Protocol(format!(
                "invalid preamble {preamble:02x?}"
            )));
        }

        match keys {
            Some(keys) => {
                let tag_len = self.read_length(reader).await?;
                let cipher_len = self.read_length(reader).await?;
                let ciphertext = self.read_body(reader, cipher_len).await?;
                let payload = crypto::open(keys, &ciphertext, tag_len as usize)?;
                decode_message(&payload)
            }
            None => {
                let len = self.read_length(reader).await?;
                let payload = self.read_body(reader, len).await?;
                decode_message(&payload)
            }
        }
    }

    async fn read_length<R: AsyncRead + Unpin>(&self, reader: &mut R) -> WireResult<u64> {
        let mut buf = [0u8; 8];
        reader.read_exact(&mut buf[8 - self.length_width..]).await?;
        Ok(u64::from_be_bytes(buf))
    }

    async fn read_body<R: AsyncRead + Unpin>(&self, reader: &mut R, len: u64) -> WireResult<Vec<u8>> {
        if len > self.max_frame_size {
            return Err(WireError::Protocol(format!(
                "frame body of {len} bytes exceeds maximum of {}",
                self.max_frame_size
            )));
        }
        let mut body = vec![0u8; len as usize];
        reader.read_exact(&mut body).await?;
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct ChatLine {
        id: u64,
        user: String,
        text: String,
    }

    fn line(text: &str) -> ChatLine {
        ChatLine {
            id: 7,
            user: "ada".to_string(),
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        let codec = FrameCodec::default();
        let keys = SessionKeys::generate();
        let bytes = codec.encode(&line("fragmented"), Some(&keys)).unwrap();
        let (head, tail) = bytes.split_at(10);
        let (middle, rest) = tail.split_at(tail.len() / 2);

        let mut reader = tokio_test::io::Builder::new()
            .read(head)
            .read(middle)
            .read(rest)
            .build();
        let decoded: ChatLine = codec.read_frame(&mut reader, Some(&keys)).await.unwrap();
        assert_eq!(decoded, line("fragmented"));
    }

    #[tokio::test]
    async fn test_plain_roundtrip() {
        let codec = FrameCodec::default();
        let bytes = codec.encode(&line("hi"), None).unwrap();
        assert_eq!(&bytes[..PREAMBLE.len()], &PREAMBLE);
        let len = u64::from_be_bytes(bytes[7..15].try_into().unwrap());
        assert_eq!(len as usize, bytes.len() - codec.header_len(false));

        let decoded: ChatLine = codec.read_frame(&mut bytes.as_slice(), None).await.unwrap();
        assert_eq!(decoded, line("hi"));
    }

    #[tokio::test]
    async fn test_sealed_roundtrip_over_duplex() {
        let codec = FrameCodec::default();
        let keys = SessionKeys::generate();
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);

        codec.write_frame(&mut a, &line("one"), Some(&keys)).await.unwrap();
        codec.write_frame(&mut a, &line("two"), Some(&keys)).await.unwrap();

        let first: ChatLine = codec.read_frame(&mut b, Some(&keys)).await.unwrap();
        let second: ChatLine = codec.read_frame(&mut b, Some(&keys)).await.unwrap();
        assert_eq!(first.text, "one");
        assert_eq!(second.text, "two");
    }

    #[tokio::test]
    async fn test_sealed_frame_hides_plaintext() {
        let codec = FrameCodec::default();
        let keys = SessionKeys::generate();
        let bytes = codec
            .encode(&line("a very recognisable sentence"), Some(&keys))
            .unwrap();
        let needle = b"recognisable";
        assert!(!bytes.windows(needle.len()).any(|w| w == needle));
    }

    #[tokio::test]
    async fn test_any_flipped_ciphertext_byte_fails_authentication() {
        let codec = FrameCodec::default();
        let keys = SessionKeys::generate();
        let bytes = codec.encode(&line("tamper"), Some(&keys)).unwrap();

        for i in codec.header_len(true)..bytes.len() {
            let mut tampered = bytes.clone();
            tampered[i] ^= 0x01;
            let result: WireResult<ChatLine> =
                codec.read_frame(&mut tampered.as_slice(), Some(&keys)).await;
            assert!(
                matches!(result, Err(WireError::Authentication)),
                "byte {i} flipped but got {result:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_bad_preamble_rejected_without_reading_further() {
        let codec = FrameCodec::default();
        let mut bytes = codec.encode(&line("x"), None).unwrap();
        bytes[3] = 0x00;

        let mut reader = bytes.as_slice();
        let result: WireResult<ChatLine> = codec.read_frame(&mut reader, None).await;
        assert!(matches!(result, Err(WireError::Protocol(_))));
        assert_eq!(reader.len(), bytes.len() - PREAMBLE.len());
    }

    #[tokio::test]
    async fn test_clean_eof_is_connection_closed() {
        let codec = FrameCodec::default();
        let mut empty: &[u8] = &[];
        let result: WireResult<ChatLine> = codec.read_frame(&mut empty, None).await;
        assert!(matches!(result, Err(WireError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_transport_error() {
        let codec = FrameCodec::default();
        let bytes = codec.encode(&line("truncate me"), None).unwrap();
        let mut short = &bytes[..bytes.len() - 3];
        let result: WireResult<ChatLine> = codec.read_frame(&mut short, None).await;
        assert!(matches!(result, Err(WireError::Transport(_))));
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let codec = FrameCodec::new(8, 1024).unwrap();
        let mut bytes = PREAMBLE.to_vec();
        bytes.extend_from_slice(&u64::MAX.to_be_bytes());
        let result: WireResult<ChatLine> = codec.read_frame(&mut bytes.as_slice(), None).await;
        assert!(matches!(result, Err(WireError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_narrow_length_width() {
        let codec = FrameCodec::new(2, DEFAULT_MAX_FRAME_SIZE).unwrap();
        let keys = SessionKeys::generate();
        let bytes = codec.encode(&line("short"), Some(&keys)).unwrap();
        assert_eq!(bytes[7..9], 32u16.to_be_bytes());
        let decoded: ChatLine = codec
            .read_frame(&mut bytes.as_slice(), Some(&keys))
            .await
            .unwrap();
        assert_eq!(decoded.text, "short");

        let huge = line(&"x".repeat(70_000));
        assert!(matches!(
            codec.encode(&huge, None),
            Err(WireError::Protocol(_))
        ));
    }

    #[test]
    fn test_invalid_width_rejected() {
        assert!(matches!(
            FrameCodec::new(0, 10),
            Err(WireError::Configuration(_))
        ));
        assert!(FrameCodec::new(9, 10).is_err());
    }

    #[test]
    fn test_batch_payload_is_unframed() {
        let batch = DescriptorBatch::single(nanolink_types::ServiceDescriptor::new(
            "svc1",
            "T",
            "localhost",
            5555,
        ));
        let bytes = encode_batch(&batch).unwrap();
        assert_ne!(&bytes[..PREAMBLE.len()], &PREAMBLE);
        assert_eq!(decode_batch(&bytes).unwrap(), batch);
    }

    #[tokio::test]
    async fn test_wrong_message_shape_is_encoding_error() {
        #[derive(Debug, Deserialize)]
        struct Other {
            #[allow(dead_code)]
            count: Vec<u32>,
        }
        let codec = FrameCodec::default();
        let bytes = codec.encode(&line("x"), None).unwrap();
        let result: WireResult<Other> = codec.read_frame(&mut bytes.as_slice(), None).await;
        assert!(matches!(result, Err(WireError::Encoding(_))));
    }
}
