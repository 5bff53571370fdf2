//! Frame codec for async streams

use crate::{Frame, ProtocolError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame codec for encoding/decoding frames over async streams
///
/// The wire format is a 4-byte big-endian length prefix followed by the
/// MessagePack encoding of the frame.
pub struct FrameCodec {
    /// Read buffer for incoming data
    read_buf: BytesMut,
    /// Maximum frame size allowed
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Create a new frame codec with default settings
    pub fn new() -> Self {
        Self {
            read_buf: BytesMut::with_capacity(8192),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a new frame codec with a custom max frame size
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            read_buf: BytesMut::with_capacity(8192),
            max_frame_size,
        }
    }

    /// Encode a frame to bytes with length prefix
    pub fn encode_frame(&self, frame: &Frame) -> Result<Bytes, ProtocolError> {
        let frame_bytes = frame.to_msgpack()?;

        if frame_bytes.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: frame_bytes.len(),
                max: self.max_frame_size,
            });
        }

        let mut buf = BytesMut::with_capacity(4 + frame_bytes.len());
        buf.put_u32(frame_bytes.len() as u32);
        buf.put_slice(&frame_bytes);

        Ok(buf.freeze())
    }

    /// Write a frame to an async writer
    pub async fn write_frame<W>(&self, writer: &mut W, frame: &Frame) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let encoded = self.encode_frame(frame)?;
        writer
            .write_all(&encoded)
            .await
            .map_err(|e| ProtocolError::Io(format!("write error: {}", e)))?;
        writer
            .flush()
            .await
            .map_err(|e| ProtocolError::Io(format!("flush error: {}", e)))?;
        Ok(())
    }

    /// Read the next frame from an async reader
    ///
    /// Returns `Ok(None)` on a clean EOF at a frame boundary.
    pub async fn read_frame<R>(&mut self, reader: &mut R) -> Result<Option<Frame>, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(frame) = self.try_decode_frame()? {
                return Ok(Some(frame));
            }

            let mut temp_buf = [0u8; 8192];
            let n = reader
                .read(&mut temp_buf)
                .await
                .map_err(|e| ProtocolError::Io(format!("read error: {}", e)))?;

            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                // EOF in the middle of a frame
                return Err(ProtocolError::InvalidFrame);
            }

            self.read_buf.extend_from_slice(&temp_buf[..n]);
        }
    }

    /// Try to decode a frame from the internal buffer
    pub fn try_decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        if self.read_buf.len() < 4 {
            return Ok(None);
        }

        let frame_len = (&self.read_buf[..4]).get_u32() as usize;

        if frame_len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: frame_len,
                max: self.max_frame_size,
            });
        }

        if self.read_buf.len() < 4 + frame_len {
            return Ok(None);
        }

        self.read_buf.advance(4);
        let frame_data = self.read_buf.split_to(frame_len);

        let frame = Frame::from_msgpack(&frame_data)?;
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_encode_decode() {
        let codec = FrameCodec::new();
        let frame = Frame::data(1, Bytes::from("hello agent"));

        let encoded = codec.encode_frame(&frame).unwrap();
        assert!(encoded.len() > 4);

        let mut codec2 = FrameCodec::new();
        let mut cursor = Cursor::new(encoded);
        let decoded = codec2.read_frame(&mut cursor).await.unwrap().unwrap();

        assert_eq!(frame.serial, decoded.serial);
        assert_eq!(frame.payload, decoded.payload);
    }

    #[tokio::test]
    async fn test_write_read_frame() {
        let codec = FrameCodec::new();
        let frame = Frame::bye(9);

        let mut buffer = Vec::new();
        codec.write_frame(&mut buffer, &frame).await.unwrap();

        let mut codec2 = FrameCodec::new();
        let mut cursor = Cursor::new(buffer);
        let decoded = codec2.read_frame(&mut cursor).await.unwrap().unwrap();

        assert_eq!(frame.serial, decoded.serial);
        assert!(decoded.is_bye());
    }

    #[tokio::test]
    async fn test_partial_frame() {
        let codec = FrameCodec::new();
        let frame = Frame::data(1, Bytes::from("partial"));
        let encoded = codec.encode_frame(&frame).unwrap();

        let mut codec2 = FrameCodec::new();
        let mid = encoded.len() / 2;
        codec2.read_buf.extend_from_slice(&encoded[..mid]);

        assert!(codec2.try_decode_frame().unwrap().is_none());

        codec2.read_buf.extend_from_slice(&encoded[mid..]);
        let decoded = codec2.try_decode_frame().unwrap().unwrap();
        assert_eq!(frame.payload, decoded.payload);
    }

    #[tokio::test]
    async fn test_multiple_frames_in_buffer() {
        let codec = FrameCodec::new();
        let frame1 = Frame::data(1, Bytes::from("first"));
        let frame2 = Frame::data(2, Bytes::from("second"));

        let mut combined = BytesMut::new();
        combined.extend_from_slice(&codec.encode_frame(&frame1).unwrap());
        combined.extend_from_slice(&codec.encode_frame(&frame2).unwrap());

        let mut codec2 = FrameCodec::new();
        let mut cursor = Cursor::new(combined.freeze());

        let decoded1 = codec2.read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(frame1.payload, decoded1.payload);

        let decoded2 = codec2.read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(frame2.payload, decoded2.payload);

        assert!(codec2.read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frame_too_large() {
        let codec = FrameCodec::with_max_frame_size(64);
        let frame = Frame::data(1, Bytes::from(vec![0u8; 128]));

        let result = codec.encode_frame(&frame);
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_truncated_stream() {
        let codec = FrameCodec::new();
        let encoded = codec
            .encode_frame(&Frame::data(1, Bytes::from("truncated")))
            .unwrap();

        let mut codec2 = FrameCodec::new();
        let mut cursor = Cursor::new(encoded[..encoded.len() - 2].to_vec());

        let result = codec2.read_frame(&mut cursor).await;
        assert!(matches!(result, Err(ProtocolError::InvalidFrame)));
    }

    #[tokio::test]
    async fn test_empty_stream() {
        let mut codec = FrameCodec::new();
        let mut cursor = Cursor::new(Vec::<u8>::new());

        assert!(codec.read_frame(&mut cursor).await.unwrap().is_none());
    }

    proptest! {
        #[test]
        fn test_codec_roundtrip_properties(
            serial in any::<u32>(),
            payload in prop::collection::vec(any::<u8>(), 0..1000)
        ) {
            tokio_test::block_on(async {
                let codec = FrameCodec::new();
                let frame = Frame::data(serial, Bytes::from(payload));

                let encoded = codec.encode_frame(&frame)?;

                let mut codec2 = FrameCodec::new();
                let mut cursor = Cursor::new(encoded);
                let decoded = codec2.read_frame(&mut cursor).await?.unwrap();

                prop_assert_eq!(frame.serial, decoded.serial);
                prop_assert_eq!(frame.payload, decoded.payload);

                Ok(())
            })?;
        }
    }
}
