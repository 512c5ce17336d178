use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, ProtocolResult};
use crate::message::{Message, MAX_MESSAGE_SIZE};

/// Length prefix plus tag byte.
const HEADER_LEN: usize = 5;

const READ_CHUNK: usize = 8 * 1024;

/// Most bytes a [`FrameReader`] holds before refusing to read more: one
/// maximal frame.
pub const MAX_BUFFERED: usize = MAX_MESSAGE_SIZE + HEADER_LEN;

/// Codec for Hoard protocol frames.
pub struct FrameCodec;

impl FrameCodec {
    /// Frame a message as `[u32 BE len][u8 tag][bincode]`; `len` counts the tag.
    pub fn encode<M: Message>(msg: &M) -> ProtocolResult<Vec<u8>> {
        let payload =
            bincode::serialize(msg).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: payload.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        let len = (payload.len() + 1) as u32;
        let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.push(msg.type_tag());
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Total length of the frame at the start of `data`, once its length
    /// prefix is available.
    pub fn frame_len(data: &[u8]) -> ProtocolResult<Option<usize>> {
        let Some(prefix) = data.first_chunk::<4>() else {
            return Ok(None);
        };
        let len = u32::from_be_bytes(*prefix) as usize;
        if len < 1 {
            return Err(ProtocolError::Framing("zero-length frame".into()));
        }
        if len - 1 > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: len - 1,
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(Some(4 + len))
    }

    /// Decode the complete frame at the front of `data`, returning the message
    /// and the frame length.
    pub fn decode<M: Message>(data: &[u8]) -> ProtocolResult<(M, usize)> {
        if data.len() < HEADER_LEN {
            return Err(ProtocolError::Framing("too short".into()));
        }
        let Some(total) = Self::frame_len(data)? else {
            return Err(ProtocolError::Framing("too short".into()));
        };
        if data.len() < total {
            return Err(ProtocolError::Framing(format!(
                "incomplete: have {}, need {}",
                data.len(),
                total
            )));
        }
        let tag = data[4];
        let msg: M = bincode::deserialize(&data[HEADER_LEN..total])
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        if msg.type_tag() != tag {
            return Err(ProtocolError::TagMismatch {
                expected: msg.type_tag(),
                found: tag,
            });
        }
        Ok((msg, total))
    }
}

/// Buffered frame reader over an async byte stream.
///
/// Bytes read ahead of the current frame stay buffered, so a caller may
/// interleave [`fill`](Self::fill) (for example to notice a disconnect while
/// a request is in progress) with [`next`](Self::next) without losing data.
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Read the next message. `Ok(None)` means the peer closed the stream
    /// cleanly between frames.
    pub async fn next<M: Message>(&mut self) -> ProtocolResult<Option<M>> {
        loop {
            if let Some(total) = FrameCodec::frame_len(&self.buf)? {
                if self.buf.len() >= total {
                    let frame = self.buf.split_to(total);
                    let (msg, _) = FrameCodec::decode(&frame)?;
                    return Ok(Some(msg));
                }
            }
            if self.fill().await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(ProtocolError::Framing(
                    "connection closed mid-frame".into(),
                ));
            }
        }
    }

    /// Pull up to one chunk more into the buffer; returns 0 at end of
    /// stream. Fails once [`MAX_BUFFERED`] bytes are waiting to be decoded.
    ///
    /// Cancel-safe: bytes are only ever appended to the buffer.
    pub async fn fill(&mut self) -> ProtocolResult<usize> {
        if self.buf.len() >= MAX_BUFFERED {
            return Err(ProtocolError::MessageTooLarge {
                size: self.buf.len(),
                max: MAX_BUFFERED,
            });
        }
        self.buf.reserve(READ_CHUNK);
        let mut chunk = (&mut self.buf).limit(READ_CHUNK);
        Ok(self.inner.read_buf(&mut chunk).await?)
    }

    /// Bytes received but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// The stream plus any bytes already read past the last frame.
    pub fn into_parts(self) -> (R, BytesMut) {
        (self.inner, self.buf)
    }
}

/// Encode `msg`, write it in full and flush.
pub async fn write_message<W, M>(writer: &mut W, msg: &M) -> ProtocolResult<()>
where
    W: AsyncWrite + Unpin,
    M: Message,
{
    let frame = FrameCodec::encode(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
