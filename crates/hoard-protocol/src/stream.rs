//! Fixed-size records on a subscribed connection.
//!
//! After `Subscribed` the server writes nothing but consecutive 20-byte
//! object ids, one per seal, in seal order.

use hoard_types::{ObjectId, OBJECT_ID_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, ProtocolResult};

pub const NOTIFICATION_LEN: usize = OBJECT_ID_SIZE;

/// Read the next notification. `Ok(None)` when the server closed the
/// stream on a record boundary.
pub async fn read_notification<R>(reader: &mut R) -> ProtocolResult<Option<ObjectId>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; NOTIFICATION_LEN];
    if !read_exact_or_eof(reader, &mut buf).await? {
        return Ok(None);
    }
    Ok(Some(ObjectId::from_raw(buf)))
}

/// Write one notification record (unflushed).
pub async fn write_notification<W>(writer: &mut W, id: &ObjectId) -> ProtocolResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(id.as_bytes()).await?;
    Ok(())
}

/// Fill `buf` completely. Returns `false` if the stream ended before the
/// first byte; a stream that ends part-way is a framing error.
pub(crate) async fn read_exact_or_eof<R>(reader: &mut R, buf: &mut [u8]) -> ProtocolResult<bool>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(ProtocolError::Framing(format!(
                "stream ended after {filled} of {} bytes",
                buf.len()
            )));
        }
        filled += n;
    }
    Ok(true)
}
