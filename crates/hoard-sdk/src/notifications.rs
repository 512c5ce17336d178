use std::io::Cursor;

use hoard_protocol::{read_notification, FrameReader};
use hoard_types::ObjectId;
use tokio::io::{AsyncReadExt, Chain};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

use crate::error::SdkResult;

/// Seal notifications from a subscribed connection, in seal order.
pub struct Notifications {
    stream: Chain<Cursor<Vec<u8>>, OwnedReadHalf>,
    _writer: OwnedWriteHalf,
}

impl Notifications {
    pub(crate) fn new(reader: FrameReader<OwnedReadHalf>, writer: OwnedWriteHalf) -> Self {
        // Records can arrive in the same read as the `Subscribed` frame.
        let (read, buffered) = reader.into_parts();
        Self {
            stream: Cursor::new(buffered.to_vec()).chain(read),
            _writer: writer,
        }
    }

    /// The next sealed object id. `None` once the store closes the stream,
    /// which it does if this subscriber falls too far behind.
    pub async fn next(&mut self) -> SdkResult<Option<ObjectId>> {
        Ok(read_notification(&mut self.stream).await?)
    }
}
