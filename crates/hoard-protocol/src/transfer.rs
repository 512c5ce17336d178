use hoard_types::{ObjectId, OBJECT_ID_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, ProtocolResult};
use crate::message::{ErrorCode, MAX_MESSAGE_SIZE};
use crate::stream::read_exact_or_eof;

/// `id[20] | metadata_len u64 BE | payload_len u64 BE`
pub const TRANSFER_HEADER_LEN: usize = OBJECT_ID_SIZE + 8 + 8;

/// Acknowledgement byte for a sealed object.
pub const ACK_OK: u8 = 0;

/// Header preceding each object on a transfer connection.
///
/// The metadata and then the payload follow immediately; the receiver
/// answers every object with a single acknowledgement byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferHeader {
    pub id: ObjectId,
    pub metadata_len: u64,
    pub payload_len: u64,
}

impl TransferHeader {
    pub fn encode(&self) -> [u8; TRANSFER_HEADER_LEN] {
        let mut buf = [0u8; TRANSFER_HEADER_LEN];
        buf[..OBJECT_ID_SIZE].copy_from_slice(self.id.as_bytes());
        buf[OBJECT_ID_SIZE..OBJECT_ID_SIZE + 8].copy_from_slice(&self.metadata_len.to_be_bytes());
        buf[OBJECT_ID_SIZE + 8..].copy_from_slice(&self.payload_len.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; TRANSFER_HEADER_LEN]) -> Self {
        let mut id = [0u8; OBJECT_ID_SIZE];
        id.copy_from_slice(&buf[..OBJECT_ID_SIZE]);
        let mut metadata_len = [0u8; 8];
        metadata_len.copy_from_slice(&buf[OBJECT_ID_SIZE..OBJECT_ID_SIZE + 8]);
        let mut payload_len = [0u8; 8];
        payload_len.copy_from_slice(&buf[OBJECT_ID_SIZE + 8..]);
        Self {
            id: ObjectId::from_raw(id),
            metadata_len: u64::from_be_bytes(metadata_len),
            payload_len: u64::from_be_bytes(payload_len),
        }
    }

    /// Read the next header. `Ok(None)` when the sender closed the
    /// connection between objects.
    pub async fn read_from<R>(reader: &mut R) -> ProtocolResult<Option<Self>>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; TRANSFER_HEADER_LEN];
        if !read_exact_or_eof(reader, &mut buf).await? {
            return Ok(None);
        }
        let header = Self::decode(&buf);
        // Metadata is buffered whole; the payload is streamed.
        if header.metadata_len > MAX_MESSAGE_SIZE as u64 {
            return Err(ProtocolError::MessageTooLarge {
                size: header.metadata_len as usize,
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(Some(header))
    }

    pub async fn write_to<W>(&self, writer: &mut W) -> ProtocolResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.encode()).await?;
        Ok(())
    }
}

/// The acknowledgement byte for a receive outcome.
pub fn ack_byte(outcome: Result<(), ErrorCode>) -> u8 {
    match outcome {
        Ok(()) => ACK_OK,
        Err(code) => code.as_u8(),
    }
}

/// Interpret an acknowledgement byte. Unknown codes map to `Internal`.
pub fn parse_ack(byte: u8) -> Result<(), ErrorCode> {
    if byte == ACK_OK {
        return Ok(());
    }
    Err(ErrorCode::from_u8(byte).unwrap_or(ErrorCode::Internal))
}

pub async fn read_ack<R>(reader: &mut R) -> ProtocolResult<Result<(), ErrorCode>>
where
    R: AsyncRead + Unpin,
{
    Ok(parse_ack(reader.read_u8().await?))
}

pub async fn write_ack<W>(writer: &mut W, outcome: Result<(), ErrorCode>) -> ProtocolResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u8(ack_byte(outcome)).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> TransferHeader {
        TransferHeader {
            id: ObjectId::from_raw([0xAB; 20]),
            metadata_len: 2,
            payload_len: 500,
        }
    }

    #[test]
    fn header_layout_is_big_endian() {
        let buf = header().encode();
        assert_eq!(&buf[..20], &[0xAB; 20]);
        assert_eq!(&buf[20..28], &[0, 0, 0, 0, 0, 0, 0, 2]);
        assert_eq!(&buf[28..36], &[0, 0, 0, 0, 0, 0, 0x01, 0xF4]);
        assert_eq!(TransferHeader::decode(&buf), header());
    }

    #[tokio::test]
    async fn header_over_a_stream() {
        let mut wire = Vec::new();
        header().write_to(&mut wire).await.unwrap();
        let mut reader = &wire[..];
        assert_eq!(
            TransferHeader::read_from(&mut reader).await.unwrap(),
            Some(header())
        );
        assert_eq!(TransferHeader::read_from(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn truncated_header_is_an_error() {
        let wire = header().encode();
        let mut reader = &wire[..30];
        assert!(TransferHeader::read_from(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn huge_metadata_is_refused() {
        let mut h = header();
        h.metadata_len = u64::MAX;
        let wire = h.encode();
        let mut reader = &wire[..];
        assert!(matches!(
            TransferHeader::read_from(&mut reader).await,
            Err(ProtocolError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn ack_codes() {
        assert_eq!(ack_byte(Ok(())), 0);
        assert_eq!(parse_ack(0), Ok(()));
        assert_eq!(
            parse_ack(ack_byte(Err(ErrorCode::ObjectExists))),
            Err(ErrorCode::ObjectExists)
        );
        assert_eq!(parse_ack(250), Err(ErrorCode::Internal));
    }

    #[tokio::test]
    async fn ack_over_a_stream() {
        let mut wire = Vec::new();
        write_ack(&mut wire, Err(ErrorCode::OutOfMemory)).await.unwrap();
        let mut reader = &wire[..];
        assert_eq!(
            read_ack(&mut reader).await.unwrap(),
            Err(ErrorCode::OutOfMemory)
        );
    }
}
