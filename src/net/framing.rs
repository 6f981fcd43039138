use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Error;
use crate::message::Message;

/// Maximum size of one serialized message body. Oversized frames are a
/// protocol violation and close the connection.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Write one framed message: big-endian u32 length prefix followed by the
/// bincode-encoded body.
pub async fn write_frame<W>(writer: &mut W, message: &Message) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let body = bincode::serialize(message)
        .map_err(|err| Error::application(format!("message encoding failed: {}", err)))?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(Error::invalid_argument(format!(
            "message of {} bytes exceeds maximum frame size",
            body.len()
        )));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message. Fails on a short read (peer closed), an
/// oversized length prefix or an undecodable body; every failure is
/// connection-fatal for the caller.
pub async fn read_frame<R>(reader: &mut R) -> Result<Message, Error>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix).await?;
    let length = u32::from_be_bytes(prefix) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(Error::application(format!(
            "frame of {} bytes exceeds maximum frame size",
            length
        )));
    }
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    bincode::deserialize(&body)
        .map_err(|err| Error::application(format!("message decoding failed: {}", err)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::message::Message;
    use crate::value::{Args, Value};
    use std::io::Cursor;

    #[tokio::test]
    async fn frame_round_trip() {
        let message = Message::Request {
            source: Address::request_handler("a", 7),
            destination: Address::new("b", "svc"),
            request_id: 7,
            method: "get".to_string(),
            args: Args::positional(vec![Value::Str("x".into())]),
            lock_token: Some("$lock_1".to_string()),
        };
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &message).await.unwrap();
        // Length prefix is big-endian and covers exactly the body.
        let length = u32::from_be_bytes(buffer[0..4].try_into().unwrap()) as usize;
        assert_eq!(length, buffer.len() - 4);

        let mut cursor = Cursor::new(buffer);
        let decoded = read_frame(&mut cursor).await.unwrap();
        assert_eq!(decoded.request_id(), Some(7));
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&(MAX_FRAME_SIZE as u32 + 1).to_be_bytes());
        buffer.extend_from_slice(&[0u8; 16]);
        let mut cursor = Cursor::new(buffer);
        assert!(read_frame(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn truncated_frame_is_rejected() {
        let message = Message::Handshake {
            context: "a".to_string(),
            workgroup: "default".to_string(),
            protocol_version: 1,
        };
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &message).await.unwrap();
        buffer.truncate(buffer.len() - 1);
        let mut cursor = Cursor::new(buffer);
        assert!(read_frame(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn garbage_body_is_rejected() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&8u32.to_be_bytes());
        buffer.extend_from_slice(&[0xff; 8]);
        let mut cursor = Cursor::new(buffer);
        assert!(read_frame(&mut cursor).await.is_err());
    }
}
