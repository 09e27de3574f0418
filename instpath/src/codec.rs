//! Length-prefixed plist framing
//!
//! Every message exchanged with lockdown and the services it starts is a
//! plist dictionary preceded by its body length as a big-endian `u32`:
//!
//! ```text
//! [u32 BE length][plist body]
//! ```
//!
//! Bodies are self-describing. Binary (`bplist00`) and XML bodies are both
//! accepted on decode; the sender picks one with [`PlistFormat`].

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::IdeviceError;

/// A single protocol message
pub type Message = plist::Dictionary;

/// Size of the length prefix
pub const HEADER_LEN: usize = 4;

/// Largest body accepted from the wire
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Serialization used for message bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlistFormat {
    #[default]
    Binary,
    Xml,
}

/// Serializes a message body without the length prefix
pub fn encode_body(message: &Message, format: PlistFormat) -> Result<Vec<u8>, IdeviceError> {
    let mut body = Vec::new();
    match format {
        PlistFormat::Binary => plist::to_writer_binary(&mut body, message)?,
        PlistFormat::Xml => plist::to_writer_xml(&mut body, message)?,
    }
    Ok(body)
}

/// Serializes a message into a complete frame
///
/// # Errors
/// `MalformedMessage` if the body would exceed [`MAX_MESSAGE_SIZE`]
pub fn encode(message: &Message, format: PlistFormat) -> Result<Vec<u8>, IdeviceError> {
    let body = encode_body(message, format)?;
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(IdeviceError::MalformedMessage(format!(
            "message body of {} bytes exceeds the {MAX_MESSAGE_SIZE} byte limit",
            body.len()
        )));
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Parses a message body
pub fn decode_body(body: &[u8]) -> Result<Message, IdeviceError> {
    plist::from_bytes::<Message>(body).map_err(|e| IdeviceError::MalformedMessage(e.to_string()))
}

/// Parses one complete frame
///
/// The declared length must match the bytes following the prefix exactly. A
/// frame is never partially interpreted.
pub fn decode(frame: &[u8]) -> Result<Message, IdeviceError> {
    let Some((header, body)) = frame.split_first_chunk::<HEADER_LEN>() else {
        return Err(IdeviceError::MalformedMessage(format!(
            "frame of {} bytes is shorter than its length prefix",
            frame.len()
        )));
    };
    let len = u32::from_be_bytes(*header) as usize;
    if len != body.len() {
        return Err(IdeviceError::MalformedMessage(format!(
            "length prefix declares {len} bytes but {} are present",
            body.len()
        )));
    }
    decode_body(body)
}

/// Writes a pre-encoded frame and flushes it
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<(), IdeviceError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Encodes and writes one message
pub async fn write_message<W>(
    writer: &mut W,
    message: &Message,
    format: PlistFormat,
) -> Result<(), IdeviceError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = encode(message, format)?;
    write_frame(writer, &frame).await
}

/// Reads one frame from a stream and returns its body
///
/// An oversized prefix is rejected before its body is read, which leaves the
/// stream at an unknown position; callers must not read from it again.
///
/// # Errors
/// - `ConnectionReset` if the stream ends inside the prefix or the body
/// - `MalformedMessage` if the declared size is over [`MAX_MESSAGE_SIZE`]
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, IdeviceError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(IdeviceError::MalformedMessage(format!(
            "declared length {len} exceeds the {MAX_MESSAGE_SIZE} byte limit"
        )));
    }
    trace!("Reading {len} byte message body");

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Reads one message from a stream
///
/// # Errors
/// Those of [`read_frame`], plus `MalformedMessage` if the body does not parse
/// as a plist dictionary. The stream stays in sync in that last case.
pub async fn read_message<R>(reader: &mut R) -> Result<Message, IdeviceError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let body = read_frame(reader).await?;
    decode_body(&body)
}
