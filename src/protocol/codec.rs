//! Length-prefixed bincode framing
//!
//! Every frame is a 4-byte little-endian body length followed by the
//! bincode-encoded message. Frames larger than [`MAX_FRAME_LEN`] are refused
//! on both sides.

use std::io::{Read, Write};

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Result, XferError};

/// Size of the length prefix
pub const HEADER_LEN: usize = 4;

/// Largest accepted frame body
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Encode a message into a complete frame
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let body = bincode::serialize(message)
        .map_err(|e| XferError::malformed(format!("Failed to encode message: {}", e)))?;
    if body.len() > MAX_FRAME_LEN {
        return Err(XferError::malformed(format!(
            "Frame of {} bytes exceeds limit of {}",
            body.len(),
            MAX_FRAME_LEN
        )));
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Validate a length prefix and return the body length it announces
pub fn body_len(header: [u8; HEADER_LEN]) -> Result<usize> {
    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(XferError::malformed(format!(
            "Announced frame of {} bytes exceeds limit of {}",
            len, MAX_FRAME_LEN
        )));
    }
    Ok(len)
}

/// Decode a frame body
pub fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(body)?)
}

/// Write one message as a frame
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let frame = encode(message)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Read the body of one frame whose header has already been consumed
pub fn read_body<R: Read>(reader: &mut R, header: [u8; HEADER_LEN]) -> Result<Vec<u8>> {
    let len = body_len(header)?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(body)
}

/// Read one message frame
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header)?;
    let body = read_body(reader, header)?;
    decode(&body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ControlOp, Request};
    use std::io::Cursor;

    #[test]
    fn test_frames_back_to_back() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Request::Control(ControlOp::GetCount)).unwrap();
        write_frame(&mut buf, &Request::MapHead { length: 42 }).unwrap();

        let mut cursor = Cursor::new(buf);
        let first: Request = read_frame(&mut cursor).unwrap();
        let second: Request = read_frame(&mut cursor).unwrap();
        assert_eq!(first, Request::Control(ControlOp::GetCount));
        assert_eq!(second, Request::MapHead { length: 42 });
    }

    #[test]
    fn test_oversized_header_rejected() {
        let header = ((MAX_FRAME_LEN + 1) as u32).to_le_bytes();
        let err = body_len(header).unwrap_err();
        assert!(matches!(err, XferError::Malformed { .. }));
    }

    #[test]
    fn test_garbage_body_is_malformed() {
        let mut frame = 3u32.to_le_bytes().to_vec();
        frame.extend_from_slice(&[0xff, 0xff, 0xff]);
        let err = read_frame::<_, Request>(&mut Cursor::new(frame)).unwrap_err();
        assert!(matches!(err, XferError::Malformed { .. }));
    }

    #[test]
    fn test_truncated_stream_is_disconnect() {
        let frame = encode(&Request::Ping).unwrap();
        let err = read_frame::<_, Request>(&mut Cursor::new(&frame[..frame.len() - 1])).unwrap_err();
        assert!(err.is_disconnect());
    }
}
