//! Length-prefixed framing for byte-stream transports.
//!
//! A frame is `[len: u32 big-endian][payload]`.

use crate::error::{CodecError, FacadeError, FacadeResult};
use std::io::{self, Read, Write};

/// Default maximum frame length (16 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Writes one frame and flushes.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> FacadeResult<()> {
    let len = u32::try_from(payload.len()).map_err(|_| CodecError::FrameTooLarge {
        len: payload.len(),
        max: u32::MAX as usize,
    })?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Reads one frame.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly before a new
/// frame started. A length above `max_len` is rejected before the payload
/// is read.
pub fn read_frame<R: Read>(reader: &mut R, max_len: usize) -> FacadeResult<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(FacadeError::from(e)),
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > max_len {
        return Err(CodecError::FrameTooLarge { len, max: max_len }.into());
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            FacadeError::Codec(CodecError::UnexpectedEof)
        } else {
            FacadeError::from(e)
        }
    })?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frames_are_read_back_in_order() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, b"first").unwrap();
        write_frame(&mut buffer, b"").unwrap();
        write_frame(&mut buffer, b"third").unwrap();

        let mut cursor = Cursor::new(buffer);
        assert_eq!(read_frame(&mut cursor, 64).unwrap().unwrap(), b"first");
        assert_eq!(read_frame(&mut cursor, 64).unwrap().unwrap(), b"");
        assert_eq!(read_frame(&mut cursor, 64).unwrap().unwrap(), b"third");
        assert!(read_frame(&mut cursor, 64).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &[0u8; 100]).unwrap();

        let err = read_frame(&mut Cursor::new(buffer), 10).unwrap_err();
        assert_eq!(
            err,
            FacadeError::Codec(CodecError::FrameTooLarge { len: 100, max: 10 })
        );
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, b"complete payload").unwrap();
        buffer.truncate(8);

        let err = read_frame(&mut Cursor::new(buffer), 64).unwrap_err();
        assert_eq!(err, FacadeError::Codec(CodecError::UnexpectedEof));
    }
}
