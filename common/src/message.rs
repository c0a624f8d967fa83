//! Length-prefixed message framing for result payloads.
//!
//! Layout: an 8-byte unsigned length `L` in native byte order, then `L` bytes of
//! payload. The framing has no resync marker, so any error leaves the stream
//! unusable and the caller must drop the connection.

use std::io::{self, Read, Write};

use crate::frame::read_full;

const LENGTH_PREFIX_SIZE: usize = 8;

/// Write one message. The prefix and the payload go out as two writes.
pub fn write_message<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), MessageError> {
    let len = payload.len() as u64;
    writer.write_all(&len.to_ne_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one message.
///
/// Returns `Ok(None)` when the stream ends cleanly before a new prefix.
/// A stream that ends inside a prefix or payload is a
/// [`MessageError::ConnectionClosed`].
pub fn read_message<R: Read>(
    reader: &mut R,
    max_len: u64,
) -> Result<Option<Vec<u8>>, MessageError> {
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    let got = read_full(reader, &mut prefix)?;
    if got == 0 {
        return Ok(None);
    }
    if got < LENGTH_PREFIX_SIZE {
        return Err(MessageError::ConnectionClosed {
            got,
            expected: LENGTH_PREFIX_SIZE,
        });
    }

    let len = u64::from_ne_bytes(prefix);
    if len > max_len {
        return Err(MessageError::TooLarge { len, max: max_len });
    }

    let mut payload = vec![0u8; len as usize];
    let got = read_full(reader, &mut payload)?;
    if got < payload.len() {
        return Err(MessageError::ConnectionClosed {
            got,
            expected: payload.len(),
        });
    }
    Ok(Some(payload))
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("connection closed mid-message: got {got} of {expected} bytes")]
    ConnectionClosed { got: usize, expected: usize },
    #[error("message length {len} exceeds limit of {max} bytes")]
    TooLarge { len: u64, max: u64 },
    #[error("message i/o: {0}")]
    Io(#[from] io::Error),
}
