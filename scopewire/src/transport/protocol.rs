//! Frame codec for stream transports
//!
//! ```text
//! +-------------+--------------+--------+-----------------+---------+
//! | token u64   | name_len u16 | name   | payload_len u32 | payload |
//! +-------------+--------------+--------+-----------------+---------+
//! ```
//!
//! All integers are little-endian. Token `0` marks an unsolicited frame: a
//! broadcast towards clients, or a notification towards a server that must
//! not be answered.

use std::io::{self, Read, Write};

use crate::domain::TransportError;

/// Token of frames that are not part of a request/response pair
pub const UNSOLICITED_TOKEN: u64 = 0;

/// Largest accepted payload
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub token: u64,
    pub name: String,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(token: u64, name: impl Into<String>, payload: Vec<u8>) -> Self {
        Self { token, name: name.into(), payload }
    }

    pub fn is_unsolicited(&self) -> bool {
        self.token == UNSOLICITED_TOKEN
    }

    /// Encode into a single buffer so one `write_all` emits the whole frame.
    ///
    /// # Errors
    /// Returns a protocol error if the name or payload exceed their length fields.
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        let name_len = u16::try_from(self.name.len())
            .map_err(|_| TransportError::Protocol(format!("endpoint name too long: {}", self.name.len())))?;
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(TransportError::Protocol(format!(
                "payload of {} bytes exceeds {MAX_PAYLOAD_SIZE}",
                self.payload.len()
            )));
        }
        #[allow(clippy::cast_possible_truncation)]
        let payload_len = self.payload.len() as u32;

        let mut buf = Vec::with_capacity(8 + 2 + self.name.len() + 4 + self.payload.len());
        buf.extend_from_slice(&self.token.to_le_bytes());
        buf.extend_from_slice(&name_len.to_le_bytes());
        buf.extend_from_slice(self.name.as_bytes());
        buf.extend_from_slice(&payload_len.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }
}

/// Write one frame.
///
/// # Errors
/// Encoding failures and I/O errors from the writer.
pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> Result<(), TransportError> {
    let buf = frame.encode()?;
    writer.write_all(&buf)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame; `Ok(None)` on a clean end of stream between frames.
///
/// # Errors
/// Malformed frames, truncated streams and I/O errors.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Frame>, TransportError> {
    let mut token = [0u8; 8];
    if !read_exact_or_eof(reader, &mut token)? {
        return Ok(None);
    }
    let token = u64::from_le_bytes(token);

    let mut name_len = [0u8; 2];
    reader.read_exact(&mut name_len).map_err(truncated)?;
    let mut name = vec![0u8; usize::from(u16::from_le_bytes(name_len))];
    reader.read_exact(&mut name).map_err(truncated)?;
    let name = String::from_utf8(name)
        .map_err(|_| TransportError::Protocol("endpoint name is not UTF-8".to_string()))?;

    let mut payload_len = [0u8; 4];
    reader.read_exact(&mut payload_len).map_err(truncated)?;
    let payload_len = u32::from_le_bytes(payload_len) as usize;
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(TransportError::Protocol(format!(
            "payload of {payload_len} bytes exceeds {MAX_PAYLOAD_SIZE}"
        )));
    }
    let mut payload = vec![0u8; payload_len];
    reader.read_exact(&mut payload).map_err(truncated)?;

    Ok(Some(Frame { token, name, payload }))
}

/// Fill `buf`, returning `false` if the stream ended before the first byte.
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool, TransportError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(TransportError::Protocol("truncated frame header".to_string())),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

fn truncated(err: io::Error) -> TransportError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        TransportError::Protocol("truncated frame".to_string())
    } else {
        err.into()
    }
}
