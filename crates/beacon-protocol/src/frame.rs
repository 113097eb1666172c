//! Framed envelope codec for the collector link.
//!
//! Every message travels as
//!
//! ```text
//! <sandesh length="NNNNNNNNNN">BODY</sandesh>
//! ```
//!
//! where `NNNNNNNNNN` is the total frame length (both wrapper tags
//! included) as a ten-digit zero-padded decimal. The opener's literal
//! tokens are validated byte-for-byte; any deviation is a framing error,
//! which is unrecoverable on the current connection.
//!
//! `FrameDecoder` is fed arbitrary-sized chunks straight off the socket and
//! yields complete BODY strings in arrival order, regardless of how the
//! stream was segmented.

// ---------------------------------------------------------------------------
// Envelope constants
// ---------------------------------------------------------------------------

const OPEN_PREFIX: &str = "<sandesh length=\"";
const OPEN_SUFFIX: &str = "\">";
const CLOSE: &str = "</sandesh>";
const LENGTH_DIGITS: usize = 10;

/// Byte length of the complete opener, digits included.
const OPEN_LEN: usize = OPEN_PREFIX.len() + LENGTH_DIGITS + OPEN_SUFFIX.len();
/// Envelope overhead added around a body.
pub const ENVELOPE_LEN: usize = OPEN_LEN + CLOSE.len();

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

/// Wrap `body` in the length-prefixed envelope.
pub fn encode(body: &str) -> String {
    let total = ENVELOPE_LEN + body.len();
    let mut frame = String::with_capacity(total);
    frame.push_str(OPEN_PREFIX);
    frame.push_str(&format!("{total:0width$}", width = LENGTH_DIGITS));
    frame.push_str(OPEN_SUFFIX);
    frame.push_str(body);
    frame.push_str(CLOSE);
    frame
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("frame opener does not match the envelope grammar")]
    BadOpener,
    #[error("invalid frame length field '{0}'")]
    BadLength(String),
    #[error("frame close tag missing or malformed")]
    BadCloser,
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
}

/// Stateful deframer.
///
/// Feed it byte chunks as they arrive; it buffers across chunk boundaries
/// and yields each complete BODY. A returned error poisons the decoder —
/// the session owning it must be closed.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        FrameDecoder::default()
    }

    /// Bytes currently buffered awaiting a complete frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Consume `chunk` and return every complete BODY now available.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<String>, FramingError> {
        self.buf.extend_from_slice(chunk);
        let mut bodies = Vec::new();
        loop {
            match self.extract_one()? {
                Some(body) => bodies.push(body),
                None => return Ok(bodies),
            }
        }
    }

    /// Try to extract a single frame from the front of the buffer.
    fn extract_one(&mut self) -> Result<Option<String>, FramingError> {
        if self.buf.len() < OPEN_LEN {
            return Ok(None);
        }
        let frame_len = self.parse_opener()?;
        if self.buf.len() < frame_len {
            return Ok(None);
        }
        // Validate the trailing close tag before slicing out the body.
        let close_start = frame_len - CLOSE.len();
        if close_start < OPEN_LEN || &self.buf[close_start..frame_len] != CLOSE.as_bytes() {
            return Err(FramingError::BadCloser);
        }
        let body = std::str::from_utf8(&self.buf[OPEN_LEN..close_start])
            .map_err(|_| FramingError::InvalidUtf8)?
            .to_owned();
        self.buf.drain(..frame_len);
        Ok(Some(body))
    }

    /// Validate the literal opener tokens and parse the length digits.
    fn parse_opener(&self) -> Result<usize, FramingError> {
        if &self.buf[..OPEN_PREFIX.len()] != OPEN_PREFIX.as_bytes() {
            return Err(FramingError::BadOpener);
        }
        if &self.buf[OPEN_LEN - OPEN_SUFFIX.len()..OPEN_LEN] != OPEN_SUFFIX.as_bytes() {
            return Err(FramingError::BadOpener);
        }
        let digits = &self.buf[OPEN_PREFIX.len()..OPEN_PREFIX.len() + LENGTH_DIGITS];
        let digits = std::str::from_utf8(digits).map_err(|_| FramingError::InvalidUtf8)?;
        let frame_len: usize = digits
            .parse()
            .map_err(|_| FramingError::BadLength(digits.to_owned()))?;
        if frame_len < ENVELOPE_LEN {
            return Err(FramingError::BadLength(digits.to_owned()));
        }
        Ok(frame_len)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
