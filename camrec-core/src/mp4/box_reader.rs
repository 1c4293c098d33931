//! Length-prefixed box framing for fragmented MP4 streams
//!
//! The transcoder writes a continuous sequence of boxes: a 4-byte big-endian
//! size (header included), a 4-byte ASCII type and the payload. Nothing beyond
//! that envelope is interpreted here.

use std::fmt;
use std::io;

use bytes::{Bytes, BytesMut};
use futures::Stream;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Size of the box header (size field plus type tag).
pub const BOX_HEADER_SIZE: usize = 8;

/// Default ceiling for a single box payload.
pub const DEFAULT_MAX_BOX_SIZE: usize = 64 * 1024 * 1024;

/// Errors that can occur while reading boxes from a byte stream
#[derive(Debug, Error)]
pub enum BoxReadError {
    /// Size field is smaller than the header or above the sanity ceiling
    #[error("Malformed box '{box_type}': declared size {declared_size}, {reason}")]
    MalformedBox {
        /// Type tag read from the header
        box_type: BoxType,
        /// Size field as written by the producer
        declared_size: u32,
        /// What made the size unacceptable
        reason: &'static str,
    },

    /// Source ended before the requested byte count arrived
    #[error("Stream truncated: expected {expected} bytes, received {received}")]
    StreamTruncated {
        /// Bytes requested
        expected: usize,
        /// Bytes received before end of stream
        received: usize,
    },

    /// Underlying read failed
    #[error("I/O error while reading boxes: {0}")]
    Io(#[from] io::Error),
}

impl BoxReadError {
    /// True when the source simply ended, which is how a stopped transcoder looks.
    pub fn is_truncation(&self) -> bool {
        matches!(self, BoxReadError::StreamTruncated { .. })
    }
}

/// Four-character box type tag
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoxType(pub [u8; 4]);

impl BoxType {
    /// File type box, first half of the initialization segment
    pub const FTYP: BoxType = BoxType(*b"ftyp");
    /// Movie metadata box, completes the initialization segment
    pub const MOOV: BoxType = BoxType(*b"moov");
    /// Movie fragment box, starts a media unit
    pub const MOOF: BoxType = BoxType(*b"moof");
    /// Media data box, closes a media unit
    pub const MDAT: BoxType = BoxType(*b"mdat");

    /// Returns the raw tag bytes.
    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl fmt::Display for BoxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for BoxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BoxType({self})")
    }
}

/// One box read from the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mp4Box {
    /// Header bytes exactly as received
    pub header: [u8; BOX_HEADER_SIZE],
    /// Payload length (header already subtracted)
    pub length: u32,
    /// Type tag
    pub box_type: BoxType,
    /// Payload bytes
    pub payload: Bytes,
}

impl Mp4Box {
    /// Builds a box from a type and payload, computing the header.
    pub fn new(box_type: BoxType, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        let size = (payload.len() + BOX_HEADER_SIZE) as u32;

        let mut header = [0u8; BOX_HEADER_SIZE];
        header[..4].copy_from_slice(&size.to_be_bytes());
        header[4..].copy_from_slice(box_type.as_bytes());

        Self {
            header,
            length: payload.len() as u32,
            box_type,
            payload,
        }
    }

    /// Total encoded size including the header.
    pub fn encoded_len(&self) -> usize {
        BOX_HEADER_SIZE + self.payload.len()
    }

    /// Appends header and payload to `buf`.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(&self.header);
        buf.extend_from_slice(&self.payload);
    }

    /// Header and payload as one contiguous buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.write_to(&mut buf);
        buf.freeze()
    }
}

/// Parses the header, returning the type and payload length.
///
/// # Errors
///
/// - `BoxReadError::MalformedBox` - Size smaller than the header or above `max_payload`
pub fn parse_box_header(
    header: &[u8; BOX_HEADER_SIZE],
    max_payload: usize,
) -> Result<(BoxType, u32), BoxReadError> {
    let declared_size = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let box_type = BoxType([header[4], header[5], header[6], header[7]]);

    // Sizes 0 (to end of file) and 1 (64-bit size) are not produced by the
    // fragmented muxer; they land here as well.
    let Some(length) = declared_size.checked_sub(BOX_HEADER_SIZE as u32) else {
        return Err(BoxReadError::MalformedBox {
            box_type,
            declared_size,
            reason: "smaller than the box header",
        });
    };

    if length as usize > max_payload {
        return Err(BoxReadError::MalformedBox {
            box_type,
            declared_size,
            reason: "exceeds the payload ceiling",
        });
    }

    Ok((box_type, length))
}

/// Reads boxes one at a time from an async byte source
///
/// A reader is single-use: after an error the stream is out of sync and a new
/// reader over a new source is required.
pub struct BoxReader<R> {
    source: R,
    max_payload: usize,
}

impl<R> BoxReader<R>
where
    R: AsyncRead + Unpin,
{
    /// Creates a reader with the default payload ceiling.
    pub fn new(source: R) -> Self {
        Self::with_max_payload(source, DEFAULT_MAX_BOX_SIZE)
    }

    /// Creates a reader rejecting payloads larger than `max_payload`.
    pub fn with_max_payload(source: R, max_payload: usize) -> Self {
        Self {
            source,
            max_payload,
        }
    }

    /// Reads exactly `count` bytes, suspending until they arrive.
    ///
    /// A zero count returns immediately without touching the source.
    ///
    /// # Errors
    ///
    /// - `BoxReadError::StreamTruncated` - Source ended before `count` bytes
    /// - `BoxReadError::Io` - Underlying read failed
    pub async fn read_bytes(&mut self, count: usize) -> Result<Bytes, BoxReadError> {
        if count == 0 {
            return Ok(Bytes::new());
        }

        let mut buf = BytesMut::zeroed(count);
        let mut filled = 0;
        while filled < count {
            let n = self.source.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(BoxReadError::StreamTruncated {
                    expected: count,
                    received: filled,
                });
            }
            filled += n;
        }

        Ok(buf.freeze())
    }

    /// Reads the next complete box.
    ///
    /// # Errors
    ///
    /// - `BoxReadError::StreamTruncated` - Source ended inside the header or payload
    /// - `BoxReadError::MalformedBox` - Size field is not plausible
    /// - `BoxReadError::Io` - Underlying read failed
    pub async fn next_box(&mut self) -> Result<Mp4Box, BoxReadError> {
        let raw = self.read_bytes(BOX_HEADER_SIZE).await?;
        let mut header = [0u8; BOX_HEADER_SIZE];
        header.copy_from_slice(&raw);

        let (box_type, length) = parse_box_header(&header, self.max_payload)?;
        let payload = self.read_bytes(length as usize).await?;

        Ok(Mp4Box {
            header,
            length,
            box_type,
            payload,
        })
    }

    /// Turns the reader into a stream that ends after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Mp4Box, BoxReadError>> {
        futures::stream::unfold(Some(self), |reader| async move {
            let mut reader = reader?;
            match reader.next_box().await {
                Ok(mp4_box) => Some((Ok(mp4_box), Some(reader))),
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    /// Returns the underlying source.
    pub fn into_inner(self) -> R {
        self.source
    }
}
