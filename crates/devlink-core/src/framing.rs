//! Byte-stream framing strategies.
//!
//! Stream transports (plain TCP, TLS) deliver bytes in arbitrary chunks.
//! A [`FrameBuffer`] accumulates those chunks and cuts them into whole frames
//! according to the channel's [`Framing`].  Message-oriented transports
//! (WebSocket) already preserve boundaries and bypass the buffer.
//!
//! ```text
//! Raw             every chunk is one frame
//! Delimited       ... payload | delimiter | payload | delimiter ...
//! LengthPrefixed  [len: 1|2|4 bytes, big-endian][payload: len bytes]
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest frame a buffer will reassemble before giving up.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("frame exceeds {max} bytes (buffered {buffered})")]
    Overflow { buffered: usize, max: usize },
    #[error("unsupported length-prefix width {0}; expected 1, 2 or 4")]
    InvalidWidth(u8),
    #[error("delimiter must not be empty")]
    EmptyDelimiter,
}

/// How a channel cuts its byte stream into frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Framing {
    #[default]
    Raw,
    /// Frames end with `delimiter`; the delimiter is stripped.
    Delimited { delimiter: Vec<u8> },
    /// Big-endian length prefix of `width` bytes.  When `include_header` is
    /// set the length counts the prefix itself.  Emitted frames keep the
    /// prefix so codecs see exactly what the device sent.
    LengthPrefixed { width: u8, include_header: bool },
}

impl Framing {
    pub fn validate(&self) -> Result<(), FramingError> {
        match self {
            Framing::Raw => Ok(()),
            Framing::Delimited { delimiter } if delimiter.is_empty() => {
                Err(FramingError::EmptyDelimiter)
            }
            Framing::Delimited { .. } => Ok(()),
            Framing::LengthPrefixed { width, .. } => match width {
                1 | 2 | 4 => Ok(()),
                other => Err(FramingError::InvalidWidth(*other)),
            },
        }
    }
}

/// Reassembly buffer for one connection.
#[derive(Debug)]
pub struct FrameBuffer {
    framing: Framing,
    buf: Vec<u8>,
    max_frame_len: usize,
}

impl FrameBuffer {
    pub fn new(framing: Framing) -> Result<Self, FramingError> {
        Self::with_max_frame_len(framing, DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(framing: Framing, max_frame_len: usize) -> Result<Self, FramingError> {
        framing.validate()?;
        Ok(Self {
            framing,
            buf: Vec::new(),
            max_frame_len,
        })
    }

    pub fn framing(&self) -> &Framing {
        &self.framing
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Appends `bytes` and returns every frame completed by them.
    ///
    /// When the bytes left over after cutting grow past the configured
    /// maximum, that remainder is discarded and reported in
    /// [`Pushed::overflow`]; frames completed earlier in the same chunk are
    /// still returned.
    pub fn push(&mut self, bytes: &[u8]) -> Pushed {
        let frames = match &self.framing {
            Framing::Raw if bytes.is_empty() => Vec::new(),
            Framing::Raw => vec![bytes.to_vec()],
            Framing::Delimited { delimiter } => {
                self.buf.extend_from_slice(bytes);
                split_delimited(&mut self.buf, delimiter)
            }
            Framing::LengthPrefixed {
                width,
                include_header,
            } => {
                self.buf.extend_from_slice(bytes);
                split_length_prefixed(&mut self.buf, *width as usize, *include_header)
            }
        };

        let overflow = (self.buf.len() > self.max_frame_len).then(|| {
            let buffered = self.buf.len();
            self.buf.clear();
            FramingError::Overflow {
                buffered,
                max: self.max_frame_len,
            }
        });
        Pushed { frames, overflow }
    }
}

/// Result of [`FrameBuffer::push`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Pushed {
    pub frames: Vec<Vec<u8>>,
    /// Set when the unfinished remainder was too long and has been dropped.
    pub overflow: Option<FramingError>,
}

fn split_delimited(buf: &mut Vec<u8>, delimiter: &[u8]) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    let mut start = 0;
    while let Some(pos) = find(&buf[start..], delimiter) {
        frames.push(buf[start..start + pos].to_vec());
        start += pos + delimiter.len();
    }
    buf.drain(..start);
    frames
}

fn split_length_prefixed(buf: &mut Vec<u8>, width: usize, include_header: bool) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    let mut start = 0;
    while buf.len() - start >= width {
        let declared = read_be(&buf[start..start + width]);
        let total = if include_header {
            declared.max(width)
        } else {
            declared + width
        };
        if buf.len() - start < total {
            break;
        }
        frames.push(buf[start..start + total].to_vec());
        start += total;
    }
    buf.drain(..start);
    frames
}

fn read_be(bytes: &[u8]) -> usize {
    bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_framing_passes_chunks_through() {
        let mut fb = FrameBuffer::new(Framing::Raw).unwrap();
        assert_eq!(fb.push(b"abc").frames, vec![b"abc".to_vec()]);
        assert!(fb.push(b"").frames.is_empty());
        assert_eq!(fb.buffered(), 0);
    }

    #[test]
    fn test_delimited_framing_splits_and_holds_remainder() {
        let mut fb = FrameBuffer::new(Framing::Delimited {
            delimiter: b"\r\n".to_vec(),
        })
        .unwrap();

        let frames = fb.push(b"OK 1\r\nOK 2\r\nPART").frames;
        assert_eq!(frames, vec![b"OK 1".to_vec(), b"OK 2".to_vec()]);
        assert_eq!(fb.buffered(), 4);

        let frames = fb.push(b"IAL\r").frames;
        assert!(frames.is_empty());
        let frames = fb.push(b"\n").frames;
        assert_eq!(frames, vec![b"PARTIAL".to_vec()]);
        assert_eq!(fb.buffered(), 0);
    }

    #[test]
    fn test_length_prefixed_framing_reassembles_split_frames() {
        let mut fb = FrameBuffer::new(Framing::LengthPrefixed {
            width: 2,
            include_header: false,
        })
        .unwrap();

        assert!(fb.push(&[0x00]).frames.is_empty());
        assert!(fb.push(&[0x03, b'a', b'b']).frames.is_empty());
        let frames = fb.push(&[b'c', 0x00, 0x01, b'z']).frames;
        assert_eq!(
            frames,
            vec![vec![0x00, 0x03, b'a', b'b', b'c'], vec![0x00, 0x01, b'z']]
        );
    }

    #[test]
    fn test_length_prefixed_with_header_counts_prefix() {
        let mut fb = FrameBuffer::new(Framing::LengthPrefixed {
            width: 1,
            include_header: true,
        })
        .unwrap();
        let frames = fb.push(&[0x03, 0xAA, 0xBB, 0x01]).frames;
        assert_eq!(frames, vec![vec![0x03, 0xAA, 0xBB], vec![0x01]]);
    }

    #[test]
    fn test_overflow_discards_partial_frame() {
        let mut fb = FrameBuffer::with_max_frame_len(
            Framing::Delimited {
                delimiter: vec![0],
            },
            4,
        )
        .unwrap();
        let pushed = fb.push(b"abcdef");
        assert!(pushed.frames.is_empty());
        assert_eq!(pushed.overflow, Some(FramingError::Overflow { buffered: 6, max: 4 }));
        assert_eq!(fb.buffered(), 0);
        assert_eq!(fb.push(b"ok\0").frames, vec![b"ok".to_vec()]);
    }

    #[test]
    fn test_overflow_keeps_frames_completed_in_same_chunk() {
        // Arrange
        let mut fb = FrameBuffer::with_max_frame_len(
            Framing::Delimited {
                delimiter: vec![0],
            },
            4,
        )
        .unwrap();

        // Act: two whole frames, then a remainder past the limit.
        let pushed = fb.push(b"ab\0cd\0efghij");

        // Assert
        assert_eq!(pushed.frames, vec![b"ab".to_vec(), b"cd".to_vec()]);
        assert_eq!(pushed.overflow, Some(FramingError::Overflow { buffered: 6, max: 4 }));
        assert_eq!(fb.buffered(), 0);
        assert_eq!(fb.push(b"k\0").frames, vec![b"k".to_vec()]);
    }

    #[test]
    fn test_length_prefixed_overflow_keeps_leading_frame() {
        let mut fb = FrameBuffer::with_max_frame_len(
            Framing::LengthPrefixed {
                width: 1,
                include_header: false,
            },
            3,
        )
        .unwrap();

        let pushed = fb.push(&[0x01, 0xAA, 0x09, 1, 2, 3]);

        assert_eq!(pushed.frames, vec![vec![0x01, 0xAA]]);
        assert_eq!(pushed.overflow, Some(FramingError::Overflow { buffered: 4, max: 3 }));
        assert_eq!(fb.buffered(), 0);
    }

    #[test]
    fn test_invalid_framings_are_rejected() {
        assert_eq!(
            FrameBuffer::new(Framing::LengthPrefixed {
                width: 3,
                include_header: false
            })
            .unwrap_err(),
            FramingError::InvalidWidth(3)
        );
        assert_eq!(
            FrameBuffer::new(Framing::Delimited { delimiter: vec![] }).unwrap_err(),
            FramingError::EmptyDelimiter
        );
    }
}
