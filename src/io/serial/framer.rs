// src/io/serial/framer.rs
//
// Splits the inbound byte stream from the scale into frames.
// Scales either terminate each reply with a delimiter (usually CRLF) or
// bracket it with STX/ETX; both are handled here so the decoder only ever
// sees one complete reply at a time.

use serde::{Deserialize, Serialize};

pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;

// =============================================================================
// Types
// =============================================================================

/// Framing encoding types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FramingEncoding {
    /// Delimiter-based framing
    Delimiter {
        /// Delimiter byte sequence (e.g., [0x0D, 0x0A] for CRLF)
        delimiter: Vec<u8>,
        /// Max frame length before forced split
        max_length: usize,
    },
    /// Payload bracketed by STX (0x02) and ETX (0x03); bytes outside a bracket are ignored
    StxEtx {
        /// Frames longer than this are dropped and the framer resynchronises on the next STX
        max_length: usize,
    },
}

impl Default for FramingEncoding {
    fn default() -> Self {
        FramingEncoding::Delimiter {
            delimiter: vec![0x0D, 0x0A],
            max_length: 64,
        }
    }
}

// =============================================================================
// Internal Framer Trait
// =============================================================================

trait FramerImpl {
    fn feed(&mut self, data: &[u8]) -> Vec<Vec<u8>>;
}

// =============================================================================
// Delimiter-Based Framer
// =============================================================================

struct DelimiterFramer {
    buffer: Vec<u8>,
    delimiter: Vec<u8>,
    max_length: usize,
}

impl DelimiterFramer {
    fn new(delimiter: Vec<u8>, max_length: usize) -> Self {
        DelimiterFramer {
            buffer: Vec::new(),
            delimiter,
            max_length: max_length.max(1),
        }
    }
}

impl FramerImpl for DelimiterFramer {
    fn feed(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();

        for &byte in data {
            self.buffer.push(byte);

            if !self.delimiter.is_empty() && self.buffer.len() >= self.delimiter.len() {
                let start = self.buffer.len() - self.delimiter.len();
                if self.buffer[start..] == self.delimiter[..] {
                    let frame: Vec<u8> = self.buffer.drain(..start).collect();
                    self.buffer.clear();
                    if !frame.is_empty() {
                        frames.push(frame);
                    }
                    continue;
                }
            }

            // Force split on max length. The tail may be the start of a
            // delimiter, so it stays buffered.
            let held_back = self.delimiter.len().saturating_sub(1);
            if self.buffer.len() >= self.max_length + held_back {
                frames.push(self.buffer.drain(..self.max_length).collect());
            }
        }

        frames
    }
}

// =============================================================================
// STX/ETX Framer
// =============================================================================

struct StxEtxFramer {
    buffer: Vec<u8>,
    in_frame: bool,
    max_length: usize,
}

impl StxEtxFramer {
    fn new(max_length: usize) -> Self {
        StxEtxFramer {
            buffer: Vec::new(),
            in_frame: false,
            max_length: max_length.max(1),
        }
    }
}

impl FramerImpl for StxEtxFramer {
    fn feed(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();

        for &byte in data {
            match byte {
                // A second STX restarts the frame: the previous one was truncated
                STX => {
                    self.buffer.clear();
                    self.in_frame = true;
                }
                ETX if self.in_frame => {
                    if !self.buffer.is_empty() {
                        frames.push(self.buffer.drain(..).collect());
                    }
                    self.in_frame = false;
                }
                _ if self.in_frame => {
                    self.buffer.push(byte);
                    if self.buffer.len() > self.max_length {
                        self.buffer.clear();
                        self.in_frame = false;
                    }
                }
                _ => {}
            }
        }

        frames
    }
}

// =============================================================================
// Public SerialFramer
// =============================================================================

/// Stateful serial framer for streaming data.
/// A partial frame left in the buffer when the link closes is discarded with the framer.
pub struct SerialFramer {
    framer: Box<dyn FramerImpl + Send>,
}

impl SerialFramer {
    /// Create a new framer with the specified encoding
    pub fn new(encoding: FramingEncoding) -> Self {
        let framer: Box<dyn FramerImpl + Send> = match encoding {
            FramingEncoding::Delimiter {
                delimiter,
                max_length,
            } => Box::new(DelimiterFramer::new(delimiter, max_length)),
            FramingEncoding::StxEtx { max_length } => Box::new(StxEtxFramer::new(max_length)),
        };

        SerialFramer { framer }
    }

    /// Feed raw bytes into the framer.
    /// Returns any complete frames that were parsed.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.framer.feed(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delimiter_framing() {
        let mut framer = SerialFramer::new(FramingEncoding::default());

        let frames = framer.feed(b"001438500000\r\n00252\r\n");

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], b"001438500000".to_vec());
        assert_eq!(frames[1], b"00252".to_vec());
    }

    #[test]
    fn test_delimiter_framing_across_reads() {
        let mut framer = SerialFramer::new(FramingEncoding::default());

        assert!(framer.feed(b"00143").is_empty());
        assert!(framer.feed(b"8500000\r").is_empty());
        let frames = framer.feed(b"\n");

        assert_eq!(frames, vec![b"001438500000".to_vec()]);
    }

    #[test]
    fn test_delimiter_max_length() {
        let mut framer = SerialFramer::new(FramingEncoding::Delimiter {
            delimiter: vec![0x0A],
            max_length: 5,
        });

        let frames = framer.feed(b"12345678\n");

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], b"12345".to_vec());
        assert_eq!(frames[1], b"678".to_vec());
    }

    #[test]
    fn test_max_length_shorter_than_delimiter() {
        let mut framer = SerialFramer::new(FramingEncoding::Delimiter {
            delimiter: vec![0x0D, 0x0A],
            max_length: 1,
        });

        let frames = framer.feed(b"AB\r\nC\r\n");

        assert_eq!(frames, vec![b"A".to_vec(), b"B".to_vec(), b"C".to_vec()]);
    }

    #[test]
    fn test_frame_at_max_length_keeps_delimiter() {
        let mut framer = SerialFramer::new(FramingEncoding::Delimiter {
            delimiter: vec![0x0D, 0x0A],
            max_length: 5,
        });

        let frames = framer.feed(b"00252\r\n1234567\r\n");

        assert_eq!(
            frames,
            vec![b"00252".to_vec(), b"12345".to_vec(), b"67".to_vec()]
        );
    }

    #[test]
    fn test_empty_lines_are_skipped() {
        let mut framer = SerialFramer::new(FramingEncoding::default());
        let frames = framer.feed(b"\r\n\r\n42\r\n");
        assert_eq!(frames, vec![b"42".to_vec()]);
    }

    #[test]
    fn test_stx_etx_framing() {
        let mut framer = SerialFramer::new(FramingEncoding::StxEtx { max_length: 32 });

        let mut data = vec![b'x', STX];
        data.extend_from_slice(b"0014385");
        data.push(ETX);
        data.extend_from_slice(b"\r\n");
        data.push(STX);
        data.extend_from_slice(b"00252");
        data.push(ETX);

        let frames = framer.feed(&data);
        assert_eq!(frames, vec![b"0014385".to_vec(), b"00252".to_vec()]);
    }

    #[test]
    fn test_stx_etx_resyncs_after_overlong_frame() {
        let mut framer = SerialFramer::new(FramingEncoding::StxEtx { max_length: 4 });

        let mut data = vec![STX];
        data.extend_from_slice(b"123456");
        data.push(ETX);
        data.push(STX);
        data.extend_from_slice(b"12");
        data.push(ETX);

        let frames = framer.feed(&data);
        assert_eq!(frames, vec![b"12".to_vec()]);
    }

    #[test]
    fn test_stx_restarts_truncated_frame() {
        let mut framer = SerialFramer::new(FramingEncoding::StxEtx { max_length: 32 });

        let mut data = vec![STX];
        data.extend_from_slice(b"00");
        data.push(STX);
        data.extend_from_slice(b"99");
        data.push(ETX);

        assert_eq!(framer.feed(&data), vec![b"99".to_vec()]);
    }
}
