//! Segmented message transfer (ASHRAE 135 clause 5.2/5.3).
//!
//! [`OutboundSegments`] splits a service payload that does not fit the peer's
//! max-APDU and tracks which window is in flight. [`Reassembly`] accepts the
//! segments of an inbound message in sequence-number order and decides when a
//! Segment-ACK is due.
//!
//! Both sides start with a window of one: the first segment is acknowledged on
//! its own and that acknowledgement carries the window size used for the rest
//! of the transfer.

use std::ops::Range;

use thiserror::Error;

use super::SegmentHeader;

/// Result type for segmentation operations
pub type Result<T> = std::result::Result<T, SegmentationError>;

/// Largest window a segment header may propose
pub const MAX_WINDOW_SIZE: u8 = 127;

/// Errors that end a segmented transfer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SegmentationError {
    #[error("segment {received} arrived while expecting {expected}")]
    OutOfOrder { expected: u8, received: u8 },
    #[error("segmented message must start at sequence number 0, got {0}")]
    UnexpectedFirstSegment(u8),
    #[error("reassembled message exceeds {limit} bytes")]
    Overflow { limit: usize },
    #[error("message needs {needed} segments, peer accepts {limit}")]
    TooManySegments { needed: usize, limit: usize },
    #[error("window size {0} outside 1..=127")]
    InvalidWindowSize(u8),
    #[error("no room for segment payload in a {0} byte APDU")]
    SegmentSizeTooSmall(usize),
}

/// What a Segment-ACK did to the transmit window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowAck {
    /// Not for the window in flight
    Ignored,
    /// Window moved on; transmit [`OutboundSegments::current_window`]
    Advanced,
    /// Negative ACK for the last segment received; transmit the window again
    Retransmit,
    /// Every segment has been acknowledged
    Finished,
}

/// Sender side of a segmented transfer
#[derive(Debug, Clone)]
pub struct OutboundSegments {
    data: Vec<u8>,
    segment_size: usize,
    total: usize,
    proposed_window: u8,
    actual_window: u8,
    window_start: usize,
}

impl OutboundSegments {
    /// Split `data` into segments of at most `segment_size` octets.
    ///
    /// `max_segments` is the peer's advertised limit, if it gave one.
    pub fn new(
        data: Vec<u8>,
        segment_size: usize,
        proposed_window: u8,
        max_segments: Option<usize>,
    ) -> Result<Self> {
        if segment_size == 0 {
            return Err(SegmentationError::SegmentSizeTooSmall(segment_size));
        }
        if proposed_window == 0 || proposed_window > MAX_WINDOW_SIZE {
            return Err(SegmentationError::InvalidWindowSize(proposed_window));
        }

        let total = data.len().div_ceil(segment_size).max(1);
        if let Some(limit) = max_segments {
            if total > limit {
                return Err(SegmentationError::TooManySegments {
                    needed: total,
                    limit,
                });
            }
        }

        Ok(Self {
            data,
            segment_size,
            total,
            proposed_window,
            actual_window: 1,
            window_start: 0,
        })
    }

    pub fn segment_count(&self) -> usize {
        self.total
    }

    /// Start the transfer over from the first segment
    pub fn restart(&mut self) {
        self.window_start = 0;
        self.actual_window = 1;
    }

    /// Segment indices that may be in flight right now
    pub fn current_window(&self) -> Range<usize> {
        let end = (self.window_start + self.actual_window as usize).min(self.total);
        self.window_start..end
    }

    /// Header and payload of segment `index`
    pub fn segment(&self, index: usize) -> (SegmentHeader, &[u8]) {
        let start = (index * self.segment_size).min(self.data.len());
        let end = (start + self.segment_size).min(self.data.len());
        let header = SegmentHeader {
            // Sequence numbers are modulo 256
            sequence_number: index as u8,
            window_size: self.proposed_window,
            more_follows: index + 1 < self.total,
        };
        (header, &self.data[start..end])
    }

    /// Apply a Segment-ACK from the peer.
    pub fn acknowledge(&mut self, sequence_number: u8, window_size: u8, negative: bool) -> WindowAck {
        if negative && self.window_start > 0 && sequence_number == (self.window_start - 1) as u8 {
            return WindowAck::Retransmit;
        }

        let acked = self
            .current_window()
            .find(|index| *index as u8 == sequence_number);
        let Some(acked) = acked else {
            return WindowAck::Ignored;
        };

        self.window_start = acked + 1;
        self.actual_window = window_size.clamp(1, MAX_WINDOW_SIZE);

        if self.window_start >= self.total {
            WindowAck::Finished
        } else {
            WindowAck::Advanced
        }
    }
}

/// What [`Reassembly`] made of an inbound segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentAccept {
    /// Stored, no acknowledgement due yet
    Buffered,
    /// Stored and a window is full; acknowledge `sequence_number`
    AckWindow { sequence_number: u8 },
    /// Seen before; acknowledge the last in-order segment again
    Duplicate { sequence_number: u8 },
    /// Final segment stored; acknowledge it and take the message
    Complete { sequence_number: u8 },
}

/// Receiver side of a segmented transfer
#[derive(Debug, Clone)]
pub struct Reassembly {
    buffer: Vec<u8>,
    expected: u8,
    window_size: u8,
    in_window: u8,
    max_total: usize,
    max_segments: Option<usize>,
    segments: usize,
}

impl Reassembly {
    /// Start from the first segment of a message.
    ///
    /// `window_size` is the actual window this receiver grants, at most the
    /// sender's proposal.
    pub fn start(
        header: SegmentHeader,
        data: &[u8],
        window_size: u8,
        max_total: usize,
        max_segments: Option<usize>,
    ) -> Result<(Self, SegmentAccept)> {
        if header.sequence_number != 0 {
            return Err(SegmentationError::UnexpectedFirstSegment(header.sequence_number));
        }
        if header.window_size == 0 || header.window_size > MAX_WINDOW_SIZE {
            return Err(SegmentationError::InvalidWindowSize(header.window_size));
        }

        let mut reassembly = Self {
            buffer: Vec::new(),
            expected: 0,
            window_size: window_size.clamp(1, header.window_size),
            in_window: 0,
            max_total,
            max_segments,
            segments: 0,
        };
        reassembly.store(data)?;
        reassembly.expected = 1;

        let accept = if header.more_follows {
            SegmentAccept::AckWindow { sequence_number: 0 }
        } else {
            SegmentAccept::Complete { sequence_number: 0 }
        };
        Ok((reassembly, accept))
    }

    /// Window size granted to the sender
    pub fn window_size(&self) -> u8 {
        self.window_size
    }

    /// Sequence number of the last segment taken in order
    pub fn last_sequence(&self) -> u8 {
        self.expected.wrapping_sub(1)
    }

    fn store(&mut self, data: &[u8]) -> Result<()> {
        if self.buffer.len() + data.len() > self.max_total {
            return Err(SegmentationError::Overflow {
                limit: self.max_total,
            });
        }
        if let Some(limit) = self.max_segments {
            if self.segments + 1 > limit {
                return Err(SegmentationError::TooManySegments {
                    needed: self.segments + 1,
                    limit,
                });
            }
        }
        self.buffer.extend_from_slice(data);
        self.segments += 1;
        Ok(())
    }

    /// Take the next segment.
    pub fn accept(&mut self, header: SegmentHeader, data: &[u8]) -> Result<SegmentAccept> {
        let sequence_number = header.sequence_number;

        if sequence_number != self.expected {
            let behind = self.expected.wrapping_sub(sequence_number);
            if behind >= 1 && behind <= self.window_size {
                return Ok(SegmentAccept::Duplicate {
                    sequence_number: self.last_sequence(),
                });
            }
            return Err(SegmentationError::OutOfOrder {
                expected: self.expected,
                received: sequence_number,
            });
        }

        self.store(data)?;
        self.expected = self.expected.wrapping_add(1);
        self.in_window += 1;

        if !header.more_follows {
            return Ok(SegmentAccept::Complete { sequence_number });
        }
        if self.in_window >= self.window_size {
            self.in_window = 0;
            return Ok(SegmentAccept::AckWindow { sequence_number });
        }
        Ok(SegmentAccept::Buffered)
    }

    /// Reassembled payload
    pub fn into_payload(self) -> Vec<u8> {
        self.buffer
    }
}
