//! Marker-delimited stream framing
//!
//! The gateway wraps every packet between a two-byte start marker and a
//! two-byte end marker. The serial link hands bytes over in arbitrary chunks,
//! so [`StreamAssembler`] buffers them until a complete marker pair is present
//! and resynchronizes when a frame is cut short or garbled.

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, trace};

// ============ Marker Constants ============

/// Start-of-frame marker
pub const START_MARKER: [u8; 2] = [0x55, 0xAA];

/// End-of-frame marker
pub const END_MARKER: [u8; 2] = [0xAA, 0x55];

/// Combined length of both markers
pub const MARKER_OVERHEAD: usize = START_MARKER.len() + END_MARKER.len();

/// Default cap on bytes held for one frame (markers included)
pub const DEFAULT_MAX_FRAME_LEN: usize = 512;

/// Assembler scanning state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblerState {
    /// No start marker in the buffer
    AwaitingStart,
    /// Start marker seen, end marker still missing
    AwaitingEnd,
}

/// Framing counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblerStats {
    /// Bytes fed into the assembler
    pub bytes_received: u64,
    /// Bytes thrown away while resynchronizing
    pub bytes_discarded: u64,
    /// Candidate bodies handed to the caller
    pub frames_extracted: u64,
    /// Times the buffer exceeded the frame cap
    pub overflows: u64,
}

fn find_marker(haystack: &[u8], marker: [u8; 2]) -> Option<usize> {
    haystack.windows(2).position(|w| w == marker)
}

fn rfind_marker(haystack: &[u8], marker: [u8; 2]) -> Option<usize> {
    haystack.windows(2).rposition(|w| w == marker)
}

/// Streaming frame extractor with resynchronization
///
/// Bytes preceding the start marker of an extracted frame are discarded. The
/// body runs from the first start marker to the first end marker after it, so
/// it may still contain the start marker of a later frame when an earlier one
/// was cut short. [`nested_body`] recovers that later frame.
pub struct StreamAssembler {
    buffer: BytesMut,
    max_frame_len: usize,
    stats: AssemblerStats,
}

impl Default for StreamAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl StreamAssembler {
    /// Create an assembler holding at most `max_frame_len` bytes per frame
    pub fn new(max_frame_len: usize) -> Self {
        let max_frame_len = max_frame_len.max(MARKER_OVERHEAD);
        Self {
            buffer: BytesMut::with_capacity(max_frame_len * 2),
            max_frame_len,
            stats: AssemblerStats::default(),
        }
    }

    /// Append freshly read bytes
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
        self.stats.bytes_received += data.len() as u64;
    }

    /// Extract the body of the next complete frame, if any
    ///
    /// Returns `None` while the buffer holds no complete marker pair. The
    /// returned body excludes both markers and may be empty or malformed;
    /// judging it is the decoder's job.
    pub fn try_extract_packet(&mut self) -> Option<Bytes> {
        loop {
            let Some(start) = find_marker(&self.buffer, START_MARKER) else {
                self.trim_unframed();
                return None;
            };

            let body_from = start + START_MARKER.len();
            let Some(end) = find_marker(&self.buffer[body_from..], END_MARKER).map(|e| e + body_from)
            else {
                if self.buffer.len() - start > self.max_frame_len {
                    // Runaway frame: skip this start marker and look for the next one.
                    let dropped = body_from;
                    self.buffer.advance(dropped);
                    self.stats.bytes_discarded += dropped as u64;
                    self.stats.overflows += 1;
                    debug!(dropped, "Frame exceeded length cap without end marker");
                    continue;
                }
                return None;
            };

            let mut frame = self.buffer.split_to(end + END_MARKER.len());
            let discarded = start;
            frame.advance(body_from);
            frame.truncate(frame.len() - END_MARKER.len());

            if discarded > 0 {
                debug!(discarded, "Discarded bytes before frame");
            }
            self.stats.bytes_discarded += discarded as u64;
            self.stats.frames_extracted += 1;
            trace!(len = frame.len(), "Frame extracted");

            return Some(frame.freeze());
        }
    }

    /// Drop unframed bytes once they exceed the cap.
    ///
    /// A trailing byte that could begin a start marker is kept.
    fn trim_unframed(&mut self) {
        if self.buffer.len() <= self.max_frame_len {
            return;
        }
        let keep = usize::from(self.buffer.last() == Some(&START_MARKER[0]));
        let dropped = self.buffer.len() - keep;
        self.buffer.advance(dropped);
        self.stats.bytes_discarded += dropped as u64;
        self.stats.overflows += 1;
        debug!(dropped, "Discarded unframed bytes over length cap");
    }

    /// Current scanning state
    pub fn state(&self) -> AssemblerState {
        if find_marker(&self.buffer, START_MARKER).is_some() {
            AssemblerState::AwaitingEnd
        } else {
            AssemblerState::AwaitingStart
        }
    }

    /// Bytes currently buffered
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Framing counters
    pub fn stats(&self) -> AssemblerStats {
        self.stats
    }

    /// Clear buffer
    pub fn clear(&mut self) {
        self.stats.bytes_discarded += self.buffer.len() as u64;
        self.buffer.clear();
    }
}

/// Body of the last frame nested inside `body`
///
/// When a frame loses its end marker, the next frame's start marker ends up
/// inside the extracted body. This returns the bytes after the last such
/// marker, or `None` if the body holds no start marker.
pub fn nested_body(body: &[u8]) -> Option<&[u8]> {
    rfind_marker(body, START_MARKER).map(|at| &body[at + START_MARKER.len()..])
}

/// Wrap a body in start and end markers
pub fn encode_frame(body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(body.len() + MARKER_OVERHEAD);
    frame.extend_from_slice(&START_MARKER);
    frame.extend_from_slice(body);
    frame.extend_from_slice(&END_MARKER);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_frame() {
        let mut asm = StreamAssembler::default();
        asm.feed(&encode_frame(&[0x01, 0x02, 0x03]));

        assert_eq!(asm.try_extract_packet().as_deref(), Some(&[0x01, 0x02, 0x03][..]));
        assert_eq!(asm.try_extract_packet(), None);
        assert_eq!(asm.buffered(), 0);
        assert_eq!(asm.state(), AssemblerState::AwaitingStart);
    }

    #[test]
    fn test_frame_split_across_reads() {
        let frame = encode_frame(b"hello");
        let mut asm = StreamAssembler::default();

        for chunk in frame[..frame.len() - 1].chunks(2) {
            asm.feed(chunk);
            assert_eq!(asm.try_extract_packet(), None);
        }
        assert_eq!(asm.state(), AssemblerState::AwaitingEnd);

        asm.feed(&frame[frame.len() - 1..]);
        assert_eq!(asm.try_extract_packet().as_deref(), Some(&b"hello"[..]));
    }

    #[test]
    fn test_garbage_prefix_discarded() {
        let mut asm = StreamAssembler::default();
        asm.feed(&[0x00, 0x13, 0x37]);
        asm.feed(&encode_frame(&[0x42]));

        assert_eq!(asm.try_extract_packet().as_deref(), Some(&[0x42][..]));
        assert_eq!(asm.stats().bytes_discarded, 3);
        assert_eq!(asm.buffered(), 0);
    }

    #[test]
    fn test_unterminated_start_is_nested() {
        let mut asm = StreamAssembler::default();
        asm.feed(&[0xDE, 0xAD]);
        asm.feed(&START_MARKER);
        asm.feed(&[0x07, 0x08]); // frame cut short
        asm.feed(&encode_frame(&[0x01, 0x00, 0x10]));

        let body = asm.try_extract_packet().unwrap();
        assert_eq!(body.as_ref(), &[0x07, 0x08, 0x55, 0xAA, 0x01, 0x00, 0x10]);
        assert_eq!(nested_body(&body), Some(&[0x01, 0x00, 0x10][..]));
        assert_eq!(asm.try_extract_packet(), None);
        assert_eq!(asm.stats().frames_extracted, 1);
        assert_eq!(asm.stats().bytes_discarded, 2);
    }

    #[test]
    fn test_start_marker_inside_body_is_kept() {
        let body = [0x03, 0x55, 0xAA, 0x00, 0xC8, 0x00];
        let mut asm = StreamAssembler::default();
        asm.feed(&encode_frame(&body));

        assert_eq!(asm.try_extract_packet().as_deref(), Some(&body[..]));
        assert_eq!(asm.stats().bytes_discarded, 0);
    }

    #[test]
    fn test_nested_body_picks_last_marker() {
        assert_eq!(nested_body(&[0x01, 0x02]), None);
        assert_eq!(
            nested_body(&[0x55, 0xAA, 0x01, 0x55, 0xAA, 0x02, 0x03]),
            Some(&[0x02, 0x03][..])
        );
        assert_eq!(nested_body(&[0x09, 0x55, 0xAA]), Some(&b""[..]));
    }

    #[test]
    fn test_garbage_without_marker_is_kept_under_cap() {
        let mut asm = StreamAssembler::new(64);
        asm.feed(&[0x11; 10]);

        assert_eq!(asm.try_extract_packet(), None);
        assert_eq!(asm.buffered(), 10);
        assert_eq!(asm.stats().bytes_discarded, 0);
    }

    #[test]
    fn test_garbage_over_cap_is_dropped() {
        let mut asm = StreamAssembler::new(16);
        asm.feed(&[0x11; 20]);
        asm.feed(&[START_MARKER[0]]);

        assert_eq!(asm.try_extract_packet(), None);
        // Possible first half of a start marker survives
        assert_eq!(asm.buffered(), 1);
        assert_eq!(asm.stats().overflows, 1);

        asm.feed(&START_MARKER[1..]);
        asm.feed(&[0x09]);
        asm.feed(&END_MARKER);
        assert_eq!(asm.try_extract_packet().as_deref(), Some(&[0x09][..]));
    }

    #[test]
    fn test_runaway_frame_dropped_then_recovered() {
        let mut asm = StreamAssembler::new(16);
        asm.feed(&START_MARKER);
        asm.feed(&[0x33; 20]);
        assert_eq!(asm.try_extract_packet(), None);
        assert_eq!(asm.state(), AssemblerState::AwaitingStart);

        asm.feed(&encode_frame(&[0x01, 0x02]));
        assert_eq!(asm.try_extract_packet().as_deref(), Some(&[0x01, 0x02][..]));
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut stream = encode_frame(&[0x01]);
        stream.extend(encode_frame(&[0x02]));
        stream.extend(encode_frame(&[0x03]));

        let mut asm = StreamAssembler::default();
        asm.feed(&stream);

        let bodies: Vec<Bytes> = std::iter::from_fn(|| asm.try_extract_packet()).collect();
        assert_eq!(bodies.len(), 3);
        assert_eq!(bodies[2].as_ref(), &[0x03]);
    }

    #[test]
    fn test_empty_body() {
        let mut asm = StreamAssembler::default();
        asm.feed(&encode_frame(&[]));
        assert_eq!(asm.try_extract_packet().map(|b| b.len()), Some(0));
    }

    #[test]
    fn test_end_marker_before_start_is_garbage() {
        let mut asm = StreamAssembler::default();
        asm.feed(&END_MARKER);
        asm.feed(&encode_frame(&[0x05]));
        assert_eq!(asm.try_extract_packet().as_deref(), Some(&[0x05][..]));
        assert_eq!(asm.stats().bytes_discarded, 2);
    }
}
