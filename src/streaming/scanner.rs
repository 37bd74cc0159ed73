//! Reassembly of a server stream into discrete messages.
//!
//! A stream starts out as back-to-back XML events terminated by
//! `</event>`. After a successful protocol swap it becomes a sequence of
//! `0xBF, varint(length), protobuf` frames. Bytes arrive in arbitrary chunks;
//! the scanner keeps its position between calls so a frame split anywhere
//! (inside the end token, the magic byte, the varint or the payload) is
//! still found exactly once.

use tracing::{debug, error, warn};

use crate::core::constants::{STREAM_MAX_PROTO_LEN, STREAM_RX_BUFFER_SIZE, TAKPROTO_MAGIC, XML_END_TOKEN};
use crate::cot::{Varint, framing::decode_varint};

/// One complete message cut from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A full XML event, end token included.
    Xml(Vec<u8>),
    /// A protobuf payload without its header.
    Proto(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    /// Looking for the XML end token.
    Xml,
    /// Looking for the magic byte.
    Magic,
    /// Inside the length varint.
    Len,
    /// Waiting for this many payload bytes.
    Data(usize),
}

/// Cursor-based scanner over a growable receive buffer.
///
/// `start` marks the first byte of the message being assembled, `pos` the
/// first byte not yet examined.
#[derive(Debug)]
pub struct StreamScanner {
    buf: Vec<u8>,
    start: usize,
    pos: usize,
    state: ScanState,
    magic_skipped: usize,
    capacity: usize,
}

impl Default for StreamScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamScanner {
    /// A scanner in XML mode.
    pub fn new() -> Self {
        Self::with_capacity(STREAM_RX_BUFFER_SIZE)
    }

    /// A scanner that discards data once more than `capacity` bytes of an
    /// unfinished message are buffered.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity.min(STREAM_RX_BUFFER_SIZE)),
            start: 0,
            pos: 0,
            state: ScanState::Xml,
            magic_skipped: 0,
            capacity,
        }
    }

    /// True until [`switch_to_proto`](Self::switch_to_proto) is called.
    pub fn is_xml(&self) -> bool {
        self.state == ScanState::Xml
    }

    /// Bytes received but not yet returned as part of a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.start
    }

    /// Treat everything after the last returned frame as protobuf frames.
    ///
    /// Bytes already buffered are rescanned, so data that arrived in the
    /// same read as the swap acceptance is not lost.
    pub fn switch_to_proto(&mut self) {
        self.state = ScanState::Magic;
        self.pos = self.start;
        self.magic_skipped = 0;
    }

    /// Forget all buffered data and return to XML mode.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.start = 0;
        self.pos = 0;
        self.state = ScanState::Xml;
        self.magic_skipped = 0;
    }

    /// Append newly received bytes.
    pub fn feed(&mut self, data: &[u8]) {
        if self.start > 0 {
            self.buf.drain(..self.start);
            self.pos -= self.start;
            self.start = 0;
        }
        self.buf.extend_from_slice(data);

        let limit = match self.state {
            ScanState::Data(len) => self.capacity.max(len + 16),
            _ => self.capacity,
        };
        if self.buf.len() > limit {
            let keep = self.capacity / 2;
            let drop = self.buf.len() - keep;
            self.buf.drain(..drop);
            self.pos = 0;
            debug!(dropped = drop, "message scanning buffer full; discarded some streaming data");
            if self.state != ScanState::Xml {
                self.state = ScanState::Magic;
            }
        }
    }

    /// The next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            match self.state {
                ScanState::Xml => return self.next_xml(),
                ScanState::Magic => {
                    let b = *self.buf.get(self.pos)?;
                    self.pos += 1;
                    if b == TAKPROTO_MAGIC {
                        if self.magic_skipped != 0 {
                            debug!(skipped = self.magic_skipped, "found magic byte in server stream after skipping");
                            self.magic_skipped = 0;
                        }
                        self.state = ScanState::Len;
                    } else {
                        if self.magic_skipped == 0 {
                            warn!(byte = format_args!("{b:#04X}"), "expected magic byte in server stream; skipping to next magic byte");
                        }
                        self.magic_skipped += 1;
                    }
                    self.start = self.pos;
                }
                ScanState::Len => {
                    let b = *self.buf.get(self.pos)?;
                    self.pos += 1;
                    if b & 0x80 != 0 && self.pos - self.start < 10 {
                        continue;
                    }
                    let header = &self.buf[self.start..self.pos];
                    self.state = match decode_varint(header) {
                        Varint::Complete(len, used) if used == header.len() && len as usize <= STREAM_MAX_PROTO_LEN => {
                            ScanState::Data(len as usize)
                        }
                        other => {
                            error!(varint = ?other, "protobuf length varint incorrect or too large; rescanning for header");
                            ScanState::Magic
                        }
                    };
                    self.start = self.pos;
                }
                ScanState::Data(len) => {
                    if self.buf.len() - self.start < len {
                        self.pos = self.buf.len();
                        return None;
                    }
                    let end = self.start + len;
                    let frame = self.buf[self.start..end].to_vec();
                    self.start = end;
                    self.pos = end;
                    self.state = ScanState::Magic;
                    return Some(Frame::Proto(frame));
                }
            }
        }
    }

    fn next_xml(&mut self) -> Option<Frame> {
        let from = self.pos.saturating_sub(XML_END_TOKEN.len() - 1).max(self.start);
        let found = self.buf[from..]
            .windows(XML_END_TOKEN.len())
            .position(|w| w == XML_END_TOKEN);
        match found {
            Some(idx) => {
                let end = from + idx + XML_END_TOKEN.len();
                let frame = self.buf[self.start..end].to_vec();
                self.start = end;
                self.pos = end;
                Some(Frame::Xml(frame))
            }
            None => {
                self.pos = self.buf.len();
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cot::framing::encode_varint;

    fn proto_frame(payload: &[u8]) -> Vec<u8> {
        let mut out = vec![TAKPROTO_MAGIC];
        encode_varint(payload.len() as u64, &mut out);
        out.extend_from_slice(payload);
        out
    }

    fn payloads() -> Vec<Vec<u8>> {
        vec![
            b"first".to_vec(),
            vec![0xBF; 3],
            (0..200u8).collect(),
            vec![0x80, 0x01, 0xFF],
            b"x".to_vec(),
        ]
    }

    fn drain(scanner: &mut StreamScanner, out: &mut Vec<Frame>) {
        while let Some(f) = scanner.next_frame() {
            out.push(f);
        }
    }

    #[test]
    fn test_proto_frames_survive_every_chunk_split() {
        let payloads = payloads();
        let stream: Vec<u8> = payloads.iter().flat_map(|p| proto_frame(p)).collect();

        for chunk in 1..=stream.len() {
            let mut scanner = StreamScanner::new();
            scanner.switch_to_proto();
            let mut frames = Vec::new();
            for piece in stream.chunks(chunk) {
                scanner.feed(piece);
                drain(&mut scanner, &mut frames);
            }
            let expected: Vec<Frame> = payloads.iter().cloned().map(Frame::Proto).collect();
            assert_eq!(frames, expected, "chunk size {chunk}");
            assert_eq!(scanner.buffered(), 0);
        }
    }

    #[test]
    fn test_xml_split_inside_end_token() {
        let a = b"<event uid=\"a\"><detail/></event>";
        let b = b"<event uid=\"b\"></event>";
        let stream: Vec<u8> = a.iter().chain(b.iter()).copied().collect();

        for split in 1..stream.len() {
            let mut scanner = StreamScanner::new();
            let mut frames = Vec::new();
            scanner.feed(&stream[..split]);
            drain(&mut scanner, &mut frames);
            scanner.feed(&stream[split..]);
            drain(&mut scanner, &mut frames);
            assert_eq!(frames, vec![Frame::Xml(a.to_vec()), Frame::Xml(b.to_vec())], "split {split}");
        }
    }

    #[test]
    fn test_switch_keeps_trailing_bytes() {
        let mut data = b"<event uid=\"resp\"></event>".to_vec();
        data.extend(proto_frame(b"after"));

        let mut scanner = StreamScanner::new();
        scanner.feed(&data);
        assert!(matches!(scanner.next_frame(), Some(Frame::Xml(_))));
        scanner.switch_to_proto();
        assert_eq!(scanner.next_frame(), Some(Frame::Proto(b"after".to_vec())));
    }

    #[test]
    fn test_resyncs_after_garbage() {
        let mut scanner = StreamScanner::new();
        scanner.switch_to_proto();
        let mut data = vec![0x00, 0x11, 0x22];
        data.extend(proto_frame(b"ok"));
        scanner.feed(&data);
        assert_eq!(scanner.next_frame(), Some(Frame::Proto(b"ok".to_vec())));
    }

    #[test]
    fn test_oversized_length_rescans() {
        let mut scanner = StreamScanner::new();
        scanner.switch_to_proto();
        let mut data = vec![TAKPROTO_MAGIC];
        encode_varint((STREAM_MAX_PROTO_LEN + 1) as u64, &mut data);
        data.extend(proto_frame(b"next"));
        scanner.feed(&data);
        assert_eq!(scanner.next_frame(), Some(Frame::Proto(b"next".to_vec())));
    }

    #[test]
    fn test_full_buffer_discards() {
        let mut scanner = StreamScanner::with_capacity(64);
        scanner.feed(&[b'a'; 100]);
        assert!(scanner.next_frame().is_none());
        assert!(scanner.buffered() <= 64);
        scanner.feed(b"<event></event>");
        assert!(matches!(scanner.next_frame(), Some(Frame::Xml(_))));
    }
}
