use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, trace, warn};

use camlink_protocol::fragment::{FragmentRecord, MarkerFragment};
use camlink_protocol::jpeg;

/// How long a marker-driven assembly may sit without new fragments before it
/// is purged. UDP loss is never retried; this purge is the sole recovery.
pub const FRAME_TIMEOUT: Duration = Duration::from_secs(1);

/// The two fragmentation dialects the camera firmware has been observed to
/// emit. Which one a given firmware uses is configuration, not detectable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    /// Explicit offset/size framing: every fragment declares the total frame
    /// size, completion is `offset + blockSize >= frameSize`.
    #[default]
    DeclaredLength,
    /// Legacy RTP-style framing without a declared length: completion is
    /// detected from the JPEG SOI/EOI markers themselves.
    MarkerDriven,
}

/// Reconstructs complete JPEG frames from a stream of UDP datagrams.
///
/// Implementations are owned and driven by the single frame-processor task;
/// they are not shared across tasks and need no internal locking.
pub trait Reassembler: Send {
    /// Feed one datagram; returns zero or more completed frames.
    fn push_datagram(&mut self, datagram: &[u8], now: Instant) -> Vec<Bytes>;

    /// Drop all in-flight assembly state.
    fn reset(&mut self);

    /// Frames seen with corrupt JPEG structure so far (diagnostics only).
    fn corrupt_frames(&self) -> u64;
}

pub fn new_reassembler(dialect: Dialect, max_frame_size: usize) -> Box<dyn Reassembler> {
    match dialect {
        Dialect::DeclaredLength => Box::new(DeclaredLengthAssembler::new(max_frame_size)),
        Dialect::MarkerDriven => Box::new(MarkerAssembler::new(max_frame_size)),
    }
}

// ── Dialect A: declared-length framing ───────────────────────────────────

/// Single-frame assembler for the declared-length dialect. A datagram may
/// pack several fragment records; an offset-0 record starts a new frame
/// buffer sized to the declared total, and completion needs no markers.
pub struct DeclaredLengthAssembler {
    max_frame_size: usize,
    buffer: Vec<u8>,
    /// Declared total size of the frame being assembled; 0 when inactive.
    declared: usize,
    sequence: u32,
    corrupt: u64,
}

impl DeclaredLengthAssembler {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            buffer: Vec::new(),
            declared: 0,
            sequence: 0,
            corrupt: 0,
        }
    }

    fn accept_fragment(&mut self, rec: &FragmentRecord<'_>, completed: &mut Vec<Bytes>) {
        let offset = rec.offset as usize;
        let block = rec.payload.len();

        if offset == 0 {
            let declared = rec.frame_size as usize;
            if declared == 0 || declared > self.max_frame_size {
                warn!(
                    sequence = rec.sequence,
                    declared, "declared frame size out of bounds, dropping frame"
                );
                self.declared = 0;
                return;
            }
            self.buffer.clear();
            self.buffer.resize(declared, 0);
            self.declared = declared;
            self.sequence = rec.sequence;
            if !jpeg::starts_with_soi(rec.payload) {
                // Recorded, not discarded: the decoder is the final arbiter.
                self.corrupt += 1;
                warn!(sequence = rec.sequence, "frame start without JPEG SOI marker");
            }
        }

        if self.declared == 0 {
            trace!(
                sequence = rec.sequence,
                offset, "fragment without active frame, dropped"
            );
            return;
        }

        if offset + block > self.declared {
            warn!(
                sequence = self.sequence,
                offset,
                block,
                declared = self.declared,
                "fragment overflows frame buffer, dropped"
            );
            return;
        }

        self.buffer[offset..offset + block].copy_from_slice(rec.payload);

        if offset + block >= self.declared {
            let frame = Bytes::from(std::mem::take(&mut self.buffer));
            if !jpeg::is_complete_frame(&frame) {
                self.corrupt += 1;
                debug!(
                    sequence = self.sequence,
                    len = frame.len(),
                    "assembled frame fails JPEG validation"
                );
            }
            self.declared = 0;
            completed.push(frame);
        }
    }
}

impl Reassembler for DeclaredLengthAssembler {
    fn push_datagram(&mut self, datagram: &[u8], _now: Instant) -> Vec<Bytes> {
        let mut completed = Vec::new();
        let mut processed = 0;

        // Combined datagrams pack several records back to back.
        while processed < datagram.len() {
            let rec = match FragmentRecord::parse(&datagram[processed..]) {
                Ok(r) => r,
                Err(e) => {
                    warn!(processed, "truncated fragment record: {}", e);
                    break;
                }
            };
            let wire = rec.wire_len();
            if rec.is_video() {
                self.accept_fragment(&rec, &mut completed);
            }
            processed += wire;
        }

        completed
    }

    fn reset(&mut self) {
        self.declared = 0;
        self.buffer.clear();
    }

    fn corrupt_frames(&self) -> u64 {
        self.corrupt
    }
}

// ── Dialect B: marker-driven framing ─────────────────────────────────────

type FrameKey = (u32, u32); // (frame id, timestamp tick)

struct Assembly {
    fragments: BTreeMap<u32, Vec<u8>>,
    total: usize,
    last_update: Instant,
}

impl Assembly {
    fn new(now: Instant) -> Self {
        Self {
            fragments: BTreeMap::new(),
            total: 0,
            last_update: now,
        }
    }

    /// Completion needs both checks: raw SOI/EOI presence across fragments,
    /// then the offset-ordered reassembly trimmed to the first EOI must
    /// itself re-validate. Markers can appear incidentally inside payload
    /// bytes before the frame has fully arrived.
    fn try_complete(&self) -> Option<Bytes> {
        let has_soi = self.fragments.values().any(|f| jpeg::contains_soi(f));
        let has_eoi = self.fragments.values().any(|f| jpeg::contains_eoi(f));
        if !has_soi || !has_eoi {
            return None;
        }

        let (&last_offset, last) = self.fragments.iter().next_back()?;
        let mut buf = vec![0u8; last_offset as usize + last.len()];
        for (&offset, frag) in &self.fragments {
            let offset = offset as usize;
            let end = (offset + frag.len()).min(buf.len());
            if end > offset {
                buf[offset..end].copy_from_slice(&frag[..end - offset]);
            }
        }

        let trimmed = jpeg::trim_to_eoi(&buf);
        if jpeg::is_complete_frame(trimmed) {
            Some(Bytes::copy_from_slice(trimmed))
        } else {
            None
        }
    }
}

/// Map of in-flight assemblies keyed by (frame id, tick), with an amortized
/// garbage-collection pass on every datagram.
pub struct MarkerAssembler {
    max_frame_size: usize,
    timeout: Duration,
    active: HashMap<FrameKey, Assembly>,
    corrupt: u64,
}

impl MarkerAssembler {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            timeout: FRAME_TIMEOUT,
            active: HashMap::new(),
            corrupt: 0,
        }
    }

    fn purge_stale(&mut self, now: Instant) {
        let timeout = self.timeout;
        self.active
            .retain(|_, a| now.duration_since(a.last_update) <= timeout);
    }
}

impl Reassembler for MarkerAssembler {
    fn push_datagram(&mut self, datagram: &[u8], now: Instant) -> Vec<Bytes> {
        // Purge BEFORE inserting: a fresh frame that recycles a stale
        // (id, tick) key must never be merged with the old assembly.
        self.purge_stale(now);

        let frag = match MarkerFragment::parse(datagram) {
            Ok(f) => f,
            Err(e) => {
                debug!("undecodable fragment datagram: {}", e);
                return Vec::new();
            }
        };

        let key = (frag.frame_id, frag.tick);
        let assembly = self
            .active
            .entry(key)
            .or_insert_with(|| Assembly::new(now));

        if assembly.total + frag.payload.len() > self.max_frame_size {
            warn!(
                frame_id = frag.frame_id,
                tick = frag.tick,
                total = assembly.total,
                "assembly exceeds frame size cap, resetting"
            );
            self.active.remove(&key);
            self.corrupt += 1;
            return Vec::new();
        }

        if let Some(prev) = assembly.fragments.insert(frag.offset, frag.payload.to_vec()) {
            assembly.total -= prev.len();
        }
        assembly.total += frag.payload.len();
        assembly.last_update = now;

        match assembly.try_complete() {
            Some(frame) => {
                self.active.remove(&key);
                vec![frame]
            }
            None => Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.active.clear();
    }

    fn corrupt_frames(&self) -> u64 {
        self.corrupt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camlink_protocol::fragment::FRAGMENT_HEADER_SIZE;

    fn record(type_byte: u8, sequence: u32, frame_size: u32, offset: u32, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAGMENT_HEADER_SIZE + payload.len());
        buf.push(type_byte);
        buf.push(0);
        buf.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        buf.extend_from_slice(&sequence.to_le_bytes());
        buf.extend_from_slice(&frame_size.to_le_bytes());
        buf.extend_from_slice(&offset.to_le_bytes());
        buf.extend_from_slice(&[0u8; 4]);
        buf.extend_from_slice(payload);
        buf
    }

    fn marker_datagram(frame_id: u32, tick: u32, offset: u32, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; FRAGMENT_HEADER_SIZE];
        buf[0] = 0x02;
        buf[4..8].copy_from_slice(&frame_id.to_le_bytes());
        buf[8..12].copy_from_slice(&tick.to_le_bytes());
        buf[12..16].copy_from_slice(&offset.to_le_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    /// A syntactically plausible JPEG byte run of the requested length.
    fn jpeg_bytes(len: usize) -> Vec<u8> {
        let mut data = vec![0x55u8; len];
        data[0] = 0xFF;
        data[1] = 0xD8;
        data[len - 2] = 0xFF;
        data[len - 1] = 0xD9;
        data
    }

    fn now() -> Instant {
        Instant::now()
    }

    #[test]
    fn declared_single_fragment_frame() {
        // One datagram, offset 0, blockSize == frameSize == 110, type 0x82.
        let payload = jpeg_bytes(110);
        let datagram = record(0x82, 1, 110, 0, &payload);

        let mut asm = DeclaredLengthAssembler::new(512 * 1024);
        let frames = asm.push_datagram(&datagram, now());
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &payload[..]);
        assert_eq!(asm.corrupt_frames(), 0);
    }

    #[test]
    fn declared_in_order_fragments_concatenate() {
        let payload = jpeg_bytes(300);
        let mut asm = DeclaredLengthAssembler::new(512 * 1024);

        let d1 = record(0x02, 5, 300, 0, &payload[..100]);
        let d2 = record(0x02, 5, 300, 100, &payload[100..200]);
        let d3 = record(0x82, 5, 300, 200, &payload[200..]);

        assert!(asm.push_datagram(&d1, now()).is_empty());
        assert!(asm.push_datagram(&d2, now()).is_empty());
        let frames = asm.push_datagram(&d3, now());
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &payload[..]);
    }

    #[test]
    fn declared_combined_datagram_completes_whole_frame() {
        // Both halves of one frame packed into a single datagram.
        let payload = jpeg_bytes(200);
        let mut datagram = record(0x02, 9, 200, 0, &payload[..120]);
        datagram.extend_from_slice(&record(0x82, 9, 200, 120, &payload[120..]));

        let mut asm = DeclaredLengthAssembler::new(512 * 1024);
        let frames = asm.push_datagram(&datagram, now());
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &payload[..]);
    }

    #[test]
    fn declared_truncated_tail_keeps_leading_records() {
        let payload = jpeg_bytes(120);
        let mut datagram = record(0x82, 3, 120, 0, &payload);
        // Append garbage that parses as a header but declares more payload
        // than remains in the datagram.
        datagram.extend_from_slice(&record(0x02, 4, 500, 0, &[0u8; 40])[..FRAGMENT_HEADER_SIZE + 10]);

        let mut asm = DeclaredLengthAssembler::new(512 * 1024);
        let frames = asm.push_datagram(&datagram, now());
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &payload[..]);
    }

    #[test]
    fn declared_skips_non_video_records() {
        let payload = jpeg_bytes(110);
        let mut datagram = record(0x05, 1, 0, 0, &[1, 2, 3, 4]); // audio-ish record
        datagram.extend_from_slice(&record(0x82, 1, 110, 0, &payload));

        let mut asm = DeclaredLengthAssembler::new(512 * 1024);
        let frames = asm.push_datagram(&datagram, now());
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn declared_oversized_frame_rejected() {
        let datagram = record(0x02, 1, 10_000_000, 0, &[0xFF, 0xD8, 0, 0]);
        let mut asm = DeclaredLengthAssembler::new(512 * 1024);
        assert!(asm.push_datagram(&datagram, now()).is_empty());

        // Follow-up fragment for the rejected frame is dropped, not a crash.
        let datagram = record(0x02, 1, 10_000_000, 4, &[0u8; 8]);
        assert!(asm.push_datagram(&datagram, now()).is_empty());
    }

    #[test]
    fn declared_overflowing_fragment_dropped_not_fatal() {
        let payload = jpeg_bytes(200);
        let mut asm = DeclaredLengthAssembler::new(512 * 1024);

        assert!(asm
            .push_datagram(&record(0x02, 7, 200, 0, &payload[..100]), now())
            .is_empty());
        // Offset past the declared size: rejected, assembly survives.
        assert!(asm
            .push_datagram(&record(0x02, 7, 200, 180, &[0u8; 60]), now())
            .is_empty());
        let frames = asm.push_datagram(&record(0x82, 7, 200, 100, &payload[100..]), now());
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &payload[..]);
    }

    #[test]
    fn declared_missing_soi_logged_but_emitted() {
        let mut payload = jpeg_bytes(110);
        payload[0] = 0x00; // corrupt start
        let datagram = record(0x82, 1, 110, 0, &payload);

        let mut asm = DeclaredLengthAssembler::new(512 * 1024);
        let frames = asm.push_datagram(&datagram, now());
        assert_eq!(frames.len(), 1, "corruption is recorded, not discarded");
        assert!(asm.corrupt_frames() >= 1);
    }

    #[test]
    fn marker_reverse_order_delivery() {
        // (frameId=7, timestamp=1001): EOI-bearing tail arrives first.
        let head = {
            let mut d = vec![0x55u8; 50];
            d[0] = 0xFF;
            d[1] = 0xD8;
            d
        };
        let tail = {
            let mut d = vec![0x66u8; 52];
            d[50] = 0xFF;
            d[51] = 0xD9;
            d
        };

        let mut asm = MarkerAssembler::new(512 * 1024);
        let t = now();
        assert!(asm
            .push_datagram(&marker_datagram(7, 1001, 50, &tail), t)
            .is_empty());
        let frames = asm.push_datagram(&marker_datagram(7, 1001, 0, &head), t);
        assert_eq!(frames.len(), 1);

        let mut expected = head.clone();
        expected.extend_from_slice(&tail);
        assert_eq!(&frames[0][..], &expected[..]);
    }

    #[test]
    fn marker_missing_eoi_never_completes_and_is_purged() {
        let head = {
            let mut d = vec![0x55u8; 80];
            d[0] = 0xFF;
            d[1] = 0xD8;
            d
        };

        let mut asm = MarkerAssembler::new(512 * 1024);
        let t0 = now();
        assert!(asm
            .push_datagram(&marker_datagram(3, 500, 0, &head), t0)
            .is_empty());

        // Clock advances past the timeout; the next datagram triggers the GC.
        let t1 = t0 + FRAME_TIMEOUT + Duration::from_millis(10);
        let tail = {
            let mut d = vec![0x66u8; 52];
            d[50] = 0xFF;
            d[51] = 0xD9;
            d
        };
        // Same key, but the SOI half was purged: no completion.
        let frames = asm.push_datagram(&marker_datagram(3, 500, 80, &tail), t1);
        assert!(frames.is_empty());
    }

    #[test]
    fn marker_recycled_key_not_merged_with_stale_data() {
        let mut asm = MarkerAssembler::new(512 * 1024);
        let t0 = now();

        // Stale fragment at offset 500 under key (9, 42).
        assert!(asm
            .push_datagram(&marker_datagram(9, 42, 500, &[0xAAu8; 64]), t0)
            .is_empty());

        // Key recycles after the timeout; the fresh frame must assemble from
        // fresh fragments only.
        let t1 = t0 + FRAME_TIMEOUT + Duration::from_millis(1);
        let head = {
            let mut d = vec![0x11u8; 60];
            d[0] = 0xFF;
            d[1] = 0xD8;
            d
        };
        let tail = {
            let mut d = vec![0x22u8; 60];
            d[58] = 0xFF;
            d[59] = 0xD9;
            d
        };
        assert!(asm
            .push_datagram(&marker_datagram(9, 42, 0, &head), t1)
            .is_empty());
        let frames = asm.push_datagram(&marker_datagram(9, 42, 60, &tail), t1);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 120, "no stale 500-offset data included");
    }

    #[test]
    fn marker_incidental_markers_do_not_false_complete() {
        // A single 40-byte fragment containing both SOI and an incidental
        // EOI: trimmed reassembly is far below the minimum size.
        let mut frag = vec![0x55u8; 40];
        frag[0] = 0xFF;
        frag[1] = 0xD8;
        frag[30] = 0xFF;
        frag[31] = 0xD9;

        let mut asm = MarkerAssembler::new(512 * 1024);
        let frames = asm.push_datagram(&marker_datagram(1, 1, 0, &frag), now());
        assert!(frames.is_empty());
    }

    #[test]
    fn marker_oversized_assembly_reset() {
        let mut asm = MarkerAssembler::new(100);
        let t = now();
        assert!(asm
            .push_datagram(&marker_datagram(1, 1, 0, &[0u8; 80]), t)
            .is_empty());
        // Would exceed the 100-byte cap: assembly is discarded.
        assert!(asm
            .push_datagram(&marker_datagram(1, 1, 80, &[0u8; 80]), t)
            .is_empty());
        assert_eq!(asm.corrupt_frames(), 1);
    }

    #[test]
    fn reset_clears_in_flight_state() {
        let payload = jpeg_bytes(200);
        let mut asm = DeclaredLengthAssembler::new(512 * 1024);
        assert!(asm
            .push_datagram(&record(0x02, 5, 200, 0, &payload[..100]), now())
            .is_empty());
        asm.reset();
        // Tail fragment now has no active frame to land in.
        assert!(asm
            .push_datagram(&record(0x82, 5, 200, 100, &payload[100..]), now())
            .is_empty());
    }
}
