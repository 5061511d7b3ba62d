//! Validation and classification of transport stream packets, and the [`Demultiplex`]
//! front-end that drives packets through reassembly.
//!
//! Rejecting a packet is not an error here: real transport streams are full of content this
//! demuxer deliberately ignores (null packets, PSI tables, corrupt frames), so each rejection
//! is reported as a [`DropReason`] through the [`DemuxObserver`] hook and processing simply
//! carries on with the next packet.

use crate::packet::{ContinuityCounter, Packet, Pid};
use crate::pes::{PesReassembler, PesSink, StreamId};
use fixedbitset::FixedBitSet;

/// Lowest PID of the range carrying elementary stream data, `0x0020` (values below are
/// reserved for PSI tables and DVB/ATSC signalling).
pub const ELEMENTARY_PID_FIRST: u16 = 0x0020;
/// Highest PID of the elementary stream range, `0x1ffa` (inclusive).
pub const ELEMENTARY_PID_LAST: u16 = 0x1ffa;
/// Lowest PID of the small band of assignable table PIDs above the elementary range, `0x1ffc`.
pub const TABLE_PID_FIRST: u16 = 0x1ffc;
/// Highest PID this demuxer will consider, `0x1ffe` (the null-packet PID `0x1fff` is past it).
pub const TABLE_PID_LAST: u16 = 0x1ffe;

fn pid_in_range(pid: Pid) -> bool {
    let pid = u16::from(pid);
    (ELEMENTARY_PID_FIRST..=ELEMENTARY_PID_LAST).contains(&pid)
        || (TABLE_PID_FIRST..=TABLE_PID_LAST).contains(&pid)
}

/// Why a transport stream packet was set aside without reaching the reassembler.
///
/// All of these are routine stream content rather than failures.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum DropReason {
    /// the first byte of the packet was not `0x47`
    InvalidSyncByte(u8),
    /// the _transport_error_indicator_ flag marked the packet as corrupt
    TransportError(Pid),
    /// _adaptation_field_control_ left the packet without usable payload bytes
    NoPayload(Pid),
    /// the PID is outside the elementary-stream and assignable-table ranges (this includes
    /// PSI PIDs below `0x0020` and the null-packet PID `0x1fff`)
    PidOutOfRange(Pid),
}

/// Why an in-flight PES accumulation was abandoned instead of emitted.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PesDiscard {
    /// more payload arrived for the unit than its header declared; nothing past the declared
    /// length is ever written
    BufferOverrun,
    /// the accumulated data ended before the PES optional header did, so no payload can be
    /// located within it
    TruncatedHeader,
}

/// Receives structured observations about the progress of a demux run.
///
/// Implementations decide how (and whether) each observation is rendered; the demuxer itself
/// never logs or fails in response to them.  All methods are called on the thread driving the
/// demuxer.
pub trait DemuxObserver {
    /// a transport stream packet was set aside for the given reason
    fn ts_packet_dropped(&mut self, reason: DropReason);
    /// the continuity counter for `pid` did not follow the previous one, suggesting packet
    /// loss somewhere upstream
    fn continuity_lost(&mut self, pid: Pid, expected: u8, actual: u8);
    /// a completed PES packet was delivered to the sink
    fn pes_packet_emitted(
        &mut self,
        pid: Pid,
        stream_id: StreamId,
        accumulated_length: usize,
        payload_length: usize,
    );
    /// an in-flight PES accumulation was abandoned
    fn pes_discarded(&mut self, pid: Pid, reason: PesDiscard);
    /// the input ended part-way through a transport stream packet
    fn input_truncated(&mut self, trailing_bytes: usize);
}

/// Observer that ignores every observation.
pub struct NullObserver;
impl DemuxObserver for NullObserver {
    fn ts_packet_dropped(&mut self, _reason: DropReason) {}
    fn continuity_lost(&mut self, _pid: Pid, _expected: u8, _actual: u8) {}
    fn pes_packet_emitted(
        &mut self,
        _pid: Pid,
        _stream_id: StreamId,
        _accumulated_length: usize,
        _payload_length: usize,
    ) {
    }
    fn pes_discarded(&mut self, _pid: Pid, _reason: PesDiscard) {}
    fn input_truncated(&mut self, _trailing_bytes: usize) {}
}

/// A transport stream packet that passed validation, reduced to the fields reassembly needs.
///
/// Constructed per packet and consumed immediately; never stored.
pub struct ParsedPacket<'buf> {
    /// which sub-stream the packet belongs to
    pub pid: Pid,
    /// true if this packet starts a new payload unit
    pub pusi: bool,
    /// this packet's 4-bit continuity counter
    pub continuity_counter: ContinuityCounter,
    /// the usable payload bytes, with any adaptation field already skipped
    pub payload: &'buf [u8],
}

/// Last-seen continuity counter per PID.
///
/// Only ever raises observations; a discontinuity never changes how the packet itself is
/// processed, since the payload that did arrive is still worth extracting.
struct ContinuityTable {
    counters: Vec<u8>,
    seen: FixedBitSet,
}

impl ContinuityTable {
    fn new() -> ContinuityTable {
        ContinuityTable {
            counters: vec![0; Pid::PID_COUNT],
            seen: FixedBitSet::with_capacity(Pid::PID_COUNT),
        }
    }

    /// Records `counter` against `pid`, returning `Some((expected, actual))` if the
    /// transition from the previously stored value indicates a loss.  A repeat of the
    /// previous counter is a legitimate duplicate, not a loss.
    fn check(&mut self, pid: Pid, counter: ContinuityCounter) -> Option<(u8, u8)> {
        let idx = usize::from(pid);
        let actual = counter.count();
        let loss = if self.seen.contains(idx) {
            let last = ContinuityCounter::new(self.counters[idx]);
            if counter.follows(last) || actual == last.count() {
                None
            } else {
                Some((last.next().count(), actual))
            }
        } else {
            None
        };
        self.seen.insert(idx);
        self.counters[idx] = actual;
        loss
    }
}

/// Drives a whole transport stream through validation, continuity tracking and PES
/// reassembly, delivering completed PES packets to `sink` and observations to `observer`.
///
/// Feed every 188-byte packet to [`push()`](Demultiplex::push) in stream order, then call
/// [`flush()`](Demultiplex::flush) exactly once when the input is exhausted.
pub struct Demultiplex<S: PesSink, O: DemuxObserver> {
    continuity: ContinuityTable,
    reassembler: PesReassembler,
    sink: S,
    observer: O,
}

impl<S: PesSink, O: DemuxObserver> Demultiplex<S, O> {
    /// Creates a demultiplexer delivering to the given sink and observer.
    pub fn new(sink: S, observer: O) -> Demultiplex<S, O> {
        Demultiplex {
            continuity: ContinuityTable::new(),
            reassembler: PesReassembler::new(),
            sink,
            observer,
        }
    }

    /// Processes one transport stream packet.
    ///
    /// Panics if `frame` is not exactly 188 bytes long; use [`crate::framer::Framer`] to cut
    /// a byte stream into correctly-sized pieces.
    pub fn push(&mut self, frame: &[u8]) {
        let pk = Packet::new(frame);
        match classify(&pk) {
            Ok(parsed) => {
                if let Some((expected, actual)) =
                    self.continuity.check(parsed.pid, parsed.continuity_counter)
                {
                    self.observer.continuity_lost(parsed.pid, expected, actual);
                }
                self.reassembler
                    .feed(&parsed, &mut self.sink, &mut self.observer);
            }
            Err(reason) => self.observer.ts_packet_dropped(reason),
        }
    }

    /// Emits whatever PES data is still accumulating.  To be called once, at end of input.
    pub fn flush(&mut self) {
        self.reassembler.flush(&mut self.sink, &mut self.observer);
    }

    /// Access to the observer, for reporting conditions found outside packet processing.
    pub fn observer_mut(&mut self) -> &mut O {
        &mut self.observer
    }

    /// Takes back the sink and observer, dropping all demux state.
    pub fn into_parts(self) -> (S, O) {
        (self.sink, self.observer)
    }
}

/// Decides whether one packet is worth reassembling, and locates its payload if so.
///
/// The PID range check runs before the adaptation field is considered, since it depends only
/// on header fields; the upper elementary-stream bound is treated as inclusive.
fn classify<'buf>(pk: &Packet<'buf>) -> Result<ParsedPacket<'buf>, DropReason> {
    if !Packet::is_sync_byte(pk.sync_byte()) {
        return Err(DropReason::InvalidSyncByte(pk.sync_byte()));
    }
    if pk.transport_error_indicator() {
        return Err(DropReason::TransportError(pk.pid()));
    }
    let pid = pk.pid();
    if !pid_in_range(pid) {
        return Err(DropReason::PidOutOfRange(pid));
    }
    if !pk.adaptation_control().has_payload() {
        return Err(DropReason::NoPayload(pid));
    }
    let payload = pk.payload().ok_or(DropReason::NoPayload(pid))?;
    Ok(ParsedPacket {
        pid,
        pusi: pk.payload_unit_start_indicator(),
        continuity_counter: pk.continuity_counter(),
        payload,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::framer::Framer;
    use crate::pes::PesPacket;
    use assert_matches::assert_matches;
    use hex_literal::*;
    use std::io;

    #[derive(Default)]
    struct Recorder {
        packets: Vec<(u16, StreamId, Vec<u8>)>,
    }
    impl PesSink for Recorder {
        fn pes_packet(&mut self, pk: &PesPacket<'_>) {
            self.packets
                .push((u16::from(pk.pid), pk.stream_id, pk.payload.to_vec()));
        }
    }

    #[derive(Default)]
    struct Events {
        dropped: Vec<DropReason>,
        losses: Vec<(u16, u8, u8)>,
        emitted: Vec<(u16, usize, usize)>,
        discarded: Vec<(u16, PesDiscard)>,
        truncated: Vec<usize>,
    }
    impl DemuxObserver for Events {
        fn ts_packet_dropped(&mut self, reason: DropReason) {
            self.dropped.push(reason);
        }
        fn continuity_lost(&mut self, pid: Pid, expected: u8, actual: u8) {
            self.losses.push((u16::from(pid), expected, actual));
        }
        fn pes_packet_emitted(
            &mut self,
            pid: Pid,
            _stream_id: StreamId,
            accumulated_length: usize,
            payload_length: usize,
        ) {
            self.emitted
                .push((u16::from(pid), accumulated_length, payload_length));
        }
        fn pes_discarded(&mut self, pid: Pid, reason: PesDiscard) {
            self.discarded.push((u16::from(pid), reason));
        }
        fn input_truncated(&mut self, trailing_bytes: usize) {
            self.truncated.push(trailing_bytes);
        }
    }

    fn demux() -> Demultiplex<Recorder, Events> {
        Demultiplex::new(Recorder::default(), Events::default())
    }

    /// payload-only packet; unused payload bytes are stuffed with 0xff
    fn ts_packet(pid: u16, pusi: bool, counter: u8, payload: &[u8]) -> [u8; Packet::SIZE] {
        assert!(payload.len() <= 184);
        let mut buf = [0xffu8; Packet::SIZE];
        buf[0] = Packet::SYNC_BYTE;
        buf[1] = if pusi { 0x40 } else { 0 } | (pid >> 8) as u8;
        buf[2] = pid as u8;
        buf[3] = 0b0001_0000 | (counter & 0x0f);
        buf[4..4 + payload.len()].copy_from_slice(payload);
        buf
    }

    /// packet whose adaptation field pads the payload so that it ends exactly at the packet
    /// boundary, the way muxers fit the tail of a PES unit
    fn ts_packet_stuffed(pid: u16, pusi: bool, counter: u8, payload: &[u8]) -> [u8; Packet::SIZE] {
        assert!(payload.len() < 184);
        let mut buf = [0xffu8; Packet::SIZE];
        buf[0] = Packet::SYNC_BYTE;
        buf[1] = if pusi { 0x40 } else { 0 } | (pid >> 8) as u8;
        buf[2] = pid as u8;
        buf[3] = 0b0011_0000 | (counter & 0x0f);
        let af_len = 183 - payload.len();
        buf[4] = af_len as u8;
        if af_len > 0 {
            buf[5] = 0; // adaptation field flags; remainder stays 0xff stuffing
        }
        buf[5 + af_len..].copy_from_slice(payload);
        buf
    }

    /// start of an unbounded video PES unit with an empty optional header and `body` bytes
    fn pes_start(body: &[u8]) -> Vec<u8> {
        let mut payload = hex!("000001e00000800000").to_vec();
        payload.extend_from_slice(body);
        payload
    }

    #[test]
    fn invalid_sync_byte_is_dropped() {
        let mut demux = demux();
        let mut frame = ts_packet(0x100, true, 0, &pes_start(b"x"));
        frame[0] = 0x46;
        demux.push(&frame);
        demux.flush();
        let (sink, events) = demux.into_parts();
        assert_eq!(events.dropped, vec![DropReason::InvalidSyncByte(0x46)]);
        assert!(sink.packets.is_empty());
    }

    #[test]
    fn transport_error_indicator_drops_packet() {
        let mut demux = demux();
        let mut frame = ts_packet(0x100, true, 0, &pes_start(b"x"));
        frame[1] |= 0b1000_0000;
        demux.push(&frame);
        demux.flush();
        let (sink, events) = demux.into_parts();
        assert_matches!(events.dropped[..], [DropReason::TransportError(pid)] if pid == Pid::new(0x100));
        assert!(sink.packets.is_empty());
    }

    #[test]
    fn packets_without_payload_are_dropped() {
        let mut demux = demux();
        let mut frame = ts_packet(0x100, false, 0, &[]);
        frame[3] = 0b0010_0000; // adaptation field only
        demux.push(&frame);
        frame[3] = 0b0000_0000; // reserved
        demux.push(&frame);
        let (_, events) = demux.into_parts();
        assert_eq!(
            events.dropped,
            vec![
                DropReason::NoPayload(Pid::new(0x100)),
                DropReason::NoPayload(Pid::new(0x100))
            ]
        );
    }

    #[test]
    fn pid_range_boundaries() {
        let accepted = [0x0020u16, 0x1ffa, 0x1ffc, 0x1ffe];
        let rejected = [0x0000u16, 0x001f, 0x1ffb, 0x1fff];
        let mut demux = demux();
        for &pid in accepted.iter().chain(&rejected) {
            demux.push(&ts_packet(pid, true, 0, &pes_start(b"data")));
        }
        demux.flush();
        let (sink, events) = demux.into_parts();
        let dropped: Vec<u16> = events
            .dropped
            .iter()
            .map(|r| match r {
                DropReason::PidOutOfRange(pid) => u16::from(*pid),
                other => panic!("unexpected drop {:?}", other),
            })
            .collect();
        assert_eq!(dropped, rejected);
        let emitted: Vec<u16> = sink.packets.iter().map(|p| p.0).collect();
        assert_eq!(emitted, accepted);
    }

    #[test]
    fn consecutive_counters_produce_no_loss() {
        let mut demux = demux();
        demux.push(&ts_packet(0x50, true, 0, &pes_start(b"")));
        for counter in (1..=15).chain(0..=1) {
            demux.push(&ts_packet(0x50, false, counter, b"abc"));
        }
        let (_, events) = demux.into_parts();
        assert!(events.losses.is_empty());
    }

    #[test]
    fn skipped_counter_produces_single_loss() {
        let mut demux = demux();
        demux.push(&ts_packet(0x50, true, 0, &pes_start(b"")));
        demux.push(&ts_packet(0x50, false, 2, b"abc"));
        let (_, events) = demux.into_parts();
        assert_eq!(events.losses, vec![(0x50, 1, 2)]);
    }

    #[test]
    fn duplicate_counter_is_not_a_loss() {
        let mut demux = demux();
        demux.push(&ts_packet(0x50, true, 0, &pes_start(b"")));
        demux.push(&ts_packet(0x50, false, 0, b"abc"));
        demux.push(&ts_packet(0x50, false, 1, b"abc"));
        let (_, events) = demux.into_parts();
        assert!(events.losses.is_empty());
    }

    #[test]
    fn losses_are_tracked_per_pid() {
        let mut demux = demux();
        demux.push(&ts_packet(0x50, true, 0, &pes_start(b"")));
        demux.push(&ts_packet(0x60, true, 7, &pes_start(b"")));
        demux.push(&ts_packet(0x50, false, 1, b"abc"));
        demux.push(&ts_packet(0x60, false, 9, b"abc"));
        let (_, events) = demux.into_parts();
        assert_eq!(events.losses, vec![(0x60, 8, 9)]);
    }

    /// A PES payload split across several transport stream packets reassembles to the
    /// original bytes exactly, fed end-to-end through framing, validation and reassembly.
    #[test]
    fn payload_survives_fragmentation_byte_for_byte() {
        let body: Vec<u8> = (0u32..1000).map(|n| (n * 7) as u8).collect();
        let mut contents = vec![0x80, 0x00, 0x00];
        contents.extend_from_slice(&body);
        assert!(contents.len() <= 0xffff);

        let mut stream = Vec::new();
        let mut counter = 0u8;
        let mut first = hex!("000001e0").to_vec();
        first.push((contents.len() >> 8) as u8);
        first.push(contents.len() as u8);
        first.extend_from_slice(&contents[..178]);
        stream.extend_from_slice(&ts_packet(0x101, true, counter, &first));
        let mut remaining = &contents[178..];
        while !remaining.is_empty() {
            counter = (counter + 1) & 0x0f;
            if remaining.len() >= 184 {
                stream.extend_from_slice(&ts_packet(0x101, false, counter, &remaining[..184]));
                remaining = &remaining[184..];
            } else {
                stream.extend_from_slice(&ts_packet_stuffed(0x101, false, counter, remaining));
                remaining = &[];
            }
        }

        let mut demux = demux();
        let mut framer = Framer::new(io::Cursor::new(stream));
        while let Some(frame) = framer.next_frame().unwrap() {
            demux.push(frame);
        }
        demux.flush();
        let (sink, events) = demux.into_parts();
        assert!(events.losses.is_empty());
        assert!(events.discarded.is_empty());
        assert!(events.truncated.is_empty());
        assert_eq!(sink.packets.len(), 1);
        assert_eq!(&sink.packets[0].2[..], &body[..]);
    }

    #[test]
    fn unit_is_emitted_when_the_next_one_starts() {
        let mut demux = demux();
        let mut first = hex!("000001e00000800000").to_vec();
        first.extend_from_slice(&[0x2a; 175]);
        demux.push(&ts_packet(0x123, true, 0, &first));
        demux.push(&ts_packet(0x123, true, 1, &pes_start(b"")));
        let (sink, events) = demux.into_parts();
        assert_eq!(sink.packets.len(), 1);
        assert_eq!(sink.packets[0].2.len(), 175);
        assert_eq!(events.emitted, vec![(0x123, 178, 175)]);
    }

    #[test]
    fn program_stream_map_unit_is_ignored() {
        let mut demux = demux();
        demux.push(&ts_packet(0x123, true, 0, &hex!("000001bc0000800000")));
        demux.push(&ts_packet(0x123, false, 1, b"continuation"));
        demux.flush();
        let (sink, events) = demux.into_parts();
        assert!(sink.packets.is_empty());
        assert!(events.emitted.is_empty());
        assert!(events.dropped.is_empty());
    }

    #[test]
    fn flush_emits_one_packet_per_inflight_pid() {
        let mut demux = demux();
        demux.push(&ts_packet(0x30, true, 0, &pes_start(b"one")));
        demux.push(&ts_packet(0x40, true, 0, &pes_start(b"two")));
        demux.flush();
        let (sink, _) = demux.into_parts();
        assert_eq!(sink.packets.len(), 2);
        assert_eq!(sink.packets[0].0, 0x30);
        assert_eq!(sink.packets[1].0, 0x40);
    }
}
