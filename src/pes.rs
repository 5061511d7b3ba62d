//! Reassembly of Packetized Elementary Stream packets from their Transport Stream fragments.
//!
//! Elementary streams are split into PES packets, which are then further split across the
//! payloads of transport stream packets.  [`PesReassembler`] collects those pieces back
//! together, keeping one in-flight accumulation buffer per PID, and hands each completed PES
//! packet to an implementation of [`PesSink`].
//!
//! A PES packet's end is only discoverable from the start of the next one on the same PID
//! (or from the end of the whole stream), so emission happens when a new
//! _payload_unit_start_indicator_ arrives for a PID that is already accumulating, and on the
//! terminal [`PesReassembler::flush()`].

use crate::demultiplex::{DemuxObserver, ParsedPacket, PesDiscard};
use crate::packet::Pid;

/// Upper bound on the bytes accumulated for a single PES packet whose header declares a
/// _PES_packet_length_ of zero (meaning "unbounded" -- the length of, e.g., a video frame's
/// PES packet routinely exceeds what the 16-bit length field can express).
pub const MAX_PES_PAYLOAD_SIZE: usize = 65_536;

/// Size of the fields at the very start of a PES packet: the 3-byte start-code prefix, the
/// stream id byte, and the 16-bit _PES_packet_length_.
const PES_PREFIX_SIZE: usize = 6;

/// Size of the fixed part of the PES 'optional header': two flag bytes followed by the
/// _PES_header_data_length_ byte.
const PES_OPTIONAL_HEADER_SIZE: usize = 3;

/// Values of the PES _stream_id_ field, identifying the kind of content within the stream,
/// per _ISO/IEC 13818-1_, _Table 2-18_.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum StreamId {
    /// `program_stream_map`
    ProgramStreamMap,
    /// `private_stream_1`
    PrivateStream1,
    /// `padding_stream`
    PaddingStream,
    /// `private_stream_2`
    PrivateStream2,
    /// ISO/IEC 13818-3 or ISO/IEC 11172-3 or ISO/IEC 13818-7 or ISO/IEC 14496-3 audio stream
    Audio(u8),
    /// Rec. ITU-T H.262 | ISO/IEC 13818-2, ISO/IEC 11172-2, ISO/IEC 14496-2, Rec. ITU-T
    /// H.264 | ISO/IEC 14496-10 or Rec. ITU-T H.265 | ISO/IEC 23008-2 video stream
    Video(u8),
    /// `ECM_stream`
    EcmStream,
    /// `EMM_stream`
    EmmStream,
    /// Rec. ITU-T H.222.0 | ISO/IEC 13818-1 Annex B or ISO/IEC 13818-6_DSMCC_stream
    DsmCc,
    /// Rec. ITU-T H.222.1 type E
    H2221TypeE,
    /// `program_stream_directory`
    ProgramStreamDirectory,
    /// Any stream_id value without a meaning of its own to this demuxer
    Other(u8),
}
impl From<u8> for StreamId {
    fn from(v: u8) -> Self {
        match v {
            0b1011_1100 => StreamId::ProgramStreamMap,
            0b1011_1101 => StreamId::PrivateStream1,
            0b1011_1110 => StreamId::PaddingStream,
            0b1011_1111 => StreamId::PrivateStream2,
            0b1100_0000..=0b1101_1111 => StreamId::Audio(v & 0b0001_1111),
            0b1110_0000..=0b1110_1111 => StreamId::Video(v & 0b0000_1111),
            0b1111_0000 => StreamId::EcmStream,
            0b1111_0001 => StreamId::EmmStream,
            0b1111_0010 => StreamId::DsmCc,
            0b1111_1000 => StreamId::H2221TypeE,
            0b1111_1111 => StreamId::ProgramStreamDirectory,
            _ => StreamId::Other(v),
        }
    }
}
impl StreamId {
    /// true for ids wrapping audio/video/data content that this demuxer extracts, false for
    /// the signalling-only ids (program stream maps and directories, ECM/EMM, DSM-CC,
    /// H.222.1 type E) whose payloads are not elementary stream data.
    pub fn is_media(self) -> bool {
        !matches!(
            self,
            StreamId::ProgramStreamMap
                | StreamId::PrivateStream2
                | StreamId::EcmStream
                | StreamId::EmmStream
                | StreamId::DsmCc
                | StreamId::H2221TypeE
                | StreamId::ProgramStreamDirectory
        )
    }
}

/// A completed PES packet, as delivered to a [`PesSink`].
///
/// `payload` borrows the reassembler's accumulation buffer and is only valid for the duration
/// of the sink call; sinks wanting to keep the data must copy it.
pub struct PesPacket<'buf> {
    /// PID of the transport stream packets this PES packet was carried in
    pub pid: Pid,
    /// value of the _stream_id_ field from the PES header
    pub stream_id: StreamId,
    /// the elementary stream data, with the PES header already stripped
    pub payload: &'buf [u8],
}

/// Trait for types that will receive the completed PES packets produced by a
/// [`PesReassembler`].
pub trait PesSink {
    /// called once per completed PES packet, on the thread driving the reassembler
    fn pes_packet(&mut self, pk: &PesPacket<'_>);
}
impl<F: FnMut(&PesPacket<'_>)> PesSink for F {
    fn pes_packet(&mut self, pk: &PesPacket<'_>) {
        self(pk)
    }
}

/// One PES packet in the process of being put back together.
struct PesAccumulator {
    stream_id: StreamId,
    /// logical capacity: the header's _PES_packet_length_, or `MAX_PES_PAYLOAD_SIZE` when the
    /// header declared zero
    declared_length: usize,
    buffer: Vec<u8>,
}

impl PesAccumulator {
    fn new(stream_id: StreamId, declared_length: usize) -> PesAccumulator {
        PesAccumulator {
            stream_id,
            declared_length,
            buffer: Vec::with_capacity(declared_length),
        }
    }

    /// Appends all of `data`, or none of it if that would grow the buffer past the declared
    /// length.  The buffer never grows beyond `declared_length`, whatever the stream claims.
    fn append(&mut self, data: &[u8]) -> Result<(), ()> {
        if self.buffer.len() + data.len() > self.declared_length {
            Err(())
        } else {
            self.buffer.extend_from_slice(data);
            Ok(())
        }
    }
}

/// Per-PID storage for in-flight accumulations, indexed directly by PID value.
#[derive(Default)]
struct Accumulators {
    by_pid: Vec<Option<PesAccumulator>>,
}

impl Accumulators {
    fn get_mut(&mut self, pid: Pid) -> Option<&mut PesAccumulator> {
        self.by_pid.get_mut(usize::from(pid)).and_then(Option::as_mut)
    }

    fn insert(&mut self, pid: Pid, accumulator: PesAccumulator) {
        let idx = usize::from(pid);
        if idx >= self.by_pid.len() {
            self.by_pid.resize_with(idx + 1, || None);
        }
        self.by_pid[idx] = Some(accumulator);
    }

    fn take(&mut self, pid: Pid) -> Option<PesAccumulator> {
        self.by_pid.get_mut(usize::from(pid)).and_then(Option::take)
    }

    /// removes and yields every stored accumulator, in ascending PID order
    fn drain(&mut self) -> impl Iterator<Item = (Pid, PesAccumulator)> + '_ {
        self.by_pid
            .iter_mut()
            .enumerate()
            .filter_map(|(idx, slot)| slot.take().map(|acc| (Pid::new(idx as u16), acc)))
    }
}

/// Reassembles PES packets from validated transport stream packets.
///
/// At most one accumulation exists per PID at any time; a transport stream interleaves the
/// fragments of at most one PES packet per PID, so a new unit starting on a PID implies the
/// previous unit on that PID is complete.
#[derive(Default)]
pub struct PesReassembler {
    accumulators: Accumulators,
}

impl PesReassembler {
    /// Creates a reassembler with no in-flight state.
    pub fn new() -> PesReassembler {
        Self::default()
    }

    /// Consumes one validated transport stream packet, emitting through `sink` any PES packet
    /// this one proves complete.
    pub fn feed<S: PesSink, O: DemuxObserver>(
        &mut self,
        pk: &ParsedPacket<'_>,
        sink: &mut S,
        observer: &mut O,
    ) {
        if pk.pusi {
            self.begin_unit(pk, sink, observer);
        } else {
            self.continue_unit(pk, observer);
        }
    }

    /// Emits every PES packet still being accumulated and clears all per-PID state.  To be
    /// called once, when the input is exhausted.
    pub fn flush<S: PesSink, O: DemuxObserver>(&mut self, sink: &mut S, observer: &mut O) {
        for (pid, accumulator) in self.accumulators.drain() {
            emit(pid, accumulator, sink, observer);
        }
    }

    fn begin_unit<S: PesSink, O: DemuxObserver>(
        &mut self,
        pk: &ParsedPacket<'_>,
        sink: &mut S,
        observer: &mut O,
    ) {
        let payload = pk.payload;
        if payload.len() < PES_PREFIX_SIZE {
            // too short to hold a PES prefix; whatever this unit is, it isn't for us
            return;
        }
        let start_code_prefix =
            u32::from(payload[0]) << 16 | u32::from(payload[1]) << 8 | u32::from(payload[2]);
        if start_code_prefix != 1 {
            // a unit without the 0x000001 prefix is not PES (PSI sections land here)
            return;
        }
        let stream_id = StreamId::from(payload[3]);
        if !stream_id.is_media() {
            return;
        }
        let pes_packet_length = usize::from(u16::from(payload[4]) << 8 | u16::from(payload[5]));
        let declared_length = if pes_packet_length == 0 {
            MAX_PES_PAYLOAD_SIZE
        } else {
            pes_packet_length
        };
        // the unit that was accumulating on this PID ends where this one starts,
        if let Some(finished) = self.accumulators.take(pk.pid) {
            emit(pk.pid, finished, sink, observer);
        }
        let mut accumulator = PesAccumulator::new(stream_id, declared_length);
        if accumulator.append(&payload[PES_PREFIX_SIZE..]).is_err() {
            observer.pes_discarded(pk.pid, PesDiscard::BufferOverrun);
            return;
        }
        self.accumulators.insert(pk.pid, accumulator);
    }

    fn continue_unit<O: DemuxObserver>(&mut self, pk: &ParsedPacket<'_>, observer: &mut O) {
        let overrun = match self.accumulators.get_mut(pk.pid) {
            // continuation of a unit whose start we never saw (or rejected); routine
            None => return,
            Some(accumulator) => accumulator.append(pk.payload).is_err(),
        };
        if overrun {
            self.accumulators.take(pk.pid);
            observer.pes_discarded(pk.pid, PesDiscard::BufferOverrun);
        }
    }
}

fn emit<S: PesSink, O: DemuxObserver>(
    pid: Pid,
    accumulator: PesAccumulator,
    sink: &mut S,
    observer: &mut O,
) {
    let buffer = &accumulator.buffer;
    if buffer.len() < PES_OPTIONAL_HEADER_SIZE {
        observer.pes_discarded(pid, PesDiscard::TruncatedHeader);
        return;
    }
    let header_data_length = usize::from(buffer[2]);
    let payload_offset = PES_OPTIONAL_HEADER_SIZE + header_data_length;
    if payload_offset > buffer.len() {
        observer.pes_discarded(pid, PesDiscard::TruncatedHeader);
        return;
    }
    let payload = &buffer[payload_offset..];
    observer.pes_packet_emitted(pid, accumulator.stream_id, buffer.len(), payload.len());
    sink.pes_packet(&PesPacket {
        pid,
        stream_id: accumulator.stream_id,
        payload,
    });
}
