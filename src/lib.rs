//! Demultiplexes MPEG2 Transport Stream data into its constituent Packetized Elementary
//! Streams, one logical stream per PID, per the _ISO/IEC 13818-1_ packet layouts.
//!
//! # Design principles
//!
//!  * *Avoid copying* where possible.  Transport stream packets are parsed through borrowing
//!    wrappers over the underlying byte buffer, and completed PES packets are handed to the
//!    caller as a borrowed slice of the reassembly buffer.
//!  * *Tolerate broken streams*.  Null packets, PSI tables, corrupt frames and continuations
//!    of units this demuxer never saw the start of are all routine content; they are set
//!    aside, reported through the [`demultiplex::DemuxObserver`] hook, and never abort a run.
//!  * *No hidden global state*.  Observability is an injected trait implementation rather
//!    than a process-wide logger configuration, so two demux runs in one process cannot
//!    interfere.
//!
//! The parsing layers are synchronous and single-threaded; [`service::DemuxService`] wraps
//! them in a background worker with cooperative cancellation for whole-file runs.
//!
//! # Example
//!
//! Collect the payload size of every PES packet in a buffer of TS data:
//!
//! ```
//! use mpeg2ts_demux::demultiplex::{Demultiplex, NullObserver};
//! use mpeg2ts_demux::pes::PesPacket;
//!
//! let ts_data: Vec<u8> = vec![]; // 188-byte packets from somewhere
//! let mut sizes = Vec::new();
//! let mut demux = Demultiplex::new(|pk: &PesPacket<'_>| sizes.push(pk.payload.len()), NullObserver);
//! for pk in ts_data.chunks_exact(188) {
//!     demux.push(pk);
//! }
//! demux.flush();
//! assert!(sizes.is_empty());
//! ```

pub mod demultiplex;
pub mod framer;
pub mod packet;
pub mod pes;
pub mod service;
