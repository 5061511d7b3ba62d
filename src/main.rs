//! Command-line front-end for the demultiplexer: option parsing, logging, per-PID output
//! files and signal handling around a [`DemuxService`].

use anyhow::Context;
use clap::Parser;
use log::{debug, error, info, trace, warn};
use mpeg2ts_demux::demultiplex::{DemuxObserver, DropReason, PesDiscard};
use mpeg2ts_demux::packet::Pid;
use mpeg2ts_demux::pes::{PesPacket, PesSink, StreamId};
use mpeg2ts_demux::service::DemuxService;
use std::collections::HashMap;
use std::fs;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(about = "Demultiplexes an MPEG Transport Stream file into one output file per PID")]
struct Options {
    /// Transport stream file to demultiplex
    input: PathBuf,

    /// Directory receiving one binary file per demultiplexed PID
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// Log severity: off, error, warn, info, debug or trace
    #[arg(short, long, default_value = "info", value_parser = parse_level)]
    log_level: log::LevelFilter,
}

fn parse_level(value: &str) -> Result<log::LevelFilter, log::ParseLevelError> {
    value.parse()
}

/// Set by the signal handler; the only state a signal context may touch.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn request_shutdown(_signal: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

#[cfg(unix)]
fn install_signal_handlers() {
    let handler = request_shutdown as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}

#[cfg(not(unix))]
fn install_signal_handlers() {}

/// Writes each completed PES payload to `<output_dir>/<pid in hex>`, creating the files
/// lazily on first emission for their PID.
struct PesWriter {
    dir: PathBuf,
    // `None` marks a PID whose output file could not be created, so it is not retried
    outputs: HashMap<u16, Option<BufWriter<File>>>,
}

impl PesWriter {
    fn new(dir: PathBuf) -> PesWriter {
        PesWriter {
            dir,
            outputs: HashMap::new(),
        }
    }

    fn output_for(&mut self, pid: Pid) -> Option<&mut BufWriter<File>> {
        let key = u16::from(pid);
        let dir = &self.dir;
        self.outputs
            .entry(key)
            .or_insert_with(|| {
                let path = dir.join(format!("{:#06x}", key));
                match File::create(&path) {
                    Ok(file) => Some(BufWriter::new(file)),
                    Err(e) => {
                        error!("cannot create {}: {}", path.display(), e);
                        None
                    }
                }
            })
            .as_mut()
    }
}

impl PesSink for PesWriter {
    fn pes_packet(&mut self, pk: &PesPacket<'_>) {
        if let Some(output) = self.output_for(pk.pid) {
            if let Err(e) = output.write_all(pk.payload) {
                error!("write failed for {:?}: {}", pk.pid, e);
            }
        }
    }
}

impl Drop for PesWriter {
    fn drop(&mut self) {
        for (pid, output) in &mut self.outputs {
            if let Some(output) = output {
                if let Err(e) = output.flush() {
                    error!("flush failed for PID {:#06x}: {}", pid, e);
                }
            }
        }
    }
}

/// Renders demux observations through the `log` crate.
struct LogObserver;

impl DemuxObserver for LogObserver {
    fn ts_packet_dropped(&mut self, reason: DropReason) {
        match reason {
            DropReason::InvalidSyncByte(b) => {
                warn!("dropping packet with sync byte {:#04x} (expected 0x47)", b)
            }
            DropReason::TransportError(pid) => debug!("dropping corrupt packet on {:?}", pid),
            DropReason::NoPayload(pid) => trace!("packet without payload on {:?}", pid),
            DropReason::PidOutOfRange(pid) => trace!("ignoring packet on {:?}", pid),
        }
    }

    fn continuity_lost(&mut self, pid: Pid, expected: u8, actual: u8) {
        warn!(
            "continuity loss on {:?}: expected counter {}, got {}",
            pid, expected, actual
        );
    }

    fn pes_packet_emitted(
        &mut self,
        pid: Pid,
        stream_id: StreamId,
        accumulated_length: usize,
        payload_length: usize,
    ) {
        trace!(
            "PES packet on {:?} ({:?}): {} bytes accumulated, {} bytes payload",
            pid,
            stream_id,
            accumulated_length,
            payload_length
        );
    }

    fn pes_discarded(&mut self, pid: Pid, reason: PesDiscard) {
        match reason {
            PesDiscard::BufferOverrun => {
                warn!("PES data on {:?} overran its declared length, discarding", pid)
            }
            PesDiscard::TruncatedHeader => {
                warn!("PES data on {:?} ended inside its header, discarding", pid)
            }
        }
    }

    fn input_truncated(&mut self, trailing_bytes: usize) {
        warn!("input ends with {} bytes of a truncated packet", trailing_bytes);
    }
}

fn main() -> anyhow::Result<()> {
    let options = Options::parse();
    env_logger::Builder::new()
        .filter_level(options.log_level)
        .init();
    info!(
        "demultiplexing {} into {}",
        options.input.display(),
        options.output_dir.display()
    );

    fs::create_dir_all(&options.output_dir).with_context(|| {
        format!(
            "cannot create output directory {}",
            options.output_dir.display()
        )
    })?;

    install_signal_handlers();

    let writer = PesWriter::new(options.output_dir.clone());
    let mut service = DemuxService::new(&options.input, writer, LogObserver);
    service.start()?;

    while !service.is_finished() {
        if SHUTDOWN.load(Ordering::Relaxed) {
            info!("shutdown requested, stopping...");
            service.stop();
            break;
        }
        thread::sleep(Duration::from_millis(20));
    }

    service.join().context("demultiplexing failed")?;
    info!("done");
    Ok(())
}
