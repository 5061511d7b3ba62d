//! Runs the demultiplexer over a file on its own worker thread, with cooperative
//! cancellation and a joinable lifecycle.

use crate::demultiplex::{Demultiplex, DemuxObserver};
use crate::framer::Framer;
use crate::packet::Packet;
use crate::pes::PesSink;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use thiserror::Error;

const READ_BUFFER_SIZE: usize = Packet::SIZE * 1024;

/// Failure modes of a demux run, as reported by [`DemuxService::start()`] and
/// [`DemuxService::join()`].
#[derive(Debug, Error)]
pub enum DemuxError {
    /// `start()` was called while a worker was already running
    #[error("demultiplexing is already started")]
    AlreadyStarted,
    /// the input could not be opened or read; everything demultiplexed before the failure
    /// has still been delivered to the sink
    #[error("transport stream read failed: {0}")]
    Io(#[from] io::Error),
    /// the worker thread panicked, which indicates a bug rather than bad input
    #[error("demux worker thread panicked")]
    WorkerPanic,
}

type WorkerExit<S, O> = (Result<(), DemuxError>, S, O);

/// Demultiplexes one transport stream file on a dedicated background thread.
///
/// The sink and observer are handed to the worker for the duration of a run and handed back
/// when [`join()`](DemuxService::join) collects it, so a service can run the same file (or
/// the same sink) repeatedly via [`reset()`](DemuxService::reset).
///
/// Whatever ends the run -- end of stream, [`stop()`](DemuxService::stop) or a read error --
/// the worker flushes the reassembler first, so partially accumulated PES packets are
/// delivered rather than silently dropped.
pub struct DemuxService<S, O> {
    input: PathBuf,
    cancel: Arc<AtomicBool>,
    parts: Option<(S, O)>,
    worker: Option<thread::JoinHandle<WorkerExit<S, O>>>,
}

impl<S, O> DemuxService<S, O>
where
    S: PesSink + Send + 'static,
    O: DemuxObserver + Send + 'static,
{
    /// Creates a service that will demultiplex the given file into the given sink.
    pub fn new(input: impl Into<PathBuf>, sink: S, observer: O) -> DemuxService<S, O> {
        DemuxService {
            input: input.into(),
            cancel: Arc::new(AtomicBool::new(false)),
            parts: Some((sink, observer)),
            worker: None,
        }
    }

    /// Spawns the worker thread and returns immediately.
    ///
    /// Fails with [`DemuxError::AlreadyStarted`] if a worker is already running.
    pub fn start(&mut self) -> Result<(), DemuxError> {
        if self.worker.is_some() {
            return Err(DemuxError::AlreadyStarted);
        }
        // parts are only absent while a worker is live (or after a failed spawn),
        let (sink, observer) = self.parts.take().ok_or(DemuxError::AlreadyStarted)?;
        self.cancel.store(false, Ordering::Relaxed);
        let input = self.input.clone();
        let cancel = Arc::clone(&self.cancel);
        let handle = thread::Builder::new()
            .name("mpegts-demux".to_string())
            .spawn(move || {
                let mut demux = Demultiplex::new(sink, observer);
                let result = demux_input(&input, &cancel, &mut demux);
                demux.flush();
                let (sink, observer) = demux.into_parts();
                (result, sink, observer)
            })?;
        self.worker = Some(handle);
        Ok(())
    }

    /// Requests cooperative cancellation, honoured by the worker between transport stream
    /// packets.  Never blocks, and is safe to call from any thread (including repeatedly, or
    /// when nothing is running).
    pub fn stop(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// true once the worker has exited, or if none was started.
    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().map_or(true, |w| w.is_finished())
    }

    /// Blocks until the worker has fully exited -- including the terminal flush -- and
    /// returns the run's outcome.  A no-op returning `Ok` when nothing was started.
    pub fn join(&mut self) -> Result<(), DemuxError> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        match worker.join() {
            Ok((result, sink, observer)) => {
                self.parts = Some((sink, observer));
                result
            }
            Err(_) => Err(DemuxError::WorkerPanic),
        }
    }

    /// Stops and joins any running worker, leaving the service ready for a fresh `start()`.
    pub fn reset(&mut self) -> Result<(), DemuxError> {
        self.stop();
        self.join()
    }
}

fn demux_input<S: PesSink, O: DemuxObserver>(
    input: &Path,
    cancel: &AtomicBool,
    demux: &mut Demultiplex<S, O>,
) -> Result<(), DemuxError> {
    let file = File::open(input)?;
    let mut framer = Framer::new(io::BufReader::with_capacity(READ_BUFFER_SIZE, file));
    while !cancel.load(Ordering::Relaxed) {
        match framer.next_frame()? {
            Some(frame) => demux.push(frame),
            None => break,
        }
    }
    if framer.trailing_bytes() != 0 {
        demux.observer_mut().input_truncated(framer.trailing_bytes());
    }
    Ok(())
}
