//! Streaming tracer: every observed event is delivered individually
//! through a ring buffer, with no kernel-side coalescing.

use std::collections::HashMap;
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use libbpf_rs::skel::{OpenSkel, Skel, SkelBuilder};
use libbpf_rs::{OpenObject, PrintLevel, RingBufferBuilder};

use crate::error::Error;
use crate::flow::{raw, Flow};
use crate::port_binding;
use crate::stats::{self, ProgramStats};
use crate::{bump_memlock_rlimit, TracerParams};

#[allow(unused_imports)]
mod bpf {
    include!(concat!(env!("OUT_DIR"), "/sockflow_stream.skel.rs"));
}

use bpf::{SockflowStreamSkel, SockflowStreamSkelBuilder};

/// Cadence of the polling loop.
const RINGBUF_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Per-call timeout handed to the ring buffer poll.
const RINGBUF_POLL_TIMEOUT: Duration = Duration::from_millis(10);

fn log_libbpf(level: PrintLevel, msg: String) {
    let msg = msg.trim_end();
    match level {
        PrintLevel::Debug => tracing::debug!(target: "libbpf", "{}", msg),
        PrintLevel::Info => tracing::info!(target: "libbpf", "{}", msg),
        PrintLevel::Warn => tracing::warn!(target: "libbpf", "{}", msg),
    }
}

/// Signals a running [`StreamingTracer::start`] loop to return.
///
/// Cloneable and sendable, so the tracer itself can live on the thread
/// that runs the blocking loop. Each tracer owns its own sink and stop
/// channel; independent streaming tracers can coexist in one process.
#[derive(Clone)]
pub struct StopHandle {
    stop_tx: Sender<()>,
}

impl StopHandle {
    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
    }
}

/// Tracer over the streaming BPF object.
pub struct StreamingTracer {
    skel: SockflowStreamSkel<'static>,
    _open_object: Box<MaybeUninit<OpenObject>>,
    stats_fd: Option<OwnedFd>,
    stop_tx: Sender<()>,
    stop_rx: Mutex<Receiver<()>>,
}

impl StreamingTracer {
    /// Loads and attaches the streaming BPF object. Also installs the
    /// libbpf log router with an info-level threshold, silencing
    /// libbpf's debug chatter.
    pub fn new(params: &TracerParams) -> Result<StreamingTracer, Error> {
        libbpf_rs::set_print(Some((PrintLevel::Info, log_libbpf)));

        bump_memlock_rlimit()?;

        let skel_builder = SockflowStreamSkelBuilder::default();

        let mut open_object = Box::new(MaybeUninit::uninit());
        let open_skel = skel_builder
            .open(&mut open_object)
            .map_err(|e| Error::LoadFailed(format!("opening BPF object: {}", e)))?;
        let mut skel = open_skel
            .load()
            .map_err(|e| Error::LoadFailed(format!("loading BPF object: {}", e)))?;
        skel.attach()
            .map_err(|e| Error::LoadFailed(format!("attaching BPF programs: {}", e)))?;

        let skel: SockflowStreamSkel<'static> = unsafe { std::mem::transmute(skel) };

        let stats_fd = if params.stats {
            let fd = stats::enable_bpf_stats()
                .map_err(|e| Error::LoadFailed(format!("enabling BPF run-time stats: {}", e)))?;
            Some(fd)
        } else {
            None
        };

        let (stop_tx, stop_rx) = mpsc::channel();

        Ok(StreamingTracer {
            skel,
            _open_object: open_object,
            stats_fd,
            stop_tx,
            stop_rx: Mutex::new(stop_rx),
        })
    }

    /// Runs the polling loop on the calling thread, decoding each ring
    /// buffer record into a [`Flow`] and pushing it into `sink`.
    ///
    /// Returns when [`StreamingTracer::stop`] (or a [`StopHandle`]) is
    /// invoked, or when the sink's receiver is dropped. EINTR from the
    /// poll is absorbed; any other poll failure ends the loop with
    /// [`Error::PollFailed`].
    pub fn start(&self, sink: Sender<Flow>) -> Result<(), Error> {
        let sink_closed = Arc::new(AtomicBool::new(false));

        let mut builder = RingBufferBuilder::new();
        let closed = sink_closed.clone();
        builder
            .add(&self.skel.maps.flows, move |data: &[u8]| {
                let mut rec = raw::flow_record::default();
                if plain::copy_from_bytes(&mut rec, data).is_err() {
                    tracing::warn!("short flow record from ring buffer: {} bytes", data.len());
                    return 0;
                }
                if sink.send(Flow::from_record(&rec, None)).is_err() {
                    closed.store(true, Ordering::Relaxed);
                }
                0
            })
            .map_err(|e| Error::LoadFailed(format!("registering ring buffer callback: {}", e)))?;
        let rb = builder
            .build()
            .map_err(|e| Error::LoadFailed(format!("creating ring buffer: {}", e)))?;

        port_binding::initialize(&self.skel.maps.udp_port_binding)?;

        let stop_rx = self.stop_rx.lock().unwrap();

        loop {
            match stop_rx.recv_timeout(RINGBUF_POLL_INTERVAL) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return Ok(()),
                Err(RecvTimeoutError::Timeout) => {}
            }

            if sink_closed.load(Ordering::Relaxed) {
                return Ok(());
            }

            match rb.poll(RINGBUF_POLL_TIMEOUT) {
                Ok(()) => {}
                Err(e) if e.kind() == libbpf_rs::ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::PollFailed(e.to_string())),
            }
        }
    }

    /// Signals the polling loop to return at its next tick.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
    }

    /// A cloneable handle for stopping the loop from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stop_tx: self.stop_tx.clone(),
        }
    }

    /// Tears the tracer down. The ring buffer is scoped to `start` and
    /// already freed once the loop has returned; the BPF object goes
    /// next, the stats fd last.
    pub fn close(self) {}

    /// Per-program run-time counters, keyed by kernel program id.
    pub fn get_stats(&self) -> io::Result<HashMap<u32, ProgramStats>> {
        stats::collect(self.skel.object())
    }
}
