//! In-flow aggregating tracer: the same drain-on-tick model as
//! [`crate::tracer::Tracer`], but keyed per connection so each distinct
//! port pair and process keeps its own record and counters.

use std::collections::HashMap;
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::OwnedFd;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use libbpf_rs::skel::{OpenSkel, Skel, SkelBuilder};
use libbpf_rs::{MapHandle, OpenObject};

use crate::error::Error;
use crate::flow::{raw, FlowStat, SingleFlow};
use crate::maps::{self, DEFAULT_BATCH_SIZE};
use crate::port_binding;
use crate::stats::{self, ProgramStats};
use crate::{bump_memlock_rlimit, TracerParams};

#[allow(unused_imports)]
mod bpf {
    include!(concat!(env!("OUT_DIR"), "/sockflow_conn.skel.rs"));
}

use bpf::{SockflowConnSkel, SockflowConnSkelBuilder};

struct PollWorker {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// Tracer over the per-connection aggregating BPF object.
pub struct InFlowTracer {
    skel: SockflowConnSkel<'static>,
    _open_object: Box<MaybeUninit<OpenObject>>,
    flows: MapHandle,
    flow_stats: MapHandle,
    stats_fd: Option<OwnedFd>,
    batch_size: u32,
    worker: Option<PollWorker>,
}

impl InFlowTracer {
    /// Loads and attaches the per-connection BPF object.
    pub fn new(params: &TracerParams) -> Result<InFlowTracer, Error> {
        bump_memlock_rlimit()?;

        let skel_builder = SockflowConnSkelBuilder::default();

        let mut open_object = Box::new(MaybeUninit::uninit());
        let open_skel = skel_builder
            .open(&mut open_object)
            .map_err(|e| Error::LoadFailed(format!("opening BPF object: {}", e)))?;
        let mut skel = open_skel
            .load()
            .map_err(|e| Error::LoadFailed(format!("loading BPF object: {}", e)))?;
        skel.attach()
            .map_err(|e| Error::LoadFailed(format!("attaching BPF programs: {}", e)))?;

        let skel: SockflowConnSkel<'static> = unsafe { std::mem::transmute(skel) };

        let flows = MapHandle::try_from(&skel.maps.flows)
            .map_err(|e| Error::LoadFailed(format!("duplicating flows map fd: {}", e)))?;
        let flow_stats = MapHandle::try_from(&skel.maps.flow_stats)
            .map_err(|e| Error::LoadFailed(format!("duplicating flow_stats map fd: {}", e)))?;

        let stats_fd = if params.stats {
            let fd = stats::enable_bpf_stats()
                .map_err(|e| Error::LoadFailed(format!("enabling BPF run-time stats: {}", e)))?;
            Some(fd)
        } else {
            None
        };

        Ok(InFlowTracer {
            skel,
            _open_object: open_object,
            flows,
            flow_stats,
            stats_fd,
            batch_size: DEFAULT_BATCH_SIZE,
            worker: None,
        })
    }

    /// Seeds the UDP port-binding table and spawns the polling worker;
    /// `callback` receives the drained connections every `interval`.
    pub fn start<F>(&mut self, mut callback: F, interval: Duration) -> Result<(), Error>
    where
        F: FnMut(Vec<SingleFlow>) -> anyhow::Result<()> + Send + 'static,
    {
        if self.worker.is_some() {
            return Err(Error::InitFailed("tracer already started".into()));
        }

        port_binding::initialize(&self.skel.maps.udp_port_binding)?;

        let flows = MapHandle::try_from(&self.skel.maps.flows)
            .map_err(|e| Error::InitFailed(format!("duplicating flows map fd: {}", e)))?;
        let flow_stats = MapHandle::try_from(&self.skel.maps.flow_stats)
            .map_err(|e| Error::InitFailed(format!("duplicating flow_stats map fd: {}", e)))?;
        let batch_size = self.batch_size;

        let (stop_tx, stop_rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("sockflow_conn_poll".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                    Err(RecvTimeoutError::Timeout) => {}
                }

                let batch = match dump_conn_flows_from(&flows, &flow_stats, batch_size) {
                    Ok(batch) => batch,
                    Err(e) => {
                        tracing::warn!("connection drain failed: {}", e);
                        continue;
                    }
                };
                if let Err(e) = callback(batch) {
                    tracing::warn!("connection callback failed: {}", e);
                }
            })
            .map_err(|e| Error::InitFailed(format!("spawning poll worker: {}", e)))?;

        self.worker = Some(PollWorker { stop_tx, handle });
        Ok(())
    }

    /// Signals the polling worker and joins it. Idempotent.
    pub fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.stop_tx.send(());
            let _ = worker.handle.join();
        }
    }

    /// Stops the worker and tears the BPF object down.
    pub fn close(mut self) {
        self.stop();
    }

    /// Drains and returns all currently accumulated connections.
    pub fn dump_flows(&self) -> Result<Vec<SingleFlow>, Error> {
        dump_conn_flows_from(&self.flows, &self.flow_stats, self.batch_size)
    }

    /// Overrides the lookup-and-delete batch size (default 10).
    pub fn set_batch_size(&mut self, batch_size: u32) {
        self.batch_size = batch_size.max(1);
    }

    /// Per-program run-time counters, keyed by kernel program id.
    pub fn get_stats(&self) -> io::Result<HashMap<u32, ProgramStats>> {
        stats::collect(self.skel.object())
    }
}

impl Drop for InFlowTracer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn dump_conn_flows_from(
    flows: &MapHandle,
    flow_stats: &MapHandle,
    batch_size: u32,
) -> Result<Vec<SingleFlow>, Error> {
    let (flows_res, stats_res) = thread::scope(|s| {
        let flows_thread =
            s.spawn(|| maps::drain_map::<raw::conn_key, raw::conn_record>(flows, batch_size));
        let stats_thread =
            s.spawn(|| maps::drain_map::<raw::conn_key, raw::flow_stat>(flow_stats, batch_size));
        (flows_thread.join(), stats_thread.join())
    });

    let records = flows_res.expect("flow drainer panicked")?;
    let stat_records = stats_res.expect("stat drainer panicked")?;
    Ok(merge_conn_flows(records, stat_records))
}

fn merge_conn_flows(
    records: Vec<(raw::conn_key, raw::conn_record)>,
    stat_records: Vec<(raw::conn_key, raw::flow_stat)>,
) -> Vec<SingleFlow> {
    let stats: HashMap<raw::conn_key, FlowStat> = stat_records
        .iter()
        .map(|(key, stat)| (*key, FlowStat::from(stat)))
        .collect();

    records
        .iter()
        .map(|(key, rec)| {
            let stat = stats.get(key).copied().unwrap_or_default();
            SingleFlow::from_record(rec, Some(stat))
        })
        .collect()
}
