//! sockflow - host-wide TCP/UDP connection flow tracing over eBPF.
//!
//! Kernel probes classify every TCP and UDP event into a flow record
//! carrying both peers, the listening port, the flow direction, and the
//! observing task. Three tracer variants differ only in how records
//! leave the kernel:
//!
//! - [`Tracer`] - flows coalesce into hash maps keyed by the aggregated
//!   flow tuple (ephemeral port collapsed) and are drained on a tick
//! - [`InFlowTracer`] - same model, keyed per connection
//! - [`StreamingTracer`] - one ring-buffer record per event
//!
//! All variants infer UDP flow direction from a table of locally bound
//! UDP ports, maintained from the bind(2) syscall and seeded from
//! `/proc/net/udp` at start.
//!
//! Loading and attaching needs CAP_BPF + CAP_PERFMON (or
//! CAP_SYS_ADMIN), a BTF-enabled kernel, and room to raise
//! RLIMIT_MEMLOCK.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! let mut tracer = sockflow::Tracer::new(&sockflow::TracerParams::default())?;
//! tracer.start(
//!     |flows| {
//!         for flow in flows {
//!             println!("{:?} {}:{} {:?}", flow.direction, flow.daddr, flow.lport, flow.task);
//!         }
//!         Ok(())
//!     },
//!     Duration::from_secs(1),
//! )?;
//! # std::thread::sleep(Duration::from_secs(3));
//! tracer.stop();
//! tracer.close();
//! # Ok::<(), sockflow::Error>(())
//! ```

mod error;
pub mod flow;
mod in_flow;
mod maps;
mod port_binding;
mod stats;
mod streaming;
mod tracer;

pub use error::Error;
pub use flow::{Flow, FlowDirection, FlowStat, SingleFlow, L4_PROTO_TCP, L4_PROTO_UDP};
pub use in_flow::InFlowTracer;
pub use stats::ProgramStats;
pub use streaming::{StopHandle, StreamingTracer};
pub use tracer::Tracer;

/// Tracer construction options.
#[derive(Debug, Default, Clone)]
pub struct TracerParams {
    /// Enable kernel-side per-program run-time statistics, readable
    /// through `get_stats()`.
    pub stats: bool,
}

/// Raise the memory-lock rlimit so the BPF subsystem can pin maps and
/// programs. Constructors call this; it is public for callers that drop
/// privileges afterwards and need the limit raised early.
pub fn bump_memlock_rlimit() -> Result<(), Error> {
    let rlimit = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };

    if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlimit) } != 0 {
        return Err(Error::LimitFailed(std::io::Error::last_os_error()));
    }

    Ok(())
}
