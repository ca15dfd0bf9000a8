//! BPF program runtime statistics.
//!
//! When enabled via `TracerParams { stats: true }`, the kernel keeps
//! per-program run counts and run times. Enabling returns a file
//! descriptor; statistics collection stops when it is closed.

use std::collections::HashMap;
use std::ffi::c_void;
use std::io;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};

/// Run-time counters for one attached BPF program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramStats {
    pub name: String,
    pub run_time_ns: u64,
    pub run_count: u64,
}

/// Enables kernel-side BPF run-time statistics (BPF_ENABLE_STATS).
/// Requires a 5.8+ kernel.
pub(crate) fn enable_bpf_stats() -> io::Result<OwnedFd> {
    let fd = unsafe { libbpf_sys::bpf_enable_stats(libbpf_sys::BPF_STATS_RUN_TIME) };
    if fd < 0 {
        return Err(io::Error::from_raw_os_error(-fd));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Collects per-program counters for every program in the object,
/// keyed by the kernel's program id.
pub(crate) fn collect(object: &libbpf_rs::Object) -> io::Result<HashMap<u32, ProgramStats>> {
    let mut stats = HashMap::new();

    for prog in object.progs() {
        let mut info: libbpf_sys::bpf_prog_info = unsafe { mem::zeroed() };
        let mut info_len = mem::size_of::<libbpf_sys::bpf_prog_info>() as u32;

        let ret = unsafe {
            libbpf_sys::bpf_obj_get_info_by_fd(
                prog.as_fd().as_raw_fd(),
                &mut info as *mut libbpf_sys::bpf_prog_info as *mut c_void,
                &mut info_len,
            )
        };
        if ret != 0 {
            return Err(io::Error::from_raw_os_error(-ret));
        }

        stats.insert(
            info.id,
            ProgramStats {
                name: prog.name().to_string_lossy().into_owned(),
                run_time_ns: info.run_time_ns,
                run_count: info.run_cnt,
            },
        );
    }

    Ok(stats)
}
