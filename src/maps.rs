//! Batched draining of the kernel flow maps.
//!
//! Userspace never writes the flow maps; it empties them with the
//! kernel's batched lookup-and-delete operation so that each drained
//! record is observed exactly once.

use std::ffi::c_void;
use std::io;
use std::os::fd::{AsFd, AsRawFd};

use libbpf_rs::MapHandle;
use plain::Plain;

use crate::error::Error;

/// Batch size for BPF_MAP_LOOKUP_AND_DELETE_BATCH.
pub(crate) const DEFAULT_BATCH_SIZE: u32 = 10;

/// Empties a hash map, returning every (key, value) pair it held.
///
/// Iterates the batch syscall until the kernel reports ENOENT, which
/// marks the final (possibly partial) batch.
pub(crate) fn drain_map<K, V>(map: &MapHandle, batch_size: u32) -> Result<Vec<(K, V)>, Error>
where
    K: Plain + Default + Copy,
    V: Plain + Default + Copy,
{
    let fd = map.as_fd().as_raw_fd();
    let mut drained = Vec::new();
    let mut keys = vec![K::default(); batch_size as usize];
    let mut vals = vec![V::default(); batch_size as usize];
    let mut in_token: u32 = 0;
    let mut have_token = false;

    loop {
        let mut out_token: u32 = 0;
        let mut count: u32 = batch_size;
        let mut opts: libbpf_sys::bpf_map_batch_opts = unsafe { std::mem::zeroed() };
        opts.sz = std::mem::size_of::<libbpf_sys::bpf_map_batch_opts>() as _;

        let ret = unsafe {
            libbpf_sys::bpf_map_lookup_and_delete_batch(
                fd,
                if have_token {
                    &mut in_token as *mut u32 as *mut c_void
                } else {
                    std::ptr::null_mut()
                },
                &mut out_token as *mut u32 as *mut c_void,
                keys.as_mut_ptr() as *mut c_void,
                vals.as_mut_ptr() as *mut c_void,
                &mut count,
                &opts,
            )
        };

        let done = if ret == 0 {
            false
        } else if -ret == libc::ENOENT {
            // Map exhausted; `count` still covers the last entries read.
            true
        } else {
            return Err(Error::DrainFailed(io::Error::from_raw_os_error(-ret)));
        };

        for i in 0..count.min(batch_size) as usize {
            drained.push((keys[i], vals[i]));
        }

        if done {
            return Ok(drained);
        }
        in_token = out_token;
        have_token = true;
    }
}
