//! Bootstraps the UDP port-binding map from the host's current state.
//!
//! The bind-syscall tracepoints only see binds that happen after
//! attach; ports bound before the tracer started would be misclassified
//! as active traffic. Seeding the map from the kernel's UDP socket
//! table closes that race. Must run before the polling loop starts.

use std::collections::BTreeSet;
use std::fs;

use libbpf_rs::{MapCore, MapFlags};

use crate::error::Error;

const PROC_NET_UDP: &str = "/proc/net/udp";

/// Matches PORT_BOUND in src/bpf/port_binding.h.
const PORT_STATE_BOUND: u8 = 2;

pub(crate) fn initialize<M: MapCore>(map: &M) -> Result<(), Error> {
    let table = fs::read_to_string(PROC_NET_UDP)
        .map_err(|e| Error::InitFailed(format!("reading {}: {}", PROC_NET_UDP, e)))?;

    for port in parse_bound_ports(&table) {
        // Keys are host byte order, matching the kernel-side lookups.
        map.update(&port.to_ne_bytes(), &[PORT_STATE_BOUND], MapFlags::ANY)
            .map_err(|e| Error::InitFailed(format!("inserting port {}: {}", port, e)))?;
    }

    Ok(())
}

/// Parses the local port column out of a /proc/net/udp table.
///
/// Lines look like:
/// `  2867: 00000000:14E9 00000000:0000 07 00000000:00000000 ...`
/// where 14E9 is the bound local port in hex. Port 0 never appears for
/// a hashed socket but is filtered anyway.
fn parse_bound_ports(table: &str) -> BTreeSet<u16> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let local = line.split_whitespace().nth(1)?;
            let (_, port_hex) = local.split_once(':')?;
            u16::from_str_radix(port_hex, 16).ok()
        })
        .filter(|port| *port != 0)
        .collect()
}
