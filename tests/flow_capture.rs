//! End-to-end flow capture tests.
//!
//! These load the real BPF objects and observe real loopback traffic,
//! so they require root/BPF privileges and are marked `#[ignore]` by
//! default. Run with:
//!
//!   sudo cargo test --test flow_capture -- --ignored --test-threads 1
//!
//! Single-threaded because every test attaches host-wide probes.

mod common;

use std::net::UdpSocket;
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use sockflow::{
    Flow, FlowDirection, InFlowTracer, StreamingTracer, Tracer, TracerParams, L4_PROTO_TCP,
    L4_PROTO_UDP,
};

use common::{
    free_udp_port, settle, tcp_accept_once, tcp_connect_discard, udp_send_unbound, DISCARD_PORT,
    LOCALHOST,
};

fn my_flows(flows: &[Flow]) -> Vec<&Flow> {
    let pid = process::id();
    flows.iter().filter(|f| f.pid == pid).collect()
}

#[test]
#[ignore] // Requires root/BPF privileges
fn test_outbound_tcp_flow_is_active() {
    let tracer = Tracer::new(&TracerParams::default()).expect("loading tracer");

    tcp_connect_discard();
    settle();

    let flows = tracer.dump_flows().expect("dumping flows");
    let flow = my_flows(&flows)
        .into_iter()
        .find(|f| f.l4_proto == L4_PROTO_TCP && f.lport == DISCARD_PORT)
        .expect("no TCP flow to the discard port observed");

    assert_eq!(flow.direction, FlowDirection::Active);
    assert_eq!(flow.saddr, LOCALHOST);
    assert_eq!(flow.daddr, LOCALHOST);
    assert!(!flow.task.is_empty());
    assert!(!flow.task.contains('\0'));

    tracer.close();
}

#[test]
#[ignore] // Requires root/BPF privileges
fn test_inbound_tcp_flow_is_passive() {
    let tracer = Tracer::new(&TracerParams::default()).expect("loading tracer");

    let port = tcp_accept_once();
    settle();

    let flows = tracer.dump_flows().expect("dumping flows");
    let flow = my_flows(&flows)
        .into_iter()
        .find(|f| {
            f.l4_proto == L4_PROTO_TCP
                && f.lport == port
                && f.direction == FlowDirection::Passive
        })
        .expect("no passive TCP flow on the listener port observed");

    assert_eq!(flow.daddr, LOCALHOST);

    tracer.close();
}

#[test]
#[ignore] // Requires root/BPF privileges
fn test_udp_client_flow_is_active() {
    let tracer = Tracer::new(&TracerParams::default()).expect("loading tracer");

    udp_send_unbound();
    settle();

    let flows = tracer.dump_flows().expect("dumping flows");
    let flow = my_flows(&flows)
        .into_iter()
        .find(|f| f.l4_proto == L4_PROTO_UDP && f.lport == DISCARD_PORT)
        .expect("no UDP flow to the discard port observed");

    assert_eq!(flow.direction, FlowDirection::Active);

    tracer.close();
}

#[test]
#[ignore] // Requires root/BPF privileges
fn test_udp_listener_flow_is_passive() {
    // Attach before binding so the bind tracepoints see the port.
    let tracer = Tracer::new(&TracerParams::default()).expect("loading tracer");

    let port = free_udp_port();
    let sock = UdpSocket::bind((LOCALHOST, port)).expect("binding listener port");
    settle();

    // A reply sent from the bound port must classify as passive.
    let _ = sock.send_to(b"pong", (LOCALHOST, DISCARD_PORT));
    settle();

    let flows = tracer.dump_flows().expect("dumping flows");
    let flow = my_flows(&flows)
        .into_iter()
        .find(|f| f.l4_proto == L4_PROTO_UDP && f.lport == port)
        .expect("no UDP flow for the bound port observed");

    assert_eq!(flow.direction, FlowDirection::Passive);

    tracer.close();
}

#[test]
#[ignore] // Requires root/BPF privileges
fn test_dump_flows_drains_the_map() {
    let tracer = Tracer::new(&TracerParams::default()).expect("loading tracer");

    tcp_connect_discard();
    settle();

    let first = tracer.dump_flows().expect("first dump");
    assert!(
        my_flows(&first)
            .iter()
            .any(|f| f.l4_proto == L4_PROTO_TCP && f.lport == DISCARD_PORT),
        "first dump misses the generated flow"
    );

    // The drain deletes as it reads; with no new traffic from this
    // process the flow must not reappear.
    let second = tracer.dump_flows().expect("second dump");
    assert!(
        !my_flows(&second)
            .iter()
            .any(|f| f.l4_proto == L4_PROTO_TCP && f.lport == DISCARD_PORT),
        "second dump still contains the drained flow"
    );

    tracer.close();
}

#[test]
#[ignore] // Requires root/BPF privileges
fn test_in_flow_tracer_keeps_port_pair() {
    let tracer = InFlowTracer::new(&TracerParams::default()).expect("loading tracer");

    tcp_connect_discard();
    settle();

    let flows = tracer.dump_flows().expect("dumping flows");
    let pid = process::id();
    let flow = flows
        .iter()
        .filter(|f| f.pid == pid)
        .find(|f| f.l4_proto == L4_PROTO_TCP && f.dport == DISCARD_PORT)
        .expect("no per-connection TCP flow observed");

    assert_eq!(flow.direction, FlowDirection::Active);
    assert_eq!(flow.lport, DISCARD_PORT);
    assert_ne!(flow.sport, 0);

    tracer.close();
}

#[test]
#[ignore] // Requires root/BPF privileges
fn test_stop_joins_the_worker() {
    let mut tracer = Tracer::new(&TracerParams::default()).expect("loading tracer");

    let ticks = Arc::new(AtomicUsize::new(0));
    let cb_ticks = ticks.clone();
    tracer
        .start(
            move |_| {
                cb_ticks.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            Duration::from_secs(1),
        )
        .expect("starting tracer");

    tcp_connect_discard();

    // Stop mid-interval; the worker must exit within one interval.
    let started = Instant::now();
    tracer.stop();
    assert!(started.elapsed() < Duration::from_secs(2));

    let after_stop = ticks.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(1500));
    assert_eq!(
        ticks.load(Ordering::SeqCst),
        after_stop,
        "callback ran after stop returned"
    );

    // stop is idempotent.
    tracer.stop();
    tracer.close();
}

#[test]
#[ignore] // Requires root/BPF privileges
fn test_close_without_start() {
    Tracer::new(&TracerParams::default())
        .expect("loading aggregating tracer")
        .close();
    InFlowTracer::new(&TracerParams::default())
        .expect("loading in-flow tracer")
        .close();
    StreamingTracer::new(&TracerParams::default())
        .expect("loading streaming tracer")
        .close();
}

#[test]
#[ignore] // Requires root/BPF privileges
fn test_streaming_delivers_individual_flows() {
    let (handle_tx, handle_rx) = mpsc::channel();
    let (flow_tx, flow_rx) = mpsc::channel();

    let worker = thread::spawn(move || {
        let tracer = StreamingTracer::new(&TracerParams::default()).expect("loading tracer");
        handle_tx.send(tracer.stop_handle()).expect("handing stop");
        let result = tracer.start(flow_tx);
        tracer.close();
        result
    });

    let stop = handle_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("streaming tracer failed to come up");

    tcp_connect_discard();

    let pid = process::id();
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut seen = None;
    while Instant::now() < deadline {
        match flow_rx.recv_timeout(Duration::from_millis(500)) {
            Ok(flow) => {
                if flow.pid == pid && flow.l4_proto == L4_PROTO_TCP && flow.lport == DISCARD_PORT {
                    seen = Some(flow);
                    break;
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    stop.stop();
    worker
        .join()
        .expect("streaming thread panicked")
        .expect("streaming loop failed");

    let flow = seen.expect("no streamed TCP flow observed");
    assert_eq!(flow.direction, FlowDirection::Active);
    assert_eq!(flow.saddr, LOCALHOST);
    assert!(flow.stat.is_none());
}

#[test]
#[ignore] // Requires root/BPF privileges
fn test_get_stats_reports_programs() {
    let tracer = Tracer::new(&TracerParams { stats: true }).expect("loading tracer");

    tcp_connect_discard();
    settle();

    let stats = tracer.get_stats().expect("collecting program stats");
    assert!(!stats.is_empty());
    assert!(stats.values().any(|s| s.name.contains("tcp_v4_connect")));

    tracer.close();
}
