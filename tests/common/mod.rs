//! Common helpers for the flow capture integration tests.
//!
//! Traffic is generated over loopback; the kprobes sit on the IPv4
//! stack functions, which fire for loopback traffic as well, so no
//! namespace or veth setup is needed.

use std::io::Read;
use std::net::{Ipv4Addr, TcpListener, TcpStream, UdpSocket};
use std::thread;
use std::time::Duration;

/// The discard port. Nothing listens there in the test environment;
/// TCP connects still traverse tcp_v4_connect and UDP sends still
/// traverse ip_make_skb.
pub const DISCARD_PORT: u16 = 9;

pub const LOCALHOST: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

/// Kprobe emissions are asynchronous with respect to the syscall
/// return; give the kernel a moment before draining.
pub fn settle() {
    thread::sleep(Duration::from_millis(200));
}

/// Picks a UDP port that was free a moment ago. The socket probing it
/// is closed again, so the port-binding table never sees this bind
/// unless a tracer is already attached.
pub fn free_udp_port() -> u16 {
    let sock = UdpSocket::bind((LOCALHOST, 0)).expect("binding probe socket");
    sock.local_addr().expect("probe socket addr").port()
}

/// Connects to the discard port; the connect itself is the traffic.
pub fn tcp_connect_discard() {
    let _ = TcpStream::connect_timeout(
        &(LOCALHOST, DISCARD_PORT).into(),
        Duration::from_millis(500),
    );
}

/// Accepts one connection on an ephemeral listener, driving the
/// inet_csk_accept return path. Returns the listener's port.
pub fn tcp_accept_once() -> u16 {
    let listener = TcpListener::bind((LOCALHOST, 0)).expect("binding listener");
    let port = listener.local_addr().expect("listener addr").port();

    let client = thread::spawn(move || {
        let _ = TcpStream::connect((LOCALHOST, port));
    });

    let (mut conn, _) = listener.accept().expect("accepting connection");
    let mut buf = [0u8; 1];
    let _ = conn.read(&mut buf);
    client.join().expect("client thread");

    port
}

/// Sends one datagram from an unbound (autobound) UDP socket.
pub fn udp_send_unbound() {
    let sock = UdpSocket::bind((LOCALHOST, 0)).expect("binding udp socket");
    let _ = sock.send_to(b"ping", (LOCALHOST, DISCARD_PORT));
}
