//! End-to-end receive scenarios over the loopback path.
//!
//! These tests open real capture handles, which needs root (or an
//! equivalent capture capability); without it each test skips. Every test
//! uses its own UDP port so the suite can run in parallel.

#![cfg(unix)]

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use capsock::{CaptureSocket, Error};

const MAX_DATAGRAM: usize = 65536;

fn is_root() -> bool {
    unsafe { libc::getuid() == 0 }
}

macro_rules! require_capture {
    ($socket:expr) => {
        if !is_root() {
            eprintln!("SKIPPED: requires root");
            return;
        }
        if !$socket.is_valid() {
            eprintln!("SKIPPED: capture driver unavailable");
            return;
        }
    };
}

/// Drains the socket until it stays idle for `idle`, returning
/// (payload, source address, source port) per datagram.
fn recv_all(socket: &CaptureSocket, idle: Duration) -> Vec<(Vec<u8>, Ipv4Addr, u16)> {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut received = Vec::new();
    loop {
        match socket.receive_datagram(&mut buf, Some(idle)) {
            Ok(d) => received.push((buf[..d.len].to_vec(), d.source_address, d.source_port)),
            Err(Error::Timeout) => return received,
            Err(e) => panic!("receive failed: {e}"),
        }
    }
}

#[test]
fn hello_world_roundtrip() {
    let socket = CaptureSocket::new();
    require_capture!(socket);
    assert!(socket.bind(Ipv4Addr::UNSPECIFIED, 14011));

    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    sender.send_to(b"Hello World", "127.0.0.1:14011").unwrap();

    let mut buf = vec![0u8; MAX_DATAGRAM];
    let datagram = socket
        .receive_datagram(&mut buf, Some(Duration::from_secs(5)))
        .expect("datagram arrives");

    assert_eq!(datagram.len, 11);
    assert_eq!(&buf[..datagram.len], b"Hello World");
    assert_eq!(datagram.source_address, Ipv4Addr::LOCALHOST);
    assert_eq!(datagram.source_port, sender.local_addr().unwrap().port());

    socket.close();
}

#[test]
fn state_transitions_across_bind_and_close() {
    let socket = CaptureSocket::new();
    require_capture!(socket);

    assert!(socket.bind(Ipv4Addr::UNSPECIFIED, 14012));
    assert!(socket.is_bound());
    assert_eq!(socket.local_address(), Some(Ipv4Addr::UNSPECIFIED));
    assert_eq!(socket.local_port(), 14012);

    // already bound: further binds and buffer-size changes fail
    assert!(!socket.bind(Ipv4Addr::UNSPECIFIED, 14112));
    assert!(!socket.set_receive_buffer_size(1 << 20));

    socket.close();
    assert!(socket.is_closed());
    assert!(!socket.is_bound());
    assert_eq!(socket.local_address(), None);
    assert_eq!(socket.local_port(), 0);
    assert!(!socket.bind(Ipv4Addr::UNSPECIFIED, 14012));
}

#[test]
fn loopback_bind_receives() {
    let socket = CaptureSocket::new();
    require_capture!(socket);
    assert!(socket.bind(Ipv4Addr::LOCALHOST, 14013));

    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    sender.send_to(b"local only", "127.0.0.1:14013").unwrap();

    let mut buf = vec![0u8; MAX_DATAGRAM];
    let datagram = socket
        .receive_datagram(&mut buf, Some(Duration::from_secs(5)))
        .expect("datagram arrives");
    assert_eq!(&buf[..datagram.len], b"local only");
}

#[test]
fn timeout_elapses_without_traffic() {
    let socket = CaptureSocket::new();
    require_capture!(socket);
    assert!(socket.bind(Ipv4Addr::UNSPECIFIED, 14014));

    let mut buf = vec![0u8; MAX_DATAGRAM];
    let start = Instant::now();
    let result = socket.receive_datagram(&mut buf, Some(Duration::from_millis(100)));
    let elapsed = start.elapsed();

    assert_eq!(result, Err(Error::Timeout));
    assert!(elapsed >= Duration::from_millis(100), "returned after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "returned after {elapsed:?}");
}

#[test]
fn zero_timeout_polls_once() {
    let socket = CaptureSocket::new();
    require_capture!(socket);
    assert!(socket.bind(Ipv4Addr::UNSPECIFIED, 14015));

    let mut buf = vec![0u8; MAX_DATAGRAM];
    let start = Instant::now();
    let result = socket.receive_datagram(&mut buf, Some(Duration::ZERO));
    assert_eq!(result, Err(Error::Timeout));
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn burst_of_datagrams_is_delivered_in_order() {
    let socket = CaptureSocket::new();
    require_capture!(socket);
    assert!(socket.bind(Ipv4Addr::UNSPECIFIED, 14016));

    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    for i in 0..100u8 {
        let payload = vec![i; 1024];
        sender.send_to(&payload, "127.0.0.1:14016").unwrap();
    }

    let mut buf = vec![0u8; MAX_DATAGRAM];
    for i in 0..100u8 {
        let datagram = socket
            .receive_datagram(&mut buf, Some(Duration::from_secs(2)))
            .unwrap_or_else(|e| panic!("datagram {i} missing: {e}"));
        assert_eq!(datagram.len, 1024);
        assert!(buf[..datagram.len].iter().all(|&b| b == i));
        thread::sleep(Duration::from_millis(10));
    }

    // nothing left
    let result = socket.receive_datagram(&mut buf, Some(Duration::from_millis(300)));
    assert_eq!(result, Err(Error::Timeout));
}

#[test]
fn close_unblocks_a_parked_receiver() {
    let socket = Arc::new(CaptureSocket::new());
    require_capture!(socket);
    assert!(socket.bind(Ipv4Addr::UNSPECIFIED, 14017));

    let (tx, rx) = crossbeam_channel::bounded(1);
    let receiver = {
        let socket = Arc::clone(&socket);
        thread::spawn(move || {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            let result = socket.receive_datagram(&mut buf, None);
            let _ = tx.send(result);
        })
    };

    thread::sleep(Duration::from_millis(200));
    socket.close();

    let result = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("receiver thread returned");
    assert_eq!(result, Err(Error::SocketClosed));
    assert!(socket.is_closed());
    receiver.join().unwrap();
}

#[test]
fn two_sockets_share_one_port() {
    let first = CaptureSocket::new();
    require_capture!(first);
    let second = CaptureSocket::new();

    assert!(first.bind(Ipv4Addr::UNSPECIFIED, 14018));
    assert!(second.bind(Ipv4Addr::UNSPECIFIED, 14018));

    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    sender.send_to(b"shared", "127.0.0.1:14018").unwrap();
    thread::sleep(Duration::from_millis(200));

    for socket in [&first, &second] {
        let received = recv_all(socket, Duration::from_millis(500));
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, b"shared");
    }
}

#[test]
fn multicast_membership_is_selective() {
    let first = CaptureSocket::new();
    require_capture!(first);
    let second = CaptureSocket::new();

    let group_a = Ipv4Addr::new(239, 255, 10, 1);
    let group_b = Ipv4Addr::new(239, 255, 10, 2);
    let port = 14019u16;

    assert!(first.bind(Ipv4Addr::UNSPECIFIED, port));
    assert!(second.bind(Ipv4Addr::UNSPECIFIED, port));
    assert!(first.join_multicast_group(group_a));
    assert!(second.join_multicast_group(group_a));
    assert!(second.join_multicast_group(group_b));

    // joining twice fails, leaving restores joinability
    assert!(!second.join_multicast_group(group_b));
    assert!(second.leave_multicast_group(group_b));
    assert!(second.join_multicast_group(group_b));

    // Send over the loopback interface so no multicast route is needed.
    let sender = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )
    .unwrap();
    sender.set_multicast_if_v4(&Ipv4Addr::LOCALHOST).unwrap();
    sender.set_multicast_loop_v4(true).unwrap();

    for group in [group_a, group_b] {
        let target = SocketAddr::V4(SocketAddrV4::new(group, port));
        sender
            .send_to(group.to_string().as_bytes(), &target.into())
            .unwrap();
    }
    thread::sleep(Duration::from_millis(200));

    let received_a = recv_all(&first, Duration::from_millis(500));
    assert_eq!(received_a.len(), 1);
    assert_eq!(received_a[0].0, group_a.to_string().as_bytes());

    let mut received_b: Vec<Vec<u8>> = recv_all(&second, Duration::from_millis(500))
        .into_iter()
        .map(|(payload, _, _)| payload)
        .collect();
    received_b.sort();
    assert_eq!(
        received_b,
        vec![
            group_a.to_string().into_bytes(),
            group_b.to_string().into_bytes()
        ]
    );
}
