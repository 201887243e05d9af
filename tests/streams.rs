//! Stream Integration Tests
//!
//! Opens streams through an exit in the in-memory network and checks data
//! transfer, SENDME flow control and the ways a stream can end.

mod common;

use common::FakeNetwork;
use std::io::{Read, Write};
use tor_circuit::protocol::cell::RelayCell;
use tor_circuit::{TorConfig, TorError};

// ===== Data transfer =====

#[test]
fn echo_through_exit() {
    let network = FakeNetwork::standard();
    let client = network.client();

    let stream = client.connect("example.com", 80).unwrap();
    stream.send(b"hello tor").unwrap();

    let mut buf = [0u8; 64];
    let n = stream.recv(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello tor");
    assert_eq!(network.log().begins, vec!["example.com:80".to_string()]);

    stream.close().unwrap();
    assert!(stream.is_closed());
}

#[test]
fn large_transfer_is_paced_by_sendmes() {
    let network = FakeNetwork::standard();
    let client = network.client();
    let mut stream = client.connect("example.com", 80).unwrap();

    // More cells than either package window holds
    let data: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
    stream.write_all(&data).unwrap();

    let mut echoed = vec![0u8; data.len()];
    stream.read_exact(&mut echoed).unwrap();
    assert_eq!(echoed, data);

    // 603 echoed cells: one SENDME per 100 on the circuit, per 50 on the stream
    let log = network.log();
    assert_eq!(log.circuit_sendmes, 6);
    assert_eq!(log.stream_sendmes, 12);
}

#[test]
fn stalled_stream_window_reports_exhaustion() {
    let network = FakeNetwork::standard();
    let mut config = TorConfig::default();
    config.stream.write_timeout_ms = 300;
    let client = network.client_with(config);

    let stream = client.connect("sink.example", 9).unwrap();
    let window = vec![0u8; RelayCell::MAX_DATA_SIZE * 500];
    stream.send(&window).unwrap();
    assert_eq!(stream.flow_control().package_window, 0);

    let err = stream.send(b"one more").unwrap_err();
    assert!(matches!(err, TorError::WindowExhausted(_)));
}

#[test]
fn streams_on_one_circuit_are_independent() {
    let network = FakeNetwork::standard();
    let client = network.client();
    let circuit = client.build_circuit_with(None, Some(80)).unwrap();

    let a = circuit.begin_stream("a.example", 80).unwrap();
    let b = circuit.begin_stream("b.example", 80).unwrap();
    assert_ne!(a.stream_id(), b.stream_id());
    assert_eq!(circuit.stream_count(), 2);

    b.send(b"bbb").unwrap();
    a.send(b"aaaa").unwrap();

    let mut buf = [0u8; 16];
    let n = a.recv(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"aaaa");
    let n = b.recv(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"bbb");

    a.close().unwrap();
    assert_eq!(circuit.stream_count(), 1);
}

// ===== Endings =====

#[test]
fn refused_begin_reports_end_reason() {
    let network = FakeNetwork::standard();
    let client = network.client();

    let err = client.connect("refused.example", 80).unwrap_err();
    assert!(
        matches!(err, TorError::Stream(ref msg) if msg.contains("CONNECTREFUSED")),
        "unexpected error: {err}"
    );
}

#[test]
fn peer_end_is_eof_after_data() {
    let network = FakeNetwork::standard();
    let client = network.client();

    let stream = client.connect("closing.example", 80).unwrap();
    stream.send(b"last words").unwrap();

    assert_eq!(stream.read_all().unwrap(), b"last words");
    assert!(stream.is_closed());
}

#[test]
fn circuit_destroy_fails_open_streams() {
    let network = FakeNetwork::standard();
    let client = network.client();
    let stream = client.connect("example.com", 443).unwrap();

    network.destroy_circuits("guard", 3);

    let mut buf = [0u8; 16];
    let err = stream.recv(&mut buf).unwrap_err();
    assert!(matches!(err, TorError::Stream(_)));
    assert!(stream.send(b"late").is_err());
}
