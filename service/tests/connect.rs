//! Async connector scenarios.

use bytes::Bytes;
use std::net::TcpStream;
use std::sync::{Arc, Mutex, mpsc};
use std::time::{Duration, Instant};
use tcp_service::{
    ChannelOptions, ConnectCallback, ConnectError, Connector, SessionId, TcpService,
};

type ConnectResult = Result<TcpStream, ConnectError>;

fn recording_connector() -> (Connector, mpsc::Receiver<(u64, ConnectResult)>) {
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let callback: ConnectCallback = Arc::new(move |uid, result| {
        let _ = tx.lock().unwrap().send((uid, result));
    });
    (Connector::start(callback).unwrap(), rx)
}

#[test]
fn failed_connect_reports_original_uid() {
    // Bind then drop, so nothing is listening on the port.
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let (mut connector, rx) = recording_connector();
    let start = Instant::now();
    assert!(connector.async_connect(addr, Duration::from_millis(500), 9001));

    let (uid, result) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(uid, 9001);
    assert!(result.is_err());
    assert!(start.elapsed() < Duration::from_secs(1));

    connector.stop();
}

#[test]
fn unroutable_connect_times_out_within_a_quantum() {
    let (mut connector, rx) = recording_connector();

    // Blackhole address; some environments reject it immediately, which
    // still counts as a delivered failure.
    let start = Instant::now();
    assert!(connector.async_connect(
        "10.255.255.1:9".parse().unwrap(),
        Duration::from_millis(500),
        7,
    ));

    let (uid, result) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(uid, 7);
    let elapsed = start.elapsed();
    match result {
        Err(ConnectError::TimedOut) => {
            assert!(elapsed >= Duration::from_millis(480), "early: {elapsed:?}");
            assert!(elapsed <= Duration::from_millis(1000), "late: {elapsed:?}");
        }
        Err(ConnectError::Io(_)) => {}
        Ok(_) => panic!("connect to a blackhole succeeded"),
    }

    connector.stop();
}

#[test]
fn connected_stream_admits_into_service() {
    let service = TcpService::new();

    // Server side echoes.
    let echo = service.clone();
    service.set_data_callback(Arc::new(move |id, bytes| {
        echo.send(id, Bytes::copy_from_slice(bytes), None);
        bytes.len()
    }));

    service.start_workers(2, None).unwrap();
    let addr = service
        .start_listen("127.0.0.1:0".parse().unwrap(), 64 * 1024, None)
        .unwrap();

    let (mut connector, rx) = recording_connector();
    assert!(connector.async_connect(addr, Duration::from_secs(2), 31));
    let (uid, result) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(uid, 31);
    let stream = result.unwrap();

    // Admit the outbound side with its own callbacks.
    let (enter_tx, enter_rx) = mpsc::channel::<SessionId>();
    let enter_tx = Mutex::new(enter_tx);
    let (data_tx, data_rx) = mpsc::channel::<Vec<u8>>();
    let data_tx = Mutex::new(data_tx);

    let opts = ChannelOptions::new(64 * 1024)
        .enter(Arc::new(move |id, _| {
            let _ = enter_tx.lock().unwrap().send(id);
        }))
        .data(Arc::new(move |_, bytes| {
            let _ = data_tx.lock().unwrap().send(bytes.to_vec());
            bytes.len()
        }));
    assert!(service.add_channel(stream, opts));

    let outbound_id = enter_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(service.send(outbound_id, Bytes::from_static(b"hello"), None));

    let mut got = Vec::new();
    while got.len() < 5 {
        got.extend(data_rx.recv_timeout(Duration::from_secs(2)).unwrap());
    }
    assert_eq!(got, b"hello");

    connector.stop();
    service.close_service();
}
