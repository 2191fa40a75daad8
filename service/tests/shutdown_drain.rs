//! Graceful shutdown drains enqueued packets before FIN.

use bytes::Bytes;
use std::io::Read;
use std::net::TcpStream;
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;
use tcp_service::{SessionId, TcpService};

#[test]
fn shutdown_delivers_all_packets_then_fin() {
    let service = TcpService::new();

    let (enter_tx, enter_rx) = mpsc::channel::<SessionId>();
    let enter_tx = Mutex::new(enter_tx);
    service.set_enter_callback(Arc::new(move |id, _| {
        let _ = enter_tx.lock().unwrap().send(id);
    }));

    let (disconnect_tx, disconnect_rx) = mpsc::channel::<SessionId>();
    let disconnect_tx = Mutex::new(disconnect_tx);
    service.set_disconnect_callback(Arc::new(move |id| {
        let _ = disconnect_tx.lock().unwrap().send(id);
    }));

    service.start_workers(1, None).unwrap();
    let addr = service
        .start_listen("127.0.0.1:0".parse().unwrap(), 64 * 1024, None)
        .unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    let id = enter_rx.recv_timeout(Duration::from_secs(2)).unwrap();

    // Enough data that the socket buffer cannot swallow it all at once.
    let mut expected = Vec::new();
    for i in 0..8u8 {
        let chunk = vec![i; 8 * 1024];
        expected.extend_from_slice(&chunk);
        assert!(service.send(id, Bytes::from(chunk), None));
    }
    assert!(service.shutdown(id));

    // Sends after shutdown are silently dropped.
    assert!(service.send(id, Bytes::from_static(b"late"), None));

    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut got = Vec::new();
    client.read_to_end(&mut got).unwrap();
    assert_eq!(got.len(), expected.len());
    assert_eq!(got, expected);

    // Closing our side completes the close; disconnect fires once.
    drop(client);
    assert_eq!(
        disconnect_rx.recv_timeout(Duration::from_secs(2)).unwrap(),
        id
    );
    assert!(
        disconnect_rx
            .recv_timeout(Duration::from_millis(300))
            .is_err()
    );

    service.close_service();
}
