//! End-to-end transfer over real UDP sockets on localhost, driven by the
//! scheduler's background thread and the wall clock.

use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::unbounded;

use rudp_transport::net::udp::UdpTransport;
use rudp_transport::{ConnectionState, Endpoint, Scheduler, TransportConfig};

const DEADLINE: Duration = Duration::from_secs(10);

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < DEADLINE {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn loopback_transfer_over_udp() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let sched = Scheduler::new();
    let ta = UdpTransport::bind("127.0.0.1:0").unwrap();
    let tb = UdpTransport::bind("127.0.0.1:0").unwrap();
    let a = Endpoint::new(ta.clone(), sched.clone(), TransportConfig::default()).unwrap();
    let b = Endpoint::new(tb.clone(), sched.clone(), TransportConfig::default()).unwrap();
    ta.start(&a).unwrap();
    tb.start(&b).unwrap();

    let (data_tx, data_rx) = unbounded::<Bytes>();
    let (close_tx, close_rx) = unbounded::<()>();
    b.on_accept(move |conn| {
        let tx = data_tx.clone();
        conn.on_data(move |bytes| {
            let _ = tx.send(bytes.clone());
        });
        let tx = close_tx.clone();
        conn.on_close(move || {
            let _ = tx.send(());
        });
    });

    sched.start(Duration::from_millis(10));

    let conn = a.connect(tb.local());
    assert!(wait_until(|| conn.state() == ConnectionState::Established));

    let data: Vec<u8> = (0..100_000u32).map(|i| (i % 253) as u8).collect();
    assert!(conn.send(&data));
    conn.end();

    let mut received = Vec::with_capacity(data.len());
    while received.len() < data.len() {
        let chunk = data_rx.recv_timeout(DEADLINE).expect("data stalled");
        received.extend_from_slice(&chunk);
    }
    assert_eq!(received, data);

    close_rx.recv_timeout(DEADLINE).expect("passive side never closed");
    assert!(wait_until(|| conn.state() == ConnectionState::Closed));
    assert!(conn.stats().segments_acked > 0);

    sched.stop();
    ta.stop();
    tb.stop();
}
