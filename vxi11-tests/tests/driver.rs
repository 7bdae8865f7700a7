use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use vxi11_client::{Builder, Retry, ScpiDevice};
use vxi11_protocol::scpi::frame_block;
use vxi11_server::server;
use vxi11_tests::scripted;

/// A driver written against the adapter trait only.
struct PowerSupply<D> {
    device: D,
}

impl<D: ScpiDevice> PowerSupply<D> {
    fn set_voltage(&mut self, volts: f64) -> Result<(), vxi11_client::Error> {
        self.device.send(&format!(":SOUR:VOLT {:.3}", volts))
    }

    fn voltage(&mut self) -> Result<f64, vxi11_client::Error> {
        let reply = self.device.query(":SOUR:VOLT?")?;
        Ok(reply.parse().unwrap_or(f64::NAN))
    }
}

#[test]
fn driver_over_session() {
    let (server, received) = scripted(server::Builder::new(), |message| {
        (message == b":SOUR:VOLT?\n").then(|| b"12.500\n".to_vec())
    });
    let session = Builder::new().open(server.endpoint()).unwrap();
    let mut psu = PowerSupply { device: session };
    psu.set_voltage(12.5).unwrap();
    assert_eq!(psu.voltage().unwrap(), 12.5);
    assert_eq!(received.messages()[0], b":SOUR:VOLT 12.500\n");
    psu.device.close().unwrap();
}

#[test]
fn retry_after_timeout() {
    // the first query goes unanswered
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let (server, _) = scripted(server::Builder::new(), move |_| {
        (counter.fetch_add(1, Ordering::SeqCst) > 0).then(|| b"42\n".to_vec())
    });
    let session = Builder::new()
        .timeout(Duration::from_millis(300))
        .open(server.endpoint())
        .unwrap();

    let mut device = Retry::new(session, 3).with_backoff(Duration::from_millis(10));
    assert_eq!(device.query("MEAS?").unwrap(), "42");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn boxed_binary_queries() {
    let (server, _) = scripted(server::Builder::new(), |_| {
        let mut block = frame_block(b"\x00\x01\x02\x03");
        block.push(b'\n');
        Some(block)
    });
    let session = Builder::new().open(server.endpoint()).unwrap();
    let mut device: Box<dyn ScpiDevice> = Box::new(Retry::new(session, 2));
    assert_eq!(device.query_binary("CURV?").unwrap().as_bytes(), b"\x00\x01\x02\x03");
    device.close().unwrap();
}
