use std::{
    net::TcpListener,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use vxi11_client::{
    Builder, Config, DeviceSession, Error, LinkState,
    error::{Failure, RpcError},
    portmap::Portmapper,
};
use vxi11_protocol::{
    DEVICE_CORE_PROGRAM, DEVICE_CORE_VERSION, DeviceErrorCode, rpc::ReplyStatus,
    scpi::frame_block,
};
use vxi11_server::server;
use vxi11_tests::{echo, identity, scripted};

fn builder() -> Builder {
    Builder::new().timeout(Duration::from_secs(2))
}

#[test]
fn identify_through_portmapper() {
    let (server, received) = scripted(server::Builder::new(), identity);
    let mut session = builder().open(server.endpoint()).unwrap();
    assert_eq!(session.state(), LinkState::Open);

    assert_eq!(session.query("*IDN?").unwrap(), "ACME,Model1,SN1,1.0");
    let idn = session.identify().unwrap();
    assert_eq!(idn.manufacturer, "ACME");
    assert_eq!(idn.model, "Model1");
    assert_eq!(idn.serial, "SN1");
    assert_eq!(idn.firmware, "1.0");
    assert_eq!(received.messages()[0], b"*IDN?\n");
}

#[test]
fn portmapper_lookup() {
    let (server, _) = scripted(server::Builder::new(), echo);
    let timeout = Duration::from_secs(1);
    let mut portmapper = Portmapper::connect("127.0.0.1", server.addr().port(), timeout).unwrap();
    portmapper.ping(timeout).unwrap();
    assert_eq!(
        portmapper
            .get_port(DEVICE_CORE_PROGRAM, DEVICE_CORE_VERSION, timeout)
            .unwrap(),
        server.addr().port()
    );
    assert!(matches!(
        portmapper.get_port(0x2000_0000, 1, timeout),
        Err(RpcError::Rejected(ReplyStatus::ProgramUnavailable))
    ));
    portmapper.close();
}

#[test]
fn explicit_core_port() {
    let (server, _) = scripted(server::Builder::new(), identity);
    let config = Config {
        core_port: Some(server.addr().port()),
        ..Config::default()
    };
    // the endpoint port is not used when the core port is given
    let endpoint = server.endpoint().with_port(1);
    let mut session = DeviceSession::open(endpoint, config).unwrap();
    assert_eq!(session.query("*IDN?").unwrap(), "ACME,Model1,SN1,1.0");
}

#[test]
fn binary_block_over_many_reads() {
    let waveform: Vec<u8> = (0..1_200_000u32).map(|i| (i % 251) as u8).collect();
    let mut response = frame_block(&waveform);
    response.push(b'\n');
    let (server, _) = scripted(server::Builder::new(), move |message| {
        (message == b"CURV?\n").then(|| response.clone())
    });

    let mut session = builder()
        .read_request_size(64 * 1024)
        .open(server.endpoint())
        .unwrap();
    let block = session.query_binary("CURV?").unwrap();
    assert_eq!(block.declared_len(), 1_200_000);
    assert_eq!(block.as_bytes(), &waveform[..]);
}

#[test]
fn reads_accumulate_until_end() {
    let (server, _) = scripted(server::Builder::new(), |_| {
        Some(b"0123456789ABCDEFGHIJ\n".to_vec())
    });
    let mut session = builder().read_request_size(4).open(server.endpoint()).unwrap();
    assert_eq!(session.query("DATA?").unwrap(), "0123456789ABCDEFGHIJ");
    assert_eq!(session.query_raw("DATA?").unwrap(), b"0123456789ABCDEFGHIJ\n");
}

#[test]
fn read_stops_at_term_char() {
    let (server, _) = scripted(server::Builder::new(), |_| Some(b"1,2\n3,4\n".to_vec()));
    let mut session = builder().read_term_char(b'\n').open(server.endpoint()).unwrap();
    session.send("LIST?").unwrap();
    assert_eq!(session.read_raw().unwrap(), b"1,2\n");
    assert_eq!(session.read_raw().unwrap(), b"3,4\n");
}

#[test]
fn long_writes_are_split() {
    let (server, received) = scripted(server::Builder::new().max_recv_size(16), |_| None);
    let mut session = builder().open(server.endpoint()).unwrap();
    assert_eq!(session.link().unwrap().max_recv_size, 16);

    let command = format!("ECHO {}", "x".repeat(100));
    session.send(&command).unwrap();
    // the server reassembles the chunks into one message
    assert_eq!(received.messages(), vec![format!("{}\n", command).into_bytes()]);
}

#[test]
fn chunk_size_below_negotiated_maximum() {
    let (server, received) = scripted(server::Builder::new(), |_| None);
    let mut session = builder().max_chunk_size(3).open(server.endpoint()).unwrap();
    session.write_raw(b"abcdefghij").unwrap();
    session.write_raw(b"").unwrap();
    assert_eq!(received.messages(), vec![b"abcdefghij".to_vec(), Vec::new()]);
}

#[test]
fn numeric_list() {
    let (server, _) = scripted(server::Builder::new(), |_| Some(b"1.0,2.5E-3,-4\n".to_vec()));
    let mut session = builder().open(server.endpoint()).unwrap();
    assert_eq!(
        session.query_numeric_list("MEAS?").unwrap(),
        vec![1.0, 0.0025, -4.0]
    );
}

#[test]
fn malformed_block_is_a_framing_error() {
    let (server, _) = scripted(server::Builder::new(), |_| Some(b"1,2,3\n".to_vec()));
    let mut session = builder().open(server.endpoint()).unwrap();
    let error = session.query_binary("CURV?").unwrap_err();
    assert!(matches!(error, Error::Scpi(_)), "{:?}", error);
    // the link survives decoding errors
    assert_eq!(session.query("*OPC?").unwrap(), "1,2,3");
}

#[test]
fn command_with_terminator_is_rejected() {
    let (server, received) = scripted(server::Builder::new(), echo);
    let mut session = builder().open(server.endpoint()).unwrap();
    assert!(matches!(session.send("A\nB"), Err(Error::Scpi(_))));
    assert!(received.messages().is_empty());
}

/// Answers the error query from a queue holding one error.
fn one_error() -> impl Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static {
    let errors = Arc::new(AtomicUsize::new(1));
    move |message: &[u8]| match message {
        b":SYST:ERR?\n" => {
            if errors.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok() {
                Some(b"-113,\"Undefined header\"\n".to_vec())
            } else {
                Some(b"0,\"No error\"\n".to_vec())
            }
        }
        _ => Some(b"1\n".to_vec()),
    }
}

#[test]
fn error_queue() {
    let (server, _) = scripted(server::Builder::new(), one_error());
    let mut session = builder().open(server.endpoint()).unwrap();
    let entries = session.error_queue().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].code, -113);
    assert_eq!(entries[0].message, "Undefined header");
    assert!(session.error_queue().unwrap().is_empty());
    session.check_errors().unwrap();
}

#[test]
fn device_reported_errors() {
    let (server, _) = scripted(server::Builder::new(), one_error());
    let mut session = builder().check_errors(true).open(server.endpoint()).unwrap();
    match session.query("BOGUS?") {
        Err(Error::DeviceReported(entries)) => {
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].to_string(), "-113,\"Undefined header\"");
        }
        other => panic!("expected reported errors, got {:?}", other),
    }
    // transport is fine and the queue is now empty
    assert_eq!(session.query("*OPC?").unwrap(), "1");
}

#[test]
fn ancillary_calls() {
    let (server, _) = scripted(server::Builder::new(), echo);
    let mut session = builder().open(server.endpoint()).unwrap();
    assert_eq!(session.read_stb().unwrap(), 0);
    session.send("*OPC?").unwrap();
    assert_eq!(session.read_stb().unwrap(), 0x10);
    session.clear().unwrap();
    assert_eq!(session.read_stb().unwrap(), 0);
    session.trigger().unwrap();
    session.remote().unwrap();
    session.local().unwrap();
}

#[test]
fn close_is_idempotent() {
    let (server, _) = scripted(server::Builder::new(), echo);
    let mut session = builder().open(server.endpoint()).unwrap();
    session.close().unwrap();
    assert_eq!(session.state(), LinkState::Closed);
    assert!(session.link().is_none());
    session.close().unwrap();
    assert!(matches!(
        session.query("*IDN?"),
        Err(Error::NotOpen(LinkState::Closed))
    ));
}

#[test]
fn unknown_device_is_refused() {
    let (server, _) = scripted(server::Builder::new(), echo);
    let endpoint = server.endpoint().with_device("inst9");
    match builder().open(endpoint) {
        Err(Error::Link { device, reason }) => {
            assert_eq!(device, "inst9");
            assert!(matches!(
                reason,
                Failure::Device(DeviceErrorCode::DeviceNotAccessible)
            ));
        }
        Err(other) => panic!("expected a refused link, got {:?}", other),
        Ok(_) => panic!("link to an unknown device should be refused"),
    }
}

#[test]
fn additional_devices() {
    let (server, _) = scripted(server::Builder::new().device("gpib0,5"), identity);
    let mut session = builder().open(server.endpoint().with_device("gpib0,5")).unwrap();
    assert_eq!(session.identify().unwrap().model, "Model1");
}

#[test]
fn connection_refused() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let endpoint = vxi11_client::Endpoint::new("127.0.0.1").with_port(port);
    assert!(matches!(
        builder().open(endpoint),
        Err(Error::Connect { .. })
    ));
}

#[test]
fn silent_create_link_times_out() {
    // accepts the connection and never answers
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let start = Instant::now();
    let result = Builder::new()
        .timeout(Duration::from_millis(500))
        .core_port(port)
        .open(vxi11_client::Endpoint::new("127.0.0.1"));
    let error = match result {
        Err(error) => error,
        Ok(_) => panic!("link creation should fail"),
    };
    assert!(matches!(error, Error::Link { .. }), "{:?}", error);
    assert!(error.is_timeout());
    assert!(start.elapsed() < Duration::from_secs(2));
    drop(listener);
}

#[test]
fn response_size_limit() {
    let (server, _) = scripted(server::Builder::new(), |message| {
        if message == b"DATA?\n" {
            Some(vec![b'x'; 10_000])
        } else {
            identity(message)
        }
    });
    let mut session = builder()
        .read_request_size(1000)
        .max_response_size(4096)
        .open(server.endpoint())
        .unwrap();
    assert!(matches!(
        session.query_raw("DATA?"),
        Err(Error::ResponseTooLarge { max: 4096 })
    ));
    // the rest of the oversized response is gone
    assert_eq!(session.state(), LinkState::Open);
    assert_eq!(session.query("*IDN?").unwrap(), "ACME,Model1,SN1,1.0");
}
