//! Test harness: runs a VXI-11 server on a background runtime for the blocking client.
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;
use vxi11_client::Endpoint;
use vxi11_server::{Instrument, server::Server};

/// A server on 127.0.0.1 with an ephemeral port, shut down on drop.
pub struct TestServer {
    runtime: Runtime,
    shutdown: CancellationToken,
    addr: SocketAddr,
}

impl TestServer {
    pub fn start<T: Instrument>(server: Server<T>) -> TestServer {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("runtime should start");
        let listening = runtime
            .block_on(server.bind("127.0.0.1:0"))
            .expect("server should bind");
        let addr = listening.local_addr().expect("bound server has an address");
        let shutdown = CancellationToken::new();
        runtime.spawn(listening.serve(shutdown.clone()));
        TestServer {
            runtime,
            shutdown,
            addr,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Endpoint reaching the server through its portmapper.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new("127.0.0.1").with_port(self.addr.port())
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

type Respond = Arc<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

/// Messages received by all links of a scripted server, in order.
#[derive(Clone, Default)]
pub struct Received(Arc<Mutex<Vec<Vec<u8>>>>);

impl Received {
    pub fn messages(&self) -> Vec<Vec<u8>> {
        self.0.lock().expect("not poisoned").clone()
    }

    fn push(&self, message: &[u8]) {
        self.0.lock().expect("not poisoned").push(message.to_vec());
    }
}

/// An instrument answering each message with the result of a function.
///
/// `None` leaves the message unanswered, so reads wait for their timeout.
pub struct ScriptedInstrument {
    respond: Respond,
    received: Received,
    pending: Option<Vec<u8>>,
}

impl Instrument for ScriptedInstrument {
    fn write(&mut self, message: &[u8]) {
        self.received.push(message);
        self.pending = (self.respond)(message);
    }

    fn read(&mut self) -> Option<Vec<u8>> {
        self.pending.take()
    }

    fn read_stb(&mut self) -> u8 {
        if self.pending.is_some() { 0x10 } else { 0 }
    }

    fn clear(&mut self) {
        self.pending = None;
    }
}

/// Starts a server whose links answer with `respond`.
pub fn scripted<F>(builder: vxi11_server::server::Builder, respond: F) -> (TestServer, Received)
where
    F: Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
{
    let respond: Respond = Arc::new(respond);
    let received = Received::default();
    let server = {
        let received = received.clone();
        builder.build(move |_device: &str| ScriptedInstrument {
            respond: respond.clone(),
            received: received.clone(),
            pending: None,
        })
    };
    (TestServer::start(server), received)
}

/// Answers every message with itself.
pub fn echo(message: &[u8]) -> Option<Vec<u8>> {
    Some(message.to_vec())
}

/// Answers `*IDN?` with a fixed identity and echoes everything else.
pub fn identity(message: &[u8]) -> Option<Vec<u8>> {
    if message == b"*IDN?\n" {
        Some(b"ACME,Model1,SN1,1.0\n".to_vec())
    } else {
        echo(message)
    }
}
