use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream, ToSocketAddrs},
    sync::Notify,
    time::{Instant, sleep, sleep_until, timeout},
};
use tokio_util::{codec::Framed, sync::CancellationToken};
use vxi11_protocol::{
    CoreProcedure, CreateLinkParms, CreateLinkResp, DEVICE_ABORT, DEVICE_ASYNC_PROGRAM,
    DEVICE_ASYNC_VERSION, DEVICE_CORE_PROGRAM, DEVICE_CORE_VERSION, DeviceError, DeviceErrorCode,
    DeviceGenericParms, DeviceLink, DeviceLockParms, DeviceReadParms, DeviceReadResp,
    DeviceReadStbResp, DeviceWriteParms, DeviceWriteResp, FLAG_END, FLAG_TERM_CHAR_SET,
    FLAG_WAIT_LOCK, IPPROTO_TCP, LinkId, Mapping, PMAPPROC_GETPORT, PMAPPROC_NULL,
    PORTMAPPER_PROGRAM, PORTMAPPER_VERSION, REASON_CHR, REASON_END, REASON_REQCNT,
    codec::{DEFAULT_MAX_RECORD_LEN, RecordCodec},
    error::DecodeError,
    rpc::{CallHeader, RPC_VERSION, ReplyStatus, encode_reply, peek_xid},
    xdr::{Pack, Unpack, Unpacker},
};

use crate::Instrument;

#[derive(Debug, Clone)]
pub struct Config {
    /// Device names accepted by `create_link`.
    pub devices: Vec<String>,
    /// Largest `device_write` payload accepted, announced in `create_link`.
    pub max_recv_size: u32,
    /// Connections without a call for this long are closed.
    pub idle_timeout: Duration,
    /// Port of the abort channel. 0 picks an ephemeral port.
    pub abort_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            devices: vec!["inst0".to_string()],
            max_recv_size: 1024 * 1024,
            idle_timeout: Duration::from_secs(60),
            abort_port: 0,
        }
    }
}

type Factory<T> = Box<dyn Fn(&str) -> T + Send + Sync>;

pub struct Server<T: Instrument> {
    factory: Factory<T>,
    config: Config,
}

/// Builder to create a [Server] instance and modify configuration options
///
/// # Example
///
/// ```ignore
/// use vxi11_server::server::Builder;
/// use std::time::Duration;
///
/// let server = Builder::new()
///     .device("inst1")
///     .max_recv_size(4096)
///     .idle_timeout(Duration::from_secs(20))
///     .build(|device: &str| MyInstrument::new(device));
/// ```
#[derive(Default)]
pub struct Builder {
    config: Config,
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    /// Accept links to `name` in addition to the configured devices.
    pub fn device(mut self, name: impl Into<String>) -> Self {
        self.config.devices.push(name.into());
        self
    }

    /// Replace the accepted device names.
    pub fn devices(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.config.devices = names.into_iter().map(Into::into).collect();
        self
    }

    /// Set the largest write payload that this server accepts.
    pub fn max_recv_size(mut self, size: u32) -> Self {
        self.config.max_recv_size = size;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    pub fn abort_port(mut self, port: u16) -> Self {
        self.config.abort_port = port;
        self
    }

    /// Build and return the server. `factory` creates the backend of each new link.
    pub fn build<T, F>(self, factory: F) -> Server<T>
    where
        T: Instrument,
        F: Fn(&str) -> T + Send + Sync + 'static,
    {
        Server::new(factory, self.config)
    }
}

impl<T: Instrument> Server<T> {
    pub fn new<F>(factory: F, config: Config) -> Server<T>
    where
        F: Fn(&str) -> T + Send + Sync + 'static,
    {
        Server {
            factory: Box::new(factory),
            config,
        }
    }

    /// Binds the core channel to `addr` and the abort channel to the same address.
    pub async fn bind(self, addr: impl ToSocketAddrs) -> io::Result<Listening<T>> {
        let core = TcpListener::bind(addr).await?;
        let core_addr = core.local_addr()?;
        let abort = TcpListener::bind(SocketAddr::new(core_addr.ip(), self.config.abort_port)).await?;
        let abort_addr = abort.local_addr()?;
        log::debug!(
            "Server config: devices={:?}, max_recv_size={}",
            self.config.devices,
            self.config.max_recv_size
        );
        Ok(Listening {
            core,
            abort,
            shared: Arc::new(Shared {
                factory: self.factory,
                config: self.config,
                core_port: core_addr.port(),
                abort_port: abort_addr.port(),
                registry: Mutex::new(Registry::default()),
                lock_released: Notify::new(),
            }),
        })
    }

    /// Binds to `addr` and serves until `shutdown` is cancelled.
    pub async fn listen(self, addr: impl ToSocketAddrs, shutdown: CancellationToken) -> io::Result<()> {
        self.bind(addr).await?.serve(shutdown).await
    }
}

/// A bound server, ready to accept connections.
pub struct Listening<T: Instrument> {
    core: TcpListener,
    abort: TcpListener,
    shared: Arc<Shared<T>>,
}

impl<T: Instrument> Listening<T> {
    /// Address of the portmapper and core channel.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.core.local_addr()
    }

    pub fn abort_addr(&self) -> io::Result<SocketAddr> {
        self.abort.local_addr()
    }

    /// Accepts connections until `shutdown` is cancelled. Open connections are closed on
    /// shutdown, which destroys their links.
    pub async fn serve(self, shutdown: CancellationToken) -> io::Result<()> {
        log::info!(
            "Server listening on port {} (abort channel on port {})",
            self.shared.core_port,
            self.shared.abort_port
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.core.accept() => match accepted {
                    Ok((tcp, peer)) => {
                        log::info!("New client connection from {}", peer);
                        let connection = CoreConnection::new(self.shared.clone(), peer, shutdown.clone());
                        tokio::spawn(connection.run(tcp));
                    }
                    Err(e) => log::error!("Connection error: {}", e),
                },
                accepted = self.abort.accept() => match accepted {
                    Ok((tcp, peer)) => {
                        log::debug!("New abort channel connection from {}", peer);
                        tokio::spawn(serve_abort(self.shared.clone(), tcp, peer, shutdown.clone()));
                    }
                    Err(e) => log::error!("Abort channel connection error: {}", e),
                },
            }
        }
        log::info!("Server shut down");
        Ok(())
    }
}

#[derive(Default)]
struct Registry {
    next_link_id: LinkId,
    /// Abort signal of every live link.
    aborts: HashMap<LinkId, Arc<Notify>>,
    /// Device name to the link holding its lock.
    locks: HashMap<String, LinkId>,
}

impl Registry {
    fn release(&mut self, link_id: LinkId) -> bool {
        let before = self.locks.len();
        self.locks.retain(|_, holder| *holder != link_id);
        self.locks.len() != before
    }
}

/// State shared by all connections of one server.
struct Shared<T> {
    factory: Factory<T>,
    config: Config,
    core_port: u16,
    abort_port: u16,
    registry: Mutex<Registry>,
    lock_released: Notify,
}

impl<T> Shared<T> {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Removes a link, releasing its lock.
    fn unregister(&self, link_id: LinkId) {
        let released = {
            let mut registry = self.registry();
            registry.aborts.remove(&link_id);
            registry.release(link_id)
        };
        if released {
            self.lock_released.notify_waiters();
        }
    }

    /// Waits until `device` is unlocked or locked by `link_id`, taking the lock if
    /// `acquire` is set. Without `wait`, a lock held by another link fails immediately.
    async fn access(
        &self,
        link_id: LinkId,
        device: &str,
        wait: bool,
        lock_timeout: Duration,
        acquire: bool,
    ) -> DeviceErrorCode {
        let deadline = Instant::now() + lock_timeout;
        loop {
            let released = self.lock_released.notified();
            tokio::pin!(released);
            // register before checking so that a release in between is not missed
            released.as_mut().enable();
            {
                let mut registry = self.registry();
                match registry.locks.get(device) {
                    None => {
                        if acquire {
                            registry.locks.insert(device.to_string(), link_id);
                        }
                        return DeviceErrorCode::NoError;
                    }
                    Some(&holder) if holder == link_id => return DeviceErrorCode::NoError,
                    Some(_) if !wait => return DeviceErrorCode::DeviceLocked,
                    Some(_) => {}
                }
            }
            tokio::select! {
                _ = &mut released => {}
                _ = sleep_until(deadline) => return DeviceErrorCode::DeviceLocked,
            }
        }
    }
}

fn millis(value: u32) -> Duration {
    Duration::from_millis(value as u64)
}

fn success(xid: u32, result: &impl Pack) -> Vec<u8> {
    encode_reply(xid, ReplyStatus::Success, result)
}

fn args<A: Unpack>(unpacker: &mut Unpacker<'_>) -> Result<A, ReplyStatus> {
    unpacker.unpack().map_err(|e| {
        log::warn!("Cannot decode call arguments: {}", e);
        ReplyStatus::GarbageArgs
    })
}

/// Decodes a call header, answering calls of an unsupported RPC version directly.
fn call_header(message: &[u8], unpacker: &mut Unpacker<'_>) -> Result<CallHeader, Option<Vec<u8>>> {
    match CallHeader::unpack(unpacker) {
        Ok(header) => Ok(header),
        Err(DecodeError::UnsupportedRpcVersion(version)) => {
            log::warn!("Rejecting call with RPC version {}", version);
            let status = ReplyStatus::RpcMismatch {
                low: RPC_VERSION,
                high: RPC_VERSION,
            };
            Err(peek_xid(message).map(|xid| encode_reply(xid, status, &())))
        }
        Err(e) => {
            log::warn!("Ignoring malformed call: {}", e);
            Err(None)
        }
    }
}

/// State of one link, owned by the connection that created it.
struct LinkSlot<T> {
    device: String,
    instrument: T,
    /// Chunks of a message not yet terminated by END.
    input: Vec<u8>,
    /// Unread part of the last response.
    output: Vec<u8>,
    abort: Arc<Notify>,
}

struct CoreConnection<T: Instrument> {
    shared: Arc<Shared<T>>,
    peer: SocketAddr,
    shutdown: CancellationToken,
    links: HashMap<LinkId, LinkSlot<T>>,
}

impl<T: Instrument> CoreConnection<T> {
    fn new(shared: Arc<Shared<T>>, peer: SocketAddr, shutdown: CancellationToken) -> Self {
        CoreConnection {
            shared,
            peer,
            shutdown,
            links: HashMap::new(),
        }
    }

    async fn run(mut self, tcp: TcpStream) {
        if let Err(e) = tcp.set_nodelay(true) {
            log::debug!("Cannot set TCP_NODELAY: {}", e);
        }
        let record_limit = DEFAULT_MAX_RECORD_LEN.max(self.shared.config.max_recv_size as usize * 2);
        let mut framed = Framed::new(tcp, RecordCodec::new(record_limit));
        let idle_timeout = self.shared.config.idle_timeout;
        loop {
            let message = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = timeout(idle_timeout, framed.next()) => match next {
                    Err(_) => {
                        log::info!("Client {} idle, closing connection", self.peer);
                        break;
                    }
                    // Client disconnected
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        log::error!("Client {} error: {}", self.peer, e);
                        break;
                    }
                    Ok(Some(Ok(message))) => message,
                },
            };
            let Some(reply) = self.handle_call(&message).await else {
                continue;
            };
            if let Err(e) = framed.send(Bytes::from(reply)).await {
                log::error!("Cannot reply to {}: {}", self.peer, e);
                break;
            }
        }
        log::info!("Client {} disconnected", self.peer);
    }

    async fn handle_call(&mut self, message: &[u8]) -> Option<Vec<u8>> {
        let mut unpacker = Unpacker::new(message);
        let header = match call_header(message, &mut unpacker) {
            Ok(header) => header,
            Err(reply) => return reply,
        };
        let xid = header.xid;
        let result = match header.program {
            PORTMAPPER_PROGRAM if header.version != PORTMAPPER_VERSION => {
                Err(ReplyStatus::ProgramMismatch {
                    low: PORTMAPPER_VERSION,
                    high: PORTMAPPER_VERSION,
                })
            }
            PORTMAPPER_PROGRAM => self.portmapper_call(xid, header.procedure, &mut unpacker),
            DEVICE_CORE_PROGRAM if header.version != DEVICE_CORE_VERSION => {
                Err(ReplyStatus::ProgramMismatch {
                    low: DEVICE_CORE_VERSION,
                    high: DEVICE_CORE_VERSION,
                })
            }
            DEVICE_CORE_PROGRAM => match CoreProcedure::from_u32(header.procedure) {
                Some(procedure) => self.core_call(xid, procedure, &mut unpacker).await,
                None => Err(ReplyStatus::ProcedureUnavailable),
            },
            program => {
                log::warn!("Call to unknown program {:#x}", program);
                Err(ReplyStatus::ProgramUnavailable)
            }
        };
        Some(result.unwrap_or_else(|status| encode_reply(xid, status, &())))
    }

    fn portmapper_call(
        &self,
        xid: u32,
        procedure: u32,
        unpacker: &mut Unpacker<'_>,
    ) -> Result<Vec<u8>, ReplyStatus> {
        match procedure {
            PMAPPROC_NULL => Ok(success(xid, &())),
            PMAPPROC_GETPORT => {
                let mapping: Mapping = args(unpacker)?;
                let port = match (mapping.program, mapping.version, mapping.protocol) {
                    (DEVICE_CORE_PROGRAM, DEVICE_CORE_VERSION, IPPROTO_TCP) => self.shared.core_port,
                    (DEVICE_ASYNC_PROGRAM, DEVICE_ASYNC_VERSION, IPPROTO_TCP) => self.shared.abort_port,
                    _ => 0,
                };
                log::debug!("Portmapper: program {:#x} is on port {}", mapping.program, port);
                Ok(success(xid, &(port as u32)))
            }
            _ => Err(ReplyStatus::ProcedureUnavailable),
        }
    }

    /// Process each core channel call, forwarding messages to the link backend.
    async fn core_call(
        &mut self,
        xid: u32,
        procedure: CoreProcedure,
        unpacker: &mut Unpacker<'_>,
    ) -> Result<Vec<u8>, ReplyStatus> {
        log::debug!("Received {:?} from {}", procedure, self.peer);
        Ok(match procedure {
            CoreProcedure::CreateLink => success(xid, &self.create_link(args(unpacker)?).await),
            CoreProcedure::DeviceWrite => success(xid, &self.device_write(args(unpacker)?).await),
            CoreProcedure::DeviceRead => success(xid, &self.device_read(args(unpacker)?).await),
            CoreProcedure::DeviceReadStb => success(xid, &self.read_stb(args(unpacker)?)),
            CoreProcedure::DeviceTrigger
            | CoreProcedure::DeviceClear
            | CoreProcedure::DeviceRemote
            | CoreProcedure::DeviceLocal => {
                let parms: DeviceGenericParms = args(unpacker)?;
                success(xid, &self.generic(procedure, parms))
            }
            CoreProcedure::DeviceLock => success(xid, &self.lock(args(unpacker)?).await),
            CoreProcedure::DeviceUnlock => success(xid, &self.unlock(args(unpacker)?)),
            CoreProcedure::DestroyLink => success(xid, &self.destroy_link(args(unpacker)?)),
        })
    }

    async fn create_link(&mut self, parms: CreateLinkParms) -> CreateLinkResp {
        let refused = |error| CreateLinkResp {
            error,
            link_id: 0,
            abort_port: 0,
            max_recv_size: 0,
        };
        if !self.shared.config.devices.contains(&parms.device) {
            log::warn!("Client {} asked for unknown device {:?}", self.peer, parms.device);
            return refused(DeviceErrorCode::DeviceNotAccessible);
        }

        let abort = Arc::new(Notify::new());
        let link_id = {
            let mut registry = self.shared.registry();
            registry.next_link_id = registry.next_link_id.wrapping_add(1);
            let link_id = registry.next_link_id;
            registry.aborts.insert(link_id, abort.clone());
            link_id
        };
        if parms.lock_device {
            let shared = self.shared.clone();
            let error = shared
                .access(link_id, &parms.device, true, millis(parms.lock_timeout), true)
                .await;
            if !error.is_ok() {
                self.shared.unregister(link_id);
                return refused(error);
            }
        }

        log::info!(
            "Created link {} to {} for client {} ({})",
            link_id,
            parms.device,
            parms.client_id,
            self.peer
        );
        self.links.insert(
            link_id,
            LinkSlot {
                instrument: (self.shared.factory)(&parms.device),
                device: parms.device,
                input: Vec::new(),
                output: Vec::new(),
                abort,
            },
        );
        CreateLinkResp {
            error: DeviceErrorCode::NoError,
            link_id,
            abort_port: self.shared.abort_port,
            max_recv_size: self.shared.config.max_recv_size,
        }
    }

    /// Waits for access to the device of a link owned by this connection, taking its lock
    /// if `acquire` is set.
    ///
    /// Only owned values are held across the wait, so instruments need not be `Sync`.
    async fn link_access(
        &mut self,
        link_id: LinkId,
        flags: u32,
        lock_timeout: u32,
        acquire: bool,
    ) -> DeviceErrorCode {
        let Some(device) = self.links.get(&link_id).map(|link| link.device.clone()) else {
            return DeviceErrorCode::InvalidLinkIdentifier;
        };
        let shared = self.shared.clone();
        let wait = flags & FLAG_WAIT_LOCK != 0;
        let error = shared
            .access(link_id, &device, wait, millis(lock_timeout), acquire)
            .await;
        if acquire && error.is_ok() {
            log::debug!("Link {} locked {}", link_id, device);
        }
        error
    }

    async fn device_write(&mut self, parms: DeviceWriteParms) -> DeviceWriteResp {
        let failed = |error| DeviceWriteResp { error, size: 0 };
        if parms.data.len() > self.shared.config.max_recv_size as usize {
            return failed(DeviceErrorCode::ParameterError);
        }
        let error = self.link_access(parms.link_id, parms.flags, parms.lock_timeout, false).await;
        if !error.is_ok() {
            return failed(error);
        }
        let Some(link) = self.links.get_mut(&parms.link_id) else {
            return failed(DeviceErrorCode::InvalidLinkIdentifier);
        };
        let size = parms.data.len() as u32;
        link.input.extend_from_slice(&parms.data);
        if parms.flags & FLAG_END != 0 {
            let message = std::mem::take(&mut link.input);
            log::trace!("Link {} message: {:02x?}", parms.link_id, message);
            link.instrument.write(&message);
        }
        DeviceWriteResp {
            error: DeviceErrorCode::NoError,
            size,
        }
    }

    async fn device_read(&mut self, parms: DeviceReadParms) -> DeviceReadResp {
        let failed = |error| DeviceReadResp {
            error,
            reason: 0,
            data: Vec::new(),
        };
        let error = self.link_access(parms.link_id, parms.flags, parms.lock_timeout, false).await;
        if !error.is_ok() {
            return failed(error);
        }
        let Some(link) = self.links.get_mut(&parms.link_id) else {
            return failed(DeviceErrorCode::InvalidLinkIdentifier);
        };
        if link.output.is_empty() {
            if let Some(response) = link.instrument.read() {
                link.output = response;
            }
        }
        if link.output.is_empty() {
            let abort = link.abort.clone();
            let aborted = abort.notified();
            let error = tokio::select! {
                _ = aborted => {
                    log::info!("Read on link {} aborted", parms.link_id);
                    DeviceErrorCode::Abort
                }
                _ = sleep(millis(parms.io_timeout)) => DeviceErrorCode::IoTimeout,
                _ = self.shutdown.cancelled() => DeviceErrorCode::Abort,
            };
            return failed(error);
        }

        let request_size = (parms.request_size as usize).max(1);
        let mut len = request_size.min(link.output.len());
        let mut reason = 0;
        if parms.flags & FLAG_TERM_CHAR_SET != 0 {
            if let Some(pos) = link.output[..len].iter().position(|&b| b == parms.term_char) {
                len = pos + 1;
                reason |= REASON_CHR;
            }
        }
        let data: Vec<u8> = link.output.drain(..len).collect();
        if link.output.is_empty() {
            reason |= REASON_END;
        } else if len == request_size {
            reason |= REASON_REQCNT;
        }
        log::trace!(
            "Link {} read {} bytes, reason={:#x}",
            parms.link_id,
            data.len(),
            reason
        );
        DeviceReadResp {
            error: DeviceErrorCode::NoError,
            reason,
            data,
        }
    }

    fn read_stb(&mut self, parms: DeviceGenericParms) -> DeviceReadStbResp {
        match self.links.get_mut(&parms.link_id) {
            Some(link) => DeviceReadStbResp {
                error: DeviceErrorCode::NoError,
                stb: link.instrument.read_stb(),
            },
            None => DeviceReadStbResp {
                error: DeviceErrorCode::InvalidLinkIdentifier,
                stb: 0,
            },
        }
    }

    fn generic(&mut self, procedure: CoreProcedure, parms: DeviceGenericParms) -> DeviceError {
        let Some(link) = self.links.get_mut(&parms.link_id) else {
            return DeviceError {
                error: DeviceErrorCode::InvalidLinkIdentifier,
            };
        };
        match procedure {
            CoreProcedure::DeviceTrigger => link.instrument.trigger(),
            CoreProcedure::DeviceClear => {
                link.input.clear();
                link.output.clear();
                link.instrument.clear();
            }
            _ => {}
        }
        DeviceError {
            error: DeviceErrorCode::NoError,
        }
    }

    async fn lock(&mut self, parms: DeviceLockParms) -> DeviceError {
        let error = self
            .link_access(parms.link_id, parms.flags, parms.lock_timeout, true)
            .await;
        DeviceError { error }
    }

    fn unlock(&mut self, DeviceLink(link_id): DeviceLink) -> DeviceError {
        if !self.links.contains_key(&link_id) {
            return DeviceError {
                error: DeviceErrorCode::InvalidLinkIdentifier,
            };
        }
        let released = self.shared.registry().release(link_id);
        if !released {
            return DeviceError {
                error: DeviceErrorCode::NoLockHeld,
            };
        }
        self.shared.lock_released.notify_waiters();
        DeviceError {
            error: DeviceErrorCode::NoError,
        }
    }

    fn destroy_link(&mut self, DeviceLink(link_id): DeviceLink) -> DeviceError {
        if self.links.remove(&link_id).is_none() {
            return DeviceError {
                error: DeviceErrorCode::InvalidLinkIdentifier,
            };
        }
        self.shared.unregister(link_id);
        log::info!("Destroyed link {} ({})", link_id, self.peer);
        DeviceError {
            error: DeviceErrorCode::NoError,
        }
    }
}

impl<T: Instrument> Drop for CoreConnection<T> {
    fn drop(&mut self) {
        for link_id in self.links.keys() {
            log::info!("Destroying link {} of closed connection {}", link_id, self.peer);
            self.shared.unregister(*link_id);
        }
    }
}

async fn serve_abort<T: Instrument>(
    shared: Arc<Shared<T>>,
    tcp: TcpStream,
    peer: SocketAddr,
    shutdown: CancellationToken,
) {
    let mut framed = Framed::new(tcp, RecordCodec::new(4096));
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = timeout(shared.config.idle_timeout, framed.next()) => match next {
                Ok(Some(Ok(message))) => message,
                Ok(Some(Err(e))) => {
                    log::error!("Abort channel client {} error: {}", peer, e);
                    break;
                }
                Ok(None) | Err(_) => break,
            },
        };
        let Some(reply) = abort_call(&shared, &message) else {
            continue;
        };
        if let Err(e) = framed.send(Bytes::from(reply)).await {
            log::error!("Cannot reply to {}: {}", peer, e);
            break;
        }
    }
    log::debug!("Abort channel client {} disconnected", peer);
}

fn abort_call<T>(shared: &Shared<T>, message: &[u8]) -> Option<Vec<u8>> {
    let mut unpacker = Unpacker::new(message);
    let header = match call_header(message, &mut unpacker) {
        Ok(header) => header,
        Err(reply) => return reply,
    };
    let xid = header.xid;
    let result = if header.program != DEVICE_ASYNC_PROGRAM {
        Err(ReplyStatus::ProgramUnavailable)
    } else if header.version != DEVICE_ASYNC_VERSION {
        Err(ReplyStatus::ProgramMismatch {
            low: DEVICE_ASYNC_VERSION,
            high: DEVICE_ASYNC_VERSION,
        })
    } else if header.procedure != DEVICE_ABORT {
        Err(ReplyStatus::ProcedureUnavailable)
    } else {
        args(&mut unpacker).map(|DeviceLink(link_id)| {
            let abort = shared.registry().aborts.get(&link_id).cloned();
            let error = match abort {
                Some(abort) => {
                    log::debug!("Abort for link {}", link_id);
                    // wakes a pending read only; an abort without one is dropped
                    abort.notify_waiters();
                    DeviceErrorCode::NoError
                }
                None => DeviceErrorCode::InvalidLinkIdentifier,
            };
            success(xid, &DeviceError { error })
        })
    };
    Some(result.unwrap_or_else(|status| encode_reply(xid, status, &())))
}

#[cfg(test)]
mod test {
    use std::cell::Cell;

    use vxi11_protocol::rpc::{ReplyHeader, encode_call};

    use super::*;

    fn shared() -> Shared<()> {
        Shared {
            factory: Box::new(|_: &str| ()),
            config: Config::default(),
            core_port: 1024,
            abort_port: 1025,
            registry: Mutex::new(Registry::default()),
            lock_released: Notify::new(),
        }
    }

    fn abort_message(program: u32, link_id: LinkId) -> Vec<u8> {
        let header = CallHeader {
            xid: 7,
            program,
            version: DEVICE_ASYNC_VERSION,
            procedure: DEVICE_ABORT,
        };
        encode_call(&header, &DeviceLink(link_id))
    }

    fn decode(reply: &[u8]) -> (ReplyHeader, Unpacker<'_>) {
        let mut unpacker = Unpacker::new(reply);
        let header = ReplyHeader::unpack(&mut unpacker).unwrap();
        (header, unpacker)
    }

    #[test]
    fn abort_of_unknown_link() {
        let shared = shared();
        let reply = abort_call(&shared, &abort_message(DEVICE_ASYNC_PROGRAM, 3)).unwrap();
        let (header, mut unpacker) = decode(&reply);
        assert_eq!(header.xid, 7);
        assert!(header.status.is_success());
        let result: DeviceError = unpacker.unpack().unwrap();
        assert_eq!(result.error, DeviceErrorCode::InvalidLinkIdentifier);
    }

    #[test]
    fn abort_of_live_link() {
        let shared = shared();
        shared.registry().aborts.insert(3, Arc::new(Notify::new()));
        let reply = abort_call(&shared, &abort_message(DEVICE_ASYNC_PROGRAM, 3)).unwrap();
        let (_, mut unpacker) = decode(&reply);
        let result: DeviceError = unpacker.unpack().unwrap();
        assert_eq!(result.error, DeviceErrorCode::NoError);
    }

    #[test]
    fn abort_channel_serves_only_abort_program() {
        let shared = shared();
        let reply = abort_call(&shared, &abort_message(DEVICE_CORE_PROGRAM, 3)).unwrap();
        let (header, _) = decode(&reply);
        assert_eq!(header.status, ReplyStatus::ProgramUnavailable);
    }

    #[test]
    fn malformed_calls_are_ignored() {
        assert!(abort_call(&shared(), &[0, 0, 0, 1]).is_none());
    }

    #[test]
    fn unregister_releases_lock() {
        let shared = shared();
        {
            let mut registry = shared.registry();
            registry.aborts.insert(1, Arc::new(Notify::new()));
            registry.locks.insert("inst0".to_string(), 1);
        }
        shared.unregister(1);
        let registry = shared.registry();
        assert!(registry.locks.is_empty());
        assert!(registry.aborts.is_empty());
    }

    #[tokio::test]
    async fn lock_contention() {
        let shared = shared();
        let wait = Duration::from_millis(20);
        assert_eq!(shared.access(1, "inst0", false, wait, true).await, DeviceErrorCode::NoError);
        // the holder passes, others are refused
        assert_eq!(shared.access(1, "inst0", false, wait, false).await, DeviceErrorCode::NoError);
        assert_eq!(shared.access(2, "inst0", false, wait, false).await, DeviceErrorCode::DeviceLocked);
        assert_eq!(shared.access(2, "inst0", true, wait, true).await, DeviceErrorCode::DeviceLocked);
        assert_eq!(shared.access(2, "inst1", false, wait, true).await, DeviceErrorCode::NoError);
    }

    #[tokio::test]
    async fn waiting_for_released_lock() {
        let shared = Arc::new(shared());
        shared.registry().locks.insert("inst0".to_string(), 1);
        let releaser = shared.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            releaser.unregister(1);
        });
        let error = shared
            .access(2, "inst0", true, Duration::from_secs(5), true)
            .await;
        assert_eq!(error, DeviceErrorCode::NoError);
        assert_eq!(shared.registry().locks.get("inst0"), Some(&2));
    }

    /// Counts the messages it received. `Send` but not `Sync`.
    struct Counter(Cell<usize>);

    impl Instrument for Counter {
        fn write(&mut self, _message: &[u8]) {
            self.0.set(self.0.get() + 1);
        }

        fn read(&mut self) -> Option<Vec<u8>> {
            Some(self.0.get().to_string().into_bytes())
        }
    }

    async fn call<R: Unpack>(
        framed: &mut Framed<TcpStream, RecordCodec>,
        xid: u32,
        procedure: CoreProcedure,
        args: &impl Pack,
    ) -> R {
        let header = CallHeader {
            xid,
            program: DEVICE_CORE_PROGRAM,
            version: DEVICE_CORE_VERSION,
            procedure: procedure as u32,
        };
        framed.send(Bytes::from(encode_call(&header, args))).await.unwrap();
        let reply = framed.next().await.unwrap().unwrap();
        let (header, mut unpacker) = decode(&reply);
        assert_eq!(header.xid, xid);
        unpacker.unpack().unwrap()
    }

    #[tokio::test]
    async fn serves_instruments_that_are_not_sync() {
        let listening = Server::new(|_: &str| Counter(Cell::new(0)), Config::default())
            .bind("127.0.0.1:0")
            .await
            .unwrap();
        let addr = listening.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(listening.serve(shutdown.clone()));

        let tcp = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(tcp, RecordCodec::default());
        let parms = CreateLinkParms {
            client_id: 1,
            lock_device: true,
            lock_timeout: 0,
            device: "inst0".to_string(),
        };
        let link: CreateLinkResp = call(&mut framed, 1, CoreProcedure::CreateLink, &parms).await;
        assert_eq!(link.error, DeviceErrorCode::NoError);

        let parms = DeviceWriteParms {
            link_id: link.link_id,
            io_timeout: 100,
            lock_timeout: 0,
            flags: FLAG_END,
            data: b"COUNT?\n".to_vec(),
        };
        let written: DeviceWriteResp = call(&mut framed, 2, CoreProcedure::DeviceWrite, &parms).await;
        assert_eq!(written.error, DeviceErrorCode::NoError);
        assert_eq!(written.size, 7);

        let parms = DeviceReadParms {
            link_id: link.link_id,
            request_size: 64,
            io_timeout: 100,
            lock_timeout: 0,
            flags: 0,
            term_char: 0,
        };
        let read: DeviceReadResp = call(&mut framed, 3, CoreProcedure::DeviceRead, &parms).await;
        assert_eq!(read.data, b"1");
        assert!(read.is_end_of_message());

        // the lock taken at link creation is already held
        let parms = DeviceLockParms {
            link_id: link.link_id,
            flags: 0,
            lock_timeout: 0,
        };
        let locked: DeviceError = call(&mut framed, 4, CoreProcedure::DeviceLock, &parms).await;
        assert_eq!(locked.error, DeviceErrorCode::NoError);

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }
}
