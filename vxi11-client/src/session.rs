use std::time::{Duration, Instant};

use vxi11_protocol::{
    DEVICE_CORE_PROGRAM, DEVICE_CORE_VERSION,
    scpi::{
        BlockValue, DEFAULT_TERMINATOR, ErrorEntry, Identification, ScpiCodec, decode_block,
        decode_numeric_list,
    },
};

use crate::{
    abort::AbortHandle,
    channel::{CoreChannel, Link, LinkState},
    endpoint::Endpoint,
    error::{Error, Failure},
    portmap::Portmapper,
    rpc::RpcClient,
    transport::Connection,
};

/// Upper bound on error queue entries drained by [`DeviceSession::error_queue`].
const MAX_ERROR_QUEUE_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct Config {
    /// Bound on every operation, spanning all reads of one response.
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub lock_timeout: Duration,
    /// Extra time granted to the RPC reply beyond the instrument-side I/O timeout.
    pub rpc_grace: Duration,
    pub terminator: u8,
    /// Ask the instrument to end text reads at this character.
    pub read_term_char: Option<u8>,
    /// Cap on a single write chunk, below the negotiated maximum.
    pub max_chunk_size: Option<u32>,
    pub read_request_size: u32,
    pub max_response_size: usize,
    /// Drain the error queue after every query.
    pub check_errors: bool,
    pub error_query: String,
    pub lock_on_open: bool,
    /// Port of the core channel. When unset, the portmapper is asked.
    pub core_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            lock_timeout: Duration::from_secs(10),
            rpc_grace: Duration::from_secs(1),
            terminator: DEFAULT_TERMINATOR,
            read_term_char: None,
            max_chunk_size: None,
            read_request_size: 1024 * 1024,
            max_response_size: 64 * 1024 * 1024,
            check_errors: false,
            error_query: ":SYST:ERR?".to_string(),
            lock_on_open: false,
            core_port: None,
        }
    }
}

/// Builder to open a [DeviceSession] with modified configuration options
///
/// # Example
///
/// ```ignore
/// use vxi11_client::{Builder, Endpoint};
/// use std::time::Duration;
///
/// let session = Builder::new()
///     .timeout(Duration::from_secs(2))
///     .check_errors(true)
///     .open(Endpoint::new("192.168.1.10"))?;
/// ```
#[derive(Default)]
pub struct Builder {
    config: Config,
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    /// Set the overall timeout of a single operation
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock_timeout = timeout;
        self
    }

    pub fn rpc_grace(mut self, grace: Duration) -> Self {
        self.config.rpc_grace = grace;
        self
    }

    /// Set the character appended to every command
    pub fn terminator(mut self, terminator: u8) -> Self {
        self.config.terminator = terminator;
        self
    }

    pub fn read_term_char(mut self, term_char: u8) -> Self {
        self.config.read_term_char = Some(term_char);
        self
    }

    pub fn max_chunk_size(mut self, size: u32) -> Self {
        self.config.max_chunk_size = Some(size);
        self
    }

    pub fn read_request_size(mut self, size: u32) -> Self {
        self.config.read_request_size = size;
        self
    }

    pub fn max_response_size(mut self, size: usize) -> Self {
        self.config.max_response_size = size;
        self
    }

    /// Query the error queue after every query and fail on reported errors
    pub fn check_errors(mut self, check: bool) -> Self {
        self.config.check_errors = check;
        self
    }

    pub fn error_query(mut self, query: impl Into<String>) -> Self {
        self.config.error_query = query.into();
        self
    }

    pub fn lock_on_open(mut self, lock: bool) -> Self {
        self.config.lock_on_open = lock;
        self
    }

    /// Connect to this core channel port instead of asking the portmapper
    pub fn core_port(mut self, port: u16) -> Self {
        self.config.core_port = Some(port);
        self
    }

    pub fn build(self) -> Config {
        self.config
    }

    /// Open a session with the configured options
    pub fn open(self, endpoint: Endpoint) -> Result<DeviceSession, Error> {
        DeviceSession::open(endpoint, self.config)
    }
}

/// A link to one instrument with a SCPI request/response interface.
///
/// A session is not meant to be shared: SCPI allows one outstanding command per link.
/// To interrupt a blocked operation from another thread, use [`DeviceSession::abort_handle`].
pub struct DeviceSession {
    endpoint: Endpoint,
    config: Config,
    codec: ScpiCodec,
    core: CoreChannel,
    abort: AbortHandle,
}

impl DeviceSession {
    /// Connects to the instrument and creates a link to the endpoint device.
    pub fn open(endpoint: Endpoint, config: Config) -> Result<DeviceSession, Error> {
        log::debug!("Opening session to {}", endpoint);
        let core_port = match config.core_port {
            Some(port) => port,
            None => {
                let mut portmapper =
                    Portmapper::connect(endpoint.host(), endpoint.port(), config.connect_timeout)?;
                let port = portmapper
                    .get_port(DEVICE_CORE_PROGRAM, DEVICE_CORE_VERSION, config.timeout)
                    .map_err(|error| Error::Link {
                        device: endpoint.device().to_string(),
                        reason: error.into(),
                    })?;
                portmapper.close();
                port
            }
        };

        let conn = Connection::connect(endpoint.host(), core_port, config.connect_timeout)?;
        let rpc = RpcClient::new(conn, DEVICE_CORE_PROGRAM, DEVICE_CORE_VERSION)
            .with_max_record_len(config.max_response_size.saturating_add(1024));
        let mut core = CoreChannel::new(rpc, config.lock_timeout, config.rpc_grace);
        let link = core.create_link(
            endpoint.device(),
            std::process::id() as i32,
            config.lock_on_open,
            config.timeout,
        )?;
        let abort = AbortHandle::new(
            endpoint.host(),
            link.abort_port,
            link.id,
            config.connect_timeout.min(config.timeout),
        );

        Ok(DeviceSession {
            codec: ScpiCodec::new(config.terminator),
            endpoint,
            config,
            core,
            abort,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> LinkState {
        self.core.state()
    }

    pub fn link(&self) -> Option<Link> {
        self.core.link()
    }

    /// A handle that can abort the operation currently blocking this session.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    fn ensure_open(&self) -> Result<(), Error> {
        match self.core.state() {
            LinkState::Open => Ok(()),
            state => Err(Error::NotOpen(state)),
        }
    }

    /// Sends an abort on the abort channel, logging rather than failing.
    fn abort_quietly(&self) {
        if let Err(error) = self.abort.abort() {
            log::warn!("Abort on {} failed: {}", self.endpoint, error);
        }
    }

    /// Clears the device, discarding input and output of an abandoned operation so that
    /// the next read does not return the rest of an old response.
    fn discard_pending(&mut self) {
        let timeout = self.config.connect_timeout.min(self.config.timeout);
        if let Err(failure) = self.core.clear(timeout) {
            log::warn!("Clearing {} failed: {}", self.endpoint, failure);
        }
    }

    /// Bookkeeping shared by all failed operations.
    fn failed(&mut self, error: Error) -> Error {
        if self.core.state() != LinkState::Aborted && error.is_timeout() {
            self.abort_quietly();
            self.discard_pending();
        }
        if self.core.state() == LinkState::Aborted {
            log::error!("Link to {} lost: {}", self.endpoint, error);
            self.abort.close();
        }
        error
    }

    fn max_chunk(&self) -> usize {
        self.config.max_chunk_size.map_or(usize::MAX, |size| size as usize)
    }

    /// Sends a command without waiting for a reply.
    pub fn send(&mut self, command: &str) -> Result<(), Error> {
        let data = self.codec.encode(command)?;
        log::debug!("{} <- {}", self.endpoint, command);
        self.write_raw(&data)
    }

    /// Writes raw bytes as one message.
    pub fn write_raw(&mut self, data: &[u8]) -> Result<(), Error> {
        self.ensure_open()?;
        let max_chunk = self.max_chunk();
        let timeout = self.config.timeout;
        self.core
            .device_write(data, max_chunk, timeout)
            .map_err(|failure| self.failed(Error::Write(failure)))
    }

    /// Reads one complete response message.
    pub fn read_raw(&mut self) -> Result<Vec<u8>, Error> {
        self.ensure_open()?;
        self.read_response(self.config.read_term_char, false)
    }

    /// Accumulates `device_read` chunks until the end of the message. For binary
    /// responses, reading continues past an end of message while the block is shorter
    /// than its header declares.
    fn read_response(&mut self, term_char: Option<u8>, binary: bool) -> Result<Vec<u8>, Error> {
        let timeout = self.config.timeout;
        let deadline = Instant::now() + timeout;
        let mut response = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.failed(Error::Timeout(timeout)));
            }
            let request_size = self.config.read_request_size;
            match self.core.device_read(request_size, term_char, remaining) {
                Ok(chunk) => {
                    response.extend_from_slice(&chunk.data);
                    if response.len() > self.config.max_response_size {
                        log::warn!(
                            "Response of {} exceeds {} bytes, clearing",
                            self.endpoint,
                            self.config.max_response_size
                        );
                        self.discard_pending();
                        return Err(Error::ResponseTooLarge {
                            max: self.config.max_response_size,
                        });
                    }
                    if chunk.end_of_message && !(binary && block_incomplete(&response)) {
                        return Ok(response);
                    }
                }
                Err(failure) if failure.is_timeout() => {
                    return Err(self.failed(Error::Timeout(timeout)));
                }
                Err(failure) => return Err(self.failed(Error::Read(failure))),
            }
        }
    }

    fn after_query(&mut self) -> Result<(), Error> {
        if self.config.check_errors {
            self.check_errors()
        } else {
            Ok(())
        }
    }

    /// Sends a command and returns the raw reply.
    pub fn query_raw(&mut self, command: &str) -> Result<Vec<u8>, Error> {
        self.send(command)?;
        let response = self.read_response(self.config.read_term_char, false)?;
        self.after_query()?;
        Ok(response)
    }

    /// Sends a command and returns the reply as text.
    pub fn query(&mut self, command: &str) -> Result<String, Error> {
        let response = self.query_raw(command)?;
        let text = self.codec.decode_text(&response);
        log::debug!("{} -> {}", self.endpoint, text);
        Ok(text)
    }

    /// Sends a command and decodes the reply as a `#<n><length><data>` block.
    pub fn query_binary(&mut self, command: &str) -> Result<BlockValue, Error> {
        self.send(command)?;
        let response = self.read_response(None, true)?;
        let block = decode_block(&response)?;
        log::debug!("{} -> block of {} bytes", self.endpoint, block.len());
        self.after_query()?;
        Ok(block)
    }

    /// Sends a command and parses the comma separated reply.
    pub fn query_numeric_list(&mut self, command: &str) -> Result<Vec<f64>, Error> {
        let text = self.query(command)?;
        Ok(decode_numeric_list(&text, ',')?)
    }

    /// Queries and parses `*IDN?`.
    pub fn identify(&mut self) -> Result<Identification, Error> {
        Ok(self.query("*IDN?")?.parse()?)
    }

    /// Drains the instrument error queue. An empty result means no errors.
    pub fn error_queue(&mut self) -> Result<Vec<ErrorEntry>, Error> {
        let query = self.config.error_query.clone();
        let mut entries = Vec::new();
        for _ in 0..MAX_ERROR_QUEUE_LEN {
            self.send(&query)?;
            let response = self.read_response(self.config.read_term_char, false)?;
            let entry: ErrorEntry = self.codec.decode_text(&response).parse()?;
            if entry.is_no_error() {
                return Ok(entries);
            }
            log::debug!("{} reported error {}", self.endpoint, entry);
            entries.push(entry);
        }
        log::warn!(
            "Error queue of {} not empty after {} entries",
            self.endpoint,
            MAX_ERROR_QUEUE_LEN
        );
        Ok(entries)
    }

    /// Fails with [`Error::DeviceReported`] if the error queue is not empty.
    pub fn check_errors(&mut self) -> Result<(), Error> {
        let entries = self.error_queue()?;
        if entries.is_empty() {
            Ok(())
        } else {
            Err(Error::DeviceReported(entries))
        }
    }

    fn operation<T>(
        &mut self,
        operation: &'static str,
        call: impl FnOnce(&mut CoreChannel, Duration) -> Result<T, Failure>,
    ) -> Result<T, Error> {
        self.ensure_open()?;
        let timeout = self.config.timeout;
        call(&mut self.core, timeout)
            .map_err(|reason| self.failed(Error::Operation { operation, reason }))
    }

    /// Reads the status byte.
    pub fn read_stb(&mut self) -> Result<u8, Error> {
        self.operation("device_readstb", |core, timeout| core.read_stb(timeout))
    }

    pub fn trigger(&mut self) -> Result<(), Error> {
        self.operation("device_trigger", |core, timeout| core.trigger(timeout))
    }

    /// Clears the device, discarding pending input and output.
    pub fn clear(&mut self) -> Result<(), Error> {
        self.operation("device_clear", |core, timeout| core.clear(timeout))
    }

    pub fn remote(&mut self) -> Result<(), Error> {
        self.operation("device_remote", |core, timeout| core.remote(timeout))
    }

    pub fn local(&mut self) -> Result<(), Error> {
        self.operation("device_local", |core, timeout| core.local(timeout))
    }

    /// Acquires the exclusive device lock, waiting up to the lock timeout.
    pub fn lock(&mut self) -> Result<(), Error> {
        self.operation("device_lock", |core, timeout| core.lock(true, timeout))
    }

    pub fn unlock(&mut self) -> Result<(), Error> {
        self.operation("device_unlock", |core, timeout| core.unlock(timeout))
    }

    /// Aborts the operation in flight, if any.
    pub fn abort(&self) -> Result<(), Error> {
        self.abort.abort()
    }

    /// Destroys the link and closes the connections. Closing twice is harmless.
    pub fn close(&mut self) -> Result<(), Error> {
        if self.core.state() == LinkState::Open {
            let timeout = self.config.timeout;
            self.core.destroy_link(timeout);
        }
        self.core.close();
        self.abort.close();
        Ok(())
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn block_incomplete(response: &[u8]) -> bool {
    matches!(decode_block(response), Err(error) if error.is_incomplete())
}
