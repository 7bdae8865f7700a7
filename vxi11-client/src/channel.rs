//! The VXI-11 core channel: link management and device I/O on one connection.
use std::{
    fmt::Display,
    time::{Duration, Instant},
};

use vxi11_protocol::{
    CoreProcedure, CreateLinkParms, CreateLinkResp, DeviceError, DeviceErrorCode,
    DeviceGenericParms, DeviceLink, DeviceLockParms, DeviceReadParms, DeviceReadResp,
    DeviceReadStbResp, DeviceWriteParms, DeviceWriteResp, FLAG_END, FLAG_TERM_CHAR_SET,
    FLAG_WAIT_LOCK, LinkId,
    xdr::{Pack, Unpack},
};

use crate::{
    error::{Error, Failure},
    rpc::RpcClient,
};

/// Lifecycle of the link held by a [`CoreChannel`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LinkState {
    Closed,
    Opening,
    Open,
    Closing,
    /// The connection failed while the link was open. The link is gone.
    Aborted,
}

impl Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LinkState::Closed => "closed",
            LinkState::Opening => "opening",
            LinkState::Open => "open",
            LinkState::Closing => "closing",
            LinkState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// A link granted by the instrument.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Link {
    pub id: LinkId,
    /// Largest payload the instrument accepts in one `device_write`.
    pub max_recv_size: u32,
    /// Port of the abort channel.
    pub abort_port: u16,
}

/// One chunk returned by `device_read`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReadChunk {
    pub data: Vec<u8>,
    pub end_of_message: bool,
}

pub struct CoreChannel {
    rpc: RpcClient,
    state: LinkState,
    link: Option<Link>,
    lock_timeout: Duration,
    /// Added to the instrument-side timeout to bound the wait for the RPC reply.
    grace: Duration,
}

fn millis(duration: Duration) -> u32 {
    duration.as_millis().min(u32::MAX as u128) as u32
}

impl CoreChannel {
    pub fn new(rpc: RpcClient, lock_timeout: Duration, grace: Duration) -> CoreChannel {
        CoreChannel {
            rpc,
            state: LinkState::Closed,
            link: None,
            lock_timeout,
            grace,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn link(&self) -> Option<Link> {
        self.link
    }

    fn open_link(&self) -> Result<Link, Failure> {
        match (self.state, self.link) {
            (LinkState::Open, Some(link)) => Ok(link),
            (state, _) => Err(Failure::NotOpen(state)),
        }
    }

    /// Performs one call. A transport failure moves the channel to [`LinkState::Aborted`]
    /// and closes the connection.
    fn call<A, R>(&mut self, procedure: CoreProcedure, args: &A, timeout: Duration) -> Result<R, Failure>
    where
        A: Pack,
        R: Unpack,
    {
        match self.rpc.call(procedure as u32, args, timeout) {
            Ok(result) => Ok(result),
            Err(error) if error.is_fatal() => {
                log::error!("{:?} failed, dropping link: {}", procedure, error);
                self.link = None;
                self.state = LinkState::Aborted;
                self.rpc.close();
                Err(error.into())
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Opens a link to `device` (e.g. `inst0`).
    pub fn create_link(
        &mut self,
        device: &str,
        client_id: i32,
        lock_device: bool,
        timeout: Duration,
    ) -> Result<Link, Error> {
        if self.state != LinkState::Closed {
            return Err(Error::NotOpen(self.state));
        }
        self.state = LinkState::Opening;
        let parms = CreateLinkParms {
            client_id,
            lock_device,
            lock_timeout: millis(self.lock_timeout),
            device: device.to_string(),
        };
        let call_timeout = if lock_device {
            timeout + self.lock_timeout
        } else {
            timeout
        };
        let resp: CreateLinkResp = match self.rpc.call(CoreProcedure::CreateLink as u32, &parms, call_timeout) {
            Ok(resp) => resp,
            Err(error) => {
                self.state = LinkState::Closed;
                return Err(Error::Link {
                    device: device.to_string(),
                    reason: error.into(),
                });
            }
        };
        if !resp.error.is_ok() {
            self.state = LinkState::Closed;
            return Err(Error::Link {
                device: device.to_string(),
                reason: Failure::Device(resp.error),
            });
        }

        let link = Link {
            id: resp.link_id,
            max_recv_size: resp.max_recv_size,
            abort_port: resp.abort_port,
        };
        log::info!(
            "Created link {} to {} on {} (max_recv_size={}, abort_port={})",
            link.id,
            device,
            self.rpc.connection().peer_addr(),
            link.max_recv_size,
            link.abort_port
        );
        self.link = Some(link);
        self.state = LinkState::Open;
        Ok(link)
    }

    /// Writes `payload`, split into chunks of at most `max_chunk` bytes (and never more
    /// than the negotiated maximum). Only the last chunk carries the END flag.
    pub fn device_write(&mut self, payload: &[u8], max_chunk: usize, timeout: Duration) -> Result<(), Failure> {
        let link = self.open_link()?;
        let chunk_size = match link.max_recv_size as usize {
            0 => max_chunk,
            negotiated => negotiated.min(max_chunk),
        }
        .max(1);
        let deadline = Instant::now() + timeout;

        let mut offset = 0;
        loop {
            let end = (offset + chunk_size).min(payload.len());
            let last = end == payload.len();
            let remaining = deadline.saturating_duration_since(Instant::now());
            let parms = DeviceWriteParms {
                link_id: link.id,
                io_timeout: millis(remaining),
                lock_timeout: millis(self.lock_timeout),
                flags: if last { FLAG_END } else { 0 },
                data: payload[offset..end].to_vec(),
            };
            log::trace!(
                "device_write link={} bytes {}..{} of {}",
                link.id,
                offset,
                end,
                payload.len()
            );
            let resp: DeviceWriteResp = self.call(CoreProcedure::DeviceWrite, &parms, remaining + self.grace)?;
            if !resp.error.is_ok() {
                return Err(Failure::Device(resp.error));
            }
            let written = resp.size as usize;
            if written == 0 && end > offset {
                return Err(Failure::ShortWrite {
                    written: offset,
                    expected: payload.len(),
                });
            }
            // the instrument may accept less than offered; resend the rest
            offset += written.min(end - offset);
            if offset >= payload.len() && last {
                return Ok(());
            }
        }
    }

    /// Performs a single `device_read`.
    pub fn device_read(
        &mut self,
        request_size: u32,
        term_char: Option<u8>,
        timeout: Duration,
    ) -> Result<ReadChunk, Failure> {
        let link = self.open_link()?;
        let parms = DeviceReadParms {
            link_id: link.id,
            request_size,
            io_timeout: millis(timeout),
            lock_timeout: millis(self.lock_timeout),
            flags: if term_char.is_some() { FLAG_TERM_CHAR_SET } else { 0 },
            term_char: term_char.unwrap_or(0),
        };
        let resp: DeviceReadResp = self.call(CoreProcedure::DeviceRead, &parms, timeout + self.grace)?;
        if !resp.error.is_ok() {
            return Err(Failure::Device(resp.error));
        }
        log::trace!(
            "device_read link={} got {} bytes, reason={:#x}",
            link.id,
            resp.data.len(),
            resp.reason
        );
        let end_of_message = resp.is_end_of_message();
        Ok(ReadChunk {
            data: resp.data,
            end_of_message,
        })
    }

    fn generic_parms(&self, link: Link, timeout: Duration) -> DeviceGenericParms {
        DeviceGenericParms {
            link_id: link.id,
            flags: 0,
            lock_timeout: millis(self.lock_timeout),
            io_timeout: millis(timeout),
        }
    }

    fn generic(&mut self, procedure: CoreProcedure, timeout: Duration) -> Result<(), Failure> {
        let link = self.open_link()?;
        let parms = self.generic_parms(link, timeout);
        let resp: DeviceError = self.call(procedure, &parms, timeout + self.grace)?;
        match resp.error {
            DeviceErrorCode::NoError => Ok(()),
            error => Err(Failure::Device(error)),
        }
    }

    /// Reads the IEEE 488.2 status byte.
    pub fn read_stb(&mut self, timeout: Duration) -> Result<u8, Failure> {
        let link = self.open_link()?;
        let parms = self.generic_parms(link, timeout);
        let resp: DeviceReadStbResp = self.call(CoreProcedure::DeviceReadStb, &parms, timeout + self.grace)?;
        match resp.error {
            DeviceErrorCode::NoError => Ok(resp.stb),
            error => Err(Failure::Device(error)),
        }
    }

    pub fn trigger(&mut self, timeout: Duration) -> Result<(), Failure> {
        self.generic(CoreProcedure::DeviceTrigger, timeout)
    }

    pub fn clear(&mut self, timeout: Duration) -> Result<(), Failure> {
        self.generic(CoreProcedure::DeviceClear, timeout)
    }

    pub fn remote(&mut self, timeout: Duration) -> Result<(), Failure> {
        self.generic(CoreProcedure::DeviceRemote, timeout)
    }

    pub fn local(&mut self, timeout: Duration) -> Result<(), Failure> {
        self.generic(CoreProcedure::DeviceLocal, timeout)
    }

    /// Acquires the device lock, waiting up to the lock timeout if `wait` is set.
    pub fn lock(&mut self, wait: bool, timeout: Duration) -> Result<(), Failure> {
        let link = self.open_link()?;
        let parms = DeviceLockParms {
            link_id: link.id,
            flags: if wait { FLAG_WAIT_LOCK } else { 0 },
            lock_timeout: millis(self.lock_timeout),
        };
        let call_timeout = timeout + self.lock_timeout + self.grace;
        let resp: DeviceError = self.call(CoreProcedure::DeviceLock, &parms, call_timeout)?;
        match resp.error {
            DeviceErrorCode::NoError => Ok(()),
            error => Err(Failure::Device(error)),
        }
    }

    pub fn unlock(&mut self, timeout: Duration) -> Result<(), Failure> {
        let link = self.open_link()?;
        let resp: DeviceError = self.call(CoreProcedure::DeviceUnlock, &DeviceLink(link.id), timeout + self.grace)?;
        match resp.error {
            DeviceErrorCode::NoError => Ok(()),
            error => Err(Failure::Device(error)),
        }
    }

    /// Releases the link. Failures are logged; the link is gone either way.
    pub fn destroy_link(&mut self, timeout: Duration) {
        let Some(link) = self.link.take() else {
            return;
        };
        if self.state != LinkState::Open {
            return;
        }
        self.state = LinkState::Closing;
        match self
            .rpc
            .call::<_, DeviceError>(CoreProcedure::DestroyLink as u32, &DeviceLink(link.id), timeout)
        {
            Ok(DeviceError {
                error: DeviceErrorCode::NoError,
            }) => log::info!("Destroyed link {}", link.id),
            Ok(DeviceError { error }) => {
                log::warn!("Instrument refused to destroy link {}: {}", link.id, error)
            }
            Err(error) => log::warn!("destroy_link for link {} failed: {}", link.id, error),
        }
        self.state = LinkState::Closed;
    }

    /// Closes the connection. The link state is kept so that an aborted link stays
    /// distinguishable from a closed one.
    pub fn close(&mut self) {
        self.rpc.close();
        if self.state != LinkState::Aborted {
            self.state = LinkState::Closed;
        }
        self.link = None;
    }
}
