//! The abort channel, used to interrupt a blocked call on the core channel.
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use vxi11_protocol::{
    DEVICE_ABORT, DEVICE_ASYNC_PROGRAM, DEVICE_ASYNC_VERSION, DeviceError, DeviceErrorCode,
    DeviceLink, LinkId,
};

use crate::{
    error::{Error, Failure},
    rpc::RpcClient,
    transport::Connection,
};

#[derive(Debug)]
struct AbortChannel {
    host: String,
    port: u16,
    link_id: LinkId,
    timeout: Duration,
    rpc: Option<RpcClient>,
    closed: bool,
}

impl AbortChannel {
    fn abort(&mut self) -> Result<(), Error> {
        if self.closed {
            log::debug!("Ignoring abort for closed link {}", self.link_id);
            return Ok(());
        }
        let rpc = match &mut self.rpc {
            Some(rpc) => rpc,
            None => {
                let conn = Connection::connect(&self.host, self.port, self.timeout)?;
                self.rpc.insert(RpcClient::new(conn, DEVICE_ASYNC_PROGRAM, DEVICE_ASYNC_VERSION))
            }
        };
        log::debug!("Sending device_abort for link {}", self.link_id);
        let result = rpc.call::<_, DeviceError>(DEVICE_ABORT, &DeviceLink(self.link_id), self.timeout);
        match result {
            Ok(DeviceError {
                error: DeviceErrorCode::NoError,
            }) => Ok(()),
            Ok(DeviceError { error }) => Err(Error::Operation {
                operation: "device_abort",
                reason: Failure::Device(error),
            }),
            Err(error) => {
                if error.is_fatal() {
                    // reconnect on the next abort
                    self.rpc = None;
                }
                Err(Error::Operation {
                    operation: "device_abort",
                    reason: error.into(),
                })
            }
        }
    }
}

/// Cloneable handle that aborts the in-flight operation of one link.
///
/// The handle may be moved to another thread and used while the session is blocked in
/// a read or write. The abort channel connection is opened on first use. Aborting a
/// link that has no pending operation has no effect, and aborting after the session
/// was closed is ignored.
#[derive(Clone, Debug)]
pub struct AbortHandle {
    inner: Arc<Mutex<AbortChannel>>,
}

impl AbortHandle {
    pub(crate) fn new(host: &str, port: u16, link_id: LinkId, timeout: Duration) -> AbortHandle {
        AbortHandle {
            inner: Arc::new(Mutex::new(AbortChannel {
                host: host.to_string(),
                port,
                link_id,
                timeout,
                rpc: None,
                closed: false,
            })),
        }
    }

    pub fn link_id(&self) -> LinkId {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).link_id
    }

    pub fn abort(&self) -> Result<(), Error> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .abort()
    }

    pub(crate) fn close(&self) {
        let mut channel = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        channel.closed = true;
        if let Some(mut rpc) = channel.rpc.take() {
            rpc.close();
        }
    }
}
