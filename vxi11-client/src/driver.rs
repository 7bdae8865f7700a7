//! The seam between instrument drivers and the session that carries their commands.
use std::{thread, time::Duration};

use vxi11_protocol::scpi::BlockValue;

use crate::{error::Error, session::DeviceSession};

/// The operations an instrument driver needs from its connection.
pub trait ScpiDevice {
    fn send(&mut self, command: &str) -> Result<(), Error>;

    fn query(&mut self, command: &str) -> Result<String, Error>;

    fn query_binary(&mut self, command: &str) -> Result<BlockValue, Error>;

    fn close(&mut self) -> Result<(), Error>;
}

impl ScpiDevice for DeviceSession {
    fn send(&mut self, command: &str) -> Result<(), Error> {
        DeviceSession::send(self, command)
    }

    fn query(&mut self, command: &str) -> Result<String, Error> {
        DeviceSession::query(self, command)
    }

    fn query_binary(&mut self, command: &str) -> Result<BlockValue, Error> {
        DeviceSession::query_binary(self, command)
    }

    fn close(&mut self) -> Result<(), Error> {
        DeviceSession::close(self)
    }
}

impl<D: ScpiDevice + ?Sized> ScpiDevice for Box<D> {
    fn send(&mut self, command: &str) -> Result<(), Error> {
        (**self).send(command)
    }

    fn query(&mut self, command: &str) -> Result<String, Error> {
        (**self).query(command)
    }

    fn query_binary(&mut self, command: &str) -> Result<BlockValue, Error> {
        (**self).query_binary(command)
    }

    fn close(&mut self) -> Result<(), Error> {
        (**self).close()
    }
}

/// Retries queries that timed out.
///
/// Only queries are retried. A command sent with [`ScpiDevice::send`] may have been
/// executed even though it timed out, so it is never sent twice.
pub struct Retry<D> {
    inner: D,
    attempts: u32,
    backoff: Duration,
}

impl<D: ScpiDevice> Retry<D> {
    /// Wraps `inner`, trying each query at most `attempts` times.
    pub fn new(inner: D, attempts: u32) -> Retry<D> {
        Retry {
            inner,
            attempts: attempts.max(1),
            backoff: Duration::ZERO,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn get_mut(&mut self) -> &mut D {
        &mut self.inner
    }

    pub fn into_inner(self) -> D {
        self.inner
    }

    fn retry<T>(
        &mut self,
        command: &str,
        mut op: impl FnMut(&mut D) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let mut attempt = 1;
        loop {
            match op(&mut self.inner) {
                Err(error) if error.is_timeout() && attempt < self.attempts => {
                    log::warn!(
                        "{:?} timed out (attempt {} of {}), retrying",
                        command,
                        attempt,
                        self.attempts
                    );
                    attempt += 1;
                    if !self.backoff.is_zero() {
                        thread::sleep(self.backoff);
                    }
                }
                result => return result,
            }
        }
    }
}

impl<D: ScpiDevice> ScpiDevice for Retry<D> {
    fn send(&mut self, command: &str) -> Result<(), Error> {
        self.inner.send(command)
    }

    fn query(&mut self, command: &str) -> Result<String, Error> {
        self.retry(command, |inner| inner.query(command))
    }

    fn query_binary(&mut self, command: &str) -> Result<BlockValue, Error> {
        self.retry(command, |inner| inner.query_binary(command))
    }

    fn close(&mut self) -> Result<(), Error> {
        self.inner.close()
    }
}
