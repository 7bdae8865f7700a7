//! Blocking TCP connection to one instrument port.
use std::{
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs},
    time::Duration,
};

use crate::error::Error;

/// The smallest timeout handed to the socket. A zero duration would mean "block forever".
const MIN_SOCKET_TIMEOUT: Duration = Duration::from_millis(1);

/// An open connection. Every blocking call is bounded by a timeout.
#[derive(Debug)]
pub struct Connection {
    stream: Option<TcpStream>,
    peer: SocketAddr,
}

impl Connection {
    /// Connects to the first reachable address of `host:port`.
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Connection, Error> {
        let addr = format!("{}:{}", host, port);
        let candidates = (host, port)
            .to_socket_addrs()
            .map_err(|source| Error::Connect {
                addr: addr.clone(),
                source,
            })?;

        let mut last_error = None;
        for candidate in candidates {
            log::debug!("Connecting to {}", candidate);
            match TcpStream::connect_timeout(&candidate, timeout.max(MIN_SOCKET_TIMEOUT)) {
                Ok(stream) => {
                    stream
                        .set_nodelay(true)
                        .map_err(|source| Error::Connect {
                            addr: addr.clone(),
                            source,
                        })?;
                    return Ok(Connection {
                        stream: Some(stream),
                        peer: candidate,
                    });
                }
                Err(error) => last_error = Some(error),
            }
        }
        Err(Error::Connect {
            addr,
            source: last_error.unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses")
            }),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn stream(&self) -> io::Result<&TcpStream> {
        self.stream
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }

    /// Bounds all subsequent reads and writes.
    pub fn set_timeout(&self, timeout: Duration) -> io::Result<()> {
        let stream = self.stream()?;
        let timeout = Some(timeout.max(MIN_SOCKET_TIMEOUT));
        stream.set_read_timeout(timeout)?;
        stream.set_write_timeout(timeout)
    }

    /// Writes all of `data` within `timeout`.
    pub fn write_with_timeout(&mut self, data: &[u8], timeout: Duration) -> io::Result<()> {
        self.set_timeout(timeout)?;
        self.write_all(data)?;
        self.flush()
    }

    /// Reads whatever is available, at most `max_bytes`, waiting up to `timeout`.
    pub fn read_with_timeout(&mut self, max_bytes: usize, timeout: Duration) -> io::Result<Vec<u8>> {
        self.set_timeout(timeout)?;
        let mut buf = vec![0; max_bytes];
        let len = self.read(&mut buf)?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Shuts the socket down. Calling this more than once has no effect.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            log::debug!("Closing connection to {}", self.peer);
            // the peer may already be gone
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut stream = self.stream()?;
        stream.read(buf)
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut stream = self.stream()?;
        stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut stream = self.stream()?;
        stream.flush()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
