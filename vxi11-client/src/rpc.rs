//! Request/response correlation on top of a [`Connection`].
use std::{
    io::{self, Read},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use vxi11_protocol::{
    codec::{DEFAULT_MAX_RECORD_LEN, take_record, write_record},
    rpc::{CallHeader, ReplyHeader, encode_call},
    xdr::{Pack, Unpack, Unpacker},
};

use crate::{error::RpcError, transport::Connection};

/// Outgoing records are split into fragments of this size.
const MAX_FRAGMENT: usize = 64 * 1024;

/// Bytes requested from the socket per read.
const READ_CHUNK: usize = 64 * 1024;

/// Client for one RPC program on one connection.
///
/// Calls are strictly sequential. Replies carrying a different transaction id than the
/// pending call are answers to calls that already timed out; they are dropped.
///
/// Received bytes are kept until they form a complete record, across calls. A reply cut
/// off by a timeout is completed by the next call and dropped as stale.
#[derive(Debug)]
pub struct RpcClient {
    conn: Connection,
    program: u32,
    version: u32,
    next_xid: u32,
    max_record_len: usize,
    inbox: Vec<u8>,
}

impl RpcClient {
    pub fn new(conn: Connection, program: u32, version: u32) -> RpcClient {
        RpcClient {
            conn,
            program,
            version,
            next_xid: initial_xid(),
            max_record_len: DEFAULT_MAX_RECORD_LEN,
            inbox: Vec::new(),
        }
    }

    /// Limits the size of accepted replies.
    pub fn with_max_record_len(mut self, max_record_len: usize) -> RpcClient {
        self.max_record_len = max_record_len;
        self
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn close(&mut self) {
        self.conn.close();
    }

    fn next_xid(&mut self) -> u32 {
        let xid = self.next_xid;
        self.next_xid = self.next_xid.wrapping_add(1);
        xid
    }

    /// Sends a call and waits up to `timeout` for its reply.
    pub fn call<A, R>(&mut self, procedure: u32, args: &A, timeout: Duration) -> Result<R, RpcError>
    where
        A: Pack + ?Sized,
        R: Unpack,
    {
        let xid = self.next_xid();
        let header = CallHeader {
            xid,
            program: self.program,
            version: self.version,
            procedure,
        };
        let message = encode_call(&header, args);
        log::trace!(
            "RPC call xid={} program={:#x} procedure={} ({} bytes)",
            xid,
            self.program,
            procedure,
            message.len()
        );

        let deadline = Instant::now() + timeout;
        self.conn
            .set_timeout(timeout)
            .map_err(|e| RpcError::from_io(e, timeout))?;
        // a partly sent record cannot be taken back
        write_record(&mut self.conn, &message, MAX_FRAGMENT).map_err(RpcError::from_write)?;

        loop {
            let Some(record) = self.receive(deadline, timeout)? else {
                continue;
            };
            let mut unpacker = Unpacker::new(&record);
            let reply: ReplyHeader = unpacker.unpack().map_err(RpcError::Decode)?;
            if reply.xid != xid {
                log::debug!(
                    "Discarding stale reply xid={} while waiting for xid={}",
                    reply.xid,
                    xid
                );
                continue;
            }
            if !reply.status.is_success() {
                return Err(RpcError::Rejected(reply.status));
            }
            return unpacker.unpack().map_err(RpcError::Decode);
        }
    }

    /// Returns the next complete record, or `None` after one read that did not complete
    /// a record.
    fn receive(&mut self, deadline: Instant, timeout: Duration) -> Result<Option<Vec<u8>>, RpcError> {
        if let Some(record) = take_record(&mut self.inbox, self.max_record_len).map_err(RpcError::Decode)? {
            return Ok(Some(record));
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(RpcError::TimedOut(timeout));
        }
        self.conn
            .set_timeout(remaining)
            .map_err(|e| RpcError::from_io(e, timeout))?;

        let start = self.inbox.len();
        self.inbox.resize(start + READ_CHUNK, 0);
        let read = self.conn.read(&mut self.inbox[start..]);
        self.inbox.truncate(start + read.as_ref().map_or(0, |len| *len));
        match read {
            Ok(0) => Err(RpcError::Closed),
            Ok(len) => {
                log::trace!("Received {} bytes, {} buffered", len, self.inbox.len());
                take_record(&mut self.inbox, self.max_record_len).map_err(RpcError::Decode)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(RpcError::from_io(e, timeout)),
        }
    }
}

/// Transaction ids only need to differ between consecutive connections of one client.
fn initial_xid() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() ^ (d.as_secs() as u32))
        .unwrap_or(1)
}
