use std::{io, time::Duration};

use vxi11_protocol::{
    DeviceErrorCode,
    error::{DecodeError, FramingError, ScpiError},
    rpc::ReplyStatus,
    scpi::ErrorEntry,
};

use crate::channel::LinkState;

/// Failure of a single RPC exchange.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("{0}")]
    Io(io::Error),

    #[error("no reply within {0:?}")]
    TimedOut(Duration),

    #[error("malformed reply: {0}")]
    Decode(DecodeError),

    #[error("call rejected: {0}")]
    Rejected(ReplyStatus),

    #[error("connection closed by peer")]
    Closed,
}

impl RpcError {
    /// Sorts I/O errors into timeouts, disconnects and everything else.
    pub(crate) fn from_io(error: io::Error, timeout: Duration) -> RpcError {
        match error.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => RpcError::TimedOut(timeout),
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => RpcError::Closed,
            _ => RpcError::Io(error),
        }
    }

    /// Sorts errors of a failed record write. A timeout may leave a partial record behind
    /// on the wire, so it is reported as an I/O failure.
    pub(crate) fn from_write(error: io::Error) -> RpcError {
        match RpcError::from_io(error, Duration::ZERO) {
            RpcError::TimedOut(_) => RpcError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "call could not be sent in time",
            )),
            other => other,
        }
    }

    /// The connection can no longer be trusted to carry RPC records.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RpcError::Io(_) | RpcError::Decode(_) | RpcError::Closed)
    }
}

/// Why a call on an established channel did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum Failure {
    #[error("instrument returned {0}")]
    Device(DeviceErrorCode),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("instrument accepted {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("link is {0}")]
    NotOpen(LinkState),
}

impl Failure {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Failure::Device(DeviceErrorCode::IoTimeout) | Failure::Rpc(RpcError::TimedOut(_))
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Failure::Rpc(rpc) if rpc.is_fatal())
    }
}

/// Errors returned by instrument sessions.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The instrument could not be reached.
    #[error("cannot connect to {addr}: {source}")]
    Connect { addr: String, source: io::Error },

    /// The instrument refused to create a link, or did not answer in time.
    #[error("cannot create link to {device}: {reason}")]
    Link {
        device: String,
        #[source]
        reason: Failure,
    },

    #[error("write failed: {0}")]
    Write(#[source] Failure),

    #[error("read failed: {0}")]
    Read(#[source] Failure),

    /// No complete response within the session timeout. The link has been
    /// sent an abort and stays usable.
    #[error("no complete response within {0:?}")]
    Timeout(Duration),

    /// Encoding of a command or decoding of a response failed.
    #[error(transparent)]
    Scpi(#[from] ScpiError),

    /// The transport worked but the instrument rejected the command.
    #[error("instrument reported {}", format_entries(.0))]
    DeviceReported(Vec<ErrorEntry>),

    #[error("{operation} failed: {reason}")]
    Operation {
        operation: &'static str,
        #[source]
        reason: Failure,
    },

    #[error("link is {0}")]
    NotOpen(LinkState),

    #[error("response exceeds {max} bytes")]
    ResponseTooLarge { max: usize },

    #[error("invalid instrument address {0:?}")]
    InvalidAddress(String),
}

impl From<FramingError> for Error {
    fn from(value: FramingError) -> Self {
        Error::Scpi(ScpiError::Framing(value))
    }
}

impl Error {
    /// Whether the operation ran out of time. Retrying may succeed.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout(_) => true,
            Error::Link { reason, .. }
            | Error::Write(reason)
            | Error::Read(reason)
            | Error::Operation { reason, .. } => reason.is_timeout(),
            _ => false,
        }
    }

    /// Whether the link was lost. The session must be reopened.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Connect { .. } | Error::NotOpen(_) => true,
            Error::Link { reason, .. }
            | Error::Write(reason)
            | Error::Read(reason)
            | Error::Operation { reason, .. } => reason.is_fatal(),
            _ => false,
        }
    }
}

fn format_entries(entries: &[ErrorEntry]) -> String {
    entries
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
