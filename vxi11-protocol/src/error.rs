use std::io;

/// Errors that may occur when decoding an RPC record from a stream or buffer.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("{0}")]
    Io(#[from] io::Error),

    /// The buffer ended before a complete XDR item could be read.
    #[error("truncated XDR data: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("invalid XDR boolean {0}")]
    InvalidBool(u32),

    #[error("invalid UTF-8 in XDR string")]
    InvalidUtf8,

    #[error("record too large! Maximum is {max}, but got {got}")]
    RecordTooLarge { max: usize, got: usize },

    #[error("unsupported RPC version {0}")]
    UnsupportedRpcVersion(u32),

    #[error("unexpected RPC message type {0}")]
    UnexpectedMessageType(u32),

    #[error("invalid {field} discriminant {value}")]
    InvalidDiscriminant { field: &'static str, value: u32 },
}

/// Errors produced by the SCPI codec.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScpiError {
    /// The command contains the line terminator and would be split by the instrument.
    #[error("command {command:?} contains an embedded terminator")]
    Encode { command: String },

    /// A binary block response is malformed.
    #[error("{0}")]
    Framing(#[from] FramingError),

    /// A token of a numeric list could not be parsed.
    #[error("cannot parse {token:?} at position {position} as a number")]
    Parse { token: String, position: usize },
}

/// Ways a `#<n><len><data>` block can be malformed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    #[error("block does not start with '#'")]
    MissingHash,

    #[error("invalid block header digit {0:?}, expected 1-9")]
    InvalidDigitCount(char),

    #[error("invalid block length field {0:?}")]
    InvalidLength(String),

    /// The input ends inside the `#<n><len>` header.
    #[error("incomplete block header")]
    IncompleteHeader,

    /// Fewer payload bytes than declared. Receiving more data may complete the block.
    #[error("block declares {declared} bytes but only {available} are available")]
    Truncated { declared: usize, available: usize },
}

impl FramingError {
    /// Whether more input could turn this error into a valid block.
    pub fn is_incomplete(&self) -> bool {
        matches!(
            self,
            FramingError::Truncated { .. } | FramingError::IncompleteHeader
        )
    }
}
