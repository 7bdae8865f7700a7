//! ONC RPC version 2 (RFC 5531) call and reply headers.
//!
//! Only `AUTH_NONE` credentials are produced; credentials of incoming calls are skipped.
use std::fmt::Display;

use crate::error::DecodeError;
use crate::xdr::{Pack, Packer, Unpack, Unpacker};

pub const RPC_VERSION: u32 = 2;

const MSG_CALL: u32 = 0;
const MSG_REPLY: u32 = 1;
const AUTH_NONE: u32 = 0;

const REPLY_ACCEPTED: u32 = 0;
const REPLY_DENIED: u32 = 1;

const ACCEPT_SUCCESS: u32 = 0;
const ACCEPT_PROG_UNAVAIL: u32 = 1;
const ACCEPT_PROG_MISMATCH: u32 = 2;
const ACCEPT_PROC_UNAVAIL: u32 = 3;
const ACCEPT_GARBAGE_ARGS: u32 = 4;
const ACCEPT_SYSTEM_ERR: u32 = 5;

const REJECT_RPC_MISMATCH: u32 = 0;
const REJECT_AUTH_ERROR: u32 = 1;

/// The header of an RPC call. The procedure arguments follow it directly.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CallHeader {
    pub xid: u32,
    pub program: u32,
    pub version: u32,
    pub procedure: u32,
}

impl Pack for CallHeader {
    fn pack(&self, packer: &mut Packer) {
        packer.pack_u32(self.xid);
        packer.pack_u32(MSG_CALL);
        packer.pack_u32(RPC_VERSION);
        packer.pack_u32(self.program);
        packer.pack_u32(self.version);
        packer.pack_u32(self.procedure);
        // credentials and verifier
        packer.pack_u32(AUTH_NONE);
        packer.pack_opaque(&[]);
        packer.pack_u32(AUTH_NONE);
        packer.pack_opaque(&[]);
    }
}

impl Unpack for CallHeader {
    fn unpack(unpacker: &mut Unpacker<'_>) -> Result<Self, DecodeError> {
        let xid = unpacker.unpack_u32()?;
        let message_type = unpacker.unpack_u32()?;
        if message_type != MSG_CALL {
            return Err(DecodeError::UnexpectedMessageType(message_type));
        }
        let rpc_version = unpacker.unpack_u32()?;
        if rpc_version != RPC_VERSION {
            return Err(DecodeError::UnsupportedRpcVersion(rpc_version));
        }
        let program = unpacker.unpack_u32()?;
        let version = unpacker.unpack_u32()?;
        let procedure = unpacker.unpack_u32()?;
        for _ in 0..2 {
            let _flavor = unpacker.unpack_u32()?;
            let _body = unpacker.unpack_opaque()?;
        }
        Ok(CallHeader {
            xid,
            program,
            version,
            procedure,
        })
    }
}

/// Outcome of an RPC call as reported by the server, independent of the procedure result.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReplyStatus {
    Success,
    ProgramUnavailable,
    ProgramMismatch { low: u32, high: u32 },
    ProcedureUnavailable,
    GarbageArgs,
    SystemError,
    RpcMismatch { low: u32, high: u32 },
    AuthError(u32),
}

impl ReplyStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ReplyStatus::Success)
    }
}

impl Display for ReplyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplyStatus::Success => write!(f, "success"),
            ReplyStatus::ProgramUnavailable => write!(f, "program unavailable"),
            ReplyStatus::ProgramMismatch { low, high } => {
                write!(f, "program version mismatch (supported {}-{})", low, high)
            }
            ReplyStatus::ProcedureUnavailable => write!(f, "procedure unavailable"),
            ReplyStatus::GarbageArgs => write!(f, "server could not decode arguments"),
            ReplyStatus::SystemError => write!(f, "system error"),
            ReplyStatus::RpcMismatch { low, high } => {
                write!(f, "RPC version mismatch (supported {}-{})", low, high)
            }
            ReplyStatus::AuthError(stat) => write!(f, "authentication error {}", stat),
        }
    }
}

/// The header of an RPC reply. On success, the procedure result follows it directly.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ReplyHeader {
    pub xid: u32,
    pub status: ReplyStatus,
}

impl Pack for ReplyHeader {
    fn pack(&self, packer: &mut Packer) {
        packer.pack_u32(self.xid);
        packer.pack_u32(MSG_REPLY);
        match self.status {
            ReplyStatus::RpcMismatch { low, high } => {
                packer.pack_u32(REPLY_DENIED);
                packer.pack_u32(REJECT_RPC_MISMATCH);
                packer.pack_u32(low);
                packer.pack_u32(high);
            }
            ReplyStatus::AuthError(stat) => {
                packer.pack_u32(REPLY_DENIED);
                packer.pack_u32(REJECT_AUTH_ERROR);
                packer.pack_u32(stat);
            }
            accepted => {
                packer.pack_u32(REPLY_ACCEPTED);
                packer.pack_u32(AUTH_NONE);
                packer.pack_opaque(&[]);
                match accepted {
                    ReplyStatus::Success => packer.pack_u32(ACCEPT_SUCCESS),
                    ReplyStatus::ProgramUnavailable => packer.pack_u32(ACCEPT_PROG_UNAVAIL),
                    ReplyStatus::ProgramMismatch { low, high } => {
                        packer.pack_u32(ACCEPT_PROG_MISMATCH);
                        packer.pack_u32(low);
                        packer.pack_u32(high);
                    }
                    ReplyStatus::ProcedureUnavailable => packer.pack_u32(ACCEPT_PROC_UNAVAIL),
                    ReplyStatus::GarbageArgs => packer.pack_u32(ACCEPT_GARBAGE_ARGS),
                    _ => packer.pack_u32(ACCEPT_SYSTEM_ERR),
                }
            }
        }
    }
}

impl Unpack for ReplyHeader {
    fn unpack(unpacker: &mut Unpacker<'_>) -> Result<Self, DecodeError> {
        let xid = unpacker.unpack_u32()?;
        let message_type = unpacker.unpack_u32()?;
        if message_type != MSG_REPLY {
            return Err(DecodeError::UnexpectedMessageType(message_type));
        }
        let status = match unpacker.unpack_u32()? {
            REPLY_ACCEPTED => {
                let _flavor = unpacker.unpack_u32()?;
                let _verifier = unpacker.unpack_opaque()?;
                match unpacker.unpack_u32()? {
                    ACCEPT_SUCCESS => ReplyStatus::Success,
                    ACCEPT_PROG_UNAVAIL => ReplyStatus::ProgramUnavailable,
                    ACCEPT_PROG_MISMATCH => ReplyStatus::ProgramMismatch {
                        low: unpacker.unpack_u32()?,
                        high: unpacker.unpack_u32()?,
                    },
                    ACCEPT_PROC_UNAVAIL => ReplyStatus::ProcedureUnavailable,
                    ACCEPT_GARBAGE_ARGS => ReplyStatus::GarbageArgs,
                    ACCEPT_SYSTEM_ERR => ReplyStatus::SystemError,
                    value => {
                        return Err(DecodeError::InvalidDiscriminant {
                            field: "accept_stat",
                            value,
                        });
                    }
                }
            }
            REPLY_DENIED => match unpacker.unpack_u32()? {
                REJECT_RPC_MISMATCH => ReplyStatus::RpcMismatch {
                    low: unpacker.unpack_u32()?,
                    high: unpacker.unpack_u32()?,
                },
                REJECT_AUTH_ERROR => ReplyStatus::AuthError(unpacker.unpack_u32()?),
                value => {
                    return Err(DecodeError::InvalidDiscriminant {
                        field: "reject_stat",
                        value,
                    });
                }
            },
            value => {
                return Err(DecodeError::InvalidDiscriminant {
                    field: "reply_stat",
                    value,
                });
            }
        };
        Ok(ReplyHeader { xid, status })
    }
}

/// Builds a complete call message: header followed by the procedure arguments.
pub fn encode_call(header: &CallHeader, args: &(impl Pack + ?Sized)) -> Vec<u8> {
    let mut packer = Packer::with_capacity(64);
    packer.pack(header);
    packer.pack(args);
    packer.into_inner()
}

/// Builds a complete reply message. The result is only serialized for successful replies.
pub fn encode_reply(xid: u32, status: ReplyStatus, result: &(impl Pack + ?Sized)) -> Vec<u8> {
    let mut packer = Packer::with_capacity(64);
    packer.pack(&ReplyHeader { xid, status });
    if status.is_success() {
        packer.pack(result);
    }
    packer.into_inner()
}

/// Reads the transaction id of a message without decoding the rest.
pub fn peek_xid(message: &[u8]) -> Option<u32> {
    let word = message.get(..4)?;
    Some(u32::from_be_bytes([word[0], word[1], word[2], word[3]]))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn call_header_layout() {
        let header = CallHeader {
            xid: 1,
            program: 0x0607AF,
            version: 1,
            procedure: 10,
        };
        let data = header.to_xdr();
        // 6 words of header plus two empty auth structures
        assert_eq!(data.len(), 40);
        assert_eq!(&data[..4], &[0, 0, 0, 1]);
        assert_eq!(&data[12..16], &[0x00, 0x06, 0x07, 0xAF]);
        assert_eq!(CallHeader::from_xdr(&data).unwrap(), header);
    }

    #[test]
    fn reply_carries_result_only_on_success() {
        let ok = encode_reply(9, ReplyStatus::Success, &42u32);
        let mut unpacker = Unpacker::new(&ok);
        let header: ReplyHeader = unpacker.unpack().unwrap();
        assert_eq!(header.xid, 9);
        assert!(header.status.is_success());
        assert_eq!(unpacker.unpack_u32().unwrap(), 42);

        let failed = encode_reply(10, ReplyStatus::ProcedureUnavailable, &42u32);
        let mut unpacker = Unpacker::new(&failed);
        let header: ReplyHeader = unpacker.unpack().unwrap();
        assert_eq!(header.status, ReplyStatus::ProcedureUnavailable);
        assert!(unpacker.remaining().is_empty());
    }

    #[test]
    fn denied_reply() {
        let data = encode_reply(3, ReplyStatus::RpcMismatch { low: 2, high: 2 }, &());
        let header = ReplyHeader::from_xdr(&data).unwrap();
        assert_eq!(header.status, ReplyStatus::RpcMismatch { low: 2, high: 2 });
    }

    #[test]
    fn call_is_not_a_reply() {
        let header = CallHeader {
            xid: 5,
            program: 100000,
            version: 2,
            procedure: 3,
        };
        let data = header.to_xdr();
        assert!(matches!(
            ReplyHeader::from_xdr(&data),
            Err(DecodeError::UnexpectedMessageType(0))
        ));
        assert_eq!(peek_xid(&data), Some(5));
    }
}
