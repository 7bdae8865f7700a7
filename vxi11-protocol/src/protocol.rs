use std::fmt::Display;

use crate::error::DecodeError;
use crate::xdr::{Pack, Packer, Unpack, Unpacker};

/// Well-known port of the portmapper.
pub const PORTMAPPER_PORT: u16 = 111;
pub const PORTMAPPER_PROGRAM: u32 = 100000;
pub const PORTMAPPER_VERSION: u32 = 2;
pub const PMAPPROC_NULL: u32 = 0;
pub const PMAPPROC_GETPORT: u32 = 3;
pub const IPPROTO_TCP: u32 = 6;

/// Core channel: link management, reads and writes.
pub const DEVICE_CORE_PROGRAM: u32 = 0x0607AF;
pub const DEVICE_CORE_VERSION: u32 = 1;
/// Abort channel, served on the port announced by `create_link`.
pub const DEVICE_ASYNC_PROGRAM: u32 = 0x0607B0;
pub const DEVICE_ASYNC_VERSION: u32 = 1;
pub const DEVICE_ABORT: u32 = 1;

/// Wait for the lock instead of failing when another link holds it.
pub const FLAG_WAIT_LOCK: u32 = 0x01;
/// Marks the last chunk of a message in `device_write`.
pub const FLAG_END: u32 = 0x08;
/// `term_char` of a read request is valid.
pub const FLAG_TERM_CHAR_SET: u32 = 0x80;

/// The read returned because the requested size was reached.
pub const REASON_REQCNT: u32 = 0x01;
/// The read returned because the termination character was seen.
pub const REASON_CHR: u32 = 0x02;
/// The read returned because the end of the message was reached.
pub const REASON_END: u32 = 0x04;

pub type LinkId = i32;

/// Procedures of the core channel.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum CoreProcedure {
    CreateLink = 10,
    DeviceWrite = 11,
    DeviceRead = 12,
    DeviceReadStb = 13,
    DeviceTrigger = 14,
    DeviceClear = 15,
    DeviceRemote = 16,
    DeviceLocal = 17,
    DeviceLock = 18,
    DeviceUnlock = 19,
    DestroyLink = 23,
}

impl CoreProcedure {
    pub fn from_u32(value: u32) -> Option<CoreProcedure> {
        use CoreProcedure::*;
        Some(match value {
            10 => CreateLink,
            11 => DeviceWrite,
            12 => DeviceRead,
            13 => DeviceReadStb,
            14 => DeviceTrigger,
            15 => DeviceClear,
            16 => DeviceRemote,
            17 => DeviceLocal,
            18 => DeviceLock,
            19 => DeviceUnlock,
            23 => DestroyLink,
            _ => return None,
        })
    }
}

/// Status codes returned in the `error` field of every VXI-11 result.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum DeviceErrorCode {
    NoError,
    SyntaxError,
    DeviceNotAccessible,
    InvalidLinkIdentifier,
    ParameterError,
    ChannelNotEstablished,
    OperationNotSupported,
    OutOfResources,
    DeviceLocked,
    NoLockHeld,
    IoTimeout,
    IoError,
    InvalidAddress,
    Abort,
    ChannelAlreadyEstablished,
    Other(u32),
}

impl DeviceErrorCode {
    pub fn from_u32(value: u32) -> DeviceErrorCode {
        use DeviceErrorCode::*;
        match value {
            0 => NoError,
            1 => SyntaxError,
            3 => DeviceNotAccessible,
            4 => InvalidLinkIdentifier,
            5 => ParameterError,
            6 => ChannelNotEstablished,
            8 => OperationNotSupported,
            9 => OutOfResources,
            11 => DeviceLocked,
            12 => NoLockHeld,
            15 => IoTimeout,
            17 => IoError,
            21 => InvalidAddress,
            23 => Abort,
            29 => ChannelAlreadyEstablished,
            other => Other(other),
        }
    }

    pub fn as_u32(&self) -> u32 {
        use DeviceErrorCode::*;
        match self {
            NoError => 0,
            SyntaxError => 1,
            DeviceNotAccessible => 3,
            InvalidLinkIdentifier => 4,
            ParameterError => 5,
            ChannelNotEstablished => 6,
            OperationNotSupported => 8,
            OutOfResources => 9,
            DeviceLocked => 11,
            NoLockHeld => 12,
            IoTimeout => 15,
            IoError => 17,
            InvalidAddress => 21,
            Abort => 23,
            ChannelAlreadyEstablished => 29,
            Other(code) => *code,
        }
    }

    pub fn is_ok(&self) -> bool {
        *self == DeviceErrorCode::NoError
    }
}

impl Display for DeviceErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use DeviceErrorCode::*;
        let text = match self {
            NoError => "no error",
            SyntaxError => "syntax error",
            DeviceNotAccessible => "device not accessible",
            InvalidLinkIdentifier => "invalid link identifier",
            ParameterError => "parameter error",
            ChannelNotEstablished => "channel not established",
            OperationNotSupported => "operation not supported",
            OutOfResources => "out of resources",
            DeviceLocked => "device locked by another link",
            NoLockHeld => "no lock held by this link",
            IoTimeout => "I/O timeout",
            IoError => "I/O error",
            InvalidAddress => "invalid address",
            Abort => "abort",
            ChannelAlreadyEstablished => "channel already established",
            Other(code) => return write!(f, "unknown error {}", code),
        };
        write!(f, "{} ({})", text, self.as_u32())
    }
}

impl Pack for DeviceErrorCode {
    fn pack(&self, packer: &mut Packer) {
        packer.pack_u32(self.as_u32());
    }
}

impl Unpack for DeviceErrorCode {
    fn unpack(unpacker: &mut Unpacker<'_>) -> Result<Self, DecodeError> {
        Ok(DeviceErrorCode::from_u32(unpacker.unpack_u32()?))
    }
}

/// Arguments of `PMAPPROC_GETPORT`. The result is the port as a `u32`, 0 if unregistered.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Mapping {
    pub program: u32,
    pub version: u32,
    pub protocol: u32,
    pub port: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreateLinkParms {
    pub client_id: i32,
    pub lock_device: bool,
    pub lock_timeout: u32,
    pub device: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreateLinkResp {
    pub error: DeviceErrorCode,
    pub link_id: LinkId,
    pub abort_port: u16,
    pub max_recv_size: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceWriteParms {
    pub link_id: LinkId,
    pub io_timeout: u32,
    pub lock_timeout: u32,
    pub flags: u32,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceWriteResp {
    pub error: DeviceErrorCode,
    pub size: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceReadParms {
    pub link_id: LinkId,
    pub request_size: u32,
    pub io_timeout: u32,
    pub lock_timeout: u32,
    pub flags: u32,
    pub term_char: u8,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceReadResp {
    pub error: DeviceErrorCode,
    pub reason: u32,
    pub data: Vec<u8>,
}

impl DeviceReadResp {
    /// Whether this reply completes the current response message.
    pub fn is_end_of_message(&self) -> bool {
        self.reason & (REASON_END | REASON_CHR) != 0
    }
}

/// Arguments shared by read_stb, trigger, clear, remote and local.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceGenericParms {
    pub link_id: LinkId,
    pub flags: u32,
    pub lock_timeout: u32,
    pub io_timeout: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceReadStbResp {
    pub error: DeviceErrorCode,
    pub stb: u8,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceLockParms {
    pub link_id: LinkId,
    pub flags: u32,
    pub lock_timeout: u32,
}

/// Argument of destroy_link, device_unlock and device_abort.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DeviceLink(pub LinkId);

/// Result of procedures that only report a status.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DeviceError {
    pub error: DeviceErrorCode,
}

impl Pack for Mapping {
    fn pack(&self, packer: &mut Packer) {
        packer.pack_u32(self.program);
        packer.pack_u32(self.version);
        packer.pack_u32(self.protocol);
        packer.pack_u32(self.port);
    }
}

impl Unpack for Mapping {
    fn unpack(unpacker: &mut Unpacker<'_>) -> Result<Self, DecodeError> {
        Ok(Mapping {
            program: unpacker.unpack_u32()?,
            version: unpacker.unpack_u32()?,
            protocol: unpacker.unpack_u32()?,
            port: unpacker.unpack_u32()?,
        })
    }
}

impl Pack for CreateLinkParms {
    fn pack(&self, packer: &mut Packer) {
        packer.pack_i32(self.client_id);
        packer.pack_bool(self.lock_device);
        packer.pack_u32(self.lock_timeout);
        packer.pack_string(&self.device);
    }
}

impl Unpack for CreateLinkParms {
    fn unpack(unpacker: &mut Unpacker<'_>) -> Result<Self, DecodeError> {
        Ok(CreateLinkParms {
            client_id: unpacker.unpack_i32()?,
            lock_device: unpacker.unpack_bool()?,
            lock_timeout: unpacker.unpack_u32()?,
            device: unpacker.unpack_string()?.to_string(),
        })
    }
}

impl Pack for CreateLinkResp {
    fn pack(&self, packer: &mut Packer) {
        packer.pack(&self.error);
        packer.pack_i32(self.link_id);
        packer.pack_u32(self.abort_port as u32);
        packer.pack_u32(self.max_recv_size);
    }
}

impl Unpack for CreateLinkResp {
    fn unpack(unpacker: &mut Unpacker<'_>) -> Result<Self, DecodeError> {
        Ok(CreateLinkResp {
            error: unpacker.unpack()?,
            link_id: unpacker.unpack_i32()?,
            // unsigned short on the wire, widened to a full XDR word
            abort_port: unpacker.unpack_u32()? as u16,
            max_recv_size: unpacker.unpack_u32()?,
        })
    }
}

impl Pack for DeviceWriteParms {
    fn pack(&self, packer: &mut Packer) {
        packer.pack_i32(self.link_id);
        packer.pack_u32(self.io_timeout);
        packer.pack_u32(self.lock_timeout);
        packer.pack_u32(self.flags);
        packer.pack_opaque(&self.data);
    }
}

impl Unpack for DeviceWriteParms {
    fn unpack(unpacker: &mut Unpacker<'_>) -> Result<Self, DecodeError> {
        Ok(DeviceWriteParms {
            link_id: unpacker.unpack_i32()?,
            io_timeout: unpacker.unpack_u32()?,
            lock_timeout: unpacker.unpack_u32()?,
            flags: unpacker.unpack_u32()?,
            data: unpacker.unpack_opaque()?.to_vec(),
        })
    }
}

impl Pack for DeviceWriteResp {
    fn pack(&self, packer: &mut Packer) {
        packer.pack(&self.error);
        packer.pack_u32(self.size);
    }
}

impl Unpack for DeviceWriteResp {
    fn unpack(unpacker: &mut Unpacker<'_>) -> Result<Self, DecodeError> {
        Ok(DeviceWriteResp {
            error: unpacker.unpack()?,
            size: unpacker.unpack_u32()?,
        })
    }
}

impl Pack for DeviceReadParms {
    fn pack(&self, packer: &mut Packer) {
        packer.pack_i32(self.link_id);
        packer.pack_u32(self.request_size);
        packer.pack_u32(self.io_timeout);
        packer.pack_u32(self.lock_timeout);
        packer.pack_u32(self.flags);
        packer.pack_u32(self.term_char as u32);
    }
}

impl Unpack for DeviceReadParms {
    fn unpack(unpacker: &mut Unpacker<'_>) -> Result<Self, DecodeError> {
        Ok(DeviceReadParms {
            link_id: unpacker.unpack_i32()?,
            request_size: unpacker.unpack_u32()?,
            io_timeout: unpacker.unpack_u32()?,
            lock_timeout: unpacker.unpack_u32()?,
            flags: unpacker.unpack_u32()?,
            term_char: unpacker.unpack_u32()? as u8,
        })
    }
}

impl Pack for DeviceReadResp {
    fn pack(&self, packer: &mut Packer) {
        packer.pack(&self.error);
        packer.pack_u32(self.reason);
        packer.pack_opaque(&self.data);
    }
}

impl Unpack for DeviceReadResp {
    fn unpack(unpacker: &mut Unpacker<'_>) -> Result<Self, DecodeError> {
        Ok(DeviceReadResp {
            error: unpacker.unpack()?,
            reason: unpacker.unpack_u32()?,
            data: unpacker.unpack_opaque()?.to_vec(),
        })
    }
}

impl Pack for DeviceGenericParms {
    fn pack(&self, packer: &mut Packer) {
        packer.pack_i32(self.link_id);
        packer.pack_u32(self.flags);
        packer.pack_u32(self.lock_timeout);
        packer.pack_u32(self.io_timeout);
    }
}

impl Unpack for DeviceGenericParms {
    fn unpack(unpacker: &mut Unpacker<'_>) -> Result<Self, DecodeError> {
        Ok(DeviceGenericParms {
            link_id: unpacker.unpack_i32()?,
            flags: unpacker.unpack_u32()?,
            lock_timeout: unpacker.unpack_u32()?,
            io_timeout: unpacker.unpack_u32()?,
        })
    }
}

impl Pack for DeviceReadStbResp {
    fn pack(&self, packer: &mut Packer) {
        packer.pack(&self.error);
        packer.pack_u32(self.stb as u32);
    }
}

impl Unpack for DeviceReadStbResp {
    fn unpack(unpacker: &mut Unpacker<'_>) -> Result<Self, DecodeError> {
        Ok(DeviceReadStbResp {
            error: unpacker.unpack()?,
            stb: unpacker.unpack_u32()? as u8,
        })
    }
}

impl Pack for DeviceLockParms {
    fn pack(&self, packer: &mut Packer) {
        packer.pack_i32(self.link_id);
        packer.pack_u32(self.flags);
        packer.pack_u32(self.lock_timeout);
    }
}

impl Unpack for DeviceLockParms {
    fn unpack(unpacker: &mut Unpacker<'_>) -> Result<Self, DecodeError> {
        Ok(DeviceLockParms {
            link_id: unpacker.unpack_i32()?,
            flags: unpacker.unpack_u32()?,
            lock_timeout: unpacker.unpack_u32()?,
        })
    }
}

impl Pack for DeviceLink {
    fn pack(&self, packer: &mut Packer) {
        packer.pack_i32(self.0);
    }
}

impl Unpack for DeviceLink {
    fn unpack(unpacker: &mut Unpacker<'_>) -> Result<Self, DecodeError> {
        Ok(DeviceLink(unpacker.unpack_i32()?))
    }
}

impl Pack for DeviceError {
    fn pack(&self, packer: &mut Packer) {
        packer.pack(&self.error);
    }
}

impl Unpack for DeviceError {
    fn unpack(unpacker: &mut Unpacker<'_>) -> Result<Self, DecodeError> {
        Ok(DeviceError {
            error: unpacker.unpack()?,
        })
    }
}
