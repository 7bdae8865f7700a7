//! XDR (RFC 4506) primitives used by ONC RPC.
//!
//! Every item is big endian and padded to a multiple of four bytes.
use crate::error::DecodeError;

/// Serializes XDR items into a growable buffer.
#[derive(Debug, Default, Clone)]
pub struct Packer {
    buf: Vec<u8>,
}

impl Packer {
    pub fn new() -> Packer {
        Packer::default()
    }

    pub fn with_capacity(capacity: usize) -> Packer {
        Packer {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn pack_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn pack_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn pack_bool(&mut self, value: bool) {
        self.pack_u32(value as u32);
    }

    /// Variable length opaque data: length word, bytes, zero padding.
    pub fn pack_opaque(&mut self, data: &[u8]) {
        self.pack_u32(data.len() as u32);
        self.buf.extend_from_slice(data);
        self.buf.resize(self.buf.len() + padding(data.len()), 0);
    }

    pub fn pack_string(&mut self, value: &str) {
        self.pack_opaque(value.as_bytes());
    }

    pub fn pack<T: Pack + ?Sized>(&mut self, value: &T) {
        value.pack(self);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Deserializes XDR items from a borrowed buffer.
#[derive(Debug, Clone)]
pub struct Unpacker<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Unpacker<'a> {
    pub fn new(buf: &'a [u8]) -> Unpacker<'a> {
        Unpacker { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let available = self.buf.len() - self.pos;
        if len > available {
            return Err(DecodeError::Truncated {
                needed: len,
                available,
            });
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn unpack_u32(&mut self) -> Result<u32, DecodeError> {
        let mut word = [0u8; 4];
        word.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(word))
    }

    pub fn unpack_i32(&mut self) -> Result<i32, DecodeError> {
        Ok(self.unpack_u32()? as i32)
    }

    pub fn unpack_bool(&mut self) -> Result<bool, DecodeError> {
        match self.unpack_u32()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DecodeError::InvalidBool(other)),
        }
    }

    pub fn unpack_opaque(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.unpack_u32()? as usize;
        let data = self.take(len)?;
        self.take(padding(len))?;
        Ok(data)
    }

    pub fn unpack_string(&mut self) -> Result<&'a str, DecodeError> {
        str::from_utf8(self.unpack_opaque()?).map_err(|_| DecodeError::InvalidUtf8)
    }

    pub fn unpack<T: Unpack>(&mut self) -> Result<T, DecodeError> {
        T::unpack(self)
    }

    /// The bytes that have not been consumed yet.
    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

fn padding(len: usize) -> usize {
    (4 - len % 4) % 4
}

/// A type with an XDR encoding.
pub trait Pack {
    fn pack(&self, packer: &mut Packer);

    fn to_xdr(&self) -> Vec<u8> {
        let mut packer = Packer::new();
        self.pack(&mut packer);
        packer.into_inner()
    }
}

/// A type that can be decoded from XDR.
pub trait Unpack: Sized {
    fn unpack(unpacker: &mut Unpacker<'_>) -> Result<Self, DecodeError>;

    fn from_xdr(data: &[u8]) -> Result<Self, DecodeError> {
        Self::unpack(&mut Unpacker::new(data))
    }
}

/// Procedures without arguments or results (e.g. the RPC `NULL` procedure).
impl Pack for () {
    fn pack(&self, _: &mut Packer) {}
}

impl Unpack for () {
    fn unpack(_: &mut Unpacker<'_>) -> Result<Self, DecodeError> {
        Ok(())
    }
}

impl Pack for u32 {
    fn pack(&self, packer: &mut Packer) {
        packer.pack_u32(*self);
    }
}

impl Unpack for u32 {
    fn unpack(unpacker: &mut Unpacker<'_>) -> Result<Self, DecodeError> {
        unpacker.unpack_u32()
    }
}
