//! Record marking (RFC 5531, section 11) for RPC messages over TCP.
//!
//! Each record is sent as one or more fragments. A fragment starts with a four byte
//! big endian header whose highest bit marks the last fragment of the record; the
//! remaining 31 bits hold the fragment length.
use std::io::{self, Read, Write};

use crate::error::DecodeError;

pub const LAST_FRAGMENT: u32 = 0x8000_0000;
const FRAGMENT_LEN_MASK: u32 = 0x7FFF_FFFF;

/// Default upper bound for a reassembled record.
pub const DEFAULT_MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

/// Writes one record, split into fragments of at most `max_fragment` bytes.
pub fn write_record(writer: &mut impl Write, record: &[u8], max_fragment: usize) -> io::Result<()> {
    let max_fragment = max_fragment.clamp(1, FRAGMENT_LEN_MASK as usize);
    let mut chunks = record.chunks(max_fragment).peekable();
    if chunks.peek().is_none() {
        writer.write_all(&LAST_FRAGMENT.to_be_bytes())?;
        return writer.flush();
    }
    while let Some(chunk) = chunks.next() {
        let mut header = chunk.len() as u32;
        if chunks.peek().is_none() {
            header |= LAST_FRAGMENT;
        }
        // one buffer per fragment so that the header and data leave in one segment
        let mut fragment = Vec::with_capacity(4 + chunk.len());
        fragment.extend_from_slice(&header.to_be_bytes());
        fragment.extend_from_slice(chunk);
        writer.write_all(&fragment)?;
    }
    writer.flush()
}

/// Reads fragments until a complete record has been reassembled.
pub fn read_record(reader: &mut impl Read, max_len: usize) -> Result<Vec<u8>, DecodeError> {
    let mut record = Vec::new();
    loop {
        let mut header = [0u8; 4];
        reader.read_exact(&mut header)?;
        let header = u32::from_be_bytes(header);
        let len = (header & FRAGMENT_LEN_MASK) as usize;
        if record.len() + len > max_len {
            return Err(DecodeError::RecordTooLarge {
                max: max_len,
                got: record.len() + len,
            });
        }
        let start = record.len();
        record.resize(start + len, 0);
        reader.read_exact(&mut record[start..])?;
        if header & LAST_FRAGMENT != 0 {
            return Ok(record);
        }
    }
}

/// Takes one complete record off the front of `buf`.
///
/// Returns `None` while `buf` holds only part of a record; the bytes stay in `buf` until
/// the rest has been appended.
pub fn take_record(buf: &mut Vec<u8>, max_len: usize) -> Result<Option<Vec<u8>>, DecodeError> {
    let mut fragments = Vec::new();
    let mut pos = 0;
    let mut total = 0;
    loop {
        let Some(header) = buf.get(pos..pos + 4) else {
            return Ok(None);
        };
        let header = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let len = (header & FRAGMENT_LEN_MASK) as usize;
        total += len;
        if total > max_len {
            return Err(DecodeError::RecordTooLarge {
                max: max_len,
                got: total,
            });
        }
        if buf.len() < pos + 4 + len {
            return Ok(None);
        }
        fragments.push(pos + 4..pos + 4 + len);
        pos += 4 + len;
        if header & LAST_FRAGMENT != 0 {
            break;
        }
    }
    let mut record = Vec::with_capacity(total);
    for fragment in fragments {
        record.extend_from_slice(&buf[fragment]);
    }
    buf.drain(..pos);
    Ok(Some(record))
}

#[cfg(feature = "tokio")]
pub use self::tokio_codec::RecordCodec;

#[cfg(feature = "tokio")]
mod tokio_codec {
    use bytes::{Buf, BufMut, Bytes, BytesMut};
    use tokio_util::codec::{Decoder, Encoder};

    use super::{DEFAULT_MAX_RECORD_LEN, FRAGMENT_LEN_MASK, LAST_FRAGMENT};
    use crate::error::DecodeError;

    /// Frames RPC records for `tokio_util::codec::Framed` streams.
    ///
    /// Outgoing records are always sent as a single fragment.
    #[derive(Debug)]
    pub struct RecordCodec {
        max_record_len: usize,
        partial: BytesMut,
    }

    impl RecordCodec {
        pub fn new(max_record_len: usize) -> RecordCodec {
            RecordCodec {
                max_record_len,
                partial: BytesMut::new(),
            }
        }
    }

    impl Default for RecordCodec {
        fn default() -> Self {
            RecordCodec::new(DEFAULT_MAX_RECORD_LEN)
        }
    }

    impl Decoder for RecordCodec {
        type Item = BytesMut;
        type Error = DecodeError;

        fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, DecodeError> {
            loop {
                if src.len() < 4 {
                    return Ok(None);
                }
                let header = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
                let len = (header & FRAGMENT_LEN_MASK) as usize;
                let total = self.partial.len() + len;
                if total > self.max_record_len {
                    return Err(DecodeError::RecordTooLarge {
                        max: self.max_record_len,
                        got: total,
                    });
                }
                if src.len() < 4 + len {
                    src.reserve(4 + len - src.len());
                    return Ok(None);
                }
                src.advance(4);
                let fragment = src.split_to(len);
                self.partial.unsplit(fragment);
                if header & LAST_FRAGMENT != 0 {
                    return Ok(Some(self.partial.split()));
                }
            }
        }
    }

    impl Encoder<Bytes> for RecordCodec {
        type Error = DecodeError;

        fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), DecodeError> {
            if item.len() > FRAGMENT_LEN_MASK as usize {
                return Err(DecodeError::RecordTooLarge {
                    max: FRAGMENT_LEN_MASK as usize,
                    got: item.len(),
                });
            }
            dst.reserve(4 + item.len());
            dst.put_u32(item.len() as u32 | LAST_FRAGMENT);
            dst.put_slice(&item);
            Ok(())
        }
    }

    #[cfg(test)]
    mod test {
        use super::*;

        #[test]
        fn decode_across_fragments_and_partial_input() {
            let mut codec = RecordCodec::default();
            let mut src = BytesMut::new();
            src.put_u32(3);
            src.put_slice(b"abc");
            src.put_u32(2 | LAST_FRAGMENT);
            src.put_slice(b"d");
            assert!(codec.decode(&mut src).unwrap().is_none());

            src.put_slice(b"e");
            let record = codec.decode(&mut src).unwrap().unwrap();
            assert_eq!(&record[..], b"abcde");
            assert!(src.is_empty());
        }

        #[test]
        fn encode_single_fragment() {
            let mut codec = RecordCodec::default();
            let mut dst = BytesMut::new();
            codec.encode(Bytes::from_static(b"xy"), &mut dst).unwrap();
            assert_eq!(&dst[..], b"\x80\x00\x00\x02xy");
        }

        #[test]
        fn oversized_record() {
            let mut codec = RecordCodec::new(8);
            let mut src = BytesMut::new();
            src.put_u32(16 | LAST_FRAGMENT);
            assert!(matches!(
                codec.decode(&mut src),
                Err(DecodeError::RecordTooLarge { max: 8, got: 16 })
            ));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn single_fragment() {
        let mut out = Vec::new();
        write_record(&mut out, b"hello", 1024).unwrap();
        assert_eq!(out, b"\x80\x00\x00\x05hello".to_vec());

        let record = read_record(&mut Cursor::new(out), DEFAULT_MAX_RECORD_LEN).unwrap();
        assert_eq!(record, b"hello");
    }

    #[test]
    fn multiple_fragments() {
        let mut out = Vec::new();
        write_record(&mut out, b"abcdefg", 3).unwrap();
        assert_eq!(
            out,
            b"\x00\x00\x00\x03abc\x00\x00\x00\x03def\x80\x00\x00\x01g".to_vec()
        );
        let record = read_record(&mut Cursor::new(out), DEFAULT_MAX_RECORD_LEN).unwrap();
        assert_eq!(record, b"abcdefg");
    }

    #[test]
    fn empty_record() {
        let mut out = Vec::new();
        write_record(&mut out, b"", 16).unwrap();
        assert_eq!(out, LAST_FRAGMENT.to_be_bytes().to_vec());
        let record = read_record(&mut Cursor::new(out), 16).unwrap();
        assert!(record.is_empty());
    }

    #[test]
    fn record_too_large() {
        let mut out = Vec::new();
        write_record(&mut out, &[0u8; 32], 1024).unwrap();
        match read_record(&mut Cursor::new(out), 16) {
            Err(DecodeError::RecordTooLarge { max, got }) => {
                assert_eq!(max, 16);
                assert_eq!(got, 32);
            }
            other => panic!("expected RecordTooLarge, got {:?}", other),
        }
    }

    #[test]
    fn take_record_waits_for_the_last_fragment() {
        let mut buf = Vec::new();
        write_record(&mut buf, b"abcdefg", 3).unwrap();
        write_record(&mut buf, b"next", 1024).unwrap();
        let split = 9;
        let mut rest = buf.split_off(split);

        assert_eq!(take_record(&mut buf, 64).unwrap(), None);
        assert_eq!(buf.len(), split);
        buf.append(&mut rest);
        assert_eq!(take_record(&mut buf, 64).unwrap().unwrap(), b"abcdefg");
        assert_eq!(take_record(&mut buf, 64).unwrap().unwrap(), b"next");
        assert!(buf.is_empty());
        assert_eq!(take_record(&mut buf, 64).unwrap(), None);
    }

    #[test]
    fn take_record_too_large() {
        let mut buf = b"\x80\x00\x00\x20".to_vec();
        assert!(matches!(
            take_record(&mut buf, 16),
            Err(DecodeError::RecordTooLarge { max: 16, got: 32 })
        ));
    }

    #[test]
    fn truncated_stream() {
        let data = b"\x80\x00\x00\x08abc".to_vec();
        assert!(matches!(
            read_record(&mut Cursor::new(data), 64),
            Err(DecodeError::Io(_))
        ));
    }
}
