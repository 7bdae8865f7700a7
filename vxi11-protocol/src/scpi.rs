//! SCPI command encoding and response decoding.
//!
//! Commands are ASCII lines closed by a terminator (usually `\n`). Responses are either
//! text, comma separated numbers, or IEEE 488.2 definite length blocks of the form
//! `#<n><length><data>`, where `<n>` is a single digit giving the number of length digits.
use std::str::FromStr;

use crate::error::{FramingError, ScpiError};

pub const DEFAULT_TERMINATOR: u8 = b'\n';

/// Encodes commands and decodes text replies for one line terminator.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ScpiCodec {
    terminator: u8,
}

impl Default for ScpiCodec {
    fn default() -> Self {
        ScpiCodec::new(DEFAULT_TERMINATOR)
    }
}

impl ScpiCodec {
    pub fn new(terminator: u8) -> ScpiCodec {
        ScpiCodec { terminator }
    }

    pub fn terminator(&self) -> u8 {
        self.terminator
    }

    /// Appends the terminator to a command.
    ///
    /// Fails if the command already contains the terminator, as the instrument would
    /// treat it as two separate commands.
    pub fn encode(&self, command: &str) -> Result<Vec<u8>, ScpiError> {
        if command.as_bytes().contains(&self.terminator) {
            return Err(ScpiError::Encode {
                command: command.to_string(),
            });
        }
        let mut out = Vec::with_capacity(command.len() + 1);
        out.extend_from_slice(command.as_bytes());
        out.push(self.terminator);
        Ok(out)
    }

    /// Decodes a text reply, dropping the trailing terminator and whitespace.
    ///
    /// Bytes that are not valid UTF-8 are replaced rather than rejected.
    pub fn decode_text(&self, bytes: &[u8]) -> String {
        let end = bytes
            .iter()
            .rposition(|b| *b != self.terminator && !b.is_ascii_whitespace())
            .map_or(0, |pos| pos + 1);
        String::from_utf8_lossy(&bytes[..end]).into_owned()
    }

    /// Decodes a multi-line text reply into its lines.
    pub fn decode_lines(&self, bytes: &[u8]) -> Vec<String> {
        let text = self.decode_text(bytes);
        if text.is_empty() {
            return Vec::new();
        }
        text.split(self.terminator as char)
            .map(|line| line.trim_end().to_string())
            .collect()
    }
}

/// The payload of a definite length block.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockValue {
    declared_len: usize,
    data: Vec<u8>,
}

impl BlockValue {
    pub fn new(data: Vec<u8>) -> BlockValue {
        BlockValue {
            declared_len: data.len(),
            data,
        }
    }

    /// The length announced by the block header. Always equal to the payload length.
    pub fn declared_len(&self) -> usize {
        self.declared_len
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Parses a `#<n><length><data>` block. Bytes after the payload (typically the
/// terminator) are ignored.
pub fn decode_block(bytes: &[u8]) -> Result<BlockValue, FramingError> {
    let (header_len, declared) = parse_block_header(bytes)?;
    let available = bytes.len() - header_len;
    if available < declared {
        return Err(FramingError::Truncated {
            declared,
            available,
        });
    }
    Ok(BlockValue {
        declared_len: declared,
        data: bytes[header_len..header_len + declared].to_vec(),
    })
}

/// Returns the header length and the declared payload length of a block.
pub fn parse_block_header(bytes: &[u8]) -> Result<(usize, usize), FramingError> {
    let Some(&first) = bytes.first() else {
        return Err(FramingError::IncompleteHeader);
    };
    if first != b'#' {
        return Err(FramingError::MissingHash);
    }
    let Some(&digit) = bytes.get(1) else {
        return Err(FramingError::IncompleteHeader);
    };
    let num_digits = match digit {
        b'1'..=b'9' => (digit - b'0') as usize,
        other => return Err(FramingError::InvalidDigitCount(other as char)),
    };
    let Some(field) = bytes.get(2..2 + num_digits) else {
        return Err(FramingError::IncompleteHeader);
    };
    if !field.iter().all(u8::is_ascii_digit) {
        return Err(FramingError::InvalidLength(
            String::from_utf8_lossy(field).into_owned(),
        ));
    }
    let declared = str::from_utf8(field)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| FramingError::InvalidLength(String::from_utf8_lossy(field).into_owned()))?;
    Ok((2 + num_digits, declared))
}

/// Builds a block with the shortest possible header for `data`.
pub fn frame_block(data: &[u8]) -> Vec<u8> {
    let len = data.len().to_string();
    let mut out = Vec::with_capacity(2 + len.len() + data.len());
    out.push(b'#');
    out.push(b'0' + len.len() as u8);
    out.extend_from_slice(len.as_bytes());
    out.extend_from_slice(data);
    out
}

/// Parses a list of numbers such as `1.5,-2E-3,+4.0e+01`.
///
/// An empty (or whitespace only) input is an empty list.
pub fn decode_numeric_list(text: &str, separator: char) -> Result<Vec<f64>, ScpiError> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    text.split(separator)
        .enumerate()
        .map(|(position, token)| {
            token.trim().parse::<f64>().map_err(|_| ScpiError::Parse {
                token: token.to_string(),
                position,
            })
        })
        .collect()
}

/// The four fields of an `*IDN?` reply.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Identification {
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    pub firmware: String,
}

impl FromStr for Identification {
    type Err = ScpiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.trim().splitn(4, ',').map(|f| f.trim().to_string());
        let mut next = |position: usize| {
            fields.next().ok_or_else(|| ScpiError::Parse {
                token: s.to_string(),
                position,
            })
        };
        Ok(Identification {
            manufacturer: next(0)?,
            model: next(1)?,
            serial: next(2)?,
            firmware: next(3)?,
        })
    }
}

/// One entry of the instrument error queue, e.g. `-113,"Undefined header"`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ErrorEntry {
    pub code: i32,
    pub message: String,
}

impl ErrorEntry {
    /// Code 0 signals an empty queue.
    pub fn is_no_error(&self) -> bool {
        self.code == 0
    }
}

impl std::fmt::Display for ErrorEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},\"{}\"", self.code, self.message)
    }
}

impl FromStr for ErrorEntry {
    type Err = ScpiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (code, message) = s.split_once(',').unwrap_or((s, ""));
        let code = code.trim().parse::<i32>().map_err(|_| ScpiError::Parse {
            token: code.to_string(),
            position: 0,
        })?;
        Ok(ErrorEntry {
            code,
            message: message.trim().trim_matches('"').to_string(),
        })
    }
}

#[test]
fn idn_scenario() {
    let codec = ScpiCodec::default();
    assert_eq!(codec.encode("*IDN?").unwrap(), b"*IDN?\n");
    assert_eq!(
        codec.decode_text(b"ACME,Model1,SN1,1.0\n"),
        "ACME,Model1,SN1,1.0"
    );
}

#[test]
fn curve_scenario() {
    let mut reply = b"#800000005".to_vec();
    reply.extend_from_slice(&[1, 2, 3, 4, 5]);
    let block = decode_block(&reply).unwrap();
    assert_eq!(block.declared_len(), 5);
    assert_eq!(block.as_bytes(), &[1, 2, 3, 4, 5]);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encode_decode_text_roundtrip() {
        let codec = ScpiCodec::default();
        for cmd in ["*RST", ":CHAN1:SCAL 0.5", "MEAS:VOLT? CH1", "", "SYST:ERR?"] {
            let encoded = codec.encode(cmd).unwrap();
            assert_eq!(codec.decode_text(&encoded), cmd);
        }
    }

    #[test]
    fn encode_rejects_embedded_terminator() {
        let codec = ScpiCodec::default();
        assert_eq!(
            codec.encode("*RST\n*IDN?"),
            Err(ScpiError::Encode {
                command: "*RST\n*IDN?".to_string()
            })
        );

        let crlf = ScpiCodec::new(b'\r');
        assert!(crlf.encode("a\rb").is_err());
        assert_eq!(crlf.encode("a\nb").unwrap(), b"a\nb\r");
    }

    #[test]
    fn decode_text_strips_whitespace() {
        let codec = ScpiCodec::default();
        assert_eq!(codec.decode_text(b"  1.25 \r\n"), "  1.25");
        assert_eq!(codec.decode_text(b""), "");
        assert_eq!(codec.decode_text(b"\n"), "");
    }

    #[test]
    fn decode_lines() {
        let codec = ScpiCodec::default();
        assert_eq!(
            codec.decode_lines(b"first\r\nsecond\nthird\n"),
            vec!["first", "second", "third"]
        );
        assert!(codec.decode_lines(b"\n").is_empty());
    }

    #[test]
    fn block_roundtrip() {
        for data in [vec![], vec![0x0a], vec![b'#'; 9], (0..=255).collect::<Vec<u8>>()] {
            let framed = frame_block(&data);
            assert_eq!(decode_block(&framed).unwrap().into_bytes(), data);
        }
    }

    #[test]
    fn frame_block_header() {
        assert_eq!(frame_block(b"abc"), b"#13abc");
        assert_eq!(&frame_block(&[0; 10])[..4], b"#210");
        assert_eq!(frame_block(&[]), b"#10");
    }

    #[test]
    fn empty_block() {
        let block = decode_block(b"#10\n").unwrap();
        assert_eq!(block.declared_len(), 0);
        assert!(block.is_empty());
    }

    #[test]
    fn block_trailing_terminator_is_ignored() {
        let block = decode_block(b"#15hello\n").unwrap();
        assert_eq!(block.as_bytes(), b"hello");
    }

    #[test]
    fn truncated_block() {
        let err = decode_block(b"#210abc").unwrap_err();
        assert_eq!(
            err,
            FramingError::Truncated {
                declared: 10,
                available: 3
            }
        );
        assert!(err.is_incomplete());
    }

    #[test]
    fn invalid_block_headers() {
        assert_eq!(decode_block(b"#0abc"), Err(FramingError::InvalidDigitCount('0')));
        assert_eq!(decode_block(b"#xabc"), Err(FramingError::InvalidDigitCount('x')));
        assert_eq!(decode_block(b"12345"), Err(FramingError::MissingHash));
        assert_eq!(
            decode_block(b"#2a1"),
            Err(FramingError::InvalidLength("a1".to_string()))
        );
        assert!(!FramingError::MissingHash.is_incomplete());
    }

    #[test]
    fn incomplete_header() {
        for partial in [&b""[..], &b"#"[..], &b"#8000"[..]] {
            let err = decode_block(partial).unwrap_err();
            assert_eq!(err, FramingError::IncompleteHeader);
            assert!(err.is_incomplete());
        }
    }

    #[test]
    fn numeric_list() {
        let values = decode_numeric_list("1.5, -2E-3,+4.0e+01,9.9E37", ',').unwrap();
        assert_eq!(values, vec![1.5, -0.002, 40.0, 9.9e37]);
        assert_eq!(decode_numeric_list("1;2", ';').unwrap(), vec![1.0, 2.0]);
        assert!(decode_numeric_list("", ',').unwrap().is_empty());
        assert!(decode_numeric_list(" \n", ',').unwrap().is_empty());
    }

    #[test]
    fn numeric_list_reports_bad_token() {
        assert_eq!(
            decode_numeric_list("1.0,2.0,volts,4", ','),
            Err(ScpiError::Parse {
                token: "volts".to_string(),
                position: 2
            })
        );
        assert!(matches!(
            decode_numeric_list("1,", ','),
            Err(ScpiError::Parse { position: 1, .. })
        ));
    }

    #[test]
    fn identification() {
        let idn: Identification = "RIGOL TECHNOLOGIES,DS1104Z,DS1ZA1234,00.04.04.SP3"
            .parse()
            .unwrap();
        assert_eq!(idn.manufacturer, "RIGOL TECHNOLOGIES");
        assert_eq!(idn.model, "DS1104Z");
        assert_eq!(idn.serial, "DS1ZA1234");
        assert_eq!(idn.firmware, "00.04.04.SP3");
        assert!("ACME,Model1".parse::<Identification>().is_err());
    }

    #[test]
    fn error_entries() {
        let entry: ErrorEntry = "-113,\"Undefined header\"".parse().unwrap();
        assert_eq!(entry.code, -113);
        assert_eq!(entry.message, "Undefined header");
        assert!(!entry.is_no_error());
        assert_eq!(entry.to_string(), "-113,\"Undefined header\"");

        let empty: ErrorEntry = "+0,\"No error\"\n".parse().unwrap();
        assert!(empty.is_no_error());
        assert!("garbage".parse::<ErrorEntry>().is_err());
    }
}
