//! # Generic SCPI Backend
//!
//! A small SCPI instrument with the IEEE 488.2 common commands and an error queue.
//!
//! ## Commands
//!
//! | command                     | effect |
//! |-----------------------------|--------|
//! | `*IDN?`                     | identity, `manufacturer,model,serial,firmware` |
//! | `*RST`                      | resets the echo value and clears the error queue |
//! | `*CLS`                      | clears the error queue |
//! | `*OPC?`                     | `1` |
//! | `*STB?`                     | status byte |
//! | `:SYSTem:ERRor[:NEXT]?`     | next error queue entry, `0,"No error"` when empty |
//! | `ECHO <text>` / `ECHO?`     | stores and returns a value |
//! | `CURVe?` / `:WAVeform:DATA?`| a waveform as a `#<n><length><data>` block of bytes |
//! | `:DATA:LIST?`               | the waveform as a comma separated list of volts |
//!
//! Several commands may be sent in one message, separated by `;` or newlines. Unknown
//! headers queue `-113,"Undefined header"`.
use std::{collections::VecDeque, f64::consts::TAU};

use vxi11_protocol::scpi::{ErrorEntry, ScpiCodec, frame_block};
use vxi11_server::Instrument;

pub const DEFAULT_SAMPLES: usize = 1000;

/// Entries beyond this are dropped and replaced by a queue overflow entry.
const ERROR_QUEUE_LEN: usize = 16;

/// Status byte bits.
const STB_ERROR_QUEUE: u8 = 0x04;
const STB_MESSAGE_AVAILABLE: u8 = 0x10;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Identity {
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    pub firmware: String,
}

impl Default for Identity {
    fn default() -> Self {
        Identity {
            manufacturer: "VXI11-RS".to_string(),
            model: "SIM-1".to_string(),
            serial: "0001".to_string(),
            firmware: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

pub struct GenericInstrument {
    identity: Identity,
    samples: usize,
    codec: ScpiCodec,
    echo: String,
    errors: VecDeque<ErrorEntry>,
    responses: VecDeque<Vec<u8>>,
}

/// Case-insensitive header match ignoring a leading colon.
fn is_header(header: &str, forms: &[&str]) -> bool {
    let header = header.trim_start_matches(':');
    forms.iter().any(|form| form.eq_ignore_ascii_case(header))
}

impl GenericInstrument {
    pub fn new(identity: Identity, samples: usize) -> GenericInstrument {
        GenericInstrument {
            identity,
            samples,
            codec: ScpiCodec::default(),
            echo: String::new(),
            errors: VecDeque::new(),
            responses: VecDeque::new(),
        }
    }

    fn respond(&mut self, text: &str) {
        let mut response = text.as_bytes().to_vec();
        response.push(self.codec.terminator());
        self.responses.push_back(response);
    }

    fn push_error(&mut self, code: i32, message: &str) {
        if self.errors.len() >= ERROR_QUEUE_LEN {
            self.errors.pop_back();
            self.errors.push_back(ErrorEntry {
                code: -350,
                message: "Queue overflow".to_string(),
            });
            return;
        }
        self.errors.push_back(ErrorEntry {
            code,
            message: message.to_string(),
        });
    }

    fn status_byte(&self) -> u8 {
        let mut stb = 0;
        if !self.errors.is_empty() {
            stb |= STB_ERROR_QUEUE;
        }
        if !self.responses.is_empty() {
            stb |= STB_MESSAGE_AVAILABLE;
        }
        stb
    }

    fn waveform(&self) -> impl Iterator<Item = f64> + '_ {
        (0..self.samples).map(|i| (i as f64 / self.samples as f64 * TAU).sin())
    }

    fn execute(&mut self, command: &str) {
        let (header, argument) = match command.split_once(char::is_whitespace) {
            Some((header, argument)) => (header, argument.trim()),
            None => (command, ""),
        };
        log::debug!("Executing {:?}", command);

        if is_header(header, &["*IDN?"]) {
            let Identity {
                manufacturer,
                model,
                serial,
                firmware,
            } = &self.identity;
            let idn = format!("{},{},{},{}", manufacturer, model, serial, firmware);
            self.respond(&idn);
        } else if is_header(header, &["*RST"]) {
            self.echo.clear();
            self.errors.clear();
            self.responses.clear();
        } else if is_header(header, &["*CLS"]) {
            self.errors.clear();
        } else if is_header(header, &["*OPC?"]) {
            self.respond("1");
        } else if is_header(header, &["*STB?"]) {
            let stb = self.status_byte();
            self.respond(&stb.to_string());
        } else if is_header(
            header,
            &["SYST:ERR?", "SYSTEM:ERROR?", "SYST:ERR:NEXT?", "SYSTEM:ERROR:NEXT?"],
        ) {
            let entry = self.errors.pop_front().unwrap_or(ErrorEntry {
                code: 0,
                message: "No error".to_string(),
            });
            self.respond(&entry.to_string());
        } else if is_header(header, &["ECHO"]) {
            self.echo = argument.to_string();
        } else if is_header(header, &["ECHO?"]) {
            let echo = self.echo.clone();
            self.respond(&echo);
        } else if is_header(header, &["CURV?", "CURVE?", "WAV:DATA?", "WAVEFORM:DATA?"]) {
            let data: Vec<u8> = self
                .waveform()
                .map(|v| (v * 127.0 + 128.0).round().clamp(0.0, 255.0) as u8)
                .collect();
            let mut response = frame_block(&data);
            response.push(self.codec.terminator());
            self.responses.push_back(response);
        } else if is_header(header, &["DATA:LIST?"]) {
            let list = self
                .waveform()
                .map(|v| format!("{:.6}", v))
                .collect::<Vec<_>>()
                .join(",");
            self.respond(&list);
        } else {
            log::debug!("Undefined header {:?}", header);
            self.push_error(-113, "Undefined header");
        }
    }
}

impl Instrument for GenericInstrument {
    fn write(&mut self, message: &[u8]) {
        for line in self.codec.decode_lines(message) {
            for command in line.split(';').map(str::trim).filter(|c| !c.is_empty()) {
                self.execute(command);
            }
        }
    }

    fn read(&mut self) -> Option<Vec<u8>> {
        self.responses.pop_front()
    }

    fn read_stb(&mut self) -> u8 {
        self.status_byte()
    }

    fn clear(&mut self) {
        self.responses.clear();
    }
}

#[cfg(test)]
mod test {
    use vxi11_protocol::scpi::{Identification, decode_block, decode_numeric_list};

    use super::*;

    fn instrument() -> GenericInstrument {
        GenericInstrument::new(Identity::default(), 100)
    }

    fn query(instrument: &mut GenericInstrument, command: &str) -> String {
        instrument.write(format!("{}\n", command).as_bytes());
        let response = instrument.read().expect("query should be answered");
        ScpiCodec::default().decode_text(&response)
    }

    #[test]
    fn identity() {
        let mut instrument = instrument();
        let idn: Identification = query(&mut instrument, "*IDN?").parse().unwrap();
        assert_eq!(idn.manufacturer, "VXI11-RS");
        assert_eq!(idn.model, "SIM-1");
    }

    #[test]
    fn error_queue() {
        let mut instrument = instrument();
        instrument.write(b"FOO\n");
        assert_eq!(instrument.read_stb() & STB_ERROR_QUEUE, STB_ERROR_QUEUE);
        assert_eq!(query(&mut instrument, ":SYST:ERR?"), "-113,\"Undefined header\"");
        assert_eq!(query(&mut instrument, "syst:err?"), "0,\"No error\"");
        assert_eq!(instrument.read_stb(), 0);
    }

    #[test]
    fn clear_status_and_reset() {
        let mut instrument = instrument();
        instrument.write(b"FOO;BAR\n");
        instrument.write(b"*CLS\n");
        assert_eq!(query(&mut instrument, ":SYST:ERR?"), "0,\"No error\"");

        instrument.write(b"ECHO hello world\n");
        assert_eq!(query(&mut instrument, "ECHO?"), "hello world");
        instrument.write(b"*RST\n");
        assert_eq!(query(&mut instrument, "ECHO?"), "");
    }

    #[test]
    fn queue_overflow() {
        let mut instrument = instrument();
        for _ in 0..ERROR_QUEUE_LEN + 4 {
            instrument.write(b"FOO\n");
        }
        let mut last = String::new();
        for _ in 0..ERROR_QUEUE_LEN {
            last = query(&mut instrument, ":SYST:ERR?");
        }
        assert_eq!(last, "-350,\"Queue overflow\"");
        assert_eq!(query(&mut instrument, ":SYST:ERR?"), "0,\"No error\"");
    }

    #[test]
    fn waveform_block() {
        let mut instrument = instrument();
        instrument.write(b"CURV?\n");
        let response = instrument.read().unwrap();
        assert!(response.starts_with(b"#3100"));
        let block = decode_block(&response).unwrap();
        assert_eq!(block.len(), 100);
        assert_eq!(block.as_bytes()[0], 128);
    }

    #[test]
    fn numeric_list() {
        let mut instrument = instrument();
        let values = decode_numeric_list(&query(&mut instrument, ":DATA:LIST?"), ',').unwrap();
        assert_eq!(values.len(), 100);
        assert_eq!(values[0], 0.0);
        assert!(values.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn several_commands_per_message() {
        let mut instrument = instrument();
        instrument.write(b"*OPC?;*OPC?\n");
        assert!(instrument.read().is_some());
        assert!(instrument.read().is_some());
        assert!(instrument.read().is_none());
    }
}
