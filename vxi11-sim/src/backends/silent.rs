//! # Silent Backend
//!
//! Accepts every message and never answers. Every read waits for its I/O timeout or an
//! abort, which makes this backend useful to exercise client timeout handling.
use vxi11_server::Instrument;

pub struct SilentInstrument;

impl Instrument for SilentInstrument {
    fn write(&mut self, message: &[u8]) {
        log::debug!("Ignoring {} byte message", message.len());
    }

    fn read(&mut self) -> Option<Vec<u8>> {
        None
    }
}
