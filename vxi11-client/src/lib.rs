//! # VXI-11 Client
//!
//! A blocking client for LAN instruments that speak VXI-11, exposing a SCPI
//! command/response interface.
//!
//! ## Overview
//!
//! A [`DeviceSession`] owns one link to one instrument. Opening a session asks the
//! portmapper of the instrument for the core channel port, connects, and creates a link
//! to the named device. Every operation is bounded by the configured timeout. An
//! operation that times out sends an abort on the abort channel so the link stays usable.
//!
//! For the protocol details, see the [`vxi11_protocol`] crate.
//!
//! ## Basic Usage
//!
//! ### Connecting to an Instrument
//!
//! ```ignore
//! use vxi11_client::{DeviceSession, Config, Endpoint};
//!
//! let endpoint: Endpoint = "TCPIP::192.168.1.10::INSTR".parse()?;
//! let mut session = DeviceSession::open(endpoint, Config::default())?;
//!
//! let idn = session.identify()?;
//! println!("Connected to {} {}", idn.manufacturer, idn.model);
//! ```
//!
//! ### Reading a Waveform
//!
//! ```ignore
//! session.send(":DATA:SOURCE CH1")?;
//! let curve = session.query_binary("CURV?")?;
//! println!("Got {} samples", curve.len());
//! ```
//!
//! ### Aborting from Another Thread
//!
//! ```ignore
//! let handle = session.abort_handle();
//! std::thread::spawn(move || handle.abort());
//! ```
//!
//! ## Drivers
//!
//! Instrument drivers are written against the [`ScpiDevice`] trait. [`Retry`] wraps any
//! device and retries queries that timed out.
//!
//! ## Related Crates
//!
//! - [`vxi11_server`](https://docs.rs/vxi11-server/) - Server implementation
//! - [`vxi11_protocol`](https://docs.rs/vxi11-protocol/) - Protocol encoding/decoding
//! - [`vxi11_sim`](https://docs.rs/vxi11-sim/) - Simulated instruments
mod abort;
mod channel;
mod driver;
mod endpoint;
pub mod error;
pub mod portmap;
mod rpc;
mod session;
pub mod transport;

pub use abort::AbortHandle;
pub use channel::{Link, LinkState};
pub use driver::{Retry, ScpiDevice};
pub use endpoint::{DEFAULT_DEVICE, Endpoint};
pub use error::Error;
pub use session::{Builder, Config, DeviceSession};
pub use vxi11_protocol::scpi::{BlockValue, ErrorEntry, Identification};
