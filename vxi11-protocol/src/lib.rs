//! # VXI-11 Protocol Library
//!
//! This crate provides the wire formats needed to talk to LAN instruments (oscilloscopes,
//! power supplies, ...) using the [VXI-11](https://www.vxibus.org/specifications.html)
//! protocol, together with a codec for the SCPI commands carried inside it.
//!
//! ## Overview
//!
//! VXI-11 is an ONC RPC program. A client first asks the portmapper of the instrument for
//! the port of the *core channel*, opens a link to a named device (`inst0`), and then
//! exchanges opaque byte messages with `device_write` and `device_read`. A separate
//! *abort channel* allows interrupting a blocked call without tearing down the link.
//!
//! This library implements:
//!
//! - XDR encoding of primitive items ([`xdr`])
//! - ONC RPC call and reply headers ([`rpc`])
//! - Record marking for RPC over TCP ([`codec`])
//! - The VXI-11 argument and result records and status codes ([`protocol`])
//! - Encoding of SCPI commands and decoding of text, numeric lists and
//!   `#<n><length><data>` blocks ([`scpi`])
//!
//! ## Basic Usage
//!
//! ### Building a call
//!
//! ```
//! use vxi11_protocol::rpc::{CallHeader, encode_call};
//! use vxi11_protocol::{CoreProcedure, CreateLinkParms, DEVICE_CORE_PROGRAM, DEVICE_CORE_VERSION};
//!
//! let header = CallHeader {
//!     xid: 1,
//!     program: DEVICE_CORE_PROGRAM,
//!     version: DEVICE_CORE_VERSION,
//!     procedure: CoreProcedure::CreateLink as u32,
//! };
//! let parms = CreateLinkParms {
//!     client_id: 42,
//!     lock_device: false,
//!     lock_timeout: 0,
//!     device: "inst0".to_string(),
//! };
//! let message = encode_call(&header, &parms);
//! assert_eq!(&message[..4], &[0, 0, 0, 1]);
//! ```
//!
//! ### Decoding SCPI replies
//!
//! ```
//! use vxi11_protocol::scpi::{ScpiCodec, decode_block, decode_numeric_list};
//!
//! let codec = ScpiCodec::default();
//! assert_eq!(codec.encode("*IDN?").expect("no embedded newline"), b"*IDN?\n");
//! assert_eq!(codec.decode_text(b"ACME,Model1,SN1,1.0\n"), "ACME,Model1,SN1,1.0");
//!
//! let block = decode_block(b"#15hello\n").expect("Block should parse");
//! assert_eq!(block.as_bytes(), b"hello");
//!
//! let values = decode_numeric_list("1.0,2.5E-3", ',').expect("Numbers should parse");
//! assert_eq!(values, vec![1.0, 0.0025]);
//! ```
//!
//! ## Error Handling
//!
//! Decoding of RPC data fails with [`error::DecodeError`], SCPI encoding and decoding with
//! [`error::ScpiError`].
//!
//! ## Features
//!
//! - `tokio`: adds [`codec::RecordCodec`], a `tokio_util` codec for record marking.

pub mod protocol;
pub use protocol::*;
pub mod codec;
pub mod error;
pub mod rpc;
pub mod scpi;
pub mod xdr;
