//! # VXI-11 Server Library
//!
//! This crate provides a foundation for serving instruments over the VXI-11 protocol,
//! so that any VXI-11 client (including [`vxi11_client`](https://docs.rs/vxi11-client/))
//! can talk to them.
//!
//! ## Overview
//!
//! VXI-11 carries opaque instrument messages (usually SCPI) over ONC RPC. This library
//! handles the RPC plumbing and link bookkeeping, and leaves the interpretation of the
//! messages to a backend implementing the [`Instrument`] trait.
//!
//! ## Architecture
//!
//! - **[`Instrument`] Trait**: what a backend does with a complete message and what it
//!   answers
//! - **[`server::Server`]**: a tokio server that answers portmapper queries and the core
//!   channel on one port, and the abort channel on a second port
//!
//! ## How It Works
//!
//! 1. A client asks the portmapper for the core channel port (always the listening port)
//! 2. `create_link` creates a fresh backend instance for the link through the factory
//!    passed to the server
//! 3. `device_write` chunks are collected until the END flag, then handed to
//!    [`Instrument::write`]
//! 4. `device_read` returns the answer of [`Instrument::read`], split into chunks of the
//!    requested size. When there is no answer, the read waits for its I/O timeout, or
//!    until a `device_abort` arrives on the abort channel
//! 5. Links are destroyed with `destroy_link` or when their connection closes
//!
//! ## Basic Usage
//!
//! ```ignore
//! use vxi11_server::{Instrument, server::Builder};
//! use tokio_util::sync::CancellationToken;
//!
//! struct Echo(Option<Vec<u8>>);
//!
//! impl Instrument for Echo {
//!     fn write(&mut self, message: &[u8]) {
//!         self.0 = Some(message.to_vec());
//!     }
//!
//!     fn read(&mut self) -> Option<Vec<u8>> {
//!         self.0.take()
//!     }
//! }
//!
//! let server = Builder::new().build(|_device: &str| Echo(None));
//! let listening = server.bind("127.0.0.1:1024").await?;
//! listening.serve(CancellationToken::new()).await?;
//! ```
//!
//! ## Locking
//!
//! A link may lock its device with `device_lock`. Writes and reads of other links to the
//! same device wait for the lock up to their lock timeout (with the wait flag) or fail
//! with "device locked by another link".
//!
//! ## Logging
//!
//! This crate uses the `log` crate. Connections, link creation and destruction are logged
//! at `info`, each call at `debug`.
pub mod server;

/// Backend of one link.
///
/// A new instance is created for every link, so backends need no synchronisation.
pub trait Instrument: Send + 'static {
    /// Handles a complete message, i.e. all chunks up to the one with the END flag.
    fn write(&mut self, message: &[u8]);

    /// Returns the pending response, if any.
    ///
    /// Returning `None` leaves the reading client waiting until its I/O timeout.
    fn read(&mut self) -> Option<Vec<u8>>;

    /// IEEE 488.2 status byte.
    fn read_stb(&mut self) -> u8 {
        0
    }

    fn trigger(&mut self) {}

    /// Device clear. Pending input and output of the link are discarded by the server.
    fn clear(&mut self) {}
}

impl<I: Instrument + ?Sized> Instrument for Box<I> {
    fn write(&mut self, message: &[u8]) {
        (**self).write(message)
    }

    fn read(&mut self) -> Option<Vec<u8>> {
        (**self).read()
    }

    fn read_stb(&mut self) -> u8 {
        (**self).read_stb()
    }

    fn trigger(&mut self) {
        (**self).trigger()
    }

    fn clear(&mut self) {
        (**self).clear()
    }
}
