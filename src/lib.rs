#![deny(missing_docs)]

//! One serial device, shared over TCP.
//!
//! A [`bridge::Bridge`] opens the configured serial device and serves any
//! number of plain TCP sessions at once. Everything the device emits is
//! broadcast to every session, everything any session sends is written to
//! the device, and an unplugged device is picked up again the moment it
//! reappears.
//!
//! Nothing fancier than `nc` or `telnet` is needed on the client side.

/// Moving bytes between the serial link and the TCP sessions.
pub mod bridge;

/// The command line interface.
pub mod cli;

/// Configuration of the serial device and the server, loadable from RON.
pub mod config;

/// Possible errors in this library.
pub mod error;

/// Supervision of the one serial device.
pub mod link;

/// Logging (tracing) setup.
pub mod logging;

/// A mock serial device for tests.
pub mod mock;

/// The TCP listener and the session registry.
pub mod server;

/// One connected TCP peer.
pub mod session;
