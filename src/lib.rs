//! Download recorded dive logs from consumer dive computers over a serial
//! line and decode the binary records they expose.
//!
//! The crate is organized around three layers:
//!
//! - [`transport`]: a byte-oriented duplex channel with timeout, drain and
//!   flush. [`transport::SerialTransport`] talks to real hardware; the
//!   in-memory transports exercise the protocol code without a device.
//! - Device backends ([`oceanic`], [`suunto`]): the request/response wire
//!   protocol of one device family plus the ringbuffer extraction that
//!   reconstructs discrete dives in most-recent-first order.
//! - [`memomouse`]: a record parser turning one raw dive into header fields
//!   and a time-ordered sample stream.
//!
//! Backends implement the [`DiveComputer`] trait. Dives are delivered
//! through a callback as `(raw_bytes, fingerprint)` pairs; storing the
//! fingerprint of the newest downloaded dive and handing it back via
//! [`DiveComputer::set_fingerprint`] turns the next download into an
//! incremental one.

pub mod core;
pub mod device;
pub mod error;
pub mod memomouse;
pub mod oceanic;
pub mod suunto;
pub mod transport;

pub use device::{DeviceEvent, DiveCallback, DiveComputer};
pub use error::{Error, Result};
pub use transport::{SerialSettings, Transport};

/// Maximum number of retries after a timeout or a corrupted packet.
///
/// Occasionally a dive computer does not respond to a command, or responds
/// with a garbled packet. The command is reissued up to this many times
/// before the error is surfaced.
pub const MAX_RETRIES: u32 = 2;

/// Receive timeout for transport reads, in milliseconds.
pub const TIMEOUT_MS: u32 = 3000;
