//! Device session abstraction.
//!
//! Each supported device family implements [`DiveComputer`]. A session owns
//! its transport exclusively for its lifetime; dropping the device releases
//! the port. Operations on one session never run concurrently; separate
//! physical devices get separate sessions.

use crate::error::Result;

/// Per-dive callback.
///
/// Invoked once per extracted dive, newest first, with the raw dive bytes
/// and the fingerprint slice identifying the dive. Returning `false` stops
/// the traversal at the next dive boundary; that is not an error.
pub type DiveCallback<'a> = &'a mut dyn FnMut(&[u8], &[u8]) -> bool;

/// Out-of-band notifications emitted while talking to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Download progress in bytes. `current` never decreases within one
    /// operation.
    Progress { current: u32, maximum: u32 },

    /// Identity of the connected device, read before the first dive.
    DeviceInfo {
        model: u32,
        firmware: u32,
        serial: u32,
    },
}

/// Sink receiving [`DeviceEvent`] notifications.
pub type EventSink = Box<dyn FnMut(DeviceEvent)>;

/// Common operations of a connected dive computer.
pub trait DiveComputer {
    /// Stores the fingerprint of the most recent already-downloaded dive.
    ///
    /// [`DiveComputer::foreach`] stops before delivering the dive whose
    /// fingerprint matches, turning the download into an incremental one.
    /// An empty slice clears the fingerprint and disables the early stop.
    fn set_fingerprint(&mut self, data: &[u8]) -> Result<()>;

    /// Reads the device version block into `data`.
    fn version(&mut self, data: &mut [u8]) -> Result<()>;

    /// Downloads a full linear image of the device memory.
    fn dump(&mut self, buffer: &mut Vec<u8>) -> Result<()>;

    /// Extracts all recorded dives, invoking the callback once per dive in
    /// most-recent-first order.
    fn foreach(&mut self, callback: DiveCallback<'_>) -> Result<()>;
}
