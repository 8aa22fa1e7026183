//! Suunto-style device backend (D9 and friends).
//!
//! These devices serve arbitrary memory ranges through a length-prefixed
//! command set. Dive storage is a single profile ringbuffer in which each
//! dive leads with a pair of chain pointers, linking all dives into a list
//! that is traversed backwards from the newest one.
//!
//! # Wire format
//!
//! Commands and responses share one frame shape with a trailing XOR
//! checksum over everything before it:
//!
//! ```text
//! +-----+------+------+-------------------+-----+
//! | cmd | 0x00 | plen |     payload       | xor |
//! +-----+------+------+-------------------+-----+
//! ```
//!
//! A memory read is `05 00 03 addr_hi addr_lo count xor`; the response
//! echoes the six command bytes, then carries `count` data bytes and the
//! checksum. Writes use command `06` and are acknowledged with an empty
//! frame.
//!
//! # Dive extraction
//!
//! A fixed header block names the newest dive, the dive count and the used
//! window of the ringbuffer. The used window is read backwards in packets
//! as large as the wrap point allows, so one packet routinely straddles
//! dive boundaries; surplus bytes past the front of the current dive are
//! kept for the dives that follow. Each dive's first four bytes hold the
//! chain pointers, and a fixed slice of its header serves as the
//! fingerprint that ends an incremental download early.

use log::{debug, warn};

use crate::core::array::{u16_le, u24_be, u32_be};
use crate::core::checksum::checksum_xor;
use crate::core::ringbuf::{contains, ringbuf_distance};
use crate::device::{DeviceEvent, DiveCallback, DiveComputer, EventSink};
use crate::error::{Error, Result};
use crate::transport::{FlushQueue, SerialSettings, Transport};
use crate::{MAX_RETRIES, TIMEOUT_MS};

/// Version block size in bytes.
pub const SZ_VERSION: usize = 4;

/// Maximum payload bytes per read/write transaction.
pub const SZ_PACKET: usize = 0x78;

/// Minimum bytes per read; the devices answer shorter reads unreliably.
pub const SZ_MINIMUM: usize = 8;

/// Fingerprint width in bytes.
pub const SZ_FINGERPRINT: usize = 7;

/// Address of the ringbuffer header block.
const HEADER_ADDRESS: u32 = 0x0190;

/// Offset of the fingerprint slice from the front of a dive.
const FP_OFFSET: usize = 0x15;

/// The HelO2 carries extra gas fields; its fingerprint sits 6 bytes deeper.
const MODEL_HELO2: u32 = 0x15;

/// Memory layout of one Suunto-style device model.
#[derive(Debug, Clone, Copy)]
pub struct SuuntoLayout {
    /// Total addressable memory in bytes.
    pub memsize: u32,

    /// Address of the serial number.
    pub serial: u32,

    /// Profile ringbuffer window, half-open.
    pub rb_profile_begin: u32,
    pub rb_profile_end: u32,
}

/// Layout of the D9.
pub static D9: SuuntoLayout = SuuntoLayout {
    memsize: 0x3440,
    serial: 0x0023,
    rb_profile_begin: 0x019A,
    rb_profile_end: 0x3400,
};

/// A session with a Suunto-style dive computer.
pub struct SuuntoDevice<T: Transport> {
    transport: T,
    layout: &'static SuuntoLayout,
    fingerprint: [u8; SZ_FINGERPRINT],
    events: Option<EventSink>,
}

impl<T: Transport> SuuntoDevice<T> {
    /// Opens a session over the given transport.
    pub fn open(mut transport: T, layout: &'static SuuntoLayout) -> Result<Self> {
        transport.configure(SerialSettings::new(9600))?;
        transport.set_timeout(TIMEOUT_MS)?;
        transport.flush(FlushQueue::Both)?;
        Ok(Self {
            transport,
            layout,
            fingerprint: [0; SZ_FINGERPRINT],
            events: None,
        })
    }

    /// Installs a sink for progress and device-info notifications.
    pub fn set_event_sink(&mut self, sink: EventSink) {
        self.events = Some(sink);
    }

    /// Reads the 4-byte version block: model, then 24-bit firmware.
    pub fn read_version(&mut self) -> Result<[u8; SZ_VERSION]> {
        let command = [0x0F, 0x00, 0x00, 0x0F];
        let payload = self.transfer(&command, &[0x05, 0x00, 0x04], SZ_VERSION)?;

        let mut version = [0u8; SZ_VERSION];
        version.copy_from_slice(&payload);
        Ok(version)
    }

    /// Clears the maximum-depth record on the device.
    pub fn reset_maxdepth(&mut self) -> Result<()> {
        let command = [0x20, 0x00, 0x00, 0x20];
        self.transfer(&command, &[0x20, 0x00, 0x00], 0)?;
        Ok(())
    }

    /// Reads `size` bytes of device memory starting at `address`.
    pub fn read_memory(&mut self, address: u32, size: usize) -> Result<Vec<u8>> {
        let mut address = address;
        let mut data = Vec::with_capacity(size);
        while data.len() < size {
            let len = (size - data.len()).min(SZ_PACKET);
            let mut command = vec![
                0x05,
                0x00,
                0x03,
                (address >> 8) as u8,
                address as u8,
                len as u8,
                0x00,
            ];
            command[6] = checksum_xor(&command[..6], 0x00);

            // The response opens by echoing the six command bytes.
            let payload = self.transfer(&command, &command[..6], len)?;
            data.extend_from_slice(&payload);
            address += len as u32;
        }
        Ok(data)
    }

    /// Writes `data` to device memory starting at `address`.
    pub fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let mut address = address;
        let mut nbytes = 0;
        while nbytes < data.len() {
            let len = (data.len() - nbytes).min(SZ_PACKET);
            let mut command = Vec::with_capacity(len + 7);
            command.extend_from_slice(&[
                0x06,
                0x00,
                len as u8 + 3,
                (address >> 8) as u8,
                address as u8,
                len as u8,
            ]);
            command.extend_from_slice(&data[nbytes..nbytes + len]);
            command.push(checksum_xor(&command, 0x00));

            self.transfer(&command, &[0x06, 0x00, 0x00], 0)?;
            nbytes += len;
            address += len as u32;
        }
        Ok(())
    }

    /// Extracts all recorded dives, newest first, stopping early at the
    /// stored fingerprint.
    pub fn read_dives(&mut self, callback: DiveCallback<'_>) -> Result<()> {
        let layout = *self.layout;
        let rb_begin = layout.rb_profile_begin;
        let rb_end = layout.rb_profile_end;
        let rb_span = rb_end - rb_begin;

        let mut maximum = rb_span + 8 + (SZ_VERSION + SZ_MINIMUM) as u32;
        let mut progress = 0u32;
        self.emit(DeviceEvent::Progress {
            current: progress,
            maximum,
        });

        let version = self.read_version()?;
        progress += SZ_VERSION as u32;
        self.emit(DeviceEvent::Progress {
            current: progress,
            maximum,
        });

        let serial = self.read_memory(layout.serial, SZ_MINIMUM)?;
        progress += SZ_MINIMUM as u32;
        self.emit(DeviceEvent::Progress {
            current: progress,
            maximum,
        });

        let model = version[0] as u32;
        self.emit(DeviceEvent::DeviceInfo {
            model,
            firmware: u24_be(&version[1..]),
            serial: u32_be(&serial),
        });

        let header = self.read_memory(HEADER_ADDRESS, 8)?;
        let last = u16_le(&header[0..]) as u32;
        let count = u16_le(&header[2..]) as u32;
        let end = u16_le(&header[4..]) as u32;
        let begin = u16_le(&header[6..]) as u32;
        debug!("profile: last={last:#06x} count={count} end={end:#06x} begin={begin:#06x}");
        if !contains(last, rb_begin, rb_end)
            || !contains(end, rb_begin, rb_end)
            || !contains(begin, rb_begin, rb_end)
        {
            warn!("invalid ringbuffer pointer");
            return Err(Error::DataFormat);
        }

        // With a non-zero dive count, begin == end means the ring is full,
        // not empty.
        let mut remaining = ringbuf_distance(begin, end, rb_begin, rb_end, count != 0);

        maximum -= rb_span - remaining;
        progress += 8;
        self.emit(DeviceEvent::Progress {
            current: progress,
            maximum,
        });

        // One scratch allocation for the whole download, filled backwards
        // from the top. The extra tail absorbs minimum-size read padding.
        let mut data = vec![0u8; rb_span as usize + SZ_MINIMUM];

        // Packets are read as large as possible, so the last packet of a
        // dive usually straddles into older dives; those surplus bytes are
        // kept for the next iteration.
        let mut available: u32 = 0;

        let mut current = last;
        let mut previous = end;
        let mut address = previous;
        let mut offset = remaining as usize + SZ_MINIMUM;

        // An incomplete dive is skipped rather than aborting the download;
        // the failure is reported once the traversal is done.
        let mut status = Ok(());

        while remaining > 0 {
            let size = ringbuf_distance(current, previous, rb_begin, rb_end, true);
            if size < 4 || size > remaining {
                warn!("unexpected dive size {size}");
                return Err(Error::DataFormat);
            }

            let mut nbytes = available;
            while nbytes < size {
                if address == rb_begin {
                    address = rb_end;
                }

                // Largest possible packet, clipped at the wrap point and at
                // the end of the used window.
                let mut len = SZ_PACKET as u32;
                if rb_begin + len > address {
                    len = address - rb_begin;
                }
                if nbytes + len > remaining {
                    len = remaining - nbytes;
                }

                offset -= len as usize;
                address -= len;

                // Short reads are unreliable; widen them leftwards to the
                // minimum. The surplus lands below the write cursor and is
                // ignored, since the buffer fills backwards.
                let extra = SZ_MINIMUM.saturating_sub(len as usize);

                let chunk = self.read_memory(address - extra as u32, len as usize + extra)?;
                data[offset - extra..offset + len as usize].copy_from_slice(&chunk);

                progress += len;
                self.emit(DeviceEvent::Progress {
                    current: progress,
                    maximum,
                });

                nbytes += len;
            }

            remaining -= size;
            available = nbytes - size;

            // The dive's first packet (read last) leads with the chain
            // pointers: previous dive, then next dive.
            let front = offset + available as usize;
            let prev = u16_le(&data[front..]) as u32;
            let next = u16_le(&data[front + 2..]) as u32;
            if !contains(prev, rb_begin, rb_end) || !contains(next, rb_begin, rb_end) {
                warn!("invalid dive chain pointer");
                return Err(Error::DataFormat);
            }
            if next != previous && next != current {
                warn!("dive chain is not continuous");
                return Err(Error::DataFormat);
            }

            if next == current {
                // A dive linked to itself never finished recording.
                warn!("skipping incomplete dive");
                status = Err(Error::DataFormat);
            } else {
                let mut fp_offset = FP_OFFSET;
                if model == MODEL_HELO2 {
                    fp_offset += 6;
                }
                if front + fp_offset + SZ_FINGERPRINT > data.len() {
                    warn!("dive too small to carry a fingerprint");
                    return Err(Error::DataFormat);
                }

                let fingerprint = &data[front + fp_offset..front + fp_offset + SZ_FINGERPRINT];
                if fingerprint == &self.fingerprint[..] {
                    return Ok(());
                }
                if !callback(&data[front + 4..front + size as usize], fingerprint) {
                    return Ok(());
                }
            }

            previous = current;
            current = prev;
        }

        status
    }

    fn emit(&mut self, event: DeviceEvent) {
        if let Some(sink) = self.events.as_mut() {
            sink(event);
        }
    }

    /// Issues one command and receives one framed response, retrying on a
    /// timeout or a corrupted packet up to [`MAX_RETRIES`] times. The
    /// response must open with `prefix` and carry `psize` payload bytes;
    /// the payload is returned.
    fn transfer(&mut self, command: &[u8], prefix: &[u8], psize: usize) -> Result<Vec<u8>> {
        let mut nretries = 0;
        loop {
            match self.packet(command, prefix, psize) {
                // A corrupted packet is discarded and requested again.
                Err(e) if e.is_retryable() => {
                    if nretries >= MAX_RETRIES {
                        return Err(e);
                    }
                    nretries += 1;
                }
                other => return other,
            }
        }
    }

    fn packet(&mut self, command: &[u8], prefix: &[u8], psize: usize) -> Result<Vec<u8>> {
        let asize = prefix.len() + psize + 1;

        self.transport.write(command)?;
        self.transport.drain()?;

        let mut answer = vec![0u8; asize];
        let nbytes = self.transport.read(&mut answer)?;
        if nbytes != asize {
            warn!("short answer: {nbytes} of {asize} bytes");
            return Err(Error::Timeout);
        }

        // A valid frame XORs to zero including its trailing checksum.
        if checksum_xor(&answer, 0x00) != 0 {
            warn!("answer checksum mismatch");
            return Err(Error::Protocol);
        }
        if &answer[..prefix.len()] != prefix {
            warn!("unexpected answer header {:02X?}", &answer[..prefix.len()]);
            return Err(Error::Protocol);
        }

        answer.truncate(asize - 1);
        answer.drain(..prefix.len());
        Ok(answer)
    }
}

impl<T: Transport> DiveComputer for SuuntoDevice<T> {
    fn set_fingerprint(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            self.fingerprint = [0; SZ_FINGERPRINT];
            return Ok(());
        }
        if data.len() != SZ_FINGERPRINT {
            return Err(Error::InvalidArgs);
        }
        self.fingerprint.copy_from_slice(data);
        Ok(())
    }

    fn version(&mut self, data: &mut [u8]) -> Result<()> {
        if data.len() < SZ_VERSION {
            return Err(Error::InvalidArgs);
        }
        let version = self.read_version()?;
        data[..SZ_VERSION].copy_from_slice(&version);
        Ok(())
    }

    fn dump(&mut self, buffer: &mut Vec<u8>) -> Result<()> {
        *buffer = self.read_memory(0, self.layout.memsize as usize)?;
        Ok(())
    }

    fn foreach(&mut self, callback: DiveCallback<'_>) -> Result<()> {
        self.read_dives(callback)
    }
}
