//! Oceanic-style device backend (Atom 2 and friends).
//!
//! These devices expose their memory as 16-byte packets behind a simple
//! command set. Dive storage uses two paired ringbuffers: a logbook ring
//! of compact 8-byte index entries and a profile ring holding the sample
//! data each entry points into.
//!
//! # Wire format
//!
//! Requests are raw command bytes. Responses carry a header byte, the
//! payload, and a trailing additive checksum:
//!
//! ```text
//! +--------+-------------------+-----+
//! | header |     payload       | sum |
//! +--------+-------------------+-----+
//! ```
//!
//! The header is `0x5A`, or `0xA5` for the handshake exchange; the
//! checksum is the byte sum of the payload modulo 256.
//!
//! # Dive extraction
//!
//! The pointer block at a fixed address names the first and last logbook
//! entries. The logbook ring is read once and linearized, then walked
//! backwards so the most recent dive comes out first; each entry's packed
//! profile pointers select the slice of the profile ring belonging to that
//! dive. A fixed sentinel pointer value marks an empty logbook, which is
//! how an empty ring is told apart from a single-entry one.

use log::{debug, warn};

use crate::core::array::u16_le;
use crate::core::checksum::checksum_add;
use crate::core::ringbuf::{contains, ringbuf_distance};
use crate::device::{DiveCallback, DiveComputer};
use crate::error::{Error, Result};
use crate::transport::{FlushQueue, SerialSettings, Transport};
use crate::{MAX_RETRIES, TIMEOUT_MS};

/// Payload bytes per read transaction.
pub const PACKET_SIZE: usize = 16;

/// Bytes per logbook entry: two entries per packet.
const ENTRY_SIZE: usize = PACKET_SIZE / 2;

/// Response header byte outside the handshake.
const ACK: u8 = 0x5A;

/// Response header byte during the handshake.
const ACK_HANDSHAKE: u8 = 0xA5;

/// Memory layout of one Oceanic-style device model.
#[derive(Debug, Clone, Copy)]
pub struct OceanicLayout {
    /// Total addressable memory in bytes.
    pub memsize: u32,

    /// Address of the pointer block naming the logbook head and tail.
    pub pointers: u32,

    /// Sentinel pointer value marking an empty logbook.
    pub rb_logbook_empty: u32,

    /// Logbook ringbuffer window, half-open.
    pub rb_logbook_begin: u32,
    pub rb_logbook_end: u32,

    /// Sentinel pointer value marking an empty profile ring.
    pub rb_profile_empty: u32,

    /// Profile ringbuffer window, half-open.
    pub rb_profile_begin: u32,
    pub rb_profile_end: u32,
}

/// Layout of the Atom 2.
pub static ATOM2: OceanicLayout = OceanicLayout {
    memsize: 0x10000,
    pointers: 0x0040,
    rb_logbook_empty: 0x0230,
    rb_logbook_begin: 0x0240,
    rb_logbook_end: 0x0A40,
    rb_profile_empty: 0x0A40,
    rb_profile_begin: 0x0A50,
    rb_profile_end: 0xFFF0,
};

/// A session with an Oceanic-style dive computer.
pub struct OceanicDevice<T: Transport> {
    transport: T,
    layout: &'static OceanicLayout,
}

impl<T: Transport> OceanicDevice<T> {
    /// Opens a session over the given transport.
    ///
    /// Configures the line to 38400 8N1, gives the interface 100 ms to
    /// settle and draw power up, and discards any stale bytes.
    pub fn open(mut transport: T, layout: &'static OceanicLayout) -> Result<Self> {
        transport.configure(SerialSettings::new(38400))?;
        transport.set_timeout(TIMEOUT_MS)?;
        transport.sleep(100);
        transport.flush(FlushQueue::Both)?;
        Ok(Self { transport, layout })
    }

    /// Sends the handshake that connects to the device.
    pub fn handshake(&mut self) -> Result<()> {
        let command = [0xA8, 0x99, 0x00];
        let answer = self.transfer(&command, 3, true)?;
        if answer[0] != 0xA5 {
            warn!("unexpected handshake byte 0x{:02X}", answer[0]);
            return Err(Error::Protocol);
        }
        Ok(())
    }

    /// Tells the device the host is done; it powers its interface down.
    ///
    /// The quit acknowledgement is a single naked byte without a checksum,
    /// so it bypasses the regular transfer path.
    pub fn quit(&mut self) -> Result<()> {
        let command = [0x6A, 0x05, 0xA5, 0x00];
        self.send(&command)?;

        let mut answer = [0u8; 1];
        let nbytes = self.transport.read(&mut answer)?;
        if nbytes != answer.len() {
            warn!("no quit acknowledgement");
            return Err(Error::Timeout);
        }
        if answer[0] != ACK_HANDSHAKE {
            warn!("unexpected quit byte 0x{:02X}", answer[0]);
            return Err(Error::Protocol);
        }
        Ok(())
    }

    /// Reads `size` bytes of device memory starting at `address`.
    ///
    /// Both the address and the size must be multiples of [`PACKET_SIZE`];
    /// the device only serves whole packets, addressed by packet index.
    pub fn read_memory(&mut self, address: u32, size: usize) -> Result<Vec<u8>> {
        debug_assert!(address as usize % PACKET_SIZE == 0);
        debug_assert!(size % PACKET_SIZE == 0);

        let mut address = address;
        let mut data = Vec::with_capacity(size);
        while data.len() < size {
            let number = address / PACKET_SIZE as u32;
            let command = [0xB1, (number >> 8) as u8, number as u8, 0x00];
            let payload = self.transfer(&command, PACKET_SIZE + 2, false)?;
            data.extend_from_slice(&payload);
            address += PACKET_SIZE as u32;
        }
        Ok(data)
    }

    /// Reads `size` bytes from the circular window `[begin, end)`,
    /// splitting the read at the wrap point and returning the bytes
    /// linearized in logical order.
    fn read_ringbuffer(&mut self, address: u32, size: usize, begin: u32, end: u32) -> Result<Vec<u8>> {
        debug_assert!(address >= begin && address < end);
        debug_assert!(size as u32 <= end - begin);

        if address + size as u32 > end {
            let first = (end - address) as usize;
            let mut data = self.read_memory(address, first)?;
            let mut rest = self.read_memory(begin, size - first)?;
            data.append(&mut rest);
            Ok(data)
        } else {
            self.read_memory(address, size)
        }
    }

    /// Extracts all recorded dives, newest first.
    ///
    /// The 8-byte logbook entry is prepended to each dive's profile bytes
    /// and doubles as the dive's fingerprint.
    pub fn read_dives(&mut self, callback: DiveCallback<'_>) -> Result<()> {
        let layout = *self.layout;

        let pointers = self.read_memory(layout.pointers, PACKET_SIZE)?;
        let logbook_first = u16_le(&pointers[4..]) as u32;
        let logbook_last = u16_le(&pointers[6..]) as u32;
        debug!("logbook: first={logbook_first:#06x} last={logbook_last:#06x}");

        // The device parks both pointers on a fixed out-of-window value to
        // mark an empty logbook; that is the only empty signal, so a ring
        // with first == last holds exactly one entry. One pointer on the
        // sentinel without the other is a contradiction.
        let empty_first = logbook_first == layout.rb_logbook_empty;
        let empty_last = logbook_last == layout.rb_logbook_empty;
        if empty_first && empty_last {
            return Ok(());
        }
        if empty_first != empty_last {
            warn!("only one logbook pointer on the empty sentinel");
            return Err(Error::DataFormat);
        }
        if !contains(logbook_first, layout.rb_logbook_begin, layout.rb_logbook_end)
            || !contains(logbook_last, layout.rb_logbook_begin, layout.rb_logbook_end)
        {
            warn!("logbook pointer outside the ringbuffer");
            return Err(Error::DataFormat);
        }

        let logbook_count = ringbuf_distance(
            logbook_first,
            logbook_last,
            layout.rb_logbook_begin,
            layout.rb_logbook_end,
            false,
        ) as usize
            / ENTRY_SIZE
            + 1;
        debug!("logbook: count={logbook_count}");

        // Align the window to whole packets before reading; the entries sit
        // at a fixed offset inside the first packet.
        let page_offset = logbook_first as usize % PACKET_SIZE;
        let page_first = logbook_first - page_offset as u32;
        let page_last = logbook_last - logbook_last % PACKET_SIZE as u32;
        let page_len = ringbuf_distance(
            page_first,
            page_last,
            layout.rb_logbook_begin,
            layout.rb_logbook_end,
            false,
        ) as usize
            + PACKET_SIZE;

        let logbooks = self.read_ringbuffer(
            page_first,
            page_len,
            layout.rb_logbook_begin,
            layout.rb_logbook_end,
        )?;

        // The logbook is linearized now; walk it backwards so the most
        // recent dive comes out first.
        for index in (0..logbook_count).rev() {
            let position = page_offset + index * ENTRY_SIZE;
            let entry = &logbooks[position..position + ENTRY_SIZE];

            let profile_first =
                (entry[5] as u32 | ((entry[6] as u32 & 0x0F) << 8)) * PACKET_SIZE as u32;
            let profile_last =
                ((entry[6] as u32 >> 4) | ((entry[7] as u32) << 4)) * PACKET_SIZE as u32;
            debug!("profile: first={profile_first:#06x} last={profile_last:#06x}");

            if !contains(profile_first, layout.rb_profile_begin, layout.rb_profile_end)
                || !contains(profile_last, layout.rb_profile_begin, layout.rb_profile_end)
            {
                warn!("profile pointer outside the ringbuffer");
                return Err(Error::DataFormat);
            }

            let profile_len = ringbuf_distance(
                profile_first,
                profile_last,
                layout.rb_profile_begin,
                layout.rb_profile_end,
                false,
            ) as usize
                + PACKET_SIZE;

            let profile = self.read_ringbuffer(
                profile_first,
                profile_len,
                layout.rb_profile_begin,
                layout.rb_profile_end,
            )?;

            // The logbook entry travels with the dive; it holds the header
            // fields the profile bytes alone are missing.
            let mut dive = Vec::with_capacity(ENTRY_SIZE + profile.len());
            dive.extend_from_slice(entry);
            dive.extend_from_slice(&profile);

            if !callback(&dive, &dive[..ENTRY_SIZE]) {
                return Ok(());
            }
        }

        Ok(())
    }

    fn send(&mut self, command: &[u8]) -> Result<()> {
        self.transport.write(command)?;
        self.transport.drain()
    }

    /// Issues one command and receives one framed response, retrying on a
    /// timeout or a corrupted packet up to [`MAX_RETRIES`] times. Returns
    /// the payload with the header and checksum bytes stripped.
    fn transfer(&mut self, command: &[u8], asize: usize, handshake: bool) -> Result<Vec<u8>> {
        debug_assert!(asize >= 2);

        let mut nretries = 0;
        loop {
            match self.packet(command, asize, handshake) {
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

    fn packet(&mut self, command: &[u8], asize: usize, handshake: bool) -> Result<Vec<u8>> {
        self.send(command)?;

        let mut answer = vec![0u8; asize];
        let nbytes = self.transport.read(&mut answer)?;
        if nbytes != asize {
            warn!("short answer: {nbytes} of {asize} bytes");
            return Err(Error::Timeout);
        }

        let header = if handshake { ACK_HANDSHAKE } else { ACK };
        if answer[0] != header {
            warn!("unexpected answer header 0x{:02X}", answer[0]);
            return Err(Error::Protocol);
        }

        let crc = answer[asize - 1];
        let ccrc = checksum_add(&answer[1..asize - 1], 0x00);
        if crc != ccrc {
            warn!("answer checksum mismatch: 0x{crc:02X} != 0x{ccrc:02X}");
            return Err(Error::Protocol);
        }

        answer.truncate(asize - 1);
        answer.remove(0);
        Ok(answer)
    }
}

impl<T: Transport> DiveComputer for OceanicDevice<T> {
    /// Incremental download is not available on this family; the logbook
    /// index is always read in full.
    fn set_fingerprint(&mut self, _data: &[u8]) -> Result<()> {
        Err(Error::Unsupported)
    }

    fn version(&mut self, data: &mut [u8]) -> Result<()> {
        if data.len() < PACKET_SIZE {
            return Err(Error::InvalidArgs);
        }

        let command = [0x84, 0x00];
        let payload = self.transfer(&command, PACKET_SIZE + 2, false)?;
        data[..PACKET_SIZE].copy_from_slice(&payload);
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
