//! Transport layer abstraction.
//!
//! The device backends talk to a [`Transport`]: a byte-oriented duplex
//! channel with a receive timeout. [`SerialTransport`] is the hardware
//! implementation; the in-memory transports in this module exercise the
//! protocol code without a device attached.
//!
//! Reads have timeout semantics rather than error semantics: a `read` that
//! returns fewer bytes than requested means the deadline expired, and the
//! transfer layer decides whether to retry. Only hard I/O failures (port
//! gone, OS error) surface as errors.

mod serial;

pub use serial::SerialTransport;

use std::collections::VecDeque;

use crate::error::{Error, Result};

/// Transport trait for exchanging raw bytes with a dive computer.
pub trait Transport {
    /// Writes all bytes to the device.
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Reads bytes into the buffer until it is full or the receive timeout
    /// expires. Returns the number of bytes read; a short count means the
    /// deadline passed before the device sent the rest.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Blocks until all previously written bytes have left the host.
    fn drain(&mut self) -> Result<()>;

    /// Discards bytes buffered in the given direction(s).
    fn flush(&mut self, queue: FlushQueue) -> Result<()>;

    /// Sets the receive timeout in milliseconds.
    fn set_timeout(&mut self, timeout_ms: u32) -> Result<()>;

    /// Applies line settings (baudrate, framing, flow control).
    fn configure(&mut self, settings: SerialSettings) -> Result<()>;

    /// Suspends the caller; some devices need settle time after opening.
    fn sleep(&mut self, ms: u32);
}

/// Which buffered direction a [`Transport::flush`] discards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushQueue {
    /// Received but unread bytes.
    Input,

    /// Written but untransmitted bytes.
    Output,

    /// Both directions.
    Both,
}

/// Number of data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataBits {
    Seven,
    Eight,
}

/// Parity bit mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
    One,
    Two,
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    None,
    Software,
    Hardware,
}

/// Serial line settings.
///
/// Most dive computer cradles speak 8N1 without flow control and differ
/// only in baudrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialSettings {
    pub baudrate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow_control: FlowControl,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self::new(9600)
    }
}

impl SerialSettings {
    /// Creates 8N1 settings without flow control at the given baudrate.
    pub const fn new(baudrate: u32) -> Self {
        Self {
            baudrate,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
        }
    }

    /// Sets the parity mode.
    pub const fn with_parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    /// Sets the flow control mode.
    pub const fn with_flow_control(mut self, flow_control: FlowControl) -> Self {
        self.flow_control = flow_control;
        self
    }
}

/// A loopback transport: everything written is immediately readable.
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    buffer: VecDeque<u8>,
}

impl LoopbackTransport {
    /// Creates a new empty loopback transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of bytes available to read.
    pub fn available(&self) -> usize {
        self.buffer.len()
    }
}

impl Transport for LoopbackTransport {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.buffer.extend(data);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut nbytes = 0;
        while nbytes < buf.len() {
            match self.buffer.pop_front() {
                Some(byte) => {
                    buf[nbytes] = byte;
                    nbytes += 1;
                }
                None => break,
            }
        }
        Ok(nbytes)
    }

    fn drain(&mut self) -> Result<()> {
        Ok(())
    }

    fn flush(&mut self, _queue: FlushQueue) -> Result<()> {
        self.buffer.clear();
        Ok(())
    }

    fn set_timeout(&mut self, _timeout_ms: u32) -> Result<()> {
        Ok(())
    }

    fn configure(&mut self, _settings: SerialSettings) -> Result<()> {
        Ok(())
    }

    fn sleep(&mut self, _ms: u32) {}
}

/// How a [`ScriptedTransport`] reacts to one expected command.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Respond with these bytes.
    Data(Vec<u8>),

    /// Stay silent; the caller's read will time out.
    Silence,

    /// Fail the next read with an I/O error, as a yanked cable would.
    Disconnect,
}

#[derive(Debug)]
struct Exchange {
    command: Vec<u8>,
    reply: Reply,
}

/// A transport that replays a scripted command/response conversation.
///
/// Each write must match the next expected command byte-for-byte (a
/// mismatch panics, pointing at the broken frame); the scripted reply then
/// becomes readable. Intended for protocol tests only.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    script: VecDeque<Exchange>,
    rx: VecDeque<u8>,
    broken: bool,
}

impl ScriptedTransport {
    /// Creates a transport with an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an expected command and the reply it triggers.
    pub fn expect(&mut self, command: &[u8], reply: Reply) -> &mut Self {
        self.script.push_back(Exchange {
            command: command.to_vec(),
            reply,
        });
        self
    }

    /// Returns true once every scripted exchange has been consumed.
    pub fn finished(&self) -> bool {
        self.script.is_empty() && self.rx.is_empty()
    }
}

impl Transport for ScriptedTransport {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        let exchange = self
            .script
            .pop_front()
            .unwrap_or_else(|| panic!("unexpected command: {data:02X?}"));
        assert_eq!(
            data, &exchange.command[..],
            "command does not match the scripted exchange"
        );
        match exchange.reply {
            Reply::Data(bytes) => self.rx.extend(bytes),
            Reply::Silence => {}
            Reply::Disconnect => self.broken = true,
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.broken {
            return Err(Error::Io(std::io::Error::from(
                std::io::ErrorKind::BrokenPipe,
            )));
        }
        let mut nbytes = 0;
        while nbytes < buf.len() {
            match self.rx.pop_front() {
                Some(byte) => {
                    buf[nbytes] = byte;
                    nbytes += 1;
                }
                None => break,
            }
        }
        Ok(nbytes)
    }

    fn drain(&mut self) -> Result<()> {
        Ok(())
    }

    fn flush(&mut self, queue: FlushQueue) -> Result<()> {
        if matches!(queue, FlushQueue::Input | FlushQueue::Both) {
            self.rx.clear();
        }
        Ok(())
    }

    fn set_timeout(&mut self, _timeout_ms: u32) -> Result<()> {
        Ok(())
    }

    fn configure(&mut self, _settings: SerialSettings) -> Result<()> {
        Ok(())
    }

    fn sleep(&mut self, _ms: u32) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_roundtrip() {
        let mut transport = LoopbackTransport::new();
        transport.write(b"hello").unwrap();
        assert_eq!(transport.available(), 5);

        let mut buf = [0u8; 8];
        let n = transport.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn test_loopback_short_read() {
        let mut transport = LoopbackTransport::new();
        transport.write(&[0x01, 0x02]).unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(transport.read(&mut buf).unwrap(), 2);
        assert_eq!(transport.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_scripted_conversation() {
        let mut transport = ScriptedTransport::new();
        transport
            .expect(&[0xA8, 0x99, 0x00], Reply::Data(vec![0xA5, 0xA5, 0xA5]))
            .expect(&[0x84, 0x00], Reply::Silence);

        transport.write(&[0xA8, 0x99, 0x00]).unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(transport.read(&mut buf).unwrap(), 3);

        transport.write(&[0x84, 0x00]).unwrap();
        assert_eq!(transport.read(&mut buf).unwrap(), 0);
        assert!(transport.finished());
    }

    #[test]
    fn test_scripted_disconnect() {
        let mut transport = ScriptedTransport::new();
        transport.expect(&[0x84, 0x00], Reply::Disconnect);
        transport.write(&[0x84, 0x00]).unwrap();

        let mut buf = [0u8; 2];
        assert!(matches!(transport.read(&mut buf), Err(Error::Io(_))));
    }

    #[test]
    fn test_settings_builder() {
        let settings = SerialSettings::new(38400).with_flow_control(FlowControl::Hardware);
        assert_eq!(settings.baudrate, 38400);
        assert_eq!(settings.data_bits, DataBits::Eight);
        assert_eq!(settings.flow_control, FlowControl::Hardware);
    }
}
