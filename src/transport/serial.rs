//! Serial port transport backed by the `serialport` crate.

use std::io::{self, Read as _, Write as _};
use std::time::Duration;

use log::trace;
use serialport::SerialPort;

use crate::error::Result;
use crate::transport::{
    DataBits, FlowControl, FlushQueue, Parity, SerialSettings, StopBits, Transport,
};

/// A [`Transport`] over a physical (or USB-bridged) serial port.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    /// Opens the named port (`/dev/ttyUSB0`, `COM3`, ...) with default
    /// settings and the crate-wide receive timeout. Backends reconfigure
    /// the line to their own requirements afterwards.
    pub fn open(name: &str) -> Result<Self> {
        let port = serialport::new(name, SerialSettings::default().baudrate)
            .timeout(Duration::from_millis(crate::TIMEOUT_MS as u64))
            .open()
            .map_err(io::Error::other)?;
        trace!("opened serial port {name}");
        Ok(Self { port })
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.port.write_all(data)?;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut nbytes = 0;
        while nbytes < buf.len() {
            match self.port.read(&mut buf[nbytes..]) {
                Ok(0) => break,
                Ok(n) => nbytes += n,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(nbytes)
    }

    fn drain(&mut self) -> Result<()> {
        self.port.flush()?;
        Ok(())
    }

    fn flush(&mut self, queue: FlushQueue) -> Result<()> {
        let buffer = match queue {
            FlushQueue::Input => serialport::ClearBuffer::Input,
            FlushQueue::Output => serialport::ClearBuffer::Output,
            FlushQueue::Both => serialport::ClearBuffer::All,
        };
        self.port.clear(buffer).map_err(io::Error::other)?;
        Ok(())
    }

    fn set_timeout(&mut self, timeout_ms: u32) -> Result<()> {
        self.port
            .set_timeout(Duration::from_millis(timeout_ms as u64))
            .map_err(io::Error::other)?;
        Ok(())
    }

    fn configure(&mut self, settings: SerialSettings) -> Result<()> {
        self.port
            .set_baud_rate(settings.baudrate)
            .map_err(io::Error::other)?;
        self.port
            .set_data_bits(match settings.data_bits {
                DataBits::Seven => serialport::DataBits::Seven,
                DataBits::Eight => serialport::DataBits::Eight,
            })
            .map_err(io::Error::other)?;
        self.port
            .set_parity(match settings.parity {
                Parity::None => serialport::Parity::None,
                Parity::Odd => serialport::Parity::Odd,
                Parity::Even => serialport::Parity::Even,
            })
            .map_err(io::Error::other)?;
        self.port
            .set_stop_bits(match settings.stop_bits {
                StopBits::One => serialport::StopBits::One,
                StopBits::Two => serialport::StopBits::Two,
            })
            .map_err(io::Error::other)?;
        self.port
            .set_flow_control(match settings.flow_control {
                FlowControl::None => serialport::FlowControl::None,
                FlowControl::Software => serialport::FlowControl::Software,
                FlowControl::Hardware => serialport::FlowControl::Hardware,
            })
            .map_err(io::Error::other)?;
        Ok(())
    }

    fn sleep(&mut self, ms: u32) {
        std::thread::sleep(Duration::from_millis(ms as u64));
    }
}
