use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;

use log::debug;

use crate::error::{Error, Result};

/// Character device for the board's primary expansion bus.
pub const I2C_DEV_PATH: &str = "/dev/i2c-1";

/// `I2C_SLAVE` ioctl request, from `linux/i2c-dev.h`.
const I2C_SLAVE: libc::c_ulong = 0x0703;

/// Byte-synchronous bus transport.
///
/// One call is one blocking bus transaction; there is no buffering, batching
/// or clock negotiation. Implementations release the underlying device in
/// `Drop`.
pub trait BusTransport: Send {
    /// Address a chip on the bus for subsequent byte exchanges.
    fn select_target(&mut self, address: u8) -> Result<()>;

    /// Transfer one byte to the selected chip.
    fn write_byte(&mut self, value: u8) -> Result<()>;

    /// Transfer one byte from the selected chip.
    fn read_byte(&mut self) -> Result<u8>;
}

/// Linux I2C bus device (`/dev/i2c-1` by default).
///
/// Chip selection is the `I2C_SLAVE` ioctl; byte exchange is one blocking
/// one-byte `read`/`write` on the file descriptor.
pub struct I2cDev {
    file: File,
    target: Option<u8>,
}

impl I2cDev {
    /// Open the default expansion bus device.
    pub fn open() -> Result<Self> {
        Self::open_path(I2C_DEV_PATH)
    }

    /// Open a specific bus device.
    pub fn open_path(path: &str) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| Error::TransportUnavailable {
                path: path.to_string(),
                source,
            })?;
        debug!("opened bus device {}", path);
        Ok(I2cDev { file, target: None })
    }
}

impl BusTransport for I2cDev {
    fn select_target(&mut self, address: u8) -> Result<()> {
        if self.target == Some(address) {
            return Ok(());
        }
        let ret = unsafe {
            libc::ioctl(self.file.as_raw_fd(), I2C_SLAVE, libc::c_ulong::from(address))
        };
        if ret < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        self.target = Some(address);
        Ok(())
    }

    fn write_byte(&mut self, value: u8) -> Result<()> {
        if self.target.is_none() {
            return Err(Error::NoTarget);
        }
        self.file.write_all(&[value])?;
        Ok(())
    }

    fn read_byte(&mut self) -> Result<u8> {
        if self.target.is_none() {
            return Err(Error::NoTarget);
        }
        let mut buf = [0u8; 1];
        self.file.read_exact(&mut buf)?;
        Ok(buf[0])
    }
}


#[cfg(test)]
mod tests {
    use super::mock::{MockBus, Xfer};
    use super::*;

    #[test]
    fn mock_records_transactions_in_order() {
        let mut bus = MockBus::new();
        bus.read_queue.push_back(0xa5);
        bus.select_target(0x20).unwrap();
        bus.write_byte(0x41).unwrap();
        assert_eq!(bus.read_byte().unwrap(), 0xa5);
        assert_eq!(
            bus.log,
            vec![Xfer::Select(0x20), Xfer::Write(0x41), Xfer::Read(0xa5)]
        );
    }
}
