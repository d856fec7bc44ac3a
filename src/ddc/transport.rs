//! Transport adapter: raw write/read against an opened bus
//! handle, with the slave address pre-set via an ioctl-style primitive.

use super::error::DdcError;
use super::packet::SLAVE_ADDRESS;

/// Capability set a transport must offer the single-exchange engine.
/// Kept as a trait so the engine and retry controller can be exercised
/// against a fake in tests instead of a real I2C bus.
pub trait DdcTransport {
    /// Write `bytes` verbatim to the device. The destination byte (`0x6e`)
    /// is implicit on the wire and must already be stripped by the caller —
    /// callers pass `&packet.bytes()[1..]`, never the full `Packet::bytes()`.
    fn write(&mut self, bytes: &[u8]) -> Result<(), DdcError>;

    /// Read a response. `bytewise` selects single-byte reads over a block
    /// read; both code paths must exist.
    fn read(&mut self, bytewise: bool, max_len: usize) -> Result<Vec<u8>, DdcError>;

    /// (Re-)set the slave address on this transport. `force` requests the
    /// forceable ioctl form, used as a fallback if the plain form fails
    /// (e.g. `EBUSY`).
    fn set_address(&mut self, force: bool) -> Result<(), DdcError>;
}

#[cfg(target_os = "linux")]
pub use linux::LinuxTransport;

#[cfg(target_os = "linux")]
mod linux {
    use std::fs::{File, OpenOptions};
    use std::io::{Read, Write};
    use std::os::unix::io::AsRawFd;

    use super::{DdcError, DdcTransport, SLAVE_ADDRESS};

    // Kernel i2c-dev ioctl request numbers (linux/i2c-dev.h).
    const I2C_SLAVE: libc::c_ulong = 0x0703;
    const I2C_SLAVE_FORCE: libc::c_ulong = 0x0706;

    fn io_err(e: std::io::Error) -> DdcError {
        DdcError::Io(e.raw_os_error().unwrap_or(-1))
    }

    /// Transport against a real `/dev/i2c-N` device.
    pub struct LinuxTransport {
        file: File,
    }

    impl LinuxTransport {
        /// Open `/dev/i2c-<bus_number>` and pre-set the slave address; on
        /// `EBUSY` falls back to the forceable ioctl if `allow_force` is set
        ///.
        pub fn open(bus_number: u32, allow_force: bool) -> Result<Self, DdcError> {
            let path = format!("/dev/i2c-{bus_number}");
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .map_err(io_err)?;
            let mut transport = LinuxTransport { file };
            match transport.set_address(false) {
                Ok(()) => Ok(transport),
                Err(DdcError::Io(errno)) if allow_force && errno == libc::EBUSY => {
                    transport.set_address(true)?;
                    Ok(transport)
                }
                Err(e) => Err(e),
            }
        }
    }

    impl DdcTransport for LinuxTransport {
        fn write(&mut self, bytes: &[u8]) -> Result<(), DdcError> {
            self.file.write_all(bytes).map_err(io_err)
        }

        fn read(&mut self, bytewise: bool, max_len: usize) -> Result<Vec<u8>, DdcError> {
            let mut buf = vec![0u8; max_len];
            if bytewise {
                for slot in buf.iter_mut() {
                    let mut byte = [0u8; 1];
                    self.file.read_exact(&mut byte).map_err(io_err)?;
                    *slot = byte[0];
                }
            } else {
                self.file.read_exact(&mut buf).map_err(io_err)?;
            }
            Ok(buf)
        }

        fn set_address(&mut self, force: bool) -> Result<(), DdcError> {
            let request = if force { I2C_SLAVE_FORCE } else { I2C_SLAVE };
            let rc = unsafe {
                libc::ioctl(self.file.as_raw_fd(), request, SLAVE_ADDRESS as libc::c_ulong)
            };
            if rc < 0 {
                return Err(io_err(std::io::Error::last_os_error()));
            }
            Ok(())
        }
    }
}

/// A fake transport used by unit tests for `exchange`/`retry`/`multipart`,
/// replaying a fixed script of responses.
#[cfg(test)]
pub struct ScriptedTransport {
    pub writes: Vec<Vec<u8>>,
    pub responses: std::collections::VecDeque<Result<Vec<u8>, DdcError>>,
    pub set_address_calls: u32,
}

#[cfg(test)]
impl ScriptedTransport {
    pub fn new(responses: Vec<Result<Vec<u8>, DdcError>>) -> Self {
        ScriptedTransport {
            writes: Vec::new(),
            responses: responses.into(),
            set_address_calls: 0,
        }
    }
}

#[cfg(test)]
impl DdcTransport for ScriptedTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<(), DdcError> {
        self.writes.push(bytes.to_vec());
        Ok(())
    }

    fn read(&mut self, _bytewise: bool, max_len: usize) -> Result<Vec<u8>, DdcError> {
        match self.responses.pop_front() {
            Some(Ok(mut bytes)) => {
                bytes.resize(max_len, 0);
                Ok(bytes)
            }
            Some(Err(e)) => Err(e),
            None => Err(DdcError::Io(5)),
        }
    }

    fn set_address(&mut self, _force: bool) -> Result<(), DdcError> {
        self.set_address_calls += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_transport_replays_in_order() {
        let mut t = ScriptedTransport::new(vec![Ok(vec![1, 2, 3]), Err(DdcError::Io(5))]);
        assert_eq!(t.read(false, 3).unwrap(), vec![1, 2, 3]);
        assert!(t.read(false, 3).is_err());
    }
}
