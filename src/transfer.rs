//! Block transfers.
//!
//! Large reads and writes are split into `block_size` chunks, each issued as
//! a single read or write command. The address advances by the full block
//! size after every chunk, including a short final chunk.

use embedded_hal::blocking::delay::DelayMs;

use crate::{Error, Programmer, SerialPort};

impl <P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Write `data` starting at `address`
    pub fn write_mem(&mut self, address: u32, data: &[u8]) -> Result<(), Error<E>> {
        self.write_mem_with_progress(address, data, |_, _| ())
    }

    /// Write `data` starting at `address`, calling `progress(done, total)` after each block
    pub fn write_mem_with_progress<F>(&mut self, address: u32, data: &[u8], mut progress: F) -> Result<(), Error<E>>
    where
        F: FnMut(usize, usize),
    {
        let stride = self.stride()?;
        let mut addr = address;
        let mut done = 0;

        debug!("Writing {} bytes to 0x{:08x}", data.len(), address);

        for chunk in data.chunks(stride) {
            if let Err(e) = self.write_block(addr, chunk) {
                error!("Write failed at 0x{:08x}: {}", addr, e);
                return Err(e);
            }

            done += chunk.len();
            progress(done, data.len());

            addr = addr.wrapping_add(stride as u32);
        }

        Ok(())
    }

    /// Fill `data` from memory starting at `address`
    pub fn read_mem(&mut self, address: u32, data: &mut [u8]) -> Result<(), Error<E>> {
        self.read_mem_with_progress(address, data, |_, _| ())
    }

    /// Fill `data` from memory starting at `address`, calling `progress(done, total)` after each block
    pub fn read_mem_with_progress<F>(&mut self, address: u32, data: &mut [u8], mut progress: F) -> Result<(), Error<E>>
    where
        F: FnMut(usize, usize),
    {
        let stride = self.stride()?;
        let total = data.len();
        let mut addr = address;
        let mut done = 0;

        debug!("Reading {} bytes from 0x{:08x}", total, address);

        for chunk in data.chunks_mut(stride) {
            if let Err(e) = self.read_block(addr, chunk) {
                error!("Read failed at 0x{:08x}: {}", addr, e);
                return Err(e);
            }

            done += chunk.len();
            progress(done, total);

            addr = addr.wrapping_add(stride as u32);
        }

        Ok(())
    }

    /// Read back `expected.len()` bytes from `address` and compare
    pub fn verify(&mut self, address: u32, expected: &[u8]) -> Result<(), Error<E>> {
        let mut actual = vec![0u8; expected.len()];
        self.read_mem(address, &mut actual)?;

        compare(address, expected, &actual)
    }

    fn stride(&self) -> Result<usize, Error<E>> {
        match self.options.block_size {
            1..=crate::protocol::MAX_CHUNK => Ok(self.options.block_size),
            _ => Err(Error::InvalidArgument("block size must be 1..=256 bytes")),
        }
    }
}

/// Compare an image with data read back from `address`, reporting the first
/// differing address
pub fn compare<E>(address: u32, expected: &[u8], actual: &[u8]) -> Result<(), Error<E>> {
    if expected.len() != actual.len() {
        return Err(Error::LengthMismatch{ expected: expected.len(), actual: actual.len() });
    }

    match expected.iter().zip(actual.iter()).position(|(a, b)| a != b) {
        Some(i) => {
            let address = address.wrapping_add(i as u32);
            error!("Verification failed at 0x{:08x} (expected 0x{:02x} read 0x{:02x})", address, expected[i], actual[i]);
            Err(Error::VerifyFailed{ address })
        },
        None => Ok(()),
    }
}
