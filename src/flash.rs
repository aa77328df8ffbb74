//! Programming sequence: identify, erase, write, verify and start an image.

use embedded_hal::blocking::delay::DelayMs;

use crate::protocol::{Command, EraseSelector};
use crate::{Error, Programmer, SerialPort};

/// Default load address for STM32 user flash
pub const FLASH_BASE: u32 = 0x0800_0000;

#[derive(Clone, PartialEq, Debug)]
pub struct FlashOptions {
    /// Load (and start) address of the image
    pub address: u32,
    /// Region to erase before writing, if any
    pub erase: Option<EraseSelector>,
    /// Read back and compare after writing
    pub verify: bool,
    /// Start the image once written
    pub go: bool,
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self {
            address: FLASH_BASE,
            erase: None,
            verify: true,
            go: true,
        }
    }
}

/// Programming stage, reported with progress updates
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Stage {
    Erase,
    Write,
    Verify,
    Go,
}

impl <P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Program `image` on a connected bootloader.
    ///
    /// The device must advertise extended erase, this is checked before
    /// anything is modified. `progress(stage, done, total)` is called as each
    /// stage advances.
    pub fn flash<F>(&mut self, image: &[u8], options: &FlashOptions, mut progress: F) -> Result<(), Error<E>>
    where
        F: FnMut(Stage, usize, usize),
    {
        let info = self.identify()?;
        info!("Bootloader v{}.{}", info.version >> 4, info.version & 0x0F);

        let mut required = vec![Command::GetId, Command::WriteMemory];
        if options.verify {
            required.push(Command::ReadMemory);
        }
        if options.go {
            required.push(Command::Go);
        }
        if let Some(c) = required.into_iter().find(|c| !info.supports(*c)) {
            error!("Bootloader does not support {:?}", c);
            return Err(Error::Unsupported(c));
        }

        let id = self.chip_id()?;
        match id.len() {
            2 => info!("Chip ID: {:02x}:{:02x}", id[0], id[1]),
            _ => warn!("Invalid chip identifier: {:02x?}", id),
        }

        if let Some(selector) = &options.erase {
            progress(Stage::Erase, 0, 1);
            self.erase(selector)?;
            progress(Stage::Erase, 1, 1);
        }

        info!("Writing {} bytes to 0x{:08x}", image.len(), options.address);
        self.write_mem_with_progress(options.address, image, |d, t| progress(Stage::Write, d, t))?;

        if options.verify {
            info!("Verifying");
            let mut actual = vec![0u8; image.len()];
            self.read_mem_with_progress(options.address, &mut actual, |d, t| progress(Stage::Verify, d, t))?;
            crate::transfer::compare::<E>(options.address, image, &actual)?;
        }

        if options.go {
            info!("Starting from 0x{:08x}", options.address);
            self.go(options.address)?;
            progress(Stage::Go, 1, 1);
        }

        Ok(())
    }
}
