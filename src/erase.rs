//! Extended erase.
//!
//! Page lists are sent as a normal checksummed data block. Mass and bank
//! erases send a bare sentinel, after which the device stays silent until
//! the erase completes, so timeouts while awaiting the ACK are tolerated.

use embedded_hal::blocking::delay::DelayMs;

use crate::protocol::{self, Command, EraseSelector};
use crate::{Error, Programmer, SerialPort};

/// Flash bank for bank-selective mass erase
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Bank {
    Bank1,
    Bank2,
}

impl <P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Erase the selected flash region
    pub fn erase(&mut self, selector: &EraseSelector) -> Result<(), Error<E>> {
        match selector {
            EraseSelector::Pages(pages) => self.erase_page_list(pages),
            _ => match selector.sentinel() {
                Some(code) => self.erase_special(code),
                None => Err(Error::InvalidArgument("no sentinel for erase selector")),
            },
        }
    }

    /// Erase the entire flash array
    pub fn mass_erase(&mut self) -> Result<(), Error<E>> {
        info!("Mass erase");
        self.erase(&EraseSelector::Mass)
    }

    /// Erase a single flash bank
    pub fn erase_bank(&mut self, bank: Bank) -> Result<(), Error<E>> {
        info!("Erasing {:?}", bank);
        match bank {
            Bank::Bank1 => self.erase(&EraseSelector::Bank1),
            Bank::Bank2 => self.erase(&EraseSelector::Bank2),
        }
    }

    /// Erase `count` pages starting from page 0
    pub fn erase_pages(&mut self, count: u16) -> Result<(), Error<E>> {
        info!("Erasing {} page(s)", count);
        self.erase(&EraseSelector::first_pages(count))
    }

    fn erase_page_list(&mut self, pages: &[u16]) -> Result<(), Error<E>> {
        let data = match protocol::encode_pages(pages) {
            Some(d) => d,
            None => return Err(Error::InvalidArgument("page list must hold 1..=65520 pages")),
        };

        self.send_command(Command::ExtendedErase)?;
        self.send_data(Command::ExtendedErase, &data)
    }

    fn erase_special(&mut self, code: u16) -> Result<(), Error<E>> {
        self.send_command(Command::ExtendedErase)?;

        // Sentinels carry no length prefix, only the checksum
        let block = protocol::with_checksum(&code.to_be_bytes());
        self.write_all(&block)?;

        for _ in 0..self.options.erase_ack_attempts {
            match self.poll_ack(Command::ExtendedErase)? {
                true => return Ok(()),
                false => debug!("Erase in progress"),
            }
        }

        warn!("No acknowledgment for erase 0x{:04x}, continuing", code);
        Ok(())
    }
}
