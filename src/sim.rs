//! Simulated STM32 bootloader for exercising the programmer without hardware.
//!
//! Bytes written by the host are parsed one at a time by a small state
//! machine, responses are queued for the host to read. Time is virtual, the
//! paired `SimDelay` only counts milliseconds.

use std::collections::VecDeque;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use crate::protocol::{checksum, complement, UART_ACK, UART_INIT, UART_NACK};
use crate::{ControlLine, SerialPort};

pub const FLASH_BASE: u32 = 0x0800_0000;
pub const FLASH_SIZE: usize = 128 * 1024;
pub const PAGE_SIZE: usize = 2048;

#[derive(Clone, PartialEq, Debug)]
pub struct SimError;

/// Operations executed by the simulated device
#[derive(Clone, PartialEq, Debug)]
pub enum Event {
    Read { address: u32, len: usize },
    Write { address: u32, len: usize },
    ErasePages(Vec<u16>),
    EraseSpecial(u16),
    Go(u32),
}

#[derive(Copy, Clone, PartialEq, Debug)]
enum Phase {
    Command,
    ReadAddress,
    ReadLength(u32),
    GoAddress,
    WriteAddress,
    WriteData(u32),
    Erase,
}

pub struct SimDevice {
    /// Device to host queue
    pub rx: VecDeque<u8>,
    /// Every byte received from the host once synchronised
    pub tx: Vec<u8>,
    pub events: Vec<Event>,
    /// Electrical levels applied to the control lines
    pub lines: Vec<(ControlLine, bool)>,
    pub memory: Vec<u8>,
    pub init_count: usize,

    /// Init characters to drop before synchronising
    pub ignore_inits: usize,
    /// Garbage emitted ahead of the handshake ACK
    pub noise: Vec<u8>,
    /// Drop everything written once synchronised
    pub silent: bool,
    pub nack_commands: Vec<u8>,
    /// Fail checksum validation on every data block
    pub corrupt_checksums: bool,
    /// Erase command advertised in the GET response
    pub erase_command: u8,
    /// Do not acknowledge mass and bank erases
    pub slow_erase: bool,
    /// Stop responding after this many more bytes
    pub truncate_after: Option<usize>,
    /// Command codes reported by GET, position 6 is replaced by `erase_command`
    pub commands: Vec<u8>,

    synced: bool,
    phase: Phase,
    buff: Vec<u8>,
}

impl SimDevice {
    pub fn new() -> Self {
        Self {
            rx: VecDeque::new(),
            tx: Vec::new(),
            events: Vec::new(),
            lines: Vec::new(),
            memory: vec![0xFF; FLASH_SIZE],
            init_count: 0,
            ignore_inits: 0,
            noise: Vec::new(),
            silent: false,
            nack_commands: Vec::new(),
            corrupt_checksums: false,
            erase_command: 0x44,
            slow_erase: false,
            truncate_after: None,
            commands: vec![0x00, 0x01, 0x02, 0x11, 0x21, 0x31, 0x44, 0x63, 0x73, 0x82, 0x92],
            synced: false,
            phase: Phase::Command,
            buff: Vec::new(),
        }
    }

    /// Fetch a region of simulated flash
    pub fn flash(&self, address: u32, len: usize) -> &[u8] {
        let offset = (address - FLASH_BASE) as usize;
        &self.memory[offset..offset + len]
    }

    pub fn writes(&self) -> Vec<(u32, usize)> {
        self.events.iter().filter_map(|e| match e {
            Event::Write { address, len } => Some((*address, *len)),
            _ => None,
        }).collect()
    }

    pub fn reads(&self) -> Vec<(u32, usize)> {
        self.events.iter().filter_map(|e| match e {
            Event::Read { address, len } => Some((*address, *len)),
            _ => None,
        }).collect()
    }

    fn offset(&self, address: u32) -> Option<usize> {
        let offset = address.checked_sub(FLASH_BASE)? as usize;
        if offset < FLASH_SIZE {
            Some(offset)
        } else {
            None
        }
    }

    fn block_ok(&self) -> bool {
        !self.corrupt_checksums && checksum(&self.buff) == 0
    }

    fn reply(&mut self, data: &[u8]) {
        let n = match self.truncate_after.as_mut() {
            Some(left) => {
                let n = data.len().min(*left);
                *left -= n;
                n
            },
            None => data.len(),
        };
        self.rx.extend(data[..n].iter());
    }

    fn done(&mut self, ok: bool) {
        self.reply(&[if ok { UART_ACK } else { UART_NACK }]);
        self.buff.clear();
        self.phase = Phase::Command;
    }

    fn receive(&mut self, b: u8) {
        if self.silent {
            return;
        }

        if !self.synced {
            if b == UART_INIT {
                self.init_count += 1;
                if self.ignore_inits > 0 {
                    self.ignore_inits -= 1;
                } else {
                    let noise: Vec<u8> = self.noise.drain(..).collect();
                    self.reply(&noise);
                    self.reply(&[UART_ACK]);
                    self.synced = true;
                }
            }
            return;
        }

        self.tx.push(b);
        self.buff.push(b);

        match self.phase {
            Phase::Command if self.buff.len() == 2 => self.command(),
            Phase::ReadAddress | Phase::GoAddress | Phase::WriteAddress if self.buff.len() == 5 => self.address(),
            Phase::ReadLength(address) if self.buff.len() == 2 => {
                let n = self.buff[0];
                if self.buff[1] != complement(n) {
                    return self.done(false);
                }
                let len = n as usize + 1;

                let offset = match self.offset(address) {
                    Some(o) if o + len <= FLASH_SIZE => o,
                    _ => return self.done(false),
                };
                self.done(true);

                let data = self.memory[offset..offset + len].to_vec();
                self.reply(&data);
                self.events.push(Event::Read { address, len });
            },
            Phase::WriteData(address) if self.buff.len() == self.buff[0] as usize + 3 => {
                let len = self.buff[0] as usize + 1;
                if !self.block_ok() {
                    return self.done(false);
                }
                let offset = match self.offset(address) {
                    Some(o) if o + len <= FLASH_SIZE => o,
                    _ => return self.done(false),
                };

                // Flash programming can only clear bits
                for (i, v) in self.buff[1..len + 1].to_vec().iter().enumerate() {
                    self.memory[offset + i] &= *v;
                }
                self.events.push(Event::Write { address, len });
                self.done(true);
            },
            Phase::Erase => self.erase(),
            _ => (),
        }
    }

    fn command(&mut self) {
        let (c, n) = (self.buff[0], self.buff[1]);
        self.buff.clear();

        if n != complement(c) || self.nack_commands.contains(&c) {
            self.reply(&[UART_NACK]);
            return;
        }
        self.reply(&[UART_ACK]);

        match c {
            0x00 => {
                let mut payload = vec![0x31];
                payload.extend_from_slice(&self.commands);
                if payload.len() > 7 {
                    payload[7] = self.erase_command;
                }
                self.reply(&[payload.len() as u8 - 1]);
                self.reply(&payload);
                self.reply(&[UART_ACK]);
            },
            0x02 => self.reply(&[0x01, 0x04, 0x13, UART_ACK]),
            0x11 => self.phase = Phase::ReadAddress,
            0x21 => self.phase = Phase::GoAddress,
            0x31 => self.phase = Phase::WriteAddress,
            0x44 => self.phase = Phase::Erase,
            _ => (),
        }
    }

    fn address(&mut self) {
        let address = u32::from_be_bytes([self.buff[0], self.buff[1], self.buff[2], self.buff[3]]);
        if !self.block_ok() || self.offset(address).is_none() {
            return self.done(false);
        }

        let next = match self.phase {
            Phase::ReadAddress => Phase::ReadLength(address),
            Phase::WriteAddress => Phase::WriteData(address),
            _ => {
                self.events.push(Event::Go(address));
                Phase::Command
            },
        };

        self.done(true);
        self.phase = next;
    }

    fn erase(&mut self) {
        if self.buff.len() < 2 {
            return;
        }
        let code = u16::from_be_bytes([self.buff[0], self.buff[1]]);

        if code >= 0xFFF0 {
            if self.buff.len() < 3 {
                return;
            }
            if !self.block_ok() {
                return self.done(false);
            }

            let half = FLASH_SIZE / 2;
            let range = match code {
                0xFFFF => 0..FLASH_SIZE,
                0xFFFE => 0..half,
                0xFFFD => half..FLASH_SIZE,
                _ => return self.done(false),
            };
            for b in &mut self.memory[range] {
                *b = 0xFF;
            }
            self.events.push(Event::EraseSpecial(code));

            if self.slow_erase {
                self.buff.clear();
                self.phase = Phase::Command;
            } else {
                self.done(true);
            }
            return;
        }

        let count = code as usize + 1;
        if self.buff.len() < 2 + count * 2 + 1 {
            return;
        }
        if !self.block_ok() {
            return self.done(false);
        }

        let pages: Vec<u16> = self.buff[2..2 + count * 2]
            .chunks(2)
            .map(|p| u16::from_be_bytes([p[0], p[1]]))
            .collect();
        for p in &pages {
            let start = *p as usize * PAGE_SIZE;
            if start + PAGE_SIZE > FLASH_SIZE {
                return self.done(false);
            }
            for b in &mut self.memory[start..start + PAGE_SIZE] {
                *b = 0xFF;
            }
        }
        self.events.push(Event::ErasePages(pages));
        self.done(true);
    }
}

impl Read<u8> for SimDevice {
    type Error = SimError;

    fn read(&mut self) -> nb::Result<u8, SimError> {
        self.rx.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

impl Write<u8> for SimDevice {
    type Error = SimError;

    fn write(&mut self, word: u8) -> nb::Result<(), SimError> {
        self.receive(word);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), SimError> {
        Ok(())
    }
}

impl SerialPort<SimError> for SimDevice {
    fn set_rts(&mut self, level: bool) -> Result<(), SimError> {
        self.lines.push((ControlLine::BootMode, level));
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), SimError> {
        self.lines.push((ControlLine::Reset, level));
        Ok(())
    }
}

/// Virtual clock
#[derive(Default)]
pub struct SimDelay {
    pub elapsed_ms: u64,
}

impl DelayMs<u32> for SimDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.elapsed_ms += ms as u64;
    }
}
