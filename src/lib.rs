//! STM32 Serial Bootloader.
//!
//! Base on AN3155

use core::marker::PhantomData;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::serial::{Write, Read};
use embedded_hal::blocking::delay::DelayMs;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub mod protocol;
pub mod transfer;
pub mod erase;
pub mod flash;

#[cfg(test)]
mod sim;

pub use protocol::{BootloaderInfo, Command, EraseSelector};
pub use erase::Bank;
pub use flash::{FlashOptions, Stage};
use protocol::{UART_ACK, UART_INIT, UART_NACK};

/// Serial transport with the two control lines used to enter the bootloader
pub trait SerialPort<E>: Write<u8, Error=E> + Read<u8, Error=E> {
    fn set_rts(&mut self, level: bool) -> Result<(), E>;
    fn set_dtr(&mut self, level: bool) -> Result<(), E>;

    /// Drive a named control line, both lines are active low
    fn set_line(&mut self, line: ControlLine, asserted: bool) -> Result<(), E> {
        match line {
            ControlLine::BootMode => self.set_rts(!asserted),
            ControlLine::Reset => self.set_dtr(!asserted),
        }
    }
}

/// Control lines wired to the target
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum ControlLine {
    /// BOOT0 select, wired to RTS
    BootMode,
    /// NRST, wired to DTR
    Reset,
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    /// Bootloader not yet synchronised
    Init,
    /// Handshake complete, accepting commands
    Connected,
    /// Device released to run user code
    Running,
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<SerialError> {
    #[error("serial error: {0:?}")]
    Serial(SerialError),

    #[error("timeout awaiting response to {0:?}")]
    Timeout(Command),

    #[error("{0:?} rejected by device (NACK)")]
    Nack(Command),

    #[error("unexpected response 0x{byte:02x} to {command:?}")]
    Unexpected { command: Command, byte: u8 },

    #[error("no handshake response after {0} attempts")]
    HandshakeFailed(u32),

    #[error("device does not support extended erase (advertised 0x{0:02x})")]
    UnsupportedDevice(u8),

    #[error("device does not support {0:?}")]
    Unsupported(Command),

    #[error("malformed bootloader response")]
    InvalidResponse,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("length mismatch: expected {expected} bytes, read {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("verification failed at 0x{address:08x}")]
    VerifyFailed { address: u32 },
}

impl<SerialError> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Do not reset the device on connection
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub no_reset: bool,

    /// Timeout to wait for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value="2000"))]
    pub response_timeout_ms: u32,

    /// Timeout for each handshake attempt
    #[cfg_attr(feature = "structopt", structopt(long, default_value="1000"))]
    pub handshake_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value="1"))]
    pub poll_delay_ms: u32,

    /// Period to hold the device in reset
    #[cfg_attr(feature = "structopt", structopt(long, default_value="200"))]
    pub reset_delay_ms: u32,

    /// Period to wait for bootloader init before sending init character
    #[cfg_attr(feature = "structopt", structopt(long, default_value="200"))]
    pub init_delay_ms: u32,

    /// Number of init characters to send before giving up
    #[cfg_attr(feature = "structopt", structopt(long, default_value="5"))]
    pub init_attempts: u32,

    /// Read / write block size and address stride
    #[cfg_attr(feature = "structopt", structopt(long, default_value="256"))]
    pub block_size: usize,

    /// Acknowledgment reads to attempt after a mass or bank erase
    #[cfg_attr(feature = "structopt", structopt(long, default_value="8"))]
    pub erase_ack_attempts: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            no_reset: false,
            response_timeout_ms: 2000,
            handshake_timeout_ms: 1000,
            poll_delay_ms: 1,
            reset_delay_ms: 200,
            init_delay_ms: 200,
            init_attempts: 5,
            block_size: protocol::MAX_CHUNK,
            erase_ack_attempts: 8,
        }
    }
}

pub struct Programmer<P, D, E> {
    state: State,
    options: Options,
    timeout_ms: u32,
    port: P,
    delay: D,
    _err: PhantomData<E>,
}

impl <P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Create a new programmer instance
    pub fn new(port: P, delay: D, options: Options) -> Self {
        let timeout_ms = options.response_timeout_ms;
        Self{state: State::Init, options, timeout_ms, port, delay, _err: PhantomData}
    }

    /// Fetch the programmer state
    pub fn state(&mut self) -> State {
        self.state
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Override the per-read timeout, returning the previous value for restoration
    pub fn set_timeout(&mut self, timeout_ms: u32) -> u32 {
        core::mem::replace(&mut self.timeout_ms, timeout_ms)
    }

    /// Reset the device into the bootloader and synchronise
    pub fn init(&mut self) -> Result<(), Error<E>> {

        // First, reset device with boot mode selected
        if !self.options.no_reset {
            debug!("Resetting device");

            self.port.set_line(ControlLine::BootMode, true)?;
            self.port.set_line(ControlLine::Reset, true)?;

            self.delay.delay_ms(self.options.reset_delay_ms);

            self.port.set_line(ControlLine::Reset, false)?;

            self.delay.delay_ms(self.options.init_delay_ms);
        }

        self.handshake()
    }

    /// Select (or release) the boot mode line
    pub fn boot_mode(&mut self, on: bool) -> Result<(), Error<E>> {
        self.port.set_line(ControlLine::BootMode, on)?;
        Ok(())
    }

    /// Send init characters until the bootloader acknowledges.
    ///
    /// The device may emit stray bytes before it locks on to the baud rate,
    /// so only the last byte of each read window is checked for the ACK.
    pub fn handshake(&mut self) -> Result<(), Error<E>> {
        let prev = self.set_timeout(self.options.handshake_timeout_ms);
        let res = self.try_handshake();
        self.set_timeout(prev);

        if res.is_ok() {
            self.state = State::Connected;
        }
        res
    }

    fn try_handshake(&mut self) -> Result<(), Error<E>> {
        let mut buff = [0u8; 1024];
        let attempts = self.options.init_attempts;

        for attempt in 1..=attempts {
            debug!("Sending init character (attempt {}/{})", attempt, attempts);
            self.write_all(&[UART_INIT])?;

            let n = self.read_bytes(&mut buff)?;
            trace!("Handshake rx: {:02x?}", &buff[..n]);

            if n > 0 && buff[n - 1] == UART_ACK {
                debug!("Bootloader synchronised");
                return Ok(());
            }
        }

        error!("No bootloader response after {} attempts", attempts);
        Err(Error::HandshakeFailed(attempts))
    }

    /// Fetch bootloader version and supported commands, rejecting devices
    /// without extended erase
    pub fn identify(&mut self) -> Result<BootloaderInfo, Error<E>> {
        self.send_command(Command::Get)?;
        let resp = self.read_response(Command::Get)?;

        let info = match BootloaderInfo::parse(&resp) {
            Some(i) => i,
            None => return Err(Error::InvalidResponse),
        };
        debug!("Bootloader version: 0x{:02x} commands: {:02x?}", info.version, info.commands);

        match info.erase_command() {
            Some(c) if c == Command::ExtendedErase.code() => Ok(info),
            Some(c) => {
                error!("Unsupported erase command: 0x{:02x}", c);
                Err(Error::UnsupportedDevice(c))
            },
            None => Err(Error::InvalidResponse),
        }
    }

    /// Fetch the chip identifier
    pub fn chip_id(&mut self) -> Result<Vec<u8>, Error<E>> {
        self.send_command(Command::GetId)?;
        self.read_response(Command::GetId)
    }

    /// Start executing from the provided address
    pub fn go(&mut self, address: u32) -> Result<(), Error<E>> {
        debug!("Go: 0x{:08x}", address);

        self.send_command(Command::Go)?;
        self.send_address(Command::Go, address)?;

        self.state = State::Running;
        Ok(())
    }

    /// Read a single block of up to 256 bytes
    pub fn read_block(&mut self, address: u32, data: &mut [u8]) -> Result<(), Error<E>> {
        if data.is_empty() || data.len() > protocol::MAX_CHUNK {
            return Err(Error::InvalidArgument("read block must be 1..=256 bytes"));
        }

        trace!("Read {} bytes from 0x{:08x}", data.len(), address);

        self.send_command(Command::ReadMemory)?;
        self.send_address(Command::ReadMemory, address)?;
        self.send_frame(Command::ReadMemory, (data.len() - 1) as u8)?;

        let n = self.read_bytes(data)?;
        if n != data.len() {
            error!("Read timeout at 0x{:08x} ({}/{} bytes)", address, n, data.len());
            return Err(Error::Timeout(Command::ReadMemory));
        }

        Ok(())
    }

    /// Write a single block of up to 256 bytes
    pub fn write_block(&mut self, address: u32, data: &[u8]) -> Result<(), Error<E>> {
        if data.is_empty() || data.len() > protocol::MAX_CHUNK {
            return Err(Error::InvalidArgument("write block must be 1..=256 bytes"));
        }

        trace!("Write {} bytes to 0x{:08x}", data.len(), address);

        self.send_command(Command::WriteMemory)?;
        self.send_address(Command::WriteMemory, address)?;

        let mut payload = Vec::with_capacity(data.len() + 1);
        payload.push((data.len() - 1) as u8);
        payload.extend_from_slice(data);

        self.send_data(Command::WriteMemory, &payload)
    }

    /// Write a command byte and its complement, then await the ACK
    pub(crate) fn send_command(&mut self, command: Command) -> Result<(), Error<E>> {
        debug!("Sending command: {:?}", command);
        self.send_frame(command, command.code())
    }

    /// Write `[b, !b]` and await the ACK, `command` identifies the exchange in errors
    fn send_frame(&mut self, command: Command, b: u8) -> Result<(), Error<E>> {
        self.write_all(&[b, protocol::complement(b)])?;
        self.await_ack(command)
    }

    /// Write a data block followed by its XOR checksum and await the ACK
    pub(crate) fn send_data(&mut self, command: Command, payload: &[u8]) -> Result<(), Error<E>> {
        let block = protocol::with_checksum(payload);
        self.write_all(&block)?;
        self.await_ack(command)
    }

    fn send_address(&mut self, command: Command, address: u32) -> Result<(), Error<E>> {
        self.send_data(command, &address.to_be_bytes())
            .map_err(|e| {
                error!("{:?} address 0x{:08x} not accepted: {}", command, address, e);
                e
            })
    }

    /// Read a length-prefixed response: `L`, then `L + 1` bytes, then ACK
    pub(crate) fn read_response(&mut self, command: Command) -> Result<Vec<u8>, Error<E>> {
        let len = match self.read_byte()? {
            Some(l) => l as usize + 1,
            None => return Err(Error::Timeout(command)),
        };

        let mut data = vec![0u8; len];
        let n = self.read_bytes(&mut data)?;
        if n != len {
            debug!("Response truncated ({}/{} bytes)", n, len);
            return Err(Error::Timeout(command));
        }

        trace!("Response: {:02x?}", data);

        self.await_ack(command)?;

        Ok(data)
    }

    pub(crate) fn await_ack(&mut self, command: Command) -> Result<(), Error<E>> {
        match self.poll_ack(command)? {
            true => Ok(()),
            false => {
                error!("Receive timeout awaiting {:?} ack", command);
                Err(Error::Timeout(command))
            },
        }
    }

    /// Await an ACK, `false` if the read timed out
    pub(crate) fn poll_ack(&mut self, command: Command) -> Result<bool, Error<E>> {
        match self.read_byte()? {
            Some(v) if v == UART_ACK => {
                trace!("Received bootloader ack");
                Ok(true)
            },
            Some(v) if v == UART_NACK => {
                debug!("Received bootloader nack");
                Err(Error::Nack(command))
            },
            Some(v) => {
                debug!("Received unexpected value: 0x{:x}", v);
                Err(Error::Unexpected{command, byte: v})
            },
            None => Ok(false),
        }
    }

    pub(crate) fn write_all(&mut self, data: &[u8]) -> Result<(), Error<E>> {
        trace!("Tx: {:02x?}", data);

        for b in data {
            block!(self.port.write(*b))?;
        }
        block!(self.port.flush())?;

        Ok(())
    }

    /// Poll for a single byte, `None` on timeout
    pub(crate) fn read_byte(&mut self) -> Result<Option<u8>, Error<E>> {
        let mut b = [0u8; 1];
        match self.read_bytes(&mut b)? {
            0 => Ok(None),
            _ => Ok(Some(b[0])),
        }
    }

    /// Fill `data` until full or the read timeout elapses, returning the
    /// number of bytes received
    pub(crate) fn read_bytes(&mut self, data: &mut [u8]) -> Result<usize, Error<E>> {
        let poll = self.options.poll_delay_ms.max(1);
        let mut t = 0;
        let mut n = 0;

        while n < data.len() {
            // Attempt to read from serial port
            match self.port.read() {
                Ok(v) => {
                    data[n] = v;
                    n += 1;
                    continue;
                },
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e.into()),
            };

            if t >= self.timeout_ms {
                break;
            }

            // Wait for delay period
            self.delay.delay_ms(poll);
            t += poll;
        }

        Ok(n)
    }
}
