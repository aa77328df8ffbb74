//! Wire level definitions for the STM32 USART bootloader (AN3155).

/// Synchronisation (auto-baud) byte sent to enter command mode
pub const UART_INIT: u8 = 0x7F;

pub const UART_ACK: u8 = 0x79;
pub const UART_NACK: u8 = 0x1F;

/// Maximum payload of a single read or write command
pub const MAX_CHUNK: usize = 256;

/// Extended erase sentinel for a full mass erase
pub const ERASE_MASS: u16 = 0xFFFF;
/// Extended erase sentinel for erasing bank 1
pub const ERASE_BANK_1: u16 = 0xFFFE;
/// Extended erase sentinel for erasing bank 2
pub const ERASE_BANK_2: u16 = 0xFFFD;

/// Page counts at or above this value collide with the reserved sentinels
pub const MAX_ERASE_PAGES: usize = 0xFFF0;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Command {
    /// Fetch bootloader version and allowed commands
    Get = 0x00,

    /// Gets the chip ID
    GetId = 0x02,

    /// Reads up to 256 bytes of memory starting from an address specified by the application.
    ReadMemory = 0x11,

    /// Jumps to user application code located in the internal Flash memory or in the SRAM.
    Go = 0x21,

    /// Writes up to 256 bytes to the RAM or Flash memory starting from an address specified by the application.
    WriteMemory = 0x31,

    /// Erases from one to all the Flash memory pages.
    Erase = 0x43,

    /// Erases from one to all the Flash memory pages using two byte addressing mode (available only for v3.0 USART bootloader versions and above).
    ExtendedErase = 0x44,
}

impl Command {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// XOR of all bytes, used as the trailer of every data block
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, b| acc ^ b)
}

/// One's complement, sent after every command byte
pub fn complement(b: u8) -> u8 {
    0xFF ^ b
}

/// Append the XOR checksum to a payload
pub fn with_checksum(payload: &[u8]) -> Vec<u8> {
    let mut block = Vec::with_capacity(payload.len() + 1);
    block.extend_from_slice(payload);
    block.push(checksum(payload));
    block
}

/// Flash regions addressable by the extended erase command
#[derive(Clone, PartialEq, Debug)]
pub enum EraseSelector {
    /// Erase the entire flash array
    Mass,
    /// Erase bank 1 only
    Bank1,
    /// Erase bank 2 only
    Bank2,
    /// Erase an explicit list of pages
    Pages(Vec<u16>),
}

impl EraseSelector {
    /// Select `count` pages starting at page 0
    pub fn first_pages(count: u16) -> Self {
        EraseSelector::Pages((0..count).collect())
    }

    /// Reserved sentinel code, `None` for page lists
    pub fn sentinel(&self) -> Option<u16> {
        match self {
            EraseSelector::Mass => Some(ERASE_MASS),
            EraseSelector::Bank1 => Some(ERASE_BANK_1),
            EraseSelector::Bank2 => Some(ERASE_BANK_2),
            EraseSelector::Pages(_) => None,
        }
    }
}

/// Encode the page selector payload: `[count - 1][page]*`, big-endian.
///
/// The caller appends the checksum. Returns `None` for empty lists or lists
/// long enough that the count would read as a sentinel.
pub fn encode_pages(pages: &[u16]) -> Option<Vec<u8>> {
    if pages.is_empty() || pages.len() > MAX_ERASE_PAGES {
        return None;
    }

    let mut data = Vec::with_capacity(2 + pages.len() * 2);
    data.extend_from_slice(&((pages.len() - 1) as u16).to_be_bytes());
    for p in pages {
        data.extend_from_slice(&p.to_be_bytes());
    }

    Some(data)
}

/// Parsed response to the GET command
#[derive(Clone, PartialEq, Debug)]
pub struct BootloaderInfo {
    /// Bootloader protocol version, BCD encoded (0x31 = v3.1)
    pub version: u8,
    /// Command codes supported by this bootloader, in the order reported
    pub commands: Vec<u8>,
}

impl BootloaderInfo {
    /// Parse a GET response payload (version byte followed by command codes)
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let (version, commands) = payload.split_first()?;
        Some(Self {
            version: *version,
            commands: commands.to_vec(),
        })
    }

    /// Erase command advertised by the device (payload byte 7)
    pub fn erase_command(&self) -> Option<u8> {
        self.commands.get(6).copied()
    }

    pub fn supports(&self, command: Command) -> bool {
        self.commands.contains(&command.code())
    }
}
