#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context};
use indicatif::{ProgressBar, ProgressStyle};

use stm32_ser::flash::FLASH_BASE;
use stm32_ser::{EraseSelector, Error, FlashOptions, Options, Programmer, Stage};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "115200")]
    baud: usize,

    /// Load and start address
    #[structopt(long, default_value = "0x08000000", parse(try_from_str = parse_hex))]
    address: u32,

    /// Erase before writing: `all`, `bank1`, `bank2` or a page count
    #[structopt(long)]
    erase: Option<Erase>,

    /// Skip read back verification
    #[structopt(long)]
    no_verify: bool,

    /// Leave the device in the bootloader after writing
    #[structopt(long)]
    no_go: bool,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,

    /// Binary image to write
    #[structopt(parse(from_os_str))]
    image: PathBuf,
}

#[derive(Clone, Debug, PartialEq)]
struct Erase(EraseSelector);

impl FromStr for Erase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let sel = match s {
            "all" => EraseSelector::Mass,
            "bank1" => EraseSelector::Bank1,
            "bank2" => EraseSelector::Bank2,
            n => {
                let count = n.parse::<u16>()
                    .map_err(|_| anyhow!("expected all, bank1, bank2 or a page count"))?;
                if count == 0 {
                    return Err(anyhow!("page count must be non-zero"));
                }
                EraseSelector::first_pages(count)
            },
        };
        Ok(Erase(sel))
    }
}

fn parse_hex(s: &str) -> Result<u32, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(h) => u32::from_str_radix(h, 16),
        None => s.parse(),
    }
}

fn main() -> anyhow::Result<()> {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    let image = std::fs::read(&o.image)
        .with_context(|| format!("reading image {}", o.image.display()))?;
    info!("Loaded {} ({})", o.image.display(), bytefmt::format(image.len() as u64));

    info!("Connecting to serial port");

    let mut p = Programmer::linux(&o.port, o.baud, o.options.clone())
        .with_context(|| format!("opening serial port {}", o.port))?;

    info!("Connecting to bootloader");

    p.init().context("connecting to bootloader")?;

    info!("Bootloader connected!");

    let flash = FlashOptions {
        address: o.address,
        erase: o.erase.map(|e| e.0),
        verify: !o.no_verify,
        go: !o.no_go,
    };
    if flash.address != FLASH_BASE {
        warn!("Using non-default load address 0x{:08x}", flash.address);
    }

    let bar = ProgressBar::new(image.len() as u64);
    bar.set_style(ProgressStyle::default_bar()
        .template("{msg:8} [{bar:40}] {bytes}/{total_bytes}")
        .progress_chars("=> "));
    let mut current = None;

    let res = p.flash(&image, &flash, |stage, done, total| {
        if current != Some(stage) {
            current = Some(stage);
            bar.set_length(total as u64);
            bar.set_message(match stage {
                Stage::Erase => "erase",
                Stage::Write => "write",
                Stage::Verify => "verify",
                Stage::Go => "go",
            });
        }
        bar.set_position(done as u64);
    });

    if let Err(e) = res {
        bar.abandon();

        if let Error::VerifyFailed{ address } = &e {
            let start = address.wrapping_sub(o.address) as usize;
            let end = (start + 16).min(image.len());
            error!("Expected from 0x{:08x}: {}", address, hex::encode(&image[start..end]));
        }

        return Err(e).context("programming device");
    }

    bar.finish_and_clear();

    if !o.no_go {
        p.boot_mode(false).context("releasing boot mode")?;
        info!("Device started at 0x{:08x}", o.address);
    } else {
        info!("Programming complete");
    }

    Ok(())
}
