use std::error::Error;
use std::num::ParseIntError;
use std::path::PathBuf;
use stlink::{FlashOptions, StLink};
use structopt::StructOpt;

fn parse_hex(src: &str) -> Result<u32, ParseIntError> {
    let src = src.trim_start_matches("0x");
    u32::from_str_radix(src, 16)
}

#[derive(StructOpt)]
struct Opts {
    /// Serial number of the probe to connect to.
    #[structopt(long = "serial")]
    serial: Option<String>,

    /// Only erase the pages the image would cover.
    #[structopt(long = "erase-only")]
    erase_only: bool,

    /// Erase the whole flash first.
    #[structopt(long = "mass-erase")]
    mass_erase: bool,

    /// Don't read back and compare the written data.
    #[structopt(long = "no-verify")]
    no_verify: bool,

    /// Start address in hex (eg. 0x08000000).
    #[structopt(parse(try_from_str = parse_hex))]
    address: u32,

    /// Raw binary image to program.
    #[structopt(parse(from_os_str))]
    file: PathBuf,
}

fn main() {
    env_logger::init();

    let opts = Opts::from_args();
    if let Err(e) = run(opts) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn run(opts: Opts) -> Result<(), Box<dyn Error>> {
    let image = std::fs::read(&opts.file)?;

    let mut probe = StLink::open_by_serial(opts.serial.as_deref())?;
    let target = probe.attach()?;
    eprintln!("Attached to {}", target);

    probe.set_flash_options(FlashOptions {
        verify: !opts.no_verify,
        ..FlashOptions::default()
    });

    if opts.mass_erase {
        eprintln!("Mass erasing...");
        probe.mass_erase()?;
    }

    if opts.erase_only {
        eprintln!("Erasing {} bytes at {:#010x}", image.len(), opts.address);
        probe.erase_range(opts.address, image.len())?;
        return Ok(());
    }

    // Flash writes need an even length.
    let mut image = image;
    if image.len() % 2 != 0 {
        image.push(target.params().family().erased_value());
    }

    eprintln!("Writing {} bytes to {:#010x}", image.len(), opts.address);
    probe.write_flash(opts.address, &image)?;
    probe.reset()?;
    eprintln!("Done.");

    Ok(())
}
