use std::error::Error;
use stlink::{RegisterIndex, StLink};
use structopt::StructOpt;

#[derive(StructOpt)]
struct Opts {
    /// Serial number of the probe to connect to.
    #[structopt(long = "serial")]
    serial: Option<String>,

    /// Halt the core and dump its registers.
    #[structopt(long = "regs")]
    regs: bool,
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
    let mut probe = StLink::open_by_serial(opts.serial.as_deref())?;
    println!("Probe:   {} (firmware {})", probe.serial(), probe.version());
    println!("VTref:   {} V", probe.target_voltage()? as f32 / 1000.0);

    let target = probe.attach()?;
    println!("Target:  {}", target);
    println!("Family:  {}", target.params().family());
    println!(
        "Flash:   {:#010x}..{:#010x}",
        target.flash_base(),
        u64::from(target.flash_base()) + u64::from(target.flash_size())
    );
    println!(
        "SRAM:    {:#010x}..{:#010x}",
        target.sram_base(),
        u64::from(target.sram_base()) + u64::from(target.sram_size())
    );
    println!(
        "Bootrom: {:#010x}..{:#010x}",
        target.sys_base(),
        u64::from(target.sys_base()) + u64::from(target.sys_size())
    );
    println!("Core:    {}", probe.status()?);

    if opts.regs {
        probe.halt()?;
        let regs = probe.read_registers()?;
        for i in 0..=20 {
            if let Some(reg) = RegisterIndex::from_index(i) {
                println!("{:>5} = {:#010x}", reg.to_string(), regs.get(reg)?);
            }
        }
        probe.run()?;
    }

    Ok(())
}
