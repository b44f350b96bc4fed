use stlink::*;

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let list = stlink::scan_usb()?.collect::<Vec<_>>();
    println!(
        "Found {} ST-Link probe{}.",
        list.len(),
        if list.len() == 1 { "" } else { "s" },
    );

    for devinfo in list {
        println!();
        print!(
            "Bus {:03} Address {:03}: VID={:04x} PID={:04X} {} – ",
            devinfo.bus_number(),
            devinfo.address(),
            devinfo.vid(),
            devinfo.pid(),
            devinfo.model().name(),
        );

        match devinfo.open() {
            Ok(mut probe) => {
                println!("Serial {}", probe.serial());
                match detailed_info(&mut probe) {
                    Ok(info) => println!("⤷ {}", info),
                    Err(e) => println!("⤷ <{}>", e),
                }
            }
            Err(e) => println!("<{}>", e),
        }
    }

    Ok(())
}

fn detailed_info(probe: &mut StLink) -> Result<String> {
    let version = *probe.version();
    let features = probe.features();
    let mode = probe.current_mode()?;
    let voltage = probe.target_voltage()?;

    Ok(format!(
        "Firmware {}, {} mode, features {:?}, VTref {} V",
        version,
        mode,
        features,
        voltage as f32 / 1000.0
    ))
}
