use std::error::Error;
use std::io::Write;
use std::thread;
use std::time::{Duration, Instant};
use stlink::{ConfigurationIssues, StLink, TraceConfig, TraceDecoder, TRACE_BUF_LEN};
use structopt::StructOpt;

#[derive(StructOpt)]
struct Opts {
    /// Serial number of the probe to connect to.
    #[structopt(long = "serial")]
    serial: Option<String>,

    /// Frequency the target core runs at, in Hz.
    #[structopt(long = "core-clock", default_value = "72000000")]
    core_clock: u32,

    /// SWO baud rate.
    #[structopt(long = "freq", short = "f", default_value = "2000000")]
    frequency: u32,

    /// Stop after this many seconds.
    #[structopt(long = "duration")]
    duration: Option<u64>,
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
    let target = probe.attach()?;
    eprintln!("Attached to {}", target);

    let config = TraceConfig {
        core_clock_hz: opts.core_clock,
        trace_hz: opts.frequency,
    };
    eprintln!(
        "Tracing at {} Hz with a {} Hz core clock",
        config.trace_hz, config.core_clock_hz
    );
    eprintln!("-----------------------------------------");

    probe.start_trace(&config)?;
    probe.run()?;

    let mut decoder = TraceDecoder::new();
    let mut buf = vec![0; TRACE_BUF_LEN];
    let out = std::io::stdout();
    let mut out = out.lock();
    let start = Instant::now();

    loop {
        let len = probe.read_trace(&mut buf)?;
        decoder.record_read(len, TRACE_BUF_LEN);
        decoder.feed(&buf[..len], &mut out)?;

        if let Some(issues) = decoder.check_configuration(start.elapsed()) {
            report(issues);
        }
        if let Some(secs) = opts.duration {
            if start.elapsed() >= Duration::from_secs(secs) {
                break;
            }
        }
        if len == 0 {
            thread::sleep(Duration::from_millis(10));
        }
    }

    probe.stop_trace()?;
    out.flush()?;

    eprintln!("-----------------------------------------");
    eprintln!("{}", decoder.counters());
    let opcodes = decoder.unknown_opcodes().collect::<Vec<_>>();
    if !opcodes.is_empty() {
        eprintln!("Unknown opcodes: {:02x?}", opcodes);
    }
    let sources = decoder.unknown_sources().collect::<Vec<_>>();
    if !sources.is_empty() {
        eprintln!("Unknown sources: {:?}", sources);
    }

    Ok(())
}

fn report(issues: ConfigurationIssues) {
    if issues.is_empty() {
        eprintln!("Trace configuration looks good.");
        return;
    }
    if issues.contains(ConfigurationIssues::NO_DATA) {
        eprintln!("warning: hardly any trace data arrived; is the core clock right?");
    }
    if issues.contains(ConfigurationIssues::BAD_DATA) {
        eprintln!("warning: the trace stream looks corrupted; check the core clock and baud rate");
    }
    if issues.contains(ConfigurationIssues::DROPPED_DATA) {
        eprintln!("warning: the probe buffer ran full and data was dropped");
    }
}
