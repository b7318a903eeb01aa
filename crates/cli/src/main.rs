//! Headless AVR runner.
//!
//! Loads an Intel HEX image into a simulated ATmega328 and runs it until the
//! firmware ends, crashes, hits a breakpoint or the cycle budget runs out.
//! Lines printed on the console register go to stdout.
//!
//! ```text
//! avrsim blink.hex --cycles 16000000 --console 0x3a --option infinite-loop-detect
//! ```

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use avrsim_core::peripherals::atmega328_peripherals;
use avrsim_core::{Area, Device, DeviceConfig, DeviceOptions, DeviceState, Firmware, RunMode, SimLoop, Termination};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "avrsim", version, about = "Run AVR firmware on a simulated ATmega328")]
struct Args {
    /// Firmware image, Intel HEX
    firmware: PathBuf,

    /// Cycle budget, 0 runs until the firmware stops
    #[arg(short, long, default_value_t = 0)]
    cycles: u64,

    /// CPU clock in Hz
    #[arg(short, long, default_value_t = 16_000_000)]
    frequency: u64,

    /// Supply voltage
    #[arg(long, default_value_t = 5.0)]
    vcc: f64,

    /// External ADC reference voltage, defaults to VCC
    #[arg(long)]
    aref: Option<f64>,

    /// Data address of the console register, e.g. 0x3a
    #[arg(long, value_parser = parse_addr)]
    console: Option<u16>,

    /// Device option, repeatable: reset-on-pin-shorting, ignore-bad-cpu-io,
    /// ignore-bad-cpu-lpm, disable-pseudo-sleep, infinite-loop-detect
    #[arg(short, long = "option", value_parser = parse_option)]
    options: Vec<DeviceOptions>,

    /// Pace the simulation to the wall clock
    #[arg(long)]
    realtime: bool,

    /// Flash byte address to break at, repeatable
    #[arg(short, long = "break", value_parser = parse_addr)]
    breakpoints: Vec<u16>,

    /// Restore the device from a state file before running
    #[arg(long)]
    load_state: Option<PathBuf>,

    /// Write the device state to a file when the run ends
    #[arg(long)]
    save_state: Option<PathBuf>,

    /// Log filter, overrides RUST_LOG
    #[arg(long)]
    log: Option<String>,
}

fn parse_addr(s: &str) -> Result<u16, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("bad address {s:?}: {e}"))
}

fn parse_option(s: &str) -> Result<DeviceOptions, String> {
    let name = s.to_ascii_uppercase().replace('-', "_");
    DeviceOptions::from_name(&name).ok_or_else(|| format!("unknown option {s:?}"))
}

fn init_logging(filter: Option<&str>) {
    let filter = match filter {
        Some(f) => EnvFilter::new(f),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log.as_deref());

    let text = fs::read_to_string(&args.firmware)
        .with_context(|| format!("reading {}", args.firmware.display()))?;
    let mut fw = Firmware::from_ihex(&text).with_context(|| format!("parsing {}", args.firmware.display()))?;
    fw.frequency = args.frequency;
    fw.vcc = args.vcc;
    fw.aref = args.aref.unwrap_or(args.vcc);
    fw.console_register = args.console;

    let mut dev = Device::new(DeviceConfig::atmega328(), atmega328_peripherals()).context("building device")?;
    dev.load_firmware(&fw).context("loading firmware")?;
    dev.set_options(args.options.iter().fold(DeviceOptions::empty(), |acc, &o| acc | o));
    tracing::info!("{}: {} bytes of flash, options {:?}", args.firmware.display(), fw.size(Area::Flash), dev.options());

    if let Some(path) = &args.load_state {
        let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        dev.load_state(&data).with_context(|| format!("restoring {}", path.display()))?;
    }

    if !args.breakpoints.is_empty() {
        let mut probe = dev.probe();
        probe.attach();
        for &addr in &args.breakpoints {
            if !probe.insert_breakpoint(addr.into()) {
                bail!("cannot set a breakpoint at {addr:#06x}");
            }
        }
    }

    let mode = if args.realtime { RunMode::Realtime } else { RunMode::Fast };
    // the budget counts from the start of this run, restored cycles excluded
    let end = (args.cycles > 0).then(|| dev.cycle() + args.cycles);
    let report = loop {
        let budget = end.map_or(0, |e| e.saturating_sub(dev.cycle()).max(1));
        let report = SimLoop::new(&mut dev, mode).run(budget);
        for line in dev.take_console_output() {
            println!("{line}");
        }
        if report.termination != Termination::Break {
            break report;
        }
        let core = dev.core();
        eprintln!("break at {:#06x}, cycle {}", core.pc * 2, report.cycle);
        for (i, chunk) in core.regs.chunks(8).enumerate() {
            let regs: Vec<String> = chunk.iter().map(|r| format!("{r:02x}")).collect();
            eprintln!("  r{:<2} {}", i * 8, regs.join(" "));
        }
        eprintln!("  sreg {:08b} sp {:#06x}", core.sreg, core.sp);
        if end.is_some_and(|e| dev.cycle() >= e) {
            break report;
        }
        dev.probe().set_device_state(DeviceState::Running);
    };

    if let Some(path) = &args.save_state {
        let data = dev.save_state().context("saving state")?;
        fs::write(path, data).with_context(|| format!("writing {}", path.display()))?;
    }

    eprintln!("{:?} after {} cycles ({:?})", report.termination, report.cycle, report.state);
    if let Some(crash) = &report.crash {
        bail!("crashed at pc {:#06x}: {:?} {}", crash.pc * 2, crash.reason, crash.message);
    }
    Ok(())
}
