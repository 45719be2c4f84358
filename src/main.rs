use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use confique::Config;
use log::{info, LevelFilter};
use simplelog::{ColorChoice, TermLogger, TerminalMode};

use wave_daq::{Conf, DigitizerSdk, Drs, SimSdk};

/// Single-shot waveform digitizer readout.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Path to the TOML run configuration.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Use the built-in simulated digitizer instead of hardware.
    #[arg(long)]
    sim: bool,

    /// Run the timing and voltage calibration before acquiring
    /// (inputs must be disconnected).
    #[arg(long)]
    calibrate: bool,

    /// Number of events to acquire, overriding the configuration.
    #[arg(short, long)]
    events: Option<usize>,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[cfg(feature = "drs_hardware")]
fn hardware_sdk() -> Result<Box<dyn DigitizerSdk>> {
    Ok(Box::new(wave_daq::hw::HwSdk::create()?))
}

#[cfg(not(feature = "drs_hardware"))]
fn hardware_sdk() -> Result<Box<dyn DigitizerSdk>> {
    anyhow::bail!(
        "built without the drs_hardware feature; rerun with --sim \
         or rebuild with --features drs_hardware"
    )
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    TermLogger::init(
        level,
        simplelog::Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )?;

    let mut builder = Conf::builder().env();
    if let Some(path) = &args.config {
        builder = builder.file(path);
    }
    let conf = builder.load().context("loading run configuration")?;

    let sdk: Box<dyn DigitizerSdk> = if args.sim {
        info!("using the simulated digitizer backend");
        Box::new(SimSdk::new())
    } else {
        hardware_sdk()?
    };

    let mut drs = Drs::open(sdk).context("opening digitizer")?;
    drs.set_trigger(
        conf.trigger.channel,
        conf.trigger.level,
        conf.trigger.edge,
        conf.trigger.delay_ns,
    )?;
    drs.set_rate(conf.acquisition.rate)?;
    drs.set_samples(conf.acquisition.samples);
    info!(
        "sampling at {:.3} GHz, {} samples, trigger channel {}",
        drs.rate()?,
        drs.samples(),
        drs.trigger_channel()
    );

    if args.calibrate || conf.run.calibrate {
        drs.run_calibration()
            .context("running board calibration")?;
        info!("calibration complete");
    }

    let events = args.events.unwrap_or(conf.run.events);
    let channel = conf.run.channel;
    for event in 0..events {
        drs.start_collect()?;
        drs.wait_ready()?;

        let wave = drs.waveform(channel)?;
        let peak = wave.iter().copied().fold(f32::INFINITY, f32::min);
        let charge = drs.integrate(
            channel,
            conf.integration.int_start,
            conf.integration.int_stop,
            conf.integration.ped_start,
            conf.integration.ped_stop,
        )?;
        info!(
            "event {event}: {} samples, peak {peak:.4} V, charge {charge:.4} V*ns",
            wave.len()
        );
    }

    Ok(())
}
