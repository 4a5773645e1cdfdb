//! A command-line tool for glitching past the ID code protection of a
//! Renesas RH850 serial boot ROM and dumping its flash.
//!
//! Two serial ports are involved: one wired to the target's boot UART, whose
//! DTR line drives the target's reset, and one to the pulse generator that
//! actually fires the glitch.

use std::{path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::ProgressBar;
use rh850_glitch::{
    link,
    sweep::Output,
    GlitchParameters, Sweep, SweepEnd, SweepPlan, SweepRange, TargetProfile, Timing,
};

/// A tool for glitching an RH850 boot ROM into giving up its flash.
///
/// Each attempt loads a delay and pulse width into the pulse generator,
/// releases the target from reset and walks the boot ROM through its
/// handshake. Attempts where the protection holds are retried with the next
/// parameter pair; the first one that gets through is used to dump the
/// entire flash.
#[derive(Debug, Parser)]
#[clap(version)]
struct GlitchTool {
    /// Target profile (RON). Defaults to the built-in RH850/P1M-E profile.
    #[clap(long, global = true)]
    profile: Option<PathBuf>,
    /// More logging; repeat for even more.
    #[clap(long, short = 'v', global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[clap(subcommand)]
    cmd: SubCmd,
}

#[derive(Debug, Subcommand)]
enum SubCmd {
    /// Sweeps glitch parameters until the boot ROM lets us in, then dumps
    /// flash.
    Sweep {
        #[clap(flatten)]
        ports: Ports,
        /// Delay range, in pulse generator cycles: START..END[:STEP].
        #[clap(long, default_value = "23650..23750:10")]
        delay: SweepRange,
        /// Pulse width range, in pulse generator cycles: START..END[:STEP].
        #[clap(long, default_value = "17..20")]
        width: SweepRange,
        /// Skip every parameter pair up to and including this one, as
        /// DELAY,WIDTH. Use to pick up an interrupted sweep.
        #[clap(long)]
        resume_after: Option<GlitchParameters>,
    },
    /// Makes a single attempt with the given parameters.
    Attempt {
        #[clap(flatten)]
        ports: Ports,
        #[clap(value_parser = parse_int::parse::<u32>)]
        delay: u32,
        #[clap(value_parser = parse_int::parse::<u32>)]
        width: u32,
    },
    /// Prints the blocks the flash will be read in.
    Blocks,
    /// Prints the target profile in use, in a form `--profile` accepts.
    Profile,
}

#[derive(Debug, Args)]
struct Ports {
    /// Serial port connected to the target's boot UART. Its DTR line drives
    /// the target's reset.
    control: String,
    /// Serial port connected to the pulse generator.
    pulse: String,
    #[clap(long, default_value_t = 9600)]
    baud_rate: u32,
    #[clap(long, default_value_t = 115_200)]
    pulse_baud_rate: u32,
    /// Read timeout on the control channel.
    #[clap(long, default_value_t = 100)]
    timeout_ms: u64,
    /// How long the target gets to come out of reset before we talk to it.
    #[clap(long, default_value_t = 100)]
    settle_ms: u64,
    /// Pause after putting the target back in reset.
    #[clap(long, default_value_t = 200)]
    cooldown_ms: u64,
    /// Output file.
    #[clap(long, short, default_value = "out.bin")]
    output: PathBuf,
    /// Keep complete blocks already in the output file and read the rest.
    #[clap(long)]
    resume: bool,
}

impl Ports {
    fn timing(&self) -> Timing {
        Timing {
            read_timeout: Duration::from_millis(self.timeout_ms),
            settle: Duration::from_millis(self.settle_ms),
            cooldown: Duration::from_millis(self.cooldown_ms),
            ..Timing::default()
        }
    }
}

fn main() -> Result<()> {
    let args = GlitchTool::parse();

    env_logger::Builder::new()
        .filter_level(log_level(args.verbose))
        .parse_default_env()
        .init();

    let profile = match &args.profile {
        Some(path) => TargetProfile::load(path)?,
        None => TargetProfile::default(),
    };

    match args.cmd {
        SubCmd::Sweep { ports, delay, width, resume_after } => {
            let mut plan = SweepPlan::new(delay, width);
            if let Some(last) = resume_after {
                plan = plan.resume_after(last)?;
            }
            run_sweep(&ports, &profile, &plan)?;
        }
        SubCmd::Attempt { ports, delay, width } => {
            run_sweep(&ports, &profile, &SweepPlan::single(GlitchParameters { delay, width })?)?;
        }
        SubCmd::Blocks => {
            let blocks = profile.layout.blocks()?;
            println!("{}: {} blocks, {} bytes", profile.name, blocks.len(), profile.layout.total_size());
            for b in blocks {
                println!("{b}  ({:#x} bytes)", b.len());
            }
        }
        SubCmd::Profile => {
            let text = ron::ser::to_string_pretty(&profile, ron::ser::PrettyConfig::default())
                .context("formatting profile")?;
            println!("{text}");
        }
    }

    Ok(())
}

/// `RUST_LOG`, when set, still overrides this.
fn log_level(verbose: u8) -> log::LevelFilter {
    match verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

fn run_sweep(ports: &Ports, profile: &TargetProfile, plan: &SweepPlan) -> Result<()> {
    let timing = ports.timing();

    let control = link::open(&ports.control, ports.baud_rate, timing.read_timeout)?;
    let pulse = link::open(&ports.pulse, ports.pulse_baud_rate, timing.read_timeout)?;
    let reopen = || link::open(&ports.control, ports.baud_rate, timing.read_timeout);

    let output = Output { path: ports.output.clone(), resume: ports.resume };
    let mut sweep = Sweep::new(control, reopen, pulse, profile, timing, output)?
        .with_progress(ProgressBar::new(profile.layout.total_size()));

    println!("trying {} parameter pairs against {}", plan.len(), profile.name);
    let end = sweep.run(plan);

    println!("attempt outcomes:");
    for (outcome, count) in sweep.tally() {
        println!("{:24} {count}", format!("{outcome:?}"));
    }

    match end? {
        SweepEnd::Dumped { params, session, bytes } => {
            println!("unlocked with {params}");
            println!("device type: {:02x?}", session.device.device_type);
            println!("wrote {bytes} bytes to {}", ports.output.display());
        }
        SweepEnd::Partial { params, bytes, error } => {
            println!("unlocked with {params}, but only {bytes} bytes were read");
            println!("rerun with --resume to continue the image");
            return Err(error).context("dump incomplete");
        }
        SweepEnd::Exhausted => {
            if let Some(last) = sweep.last_tried() {
                println!("last tried: {},{}", last.delay, last.width);
            }
            bail!("no parameter pair got past the protection");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_raises_the_filter() {
        assert_eq!(log_level(0), log::LevelFilter::Info);
        assert_eq!(log_level(1), log::LevelFilter::Debug);
        assert_eq!(log_level(2), log::LevelFilter::Trace);
        assert_eq!(log_level(7), log::LevelFilter::Trace);
    }

    #[test]
    fn verbose_flag_reaches_the_logger() {
        let args = GlitchTool::parse_from(["rh850-glitch", "-vv", "blocks"]);
        assert_eq!(args.verbose, 2);

        let logger = env_logger::Builder::new()
            .filter_level(log_level(args.verbose))
            .build();
        let debug = log::Metadata::builder().level(log::Level::Debug).target("rh850_glitch").build();
        let trace = log::Metadata::builder().level(log::Level::Trace).target("rh850_glitch").build();
        assert!(log::Log::enabled(&logger, &debug));
        assert!(log::Log::enabled(&logger, &trace));

        let quiet = env_logger::Builder::new().filter_level(log_level(0)).build();
        assert!(!log::Log::enabled(&quiet, &debug));
    }
}
