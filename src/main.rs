use std::fs::OpenOptions;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pbbes::config::Config;
use pbbes::connection::{self, Connection};
use pbbes::display::{self, TerminalGuard};
use pbbes::keyboard::{KeyDecoder, RawStdin};
use pbbes::record::Recorder;
use pbbes::{Console, Device, Flow, IntervalScheduler, SystemClock};

/// Longest accepted session label.
const LABEL_MAX: usize = 80;

/// Pause between the two calibration cycles.
const CALIBRATION_PAUSE: Duration = Duration::from_millis(200);

const BANNER: &str = "\
=============================================================================
ForeSail-1 / PATE Bias Board Evaluation Software
=============================================================================";

#[derive(Parser, Debug)]
#[command(name = "pbbes", version, about = "Operator console for the PATE bias board")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Serial port device.
    #[arg(short, long)]
    device: Option<String>,

    /// Logging level.
    #[arg(
        short,
        long,
        value_name = "LEVEL",
        value_parser = ["error", "warn", "info", "debug", "trace"],
        ignore_case = true
    )]
    log: Option<String>,

    /// Measurement interval in seconds.
    #[arg(short, long, value_name = "SECONDS", value_parser = clap::value_parser!(u16).range(1..=999))]
    interval: Option<u16>,

    /// Skip the start-up calibration.
    #[arg(long)]
    no_calibrate: bool,

    /// Do not record measurements to CSV.
    #[arg(long)]
    no_csv: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{:#}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logging(&config) {
        eprintln!("{:#}", e);
        return ExitCode::FAILURE;
    }

    match run(&cli, &config) {
        Ok(()) => {
            println!("Program terminated normally.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = ?e, "abnormal program termination");
            eprintln!("{:#}", e);
            eprintln!(
                "\x1b[31;1mAbnormal program termination! See '{}' for details.\x1b[0m",
                config.log.file.display()
            );
            ExitCode::FAILURE
        }
    }
}

/// Defaults, then the config file, then command-line flags.
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(device) = &cli.device {
        config.serial.device = device.clone();
    }
    if let Some(level) = &cli.log {
        config.log.level = level.to_lowercase();
    }
    if let Some(interval) = cli.interval {
        config.schedule.interval_secs = interval;
    }
    config.validate()?;
    Ok(config)
}

fn init_logging(config: &Config) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.log.file)
        .with_context(|| format!("cannot open log file '{}'", config.log.file.display()))?;
    let filter = EnvFilter::try_new(&config.log.level)
        .with_context(|| format!("invalid log level '{}'", config.log.level))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .init();
    Ok(())
}

fn run(cli: &Cli, config: &Config) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "program execution started");
    info!(seconds = config.schedule.interval_secs, "measurement interval");

    let device_path = &config.serial.device;
    let port = connection::open(&config.serial)
        .map_err(|e| {
            eprintln!("To allow non-root user access to serial device:");
            eprintln!("    sudo usermod -a -G dialout $USER");
            e
        })
        .with_context(|| format!("unable to open serial port '{}'", device_path))?;
    let mut device = Device::new(port);
    let firmware = device.version().with_context(|| {
        format!(
            "unsuccessful communication test on port '{}' ({})",
            device_path,
            device.serial_parameters()
        )
    })?;
    info!(
        device = %device_path,
        parameters = %device.serial_parameters(),
        %firmware,
        "connected to bias board"
    );

    println!("{}", BANNER);
    println!("pbbes {} / firmware {}\n", env!("CARGO_PKG_VERSION"), firmware);
    let label = read_label()?;
    if !cli.no_calibrate {
        calibrate(&mut device)?;
    }

    let scheduler = IntervalScheduler::new(
        SystemClock,
        config.schedule.heartbeat(),
        config.schedule.interval(),
        config.schedule.time_window(),
    );
    let keys = KeyDecoder::new(RawStdin::new().context("cannot switch stdin to non-blocking")?);
    let mut guard = TerminalGuard::enter().context("cannot set up the terminal")?;

    let mut console = Console::new(device, scheduler, keys)?;
    if !cli.no_csv {
        let (recorder, path) = Recorder::create(Path::new("."), Local::now(), &label, &firmware)
            .context("failed creating CSV file")?;
        info!(path = %path.display(), "recording measurements");
        console = console.with_recorder(recorder);
    }

    loop {
        guard
            .terminal_mut()
            .draw(|frame| display::render(frame, &console))?;
        if console.tick()? == Flow::Quit {
            break;
        }
    }
    Ok(())
}

fn read_label() -> Result<String> {
    println!("Enter label/note for the session (max {} characters):", LABEL_MAX);
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let label: String = line.trim_end_matches(['\r', '\n']).chars().take(LABEL_MAX).collect();
    info!(%label, "session label");
    Ok(label)
}

/// Runs the `RRR` cycle twice, echoing the board's progress output.
fn calibrate<C: Connection>(device: &mut Device<C>) -> Result<()> {
    for n in 1..=2 {
        println!("\x1b[33mCalibration #{}\x1b[0m", n);
        device
            .calibrate(|chunk| {
                print!("{}", chunk);
                let _ = io::stdout().flush();
            })
            .with_context(|| format!("calibration #{} failed", n))?;
        thread::sleep(CALIBRATION_PAUSE);
    }
    info!("calibration complete");
    Ok(())
}
