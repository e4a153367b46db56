use anyhow::Context;
use burnin::probe::DeviceHandle;
use burnin::session::DEFAULT_STATE_ROOT;
use burnin::{devices, AcceptanceTest, RunOutcome, RunPolicy, TestError, TestResult};
use clap::Parser;
use colored::Colorize;
use std::io::{self, Write};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "burnin")]
#[command(about = "Acceptance-test orchestrator for block storage devices (SMART self-tests, destructive surface scan, health comparison)")]
#[command(version = "1.0.0")]
struct Cli {
    /// Target block device (e.g. /dev/sda); prompts interactively when absent
    #[arg(short, long)]
    device: Option<String>,

    /// Fully unattended mode: auto-confirm the destructive-action warning and
    /// the resume-vs-fresh decision (unattended runs start fresh)
    #[arg(short = 'y', long)]
    yes: bool,

    /// Resume an incomplete session for the device without prompting
    #[arg(long)]
    resume: bool,

    /// Root directory for persisted session state
    #[arg(long, default_value = DEFAULT_STATE_ROOT)]
    state_dir: PathBuf,

    /// Skip the tmux/screen session-persistence check
    #[arg(long)]
    skip_session_check: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    env_logger::Builder::from_default_env()
        .filter_level(if cli.debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Warn
        })
        .init();

    print_banner();

    match run(cli).await {
        // User-cancelled is a clean exit: nothing was written to the device.
        Ok(RunOutcome::Cancelled) | Ok(RunOutcome::Completed { .. }) => {
            std::process::exit(0);
        }
        Err(e) => {
            eprintln!();
            eprintln!("{}", format!("❌ {}", e).red().bold());
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<RunOutcome> {
    let device_path = match cli.device {
        Some(path) => path,
        None => select_device_interactively()?,
    };

    devices::preflight(&device_path, cli.skip_session_check)?;

    let device = DeviceHandle::identify(&device_path)
        .with_context(|| format!("failed to identify {}", device_path))?;
    println!(
        "Identified {}: {} (serial {}, bus {})",
        device.path, device.model, device.serial, device.bus
    );

    let policy = RunPolicy {
        auto_confirm: cli.yes,
        resume: cli.resume,
    };
    let mut test = AcceptanceTest::begin(&cli.state_dir, device, policy)?;
    log::debug!("session directory: {}", test.session_dir().display());

    Ok(test.run().await?)
}

fn select_device_interactively() -> TestResult<String> {
    let candidates = devices::list_devices()?;
    if candidates.is_empty() {
        return Err(TestError::Precondition(
            "no candidate block devices found".to_string(),
        ));
    }

    println!();
    println!("Detected block devices:");
    for (i, dev) in candidates.iter().enumerate() {
        println!("  [{}] {:<14} {:>8}  {}", i + 1, dev.path, dev.size, dev.model);
    }

    loop {
        print!("Select device to test [1-{}] (or q to quit): ", candidates.len());
        io::stdout().flush()?;
        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        let trimmed = input.trim();

        if trimmed.eq_ignore_ascii_case("q") {
            return Err(TestError::Precondition("no device selected".to_string()));
        }
        if let Ok(n) = trimmed.parse::<usize>() {
            if (1..=candidates.len()).contains(&n) {
                return Ok(candidates[n - 1].path.clone());
            }
        }
        println!("Invalid selection.");
    }
}

fn print_banner() {
    println!();
    println!("{}", "┌──────────────────────────────────────────────┐".cyan());
    println!(
        "{}",
        "│  burnin — drive acceptance test orchestrator │".cyan().bold()
    );
    println!("{}", "└──────────────────────────────────────────────┘".cyan());
}
