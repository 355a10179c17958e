use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use volknob::audio::{AlsaCatalog, EndpointCatalog};
use volknob::config::{AppConfig, ConfigStore};
use volknob::control::ControlSession;
use volknob::error::{AppError, Result};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// volknob command line arguments
#[derive(Parser, Debug)]
#[command(name = "volknob")]
#[command(version, about = "Bridge a serial volume knob to an audio endpoint", long_about = None)]
struct CliArgs {
    /// Path to the configuration file
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Serial device path (overrides config)
    #[arg(short = 'd', long, value_name = "PATH")]
    device: Option<String>,

    /// Baud rate (overrides config)
    #[arg(short = 'b', long, value_name = "BAUD")]
    baud: Option<u32>,

    /// Endpoint index, skips the interactive prompt
    #[arg(short = 'e', long, value_name = "INDEX")]
    endpoint: Option<usize>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List audio render endpoints
    List,
    /// Run the control loop (default)
    Run,
    /// Apply a one-shot volume level and exit
    Set {
        /// Volume level in [0.0, 1.0]
        level: f64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting volknob v{}", env!("CARGO_PKG_VERSION"));

    let config_path = resolve_config_path(args.config);
    let config_store = ConfigStore::load(&config_path).await?;
    let mut config = (*config_store.get()).clone();

    // Apply CLI argument overrides to config (only if explicitly specified)
    if let Some(device) = args.device {
        config.serial.device = device;
    }
    if let Some(baud) = args.baud {
        config.serial.baud_rate = baud;
    }

    let catalog = AlsaCatalog::discover()?;

    let result = match args.command.unwrap_or(Command::Run) {
        Command::List => {
            print_endpoints(&catalog);
            Ok(())
        }
        Command::Set { level } => set_once(&catalog, args.endpoint, level),
        Command::Run => run_control(config, catalog, args.endpoint).await,
    };

    if let Err(e) = result {
        tracing::error!("{}", e);
        std::process::exit(e.exit_code());
    }

    Ok(())
}

/// Run a control session until ctrl-c or a fatal link failure.
async fn run_control(
    config: AppConfig,
    catalog: AlsaCatalog,
    endpoint: Option<usize>,
) -> Result<()> {
    if catalog.list().is_empty() {
        return Err(AppError::Config(
            "no audio render endpoints found".to_string(),
        ));
    }

    print_endpoints(&catalog);
    let selection = match endpoint {
        Some(index) => index,
        None => prompt_endpoint_index(catalog.list().len())?,
    };

    let cancel = CancellationToken::new();
    let session = ControlSession::start(
        Box::new(catalog),
        selection,
        config.serial.clone(),
        config.control.clone(),
        cancel.clone(),
    );

    // Drain the session cooperatively on ctrl-c
    let signal_task = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown signal received");
                cancel.cancel();
            }
        }
    });

    let result = session.join().await;
    signal_task.abort();

    if result.is_ok() {
        tracing::info!("Control session stopped");
    }
    result
}

/// Apply one volume level to a chosen endpoint and exit.
fn set_once(catalog: &AlsaCatalog, endpoint: Option<usize>, level: f64) -> Result<()> {
    if catalog.list().is_empty() {
        return Err(AppError::Config(
            "no audio render endpoints found".to_string(),
        ));
    }

    print_endpoints(catalog);
    let selection = match endpoint {
        Some(index) => index,
        None => prompt_endpoint_index(catalog.list().len())?,
    };

    let mut sink = catalog.activate(selection)?;
    match sink.get_scalar() {
        Ok(current) => println!(
            "Current volume for {}: {:.1}%",
            sink.name(),
            current * 100.0
        ),
        Err(e) => tracing::warn!("Failed to read current volume: {}", e),
    }

    let level = level.clamp(0.0, 1.0);
    sink.set_scalar(level)?;
    println!("Volume changed to: {:.1}%", level * 100.0);
    Ok(())
}

/// Print the numbered endpoint listing.
fn print_endpoints(catalog: &AlsaCatalog) {
    let endpoints = catalog.list();
    println!("Number of audio output endpoints: {}", endpoints.len());
    for (index, endpoint) in endpoints.iter().enumerate() {
        println!("{:>3}) {}", index, endpoint.description);
    }
}

/// Prompt for an endpoint index on stdin.
///
/// Non-numeric input re-prompts; range validation is the session's job so an
/// out-of-range index surfaces as its selection failure.
fn prompt_endpoint_index(count: usize) -> Result<usize> {
    let mut line = String::new();
    loop {
        print!("Input device number [0-{}]: ", count.saturating_sub(1));
        std::io::stdout().flush()?;

        line.clear();
        if std::io::stdin().read_line(&mut line)? == 0 {
            return Err(AppError::Config(
                "endpoint selection aborted, stdin closed".to_string(),
            ));
        }

        match line.trim().parse::<usize>() {
            Ok(index) => return Ok(index),
            Err(_) => println!("Not a number: {}", line.trim()),
        }
    }
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "volknob=error",
        LogLevel::Warn => "volknob=warn",
        LogLevel::Info => "volknob=info",
        LogLevel::Debug => "volknob=debug",
        LogLevel::Trace => "volknob=trace",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

/// Resolve the configuration file path
fn resolve_config_path(cli_path: Option<PathBuf>) -> PathBuf {
    if let Some(path) = cli_path {
        return path;
    }
    if let Ok(path) = std::env::var("VOLKNOB_CONFIG") {
        return PathBuf::from(path);
    }
    PathBuf::from("/etc/volknob/config.toml")
}
