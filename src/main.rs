mod config;
mod gate;
mod handoff;
mod metadata;
mod status;
mod stop;
mod window;

use clap::Parser;
use config::{ConfigError, FileConfig, LimitConfig, Overrides};
use handoff::ExecHandoff;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Guard a supervised command against restart storms: count launches in a
/// trailing window and refuse to exec the command once the limit is hit,
/// asking the supervisor to stop the service instead.
#[derive(Parser, Debug)]
#[command(name = "runlimit", version, about)]
pub struct Cli {
    /// Window size as a duration, e.g. 90s, 10m, 1h30m [default: 10m]
    #[arg(long, value_name = "DURATION")]
    window_size: Option<String>,

    /// Max restarts within the window [default: 5]
    #[arg(long, value_name = "RESTARTS")]
    max_restarts: Option<u32>,

    /// Directory where metadata files are stored [default: /run/runlimit]
    #[arg(long, value_name = "DIR")]
    metadata_dir: Option<PathBuf>,

    /// Metadata key, which forms part of the metadata file name
    /// [default: derived from the working directory]
    #[arg(long, value_name = "KEY")]
    metadata_key: Option<String>,

    /// Command used to stop the service when the limit is hit
    #[arg(long, value_name = "CMD")]
    sv_cmd: Option<String>,

    /// TOML config file (flags override its values)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Print the restart history for this identity as JSON and exit
    #[arg(long)]
    status: bool,

    /// Extra logging (window evaluation, lock and metadata details)
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log errors
    #[arg(short, long)]
    quiet: bool,

    /// Command to exec when the launch is admitted
    #[arg(
        value_name = "COMMAND",
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    command: Vec<String>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            window_size: self.window_size.clone(),
            max_restarts: self.max_restarts,
            metadata_dir: self.metadata_dir.clone(),
            metadata_key: self.metadata_key.clone(),
            sv_cmd: self.sv_cmd.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);
    tracing::debug!(?cli, "parsed CLI arguments");

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Logs go to stderr; stdout belongs to the command we hand off to.
fn init_tracing(verbose: bool, quiet: bool) {
    let default_level = if verbose {
        "debug"
    } else if quiet {
        "error"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let file = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let cwd = std::env::current_dir()?;
    let config = LimitConfig::resolve(file, cli.overrides(), &cwd)?;

    if cli.status {
        let report = status::report(&config)?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if cli.dry_run {
        print_settings(&config, &cli.command);
        println!("Dry run: config validated, not running.");
        return Ok(());
    }

    if cli.command.is_empty() {
        return Err(ConfigError::MissingCommand.into());
    }

    gate::run_gate(&config, &cli.command, &ExecHandoff).await?;
    Ok(())
}

fn print_settings(config: &LimitConfig, command: &[String]) {
    println!("runlimit v{}", env!("CARGO_PKG_VERSION"));
    println!("window: {}s", config.window.num_seconds());
    println!("max restarts: {}", config.max_restarts);
    println!("metadata file: {}", config.metadata_path().display());
    match &config.stop_command {
        Some(cmd) => println!("stop command: {cmd:?}"),
        None => println!("stop command: none"),
    }
    if command.is_empty() {
        println!("command: none");
    } else {
        println!("command: {command:?}");
    }
}
