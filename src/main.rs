use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, Level};

use usc_tunnel::utils::logging::init_logging;
use usc_tunnel::{tunnel, Result, TunnelConfig};

#[derive(Parser)]
#[command(name = "usc-tunnel")]
#[command(about = "TLS tunnel for USC-framed NETCONF sessions", version, long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "usc-tunnel.toml")]
    config: PathBuf,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,

    /// Print an example configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Override the configured log level
    #[arg(short, long)]
    log_level: Option<Level>,
}

fn load(cli: &Cli) -> Result<TunnelConfig> {
    let mut config = TunnelConfig::from_file(&cli.config)?;
    config.apply_env()?;
    if let Some(level) = cli.log_level {
        config.logging.log_level = level;
    }
    config.validate_strict()?;
    Ok(config)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.print_config {
        print!("{}", TunnelConfig::example_config());
        return ExitCode::SUCCESS;
    }

    let config = match load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {e}", cli.config.display());
            return ExitCode::FAILURE;
        }
    };

    if cli.check {
        println!(
            "{}: configuration OK ({} services)",
            cli.config.display(),
            config.services.len()
        );
        return ExitCode::SUCCESS;
    }

    if let Err(e) = init_logging(&config.logging) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    match tunnel::run(config, Some(cli.config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "usc-tunnel failed");
            ExitCode::FAILURE
        }
    }
}
