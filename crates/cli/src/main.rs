mod fixture;
mod serve;

use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use nextmove_engine::EngineConfig;
use tracing_subscriber::EnvFilter;

/// Output format for CLI responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

/// Next-move recommendation and execution engine.
#[derive(Parser)]
#[command(
    name = "nextmove",
    version,
    about = "Next-move recommendation and execution engine"
)]
struct Cli {
    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text", value_enum)]
    output: OutputFormat,

    /// Suppress non-essential output
    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API server and the background scheduler
    Serve {
        /// Path to an engine config file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Port to listen on (overrides `server.port`)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Validate an engine config file
    CheckConfig {
        /// Path to the TOML config file
        file: PathBuf,
    },

    /// Run scheduler cycles against a JSON fixture and print the result
    Cycle {
        /// Path to the fixture JSON file
        #[arg(long)]
        fixture: PathBuf,
        /// Path to an engine config file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.quiet);

    match cli.command {
        Commands::Serve { config, port } => {
            let mut config = load_config_or_exit(config.as_deref());
            if let Some(port) = port {
                config.server.port = port;
            }
            let rt = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    eprintln!("error: failed to create tokio runtime: {}", e);
                    process::exit(1);
                }
            };
            if let Err(e) = rt.block_on(serve::start_server(config)) {
                eprintln!("Server error: {}", e);
                process::exit(1);
            }
        }
        Commands::CheckConfig { file } => {
            cmd_check_config(&file, cli.output, cli.quiet);
        }
        Commands::Cycle { fixture, config } => {
            let config = load_config_or_exit(config.as_deref());
            cmd_cycle(&fixture, config, cli.output, cli.quiet);
        }
    }
}

/// Log to stderr so stdout stays machine-readable. `RUST_LOG` overrides the
/// default filter; `NEXTMOVE_LOG_JSON=1` switches to JSON lines.
fn init_tracing(quiet: bool) {
    let default = if quiet { "warn" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let json = std::env::var("NEXTMOVE_LOG_JSON")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = result {
        eprintln!("warning: could not install log subscriber: {}", e);
    }
}

fn load_config_or_exit(path: Option<&Path>) -> EngineConfig {
    let Some(path) = path else {
        return EngineConfig::default();
    };
    match EngineConfig::load(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            process::exit(1);
        }
    }
}

fn cmd_check_config(file: &Path, output: OutputFormat, quiet: bool) {
    match EngineConfig::load(file) {
        Ok(config) => match output {
            OutputFormat::Json => {
                let json = serde_json::json!({ "valid": true, "config": config });
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json).unwrap_or_default()
                );
            }
            OutputFormat::Text => {
                if !quiet {
                    println!("valid");
                }
            }
        },
        Err(e) => {
            match output {
                OutputFormat::Json => {
                    let json = serde_json::json!({ "valid": false, "error": e.to_string() });
                    eprintln!(
                        "{}",
                        serde_json::to_string_pretty(&json).unwrap_or_default()
                    );
                }
                OutputFormat::Text => eprintln!("error: {}", e),
            }
            process::exit(1);
        }
    }
}

fn cmd_cycle(path: &Path, config: EngineConfig, output: OutputFormat, quiet: bool) {
    let fixture = match fixture::Fixture::load(path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("error: {}", e);
            process::exit(1);
        }
    };
    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to create tokio runtime: {}", e);
            process::exit(1);
        }
    };
    let reports = match rt.block_on(fixture.run(config)) {
        Ok(reports) => reports,
        Err(e) => {
            eprintln!("error: {}", e);
            process::exit(1);
        }
    };

    match output {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&reports).unwrap_or_default()
            );
        }
        OutputFormat::Text => {
            if quiet {
                return;
            }
            for report in &reports {
                println!("{}", fixture::summarize(report));
            }
        }
    }
}
