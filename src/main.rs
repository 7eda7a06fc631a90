//! # Main: CLI Entry Point
//!
//! `switchboard serve` starts the HTTP server: provider webhooks, TwiML
//! endpoints, the agent API and the `/socket/calls` presence hub.
//!
//! ## Configuration
//!
//! - `--config <file>`: optional TOML file (`[server]`, `[telephony]`, `[hub]`, `[auth]`).
//! - Every override flag also reads an environment variable (`DATABASE_URL`,
//!   `TWILIO_ACCOUNT_SID`, `JWT_SECRET`, ...). A `.env` file is loaded first.
//! - `LOG_FORMAT=json` switches to JSON logs; `RUST_LOG` filters them.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use switchboard::config::{Config, ConfigOverrides};
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "switchboard", about = "Call lifecycle orchestration and agent presence")]
struct Cli {
    /// TOML config file
    #[arg(long, env = "SWITCHBOARD_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the webhook, API and socket server
    Serve {
        #[command(flatten)]
        overrides: ConfigOverrides,
    },
    /// Print the effective configuration with secrets omitted
    Config {
        #[command(flatten)]
        overrides: ConfigOverrides,
    },
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    // LOG_FORMAT=json for K8s, human-readable otherwise
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;

    match &cli.command {
        Commands::Serve { overrides } => {
            config.apply(overrides);
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(switchboard::server::run(config))
        }
        Commands::Config { overrides } => {
            config.apply(overrides);
            println!("[server]");
            println!("port = {}", config.server.port);
            println!(
                "database = {}",
                if config.server.database_url.is_some() { "postgres" } else { "memory" }
            );
            println!("\n[telephony]");
            print!("{}", toml::to_string_pretty(&config.telephony)?);
            println!("\n[hub]");
            println!("fallback_owner_id = {:?}", config.hub.fallback_owner_id);
            println!(
                "\n[auth]\njwt_verification = {}",
                config.auth.jwt_secret.is_some()
            );
            Ok(())
        }
    }
}
