#![deny(clippy::pedantic, clippy::all, clippy::nursery)]

use std::path::PathBuf;

use clap::Parser;
use smtp_tunnel::{config::Config, controller::Controller};

/// Transparent SMTP relay
#[derive(Parser, Debug)]
#[command(name = "smtp-tunnel")]
#[command(about = "Relay SMTP sessions to an upstream MTA, rewriting them in flight", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = match cli.config {
        Some(path) => path,
        None => find_config_file()?,
    };

    let config = Config::load(&config_path)?;
    Controller::new(config).run().await
}

/// Find the configuration file using the following precedence:
/// 1. `SMTP_TUNNEL_CONFIG` environment variable
/// 2. ./smtp-tunnel.toml (current working directory)
/// 3. /etc/smtp-tunnel/smtp-tunnel.toml (system-wide config)
fn find_config_file() -> anyhow::Result<PathBuf> {
    if let Ok(env_path) = std::env::var("SMTP_TUNNEL_CONFIG") {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!(
            "SMTP_TUNNEL_CONFIG points to non-existent file: {}",
            path.display()
        );
    }

    let default_paths = [
        PathBuf::from("./smtp-tunnel.toml"),
        PathBuf::from("/etc/smtp-tunnel/smtp-tunnel.toml"),
    ];

    for path in &default_paths {
        if path.exists() {
            return Ok(path.clone());
        }
    }

    let paths_tried = default_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - SMTP_TUNNEL_CONFIG environment variable\n{paths_tried}"
    )
}
