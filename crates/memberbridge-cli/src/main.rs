mod server;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use memberbridge_auth::{KeyCache, TokenVerifier};
use memberbridge_core::{AppConfig, default_config_dir, env_overrides, write_default_config_file};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "memberbridge", about = "Member sign-in bridge for web apps")]
struct Cli {
    #[arg(long, global = true)]
    json: bool,

    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// `json` for structured logs, anything else for plain text
    #[arg(long, global = true)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP server
    Serve,
    /// Print the effective configuration with secrets redacted
    CheckConfig,
    /// Fetch the issuer's key set and list key ids
    Keys,
    /// Verify a member token against the live key set
    Verify {
        #[arg(long)]
        token: String,
    },
    /// Write the default configuration file
    Init {
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_tracing(&cli.log_level, cli.log_format.as_deref())?;
    let cfg_dir = cli.config_dir.clone().unwrap_or_else(default_config_dir);

    match cli.command {
        Commands::Init { force } => {
            let path = write_default_config_file(&cfg_dir, force)?;
            pout(
                cli.json,
                serde_json::json!({"message": "init complete", "config_file": path}),
                &format!("Config written to {}", path.display()),
            )?;
        }
        Commands::CheckConfig => {
            let config = AppConfig::load(Some(&cfg_dir))?;
            let from_env = env_overrides(|name| std::env::var(name).ok());
            let mut value = serde_json::to_value(config.summary())?;
            value["from_env"] = serde_json::to_value(from_env)?;
            pout(
                cli.json,
                value,
                &format!(
                    "Config OK: issuer {} -> callback {}",
                    config.trust.expected_issuer(),
                    config.callback_url
                ),
            )?;
        }
        Commands::Keys => {
            let config = AppConfig::load(Some(&cfg_dir))?;
            let keys = KeyCache::for_config(&config.trust)?;
            let count = keys.refresh().await?;
            let ids = keys.key_ids().await;
            pout(
                cli.json,
                serde_json::json!({"jwks_url": config.trust.jwks_url(), "count": count, "kids": ids}),
                &format!("{count} key(s): {}", ids.join(", ")),
            )?;
        }
        Commands::Verify { token } => {
            let config = AppConfig::load(Some(&cfg_dir))?;
            let keys = Arc::new(KeyCache::for_config(&config.trust)?);
            let verifier = TokenVerifier::new(Arc::new(config.trust), keys);
            let identity = verifier.verify(&token).await?;
            pout(
                cli.json,
                serde_json::to_value(&identity)?,
                &format!("Token valid for {}", identity.sub),
            )?;
        }
        Commands::Serve => {
            let config = AppConfig::load(Some(&cfg_dir))?;
            server::serve(&config).await?;
        }
    }

    Ok(())
}

/// Logs go to stderr so command output on stdout stays machine-readable.
fn setup_tracing(level: &str, format: Option<&str>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()?,
        _ => subscriber
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()?,
    }

    Ok(())
}

pub fn pout(json_mode: bool, value: serde_json::Value, text: &str) -> anyhow::Result<()> {
    if json_mode {
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("{text}");
    }
    Ok(())
}
