use clap::Parser;
use fern::colors::{Color, ColoredLevelConfig};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::{env, fs, path::PathBuf};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::infra::db::{DatabasePoolConfig, SqliteConfig};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to Settings.toml file holding configuration options
    #[arg(short, long)]
    pub config: Option<String>,

    /// Log level to run with the service (default: info)
    #[arg(short, long)]
    pub level: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub config: Option<String>,
    pub level: Option<String>,
    pub db_settings: DbSettings,
    pub solana_settings: SolanaSettings,
    pub coordinator_settings: CoordinatorSettings,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DbSettings {
    pub data_folder: String,
    pub read_max_connections: u32,
    pub read_min_connections: u32,
    pub write_max_connections: u32,
    pub write_min_connections: u32,
    pub idle_timeout_secs: u64,
    pub acquire_timeout_secs: u64,
}

impl Default for DbSettings {
    fn default() -> Self {
        DbSettings {
            data_folder: String::from("./data"),
            read_max_connections: 12,
            read_min_connections: 2,
            write_max_connections: 5,
            write_min_connections: 1,
            idle_timeout_secs: 600,   // 10 minutes
            acquire_timeout_secs: 15, // 15 seconds
        }
    }
}

impl From<DbSettings> for DatabasePoolConfig {
    fn from(settings: DbSettings) -> Self {
        DatabasePoolConfig {
            read_max_connections: settings.read_max_connections,
            read_min_connections: settings.read_min_connections,
            write_max_connections: settings.write_max_connections,
            write_min_connections: settings.write_min_connections,
            idle_timeout_secs: settings.idle_timeout_secs,
            acquire_timeout_secs: settings.acquire_timeout_secs,
            sqlite_config: SqliteConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SolanaSettings {
    pub rpc_url: String,
    pub ws_url: String,
    /// JSON-RPC endpoint answering `qn_estimatePriorityFees`
    pub fee_oracle_url: String,
    /// Base url of the contract service, trailing slash included
    pub contract_service_url: String,
    /// Address of the deployed duels program, matched against tx logs
    pub program_address: String,
    /// Base58 private key of the payout authority
    pub admin_private_key: String,
    pub usdc_mint_address: String,
}

impl Default for SolanaSettings {
    fn default() -> Self {
        SolanaSettings {
            rpc_url: String::from("https://api.devnet.solana.com"),
            ws_url: String::from("wss://api.devnet.solana.com"),
            fee_oracle_url: String::new(),
            contract_service_url: String::from("http://localhost:9040/"),
            program_address: String::new(),
            admin_private_key: String::new(),
            usdc_mint_address: String::from("EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorSettings {
    /// Base url of the share-image renderer; empty disables the side effect
    pub share_image_url: String,
    pub fee_refresh_interval_secs: u64,
    pub notification_retention_days: u64,
    pub notification_sweep_interval_secs: u64,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        CoordinatorSettings {
            share_image_url: String::new(),
            fee_refresh_interval_secs: 60,
            notification_retention_days: 30,
            notification_sweep_interval_secs: 24 * 60 * 60, // daily
        }
    }
}

fn default_config_path() -> PathBuf {
    PathBuf::from("./config/local.toml")
}

pub fn get_settings() -> Result<Settings, anyhow::Error> {
    let cli = Cli::parse();
    get_settings_with(cli.config, cli.level)
}

pub fn get_settings_with(
    config_path: Option<String>,
    level: Option<String>,
) -> Result<Settings, anyhow::Error> {
    let path = config_path
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);

    let mut settings = if path.exists() {
        let raw = fs::read_to_string(&path)?;
        toml::from_str(&raw)?
    } else {
        Settings::default()
    };

    if let Some(level) = level {
        settings.level = Some(level);
    }

    Ok(settings)
}

/// Install the process-wide logger. `quiet_targets` are chatty third-party
/// crates demoted to warnings so payout and tracker logs stay readable;
/// their errors still come through.
pub fn setup_logger(
    level: Option<String>,
    quiet_targets: Vec<String>,
) -> Result<(), fern::InitError> {
    let colors = ColoredLevelConfig::new()
        .trace(Color::BrightBlack)
        .debug(Color::Cyan)
        .info(Color::Green)
        .warn(Color::Yellow)
        .error(Color::Red);

    let mut dispatch = fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "{} {:<5} {} > {}",
                OffsetDateTime::now_utc()
                    .format(&Rfc3339)
                    .unwrap_or_default(),
                colors.color(record.level()),
                record.target(),
                message
            ));
        })
        .level(get_log_level(level));

    for target in quiet_targets {
        dispatch = dispatch.level_for(target, LevelFilter::Warn);
    }

    dispatch.chain(std::io::stdout()).apply()?;
    Ok(())
}

/// Effective level: the CLI/config value wins, then `RUST_LOG`, then info.
pub fn get_log_level(level: Option<String>) -> LevelFilter {
    level
        .or_else(|| env::var("RUST_LOG").ok())
        .and_then(|raw| parse_level(&raw))
        .unwrap_or(LevelFilter::Info)
}

fn parse_level(raw: &str) -> Option<LevelFilter> {
    match raw.to_lowercase().as_str() {
        "trace" => Some(LevelFilter::Trace),
        "debug" => Some(LevelFilter::Debug),
        "info" => Some(LevelFilter::Info),
        "warn" => Some(LevelFilter::Warn),
        "error" => Some(LevelFilter::Error),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let settings =
            get_settings_with(Some("./does/not/exist.toml".to_string()), None).unwrap();
        assert_eq!(settings.db_settings.data_folder, "./data");
        assert_eq!(settings.coordinator_settings.fee_refresh_interval_secs, 60);
        assert!(settings.level.is_none());
    }

    #[test]
    fn cli_level_overrides_settings() {
        let settings = get_settings_with(None, Some("debug".to_string())).unwrap();
        assert_eq!(settings.level.as_deref(), Some("debug"));
        assert_eq!(get_log_level(settings.level), LevelFilter::Debug);
    }

    #[test]
    fn unknown_level_defaults_to_info() {
        assert_eq!(get_log_level(Some("verbose".to_string())), LevelFilter::Info);
    }

    #[test]
    fn level_parsing_is_case_insensitive() {
        assert_eq!(parse_level("WARN"), Some(LevelFilter::Warn));
        assert_eq!(parse_level("Trace"), Some(LevelFilter::Trace));
        assert_eq!(parse_level("loud"), None);
    }
}
