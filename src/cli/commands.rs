use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::info;
use std::path::Path;

use crate::config::Config;
use crate::formula;
use crate::sensors::models::{Sensor, SensorState};
use crate::services::{DeviceProfile, Gateway};
use crate::storage::{BufferStore, ConfigStore, SqliteConfigStore, SqliteManager};

pub const DEFAULT_CONFIG_PATH: &str = "config/gateway.toml";

pub fn build_cli() -> Command {
    Command::new("edge-gateway")
        .version(crate::VERSION)
        .about("Industrial edge gateway: acquisition, store & forward, local automation")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .default_value(DEFAULT_CONFIG_PATH)
                .global(true)
                .help("Configuration file (TOML)"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .global(true)
                .help("Overrides logging.level (error, warn, info, debug, trace)"),
        )
        .subcommand(Command::new("run").about("Start the gateway until Ctrl+C"))
        .subcommand(
            Command::new("test-formula")
                .about("Evaluate a sensor formula against a test value")
                .arg(Arg::new("expression").required(true).help("Formula using `val`"))
                .arg(
                    Arg::new("value")
                        .short('v')
                        .long("value")
                        .default_value("0")
                        .allow_negative_numbers(true)
                        .help("Value bound to `val`"),
                ),
        )
        .subcommand(Command::new("profile").about("Print the digital-twin device profile as JSON"))
        .subcommand(Command::new("buffer-status").about("Show unsynced/synced buffer counts"))
        .subcommand(Command::new("flush").about("Push buffered readings to the time-series sink now"))
        .subcommand(
            Command::new("init-config")
                .about("Write a default configuration file")
                .arg(
                    Arg::new("force")
                        .short('f')
                        .long("force")
                        .action(ArgAction::SetTrue)
                        .help("Overwrite an existing file"),
                ),
        )
}

/// Dispatches the selected subcommand; `run` is the default.
pub async fn handle_subcommands(matches: &ArgMatches, config: Config, config_path: &Path) -> Result<()> {
    match matches.subcommand() {
        Some(("test-formula", sub)) => test_formula(sub),
        Some(("profile", _)) => print_profile(&config).await,
        Some(("buffer-status", _)) => buffer_status(&config).await,
        Some(("flush", _)) => flush(config).await,
        Some(("init-config", sub)) => init_config(config_path, sub.get_flag("force")),
        _ => run(config).await,
    }
}

async fn run(config: Config) -> Result<()> {
    let gateway = Gateway::open(config).await.context("gateway initialization failed")?;
    gateway.start().await?;

    tokio::signal::ctrl_c().await.context("cannot listen for Ctrl+C")?;
    info!("🛑 Ctrl+C received");
    gateway.shutdown().await?;
    Ok(())
}

fn test_formula(matches: &ArgMatches) -> Result<()> {
    let expression = matches
        .get_one::<String>("expression")
        .context("expression is required")?;
    let value: f64 = matches
        .get_one::<String>("value")
        .map(|v| v.parse())
        .transpose()
        .context("value must be a number")?
        .unwrap_or(0.0);

    let result = formula::test_formula(expression, value);
    println!("{}", serde_json::to_string_pretty(&result)?);
    if result.valid {
        println!("✅ {} with val = {} -> {}", expression, value, result.result.unwrap_or_default());
    } else {
        println!("❌ {}", result.error.unwrap_or_default());
    }
    Ok(())
}

async fn print_profile(config: &Config) -> Result<()> {
    let database = SqliteManager::new(&config.database).await?;
    let store = SqliteConfigStore::new(database.pool().clone());
    let sensors: Vec<Sensor> = store
        .list_sensors()
        .await?
        .into_iter()
        .map(|(id, definition)| Sensor { id, definition, state: SensorState::default() })
        .collect();
    let profile = DeviceProfile::from_sensors(&config.gateway.name, &sensors);
    println!("{}", serde_json::to_string_pretty(&profile)?);
    database.close().await;
    Ok(())
}

async fn buffer_status(config: &Config) -> Result<()> {
    let database = SqliteManager::new(&config.database).await?;
    let buffer = BufferStore::new(database.pool().clone(), &config.buffer);
    let counts = buffer.counts().await?;
    println!("📦 Buffer {}", config.database.database_path);
    println!("   unsynced: {}", counts.unsynced);
    println!("   synced:   {}", counts.synced);
    println!("   rejected: {}", buffer.rejected_count().await?);
    database.close().await;
    Ok(())
}

async fn flush(config: Config) -> Result<()> {
    let gateway = Gateway::open(config).await?;
    let result = gateway.flush_buffer().await;
    let status = gateway.buffer_status().await?;
    match result {
        Ok(n) => println!("☁️  Synced {} record(s), {} still unsynced", n, status.unsynced_count),
        Err(e) => println!("❌ Sink unreachable ({}), {} record(s) stay buffered", e, status.unsynced_count),
    }
    Ok(())
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    Config::default().save_to_file(path)?;
    println!("✅ Default configuration written to {}", path.display());
    Ok(())
}
