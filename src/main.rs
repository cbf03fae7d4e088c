use anyhow::Result;
use log::info;
use std::path::PathBuf;

use edge_gateway::cli::{build_cli, handle_subcommands};
use edge_gateway::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = build_cli().get_matches();

    let config_path = PathBuf::from(
        matches
            .get_one::<String>("config")
            .map(String::as_str)
            .unwrap_or(edge_gateway::cli::commands::DEFAULT_CONFIG_PATH),
    );
    let config = Config::load_or_default(&config_path);

    // logging needs the configured level, so it starts after the config is read
    let level = matches
        .get_one::<String>("log-level")
        .cloned()
        .or_else(|| config.as_ref().ok().map(|c| c.logging.level.clone()))
        .unwrap_or_else(|| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .init();

    let config = config?;
    info!("🏭 Edge Gateway v{} ({})", edge_gateway::VERSION, config.gateway.name);
    handle_subcommands(&matches, config, &config_path).await
}
