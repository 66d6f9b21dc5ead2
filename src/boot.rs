use std::{env, process, str::FromStr as _};

use clap::Parser as _;
use config_rs::Config as ConfigRs;
use tracing::{debug, error, trace};

use crate::{
    app_info::AppInfo,
    cli::{Cli, Commands},
    commands::{archive, migrate, serve, version},
    config::Config,
    environment::Environment,
    error::SchedulerError,
    jobs::job_registry::JobRegistry,
    setup_tracing::setup_tracing_for_command,
};

const ENVIRONMENT_VARIABLE: &str = "APP_ENVIRONMENT";

/// Everything a node binary hands to [`boot`]: its metadata and the handlers
/// it can run.
pub struct BootConfig {
    pub app_info: AppInfo,
    pub job_registry: JobRegistry,
}

impl BootConfig {
    #[must_use]
    pub const fn new(app_info: AppInfo, job_registry: JobRegistry) -> Self {
        Self {
            app_info,
            job_registry,
        }
    }
}

/// Entry point for node binaries. Exits the process with status 1 on failure.
pub async fn boot(config: BootConfig) {
    let cli = Cli::parse();

    if matches!(cli.command, Some(Commands::Version)) {
        version::print_version_info(config.app_info);
        return;
    }

    let environment = set_environment();

    let app_config = match read_config(&environment) {
        Ok(app_config) => app_config,
        Err(e) => {
            eprintln!("❌ Invalid configuration: {e}");
            process::exit(1);
        }
    };

    setup_tracing_for_command(&cli.command, &app_config.tracing.log_level);

    debug!("Environment set to: {:?}", environment);
    trace!("Configuration loaded: {:?}", app_config);

    if let Err(e) = handle_command(environment, app_config, cli, config).await {
        error!("❌ {}", e);
        process::exit(1);
    }
}

#[must_use]
pub fn set_environment() -> Environment {
    env::var(ENVIRONMENT_VARIABLE)
        .ok()
        .and_then(|s| Environment::from_str(&s).ok())
        .unwrap_or_default()
}

/// Reads `config/<environment>` (optional) overlaid with `APP_*` variables,
/// e.g. `APP_DATABASE__URL` or `APP_SCHEDULER__NODE_ID`.
pub fn read_config(environment: &Environment) -> Result<Config, SchedulerError> {
    let config_file_name = format!("config/{environment}");

    trace!("Reading configuration from: {}", config_file_name);

    let config: Config = ConfigRs::builder()
        .add_source(config_rs::File::with_name(&config_file_name).required(false))
        .add_source(
            config_rs::Environment::with_prefix("APP")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .and_then(ConfigRs::try_deserialize)
        .map_err(|e| SchedulerError::Config(e.to_string()))?;

    config.scheduler.validate()?;
    Ok(config)
}

pub async fn handle_command(
    environment: Environment,
    config: Config,
    cli: Cli,
    boot_config: BootConfig,
) -> Result<(), SchedulerError> {
    match cli.command {
        Some(Commands::Migrate { action }) => migrate::handle_migrate_command(&config, action).await,
        Some(Commands::Archive) => archive::handle_archive_command(&config).await,
        Some(Commands::Version) => {
            version::print_version_info(boot_config.app_info);
            Ok(())
        }
        Some(Commands::Serve) | None => {
            serve::handle_serve_command(environment, config, boot_config.job_registry).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_environment_config_file() {
        if env::var("APP_SCHEDULER__NODE_ID").is_ok() {
            return;
        }
        let config = read_config(&Environment::Test).unwrap();
        assert_eq!(config.database.url, "sqlite::memory:");
        assert_eq!(config.scheduler.node_id, "node-test");
        assert!(config.scheduler.workers.pools.contains_key("default"));
    }
}
