use time::format_description::parse;
use tracing_subscriber::{fmt::time::OffsetTime, EnvFilter};

use crate::cli::Commands;

pub fn setup_tracing_for_command(command: &Option<Commands>, node_log_level: &str) {
    // One-shot commands stay quiet unless RUST_LOG says otherwise; a serving
    // node logs at the configured level.
    let default_level = match command {
        Some(Commands::Migrate { .. } | Commands::Archive) => "warn",
        Some(Commands::Version) => "error",
        Some(Commands::Serve) | None => node_log_level,
    };

    let mut env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    // Filter out noisy third-party logs
    for directive in [
        "sqlx::postgres::notice=warn",
        "sea_orm_migration::migrator=warn",
    ] {
        if let Ok(directive) = directive.parse() {
            env_filter = env_filter.add_directive(directive);
        }
    }

    let timer = OffsetTime::new(
        time::UtcOffset::current_local_offset().unwrap_or(time::UtcOffset::UTC),
        parse("[hour]:[minute]:[second].[subsecond digits:2]").unwrap_or_default(),
    );

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_level(true)
        .with_ansi(true)
        .with_timer(timer)
        .compact()
        .init();
}
