use sqlx::ConnectOptions;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::log::LevelFilter;

use crate::config::Config;

/// Snapshot loads read years of rows at once
const SLOW_STATEMENT_THRESHOLD: Duration = Duration::from_secs(60);

pub async fn create_pool(config: &Config) -> Result<PgPool, sqlx::Error> {
    let connect_options = PgConnectOptions::from_str(&config.database_url)?
        .application_name("minvol-portfolio")
        .log_slow_statements(LevelFilter::Warn, SLOW_STATEMENT_THRESHOLD);

    PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .connect_with(connect_options)
        .await
}
