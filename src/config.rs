use dotenvy::dotenv;
use eyre::{Result, WrapErr, eyre};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::strategy::strategy_constants::{DEFAULT_BACKTEST_START_YEAR, DEFAULT_INVESTMENTS};
use crate::strategy::types::StrategySettings;

/// Concurrent price downloads when refreshing market data
pub const DEFAULT_IO_WORKERS: usize = 50;

pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub db_max_connections: u32,
    pub mode: String,
    pub strategy: StrategySettings,
    pub io_workers: usize,
    pub cpu_workers: Option<usize>, // None leaves rayon at one thread per core
    pub default_investment: i64,
    pub chart_dir: Option<PathBuf>,
    pub import_dir: Option<PathBuf>, // CSV exports to refresh from before computing
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenv().ok();

        let mode = env::var("MODE").unwrap_or_else(|_| "test".to_string());
        if !matches!(mode.as_str(), "test" | "prod") {
            return Err(eyre!("Invalid MODE value {mode} (must be 'test' or 'prod')"));
        }

        let database_url = env::var("DATABASE_URL").wrap_err("Missing DATABASE_URL")?;
        let db_max_connections =
            parse_setting("DB_MAX_CONNECTIONS", env::var("DB_MAX_CONNECTIONS").ok(), DEFAULT_DB_MAX_CONNECTIONS)?;

        let defaults = StrategySettings::default();
        let strategy = StrategySettings {
            reference_symbol: env::var("REFERENCE_SYMBOL").unwrap_or(defaults.reference_symbol),
            benchmark_symbol: env::var("BENCHMARK_SYMBOL").unwrap_or(defaults.benchmark_symbol),
            low_vol_benchmark_symbol: env::var("BENCHMARK_LV_SYMBOL").unwrap_or(defaults.low_vol_benchmark_symbol),
            low_vol_subset_size: parse_setting("LOW_VOL_SUBSET_SIZE", env::var("LOW_VOL_SUBSET_SIZE").ok(), defaults.low_vol_subset_size)?,
            backtest_start_year: parse_setting(
                "BACKTEST_START_YEAR",
                env::var("BACKTEST_START_YEAR").ok(),
                DEFAULT_BACKTEST_START_YEAR,
            )?,
        };

        let io_workers = parse_setting("IO_WORKERS", env::var("IO_WORKERS").ok(), DEFAULT_IO_WORKERS)?;
        let cpu_workers = env::var("CPU_WORKERS")
            .ok()
            .map(|raw| parse_setting("CPU_WORKERS", Some(raw), 0usize))
            .transpose()?;
        let default_investment =
            parse_setting("DEFAULT_INVESTMENT", env::var("DEFAULT_INVESTMENT").ok(), DEFAULT_INVESTMENTS[0])?;
        if default_investment <= 0 {
            return Err(eyre!("DEFAULT_INVESTMENT must be positive"));
        }

        Ok(Config {
            database_url,
            db_max_connections: db_max_connections.max(1),
            mode,
            strategy,
            io_workers: io_workers.max(1),
            cpu_workers: cpu_workers.filter(|n| *n > 0),
            default_investment,
            chart_dir: env::var("CHART_DIR").ok().map(PathBuf::from),
            import_dir: env::var("PRICE_IMPORT_DIR").ok().map(PathBuf::from),
        })
    }

    /// Size the global rayon pool. Must run before any parallel work.
    pub fn init_thread_pool(&self) -> Result<()> {
        if let Some(threads) = self.cpu_workers {
            rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build_global()
                .wrap_err("Failed to build the CPU worker pool")?;
        }
        Ok(())
    }
}

fn parse_setting<T>(name: &str, raw: Option<String>, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e| eyre!("Invalid {name} value {raw:?}: {e}")),
    }
}
