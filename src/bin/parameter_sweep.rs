use dotenvy::dotenv;
use chrono::{Datelike, NaiveDate, Utc};
use eyre::{Result, eyre};
use std::env;
use tracing::info;

use minvol_portfolio::config::Config;
use minvol_portfolio::db::db_manager::DbManager;
use minvol_portfolio::logging;
use minvol_portfolio::market_data::matrix::MarketMatrixProvider;
use minvol_portfolio::strategy::context::StrategyContext;
use minvol_portfolio::strategy::engine::{self, SweepSummary};
use minvol_portfolio::strategy::rolling::Anniversary;
use minvol_portfolio::strategy::strategy_constants::DEFAULT_PERIODS;

/// Usage: parameter_sweep [first_year] [last_year]
#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv().ok();

    // Initialize logging
    if let Err(e) = logging::init_logging(env!("CARGO_BIN_NAME").to_string()) {
        eprintln!("Failed to initialize logging: {}", e);
        return Err(e);
    }

    let cfg = Config::load()?;
    cfg.init_thread_pool()?;

    let today = Utc::now().date_naive();
    let mut args = env::args().skip(1);
    let first_year = parse_year(args.next(), cfg.strategy.backtest_start_year)?;
    let last_year = parse_year(args.next(), today.year() - 1)?;
    if last_year < first_year {
        return Err(eyre!("Last year {last_year} is before first year {first_year}"));
    }
    info!(first_year, last_year, "Sweeping configurations");

    let db_manager = DbManager::init(&cfg).await?;
    let longest = DEFAULT_PERIODS.iter().copied().max().unwrap_or(1) as i32;
    let since = NaiveDate::from_ymd_opt(first_year - longest - 1, 1, 1).ok_or_else(|| eyre!("Year {first_year} out of range"))?;
    let snapshot = db_manager.load_market_snapshot(since).await?;

    let provider = MarketMatrixProvider::new(&snapshot, cfg.strategy.reference_symbol.clone());
    let ctx = StrategyContext::new(&provider, &cfg.strategy);
    let report = engine::parameter_sweep(
        &ctx,
        &engine::default_configurations(),
        first_year..last_year + 1,
        Anniversary::from_date(today),
    );

    let mut summaries: Vec<&SweepSummary> = report.succeeded.iter().map(|(_, s)| s).collect();
    summaries.sort_by(|a, b| a.avg_volatility.total_cmp(&b.avg_volatility));
    for s in summaries {
        info!(
            key = %s.key,
            years = s.years.len(),
            avg_volatility = format!("{:.2}", s.avg_volatility),
            std_volatility = format!("{:.2}", s.std_volatility),
            avg_return = format!("{:.2}", s.avg_return),
            std_return = format!("{:.2}", s.std_return),
            avg_risk_adjusted = ?s.avg_risk_adjusted,
            "Sweep result"
        );
    }
    Ok(())
}

fn parse_year(raw: Option<String>, default: i32) -> Result<i32> {
    match raw {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e| eyre!("Invalid year {raw:?}: {e}")),
    }
}
