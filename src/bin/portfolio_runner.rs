use dotenvy::dotenv;
use chrono::{Datelike, Duration, NaiveDate, Utc};
use eyre::{Result, WrapErr, eyre};
use std::fs;
use std::path::Path;
use tracing::{error, info, instrument, warn};

use minvol_portfolio::config::Config;
use minvol_portfolio::db::db_manager::DbManager;
use minvol_portfolio::logging;
use minvol_portfolio::market_data::fetcher::refresh_snapshot;
use minvol_portfolio::market_data::import::CsvHistoryDirectory;
use minvol_portfolio::market_data::matrix::MarketMatrixProvider;
use minvol_portfolio::market_data::source::MarketSnapshot;
use minvol_portfolio::render::{CsvRenderer, Renderer};
use minvol_portfolio::store::PortfolioStore;
use minvol_portfolio::strategy::context::StrategyContext;
use minvol_portfolio::strategy::engine;
use minvol_portfolio::strategy::rolling::{Backtest, RollingPortfolioSeries};
use minvol_portfolio::strategy::strategy_constants::{DEFAULT_INVESTMENTS, DEFAULT_PERIODS};
use minvol_portfolio::strategy::types::PortfolioKey;

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
    info!(mode = %cfg.mode, "Configuration loaded and logging initialized");

    let db_manager = DbManager::init(&cfg).await.wrap_err("Failed to initialize database")?;
    info!("Database manager initialized");

    let today = Utc::now().date_naive();
    run(&cfg, &db_manager, today).await
}

/// Earliest date any minimization window of the backtest can reach
fn history_start(cfg: &Config) -> Result<NaiveDate> {
    let longest = DEFAULT_PERIODS.iter().copied().max().unwrap_or(1) as i32;
    NaiveDate::from_ymd_opt(cfg.strategy.backtest_start_year - longest - 1, 1, 1)
        .ok_or_else(|| eyre!("Backtest start year {} out of range", cfg.strategy.backtest_start_year))
}

#[instrument(skip_all, fields(on_close = true, today = %today))]
async fn run(cfg: &Config, db_manager: &DbManager, today: NaiveDate) -> Result<()> {
    let mut snapshot = db_manager.load_market_snapshot(history_start(cfg)?).await?;
    if let Some(dir) = &cfg.import_dir {
        refresh_market_data(cfg, db_manager, &mut snapshot, dir, today).await?;
    }
    let provider = MarketMatrixProvider::new(&snapshot, cfg.strategy.reference_symbol.clone());
    let ctx = StrategyContext::new(&provider, &cfg.strategy);
    let keys = engine::default_configurations();

    // Live portfolios
    let portfolios = engine::recompute_portfolios(&ctx, &keys, today);
    for (_, portfolio) in &portfolios.succeeded {
        portfolio.log_portfolio();
        if let Err(e) = db_manager.save_portfolio(portfolio).await {
            error!(key = %portfolio.key, err = %e, "Failed to store portfolio");
        }
    }

    // Past portfolio chains: refresh what is stored, create the rest
    let mut stored = Vec::new();
    let mut created = Vec::new();
    for key in &keys {
        match db_manager.load_series(*key).await? {
            Some(series) => stored.push(series),
            None => {
                let (series, report) =
                    RollingPortfolioSeries::create_from(&ctx, *key, cfg.strategy.backtest_start_year, today);
                if !report.is_clean() {
                    warn!(key = %key, skipped = ?report.skipped_items(), "Some years could not be computed");
                }
                created.push(series);
            }
        }
    }
    engine::refresh_all(&ctx, &mut stored, today).log_summary("refresh series");

    let mut all_series = stored;
    all_series.extend(created.into_iter().filter(|s| !s.is_empty()));
    for series in &all_series {
        db_manager.save_series(series).await?;
    }

    // Backtests for every investment level
    let backtests = engine::backtest_all(&ctx, &all_series, &DEFAULT_INVESTMENTS);
    for (_, (key, backtest)) in &backtests.succeeded {
        let investment = backtest.investment as i64;
        db_manager.save_statistics(*key, investment, &backtest.periods).await?;
        if investment == cfg.default_investment {
            if let Some(dir) = &cfg.chart_dir {
                write_chart(dir, key, backtest)?;
            }
        }
    }

    info!(
        portfolios = portfolios.succeeded.len(),
        series = all_series.len(),
        backtests = backtests.succeeded.len(),
        "Portfolio run complete"
    );
    Ok(())
}

/// Pull new closes and index lists from the import directory into both the
/// database and the in-memory snapshot
#[instrument(skip_all, fields(on_close = true, dir = %dir.display()))]
async fn refresh_market_data(
    cfg: &Config,
    db_manager: &DbManager,
    snapshot: &mut MarketSnapshot,
    dir: &Path,
    today: NaiveDate,
) -> Result<()> {
    let source = CsvHistoryDirectory::new(dir);
    for (year, members) in source.read_memberships().await? {
        db_manager.set_index_membership(year, &members).await?;
        snapshot.set_membership(year, members);
    }

    let mut symbols = snapshot.known_symbols();
    let settings = &cfg.strategy;
    for symbol in [&settings.reference_symbol, &settings.benchmark_symbol, &settings.low_vol_benchmark_symbol] {
        symbols.insert(symbol.clone());
    }
    let symbols: Vec<String> = symbols.into_iter().collect();

    let (fetched, planned) =
        refresh_snapshot(snapshot, &source, &symbols, history_start(cfg)?, today - Duration::days(1), cfg.io_workers)
            .await;
    planned.log_summary("plan price updates");
    fetched.log_summary("read price histories");

    for (symbol, rows) in &fetched.succeeded {
        if let Err(e) = db_manager.insert_price_points(rows).await {
            error!(symbol = %symbol, err = %e, "Failed to store price points");
        }
    }
    Ok(())
}

fn write_chart(dir: &Path, key: &PortfolioKey, backtest: &Backtest) -> Result<()> {
    fs::create_dir_all(dir).wrap_err("Failed to create chart directory")?;
    let csv = CsvRenderer::default().render(&backtest.chart)?;
    let path = dir.join(format!(
        "backtest_{}_{}_{}_{}.csv",
        key.spread,
        key.period,
        if key.low_vol_only { "lv" } else { "all" },
        backtest.investment as i64
    ));
    fs::write(&path, csv).wrap_err_with(|| format!("Failed to write {}", path.display()))?;
    info!(path = %path.display(), first_year = backtest.periods.first().map(|p| p.start_date.year()), "Chart written");
    Ok(())
}
