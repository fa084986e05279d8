use approx::assert_abs_diff_eq;
use chrono::{Datelike, Duration, NaiveDate, Weekday};

use minvol_portfolio::market_data::matrix::MarketMatrixProvider;
use minvol_portfolio::market_data::source::MarketSnapshot;
use minvol_portfolio::market_data::types::PricePoint;
use minvol_portfolio::render::{CsvRenderer, Renderer};
use minvol_portfolio::store::{InMemoryPortfolioStore, PortfolioStore};
use minvol_portfolio::strategy::context::StrategyContext;
use minvol_portfolio::strategy::engine;
use minvol_portfolio::strategy::materializer::{AllocationMaterializer, calculate_portfolio_with_investment};
use minvol_portfolio::strategy::rolling::{Anniversary, RollingPortfolioSeries};
use minvol_portfolio::strategy::types::StrategySettings;

const STOCKS: [&str; 5] = ["AAA", "BBB", "CCC", "DDD", "KO"];

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Weekday closes from 2010 through 2016; DDD joins late, in 2014
fn market() -> MarketSnapshot {
    let mut snapshot = MarketSnapshot::new();
    let symbols: Vec<&str> = STOCKS.iter().copied().chain(["^SP500TR", "SPLV"]).collect();
    for (k, symbol) in symbols.iter().enumerate() {
        let first = if *symbol == "DDD" { date(2014, 1, 2) } else { date(2010, 1, 4) };
        let mut price = 20.0 + 15.0 * k as f64;
        let mut day = first;
        let mut t = 0.0_f64;
        while day <= date(2016, 12, 30) {
            if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
                let change = 0.5 * (t * 0.7 + 1.3 * k as f64).sin() + 0.25 * (t * 0.21 * (k + 2) as f64).cos() + 0.03;
                price *= 1.0 + change / 100.0;
                snapshot.insert(PricePoint { symbol: symbol.to_string(), date: day, close_price: price, pct_change: change });
                t += 1.0;
            }
            day += Duration::days(1);
        }
    }
    for year in 2010..=2016 {
        let members: Vec<&str> = STOCKS.iter().copied().filter(|s| year >= 2014 || *s != "DDD").collect();
        snapshot.set_membership(year, members);
    }
    snapshot
}

#[test]
fn materialized_shares_respect_the_budget() {
    let snapshot = market();
    let provider = MarketMatrixProvider::new(&snapshot, "KO");
    let materializer = AllocationMaterializer::new(&provider);
    let symbols: Vec<String> = ["AAA", "BBB", "CCC"].iter().map(|s| s.to_string()).collect();

    let shares = calculate_portfolio_with_investment(
        &materializer,
        date(2013, 1, 1),
        date(2014, 1, 1),
        2,
        &symbols,
        50_000.0,
        false,
    )
    .unwrap();

    assert!(!shares.is_empty());
    assert!(shares.shares.iter().all(|s| *s > 0));
    assert!(shares.price_warning.is_none());
    assert!(shares.volatility.is_some());
    // Half-even rounding can overshoot by at most half a share per holding
    let slack: f64 = shares.prices.iter().sum::<f64>() / 2.0;
    assert!(shares.invested() <= 50_000.0 + slack);
}

#[tokio::test]
async fn full_run_persists_and_renders() {
    let snapshot = market();
    let provider = MarketMatrixProvider::new(&snapshot, "KO");
    let settings = StrategySettings { backtest_start_year: 2013, ..StrategySettings::default() };
    let ctx = StrategyContext::new(&provider, &settings);
    let store = InMemoryPortfolioStore::new();
    let today = date(2016, 5, 10);

    let keys = engine::configuration_grid(&[2, 3], &[1, 2], &[false]);
    let portfolios = engine::recompute_portfolios(&ctx, &keys, today);
    assert!(portfolios.is_clean(), "{:?}", portfolios.skipped);
    for (_, portfolio) in &portfolios.succeeded {
        let cap = 1.0 / portfolio.key.spread as f64;
        assert!(portfolio.allocation.weights().iter().all(|w| *w <= cap + 1e-9));
        assert_abs_diff_eq!(portfolio.allocation.total(), 1.0, epsilon = 1e-6);
        store.save_portfolio(portfolio).await.unwrap();
    }
    let stored = store.load_portfolio(keys[0]).await.unwrap().unwrap();
    assert!(stored.universe.contains(&"DDD".to_string()));

    let mut series: Vec<RollingPortfolioSeries> = keys
        .iter()
        .map(|key| RollingPortfolioSeries::create_from(&ctx, *key, settings.backtest_start_year, today).0)
        .collect();
    assert!(series.iter().all(|s| s.len() == 3));
    assert!(series.iter().all(|s| s.anniversary() == Anniversary::new(5, 10).unwrap()));

    // Refreshing on the same day leaves every chain as it was
    let before = series.clone();
    assert!(engine::refresh_all(&ctx, &mut series, today).is_clean());
    assert_eq!(series, before);

    for s in &series {
        store.save_series(s).await.unwrap();
    }
    let reloaded = store.load_series(keys[1]).await.unwrap().unwrap();
    assert_eq!(reloaded, series[1]);

    let backtests = engine::backtest_all(&ctx, &series, &[10_000, 100_000]);
    assert!(backtests.is_clean(), "{:?}", backtests.skipped);
    assert_eq!(backtests.succeeded.len(), keys.len() * 2);

    let (key, backtest) = &backtests.succeeded[0].1;
    store.save_statistics(*key, backtest.investment as i64, &backtest.periods).await.unwrap();
    let cached = store.load_statistics(*key, backtest.investment as i64).await.unwrap();
    assert_eq!(cached.len(), 3);
    assert!(cached.windows(2).all(|w| w[0].end_date <= w[1].start_date + Duration::days(1)));

    let csv = CsvRenderer::default().render(&backtest.chart).unwrap();
    let header = csv.lines().next().unwrap();
    assert_eq!(header, "date,Portfolio,^SP500TR,SPLV");
    assert_eq!(csv.lines().count(), backtest.chart.dates.len() + 1);
}

#[test]
fn sweep_scores_every_configuration() {
    let snapshot = market();
    let provider = MarketMatrixProvider::new(&snapshot, "KO");
    let settings = StrategySettings::default();
    let ctx = StrategyContext::new(&provider, &settings);

    let keys = engine::configuration_grid(&[2, 4], &[1], &[false]);
    let report = engine::parameter_sweep(&ctx, &keys, 2012..2016, Anniversary::new(3, 1).unwrap());
    assert!(report.is_clean(), "{:?}", report.skipped);
    for (_, summary) in &report.succeeded {
        assert_eq!(summary.years, vec![2012, 2013, 2014, 2015]);
        assert!(summary.avg_volatility > 0.0);
        assert!(summary.std_volatility >= 0.0);
    }
}
