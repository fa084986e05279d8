use chrono::{Duration, NaiveDate};
use ndarray::Array1;
use rayon::prelude::*;
use std::ops::Range;
use tracing::{info, instrument, warn};

use super::context::StrategyContext;
use super::rolling::{Anniversary, Backtest, RollingPortfolioSeries, compute_past_portfolio};
use super::simulator::{StartValues, WindowStatistics};
use super::strategy_constants::{DEFAULT_LOW_VOL_FLAGS, DEFAULT_PERIODS, DEFAULT_SPREADS, SCORING_WINDOW_DAYS};
use super::types::{Portfolio, PortfolioKey};
use crate::batch::BatchReport;
use crate::errors::{Result, VolaError};
use crate::market_data::source::MarketDataSource;
use crate::market_data::universe::UniverseCheck;
use crate::stats_utils::{ZERO_STD_EPSILON, mean, population_std};

/// Notional used when scoring the sweep with fractional shares
const SWEEP_NOTIONAL: f64 = 10_000.0;

/// Every (spread, period, low_vol_only) combination
pub fn configuration_grid(spreads: &[u32], periods: &[u32], low_vol_flags: &[bool]) -> Vec<PortfolioKey> {
    let mut keys = Vec::with_capacity(spreads.len() * periods.len() * low_vol_flags.len());
    for &low_vol_only in low_vol_flags {
        for &period in periods {
            for &spread in spreads {
                keys.push(PortfolioKey::new(spread, period, low_vol_only));
            }
        }
    }
    keys
}

pub fn default_configurations() -> Vec<PortfolioKey> {
    configuration_grid(&DEFAULT_SPREADS, &DEFAULT_PERIODS, &DEFAULT_LOW_VOL_FLAGS)
}

/// Live portfolio for every configuration; a failing configuration is
/// reported and does not stop the others
#[instrument(skip_all, fields(on_close = true, configurations = keys.len(), as_of = %as_of))]
pub fn recompute_portfolios<S: MarketDataSource>(
    ctx: &StrategyContext<'_, '_, S>,
    keys: &[PortfolioKey],
    as_of: NaiveDate,
) -> BatchReport<Portfolio> {
    let results: Vec<(String, Result<Portfolio>)> =
        keys.par_iter().map(|key| (key.to_string(), Portfolio::compute(ctx, *key, as_of))).collect();
    let report = BatchReport::from_results(results);
    report.log_summary("recompute portfolios");
    report
}

/// Refresh every series in place, one report entry per series
#[instrument(skip_all, fields(on_close = true, series = series.len(), today = %today))]
pub fn refresh_all<S: MarketDataSource>(
    ctx: &StrategyContext<'_, '_, S>,
    series: &mut [RollingPortfolioSeries],
    today: NaiveDate,
) -> BatchReport<()> {
    let results: Vec<(String, std::result::Result<(), String>)> = series
        .par_iter_mut()
        .map(|s| {
            let report = s.refresh(ctx, today);
            let outcome = if report.is_clean() {
                Ok(())
            } else {
                Err(format!("years {:?} kept their previous allocation", report.skipped_items()))
            };
            (s.key().to_string(), outcome)
        })
        .collect();
    BatchReport::from_results(results)
}

/// Chained backtest of every series for every investment
#[instrument(skip_all, fields(on_close = true, series = series.len(), investments = investments.len()))]
pub fn backtest_all<S: MarketDataSource>(
    ctx: &StrategyContext<'_, '_, S>,
    series: &[RollingPortfolioSeries],
    investments: &[i64],
) -> BatchReport<(PortfolioKey, Backtest)> {
    let jobs: Vec<(&RollingPortfolioSeries, i64)> =
        series.iter().flat_map(|s| investments.iter().map(move |inv| (s, *inv))).collect();
    let results: Vec<(String, Result<(PortfolioKey, Backtest)>)> = jobs
        .par_iter()
        .map(|(s, investment)| {
            let outcome = s.backtest(ctx, *investment as f64).map(|b| (s.key(), b));
            (format!("{}@{}", s.key(), investment), outcome)
        })
        .collect();
    let report = BatchReport::from_results(results);
    report.log_summary("backtest");
    report
}

/// Mean and spread of yearly out-of-sample results for one configuration
#[derive(Debug, Clone, PartialEq)]
pub struct SweepSummary {
    pub key: PortfolioKey,
    pub years: Vec<i32>,
    pub avg_volatility: f64,
    pub std_volatility: f64,
    pub avg_return: f64,
    pub std_return: f64,
    pub avg_risk_adjusted: Option<f64>, // return / volatility, over years with non-zero volatility
    pub std_risk_adjusted: Option<f64>,
}

/// Score each configuration on every year of `years`: minimize up to the
/// anniversary, then hold fractional shares for the following year.
///
/// Minimization universes use the strict calendar check.
#[instrument(skip_all, fields(on_close = true, configurations = keys.len(), first_year = years.start, last_year = years.end))]
pub fn parameter_sweep<S: MarketDataSource>(
    ctx: &StrategyContext<'_, '_, S>,
    keys: &[PortfolioKey],
    years: Range<i32>,
    anniversary: Anniversary,
) -> BatchReport<SweepSummary> {
    let results: Vec<(String, Result<SweepSummary>)> = keys
        .par_iter()
        .map(|key| (key.to_string(), sweep_configuration(ctx, *key, years.clone(), anniversary)))
        .collect();
    let report = BatchReport::from_results(results);
    report.log_summary("parameter sweep");
    report
}

fn sweep_configuration<S: MarketDataSource>(
    ctx: &StrategyContext<'_, '_, S>,
    key: PortfolioKey,
    years: Range<i32>,
    anniversary: Anniversary,
) -> Result<SweepSummary> {
    let simulator = ctx.simulator();
    let mut scored: Vec<(i32, WindowStatistics)> = Vec::new();
    for year in years {
        let outcome = compute_past_portfolio(ctx, &key, anniversary, year, UniverseCheck::Strict).and_then(|past| {
            let end = past.start_date + Duration::days(SCORING_WINDOW_DAYS);
            let start_values = StartValues { portfolio: SWEEP_NOTIONAL, benchmark: SWEEP_NOTIONAL, low_vol: None };
            simulator.simulate(past.start_date, end, &past.allocation, start_values, true)
        });
        match outcome {
            Ok(out) => scored.push((year, out.stats)),
            Err(e) => warn!(key = %key, year, err = %e, "Skipping sweep year"),
        }
    }
    if scored.is_empty() {
        return Err(VolaError::unavailable("*", format!("no year could be scored for {key}")));
    }

    let volatility = Array1::from_iter(scored.iter().map(|(_, s)| s.volatility));
    let returns = Array1::from_iter(scored.iter().map(|(_, s)| s.return_pct));
    let risk_adjusted = Array1::from_iter(
        scored
            .iter()
            .filter(|(_, s)| s.volatility > ZERO_STD_EPSILON)
            .map(|(_, s)| s.return_pct / s.volatility),
    );
    let has_risk_adjusted = !risk_adjusted.is_empty();

    let summary = SweepSummary {
        key,
        years: scored.iter().map(|(y, _)| *y).collect(),
        avg_volatility: mean(volatility.view()),
        std_volatility: population_std(volatility.view()),
        avg_return: mean(returns.view()),
        std_return: population_std(returns.view()),
        avg_risk_adjusted: has_risk_adjusted.then(|| mean(risk_adjusted.view())),
        std_risk_adjusted: has_risk_adjusted.then(|| population_std(risk_adjusted.view())),
    };
    info!(
        key = %key,
        years = summary.years.len(),
        avg_volatility = summary.avg_volatility,
        avg_return = summary.avg_return,
        "Scored configuration"
    );
    Ok(summary)
}
