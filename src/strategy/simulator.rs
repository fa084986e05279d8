use chrono::NaiveDate;
use ndarray::{Array1, ArrayView1, Axis};
use std::collections::BTreeSet;
use tracing::{debug, instrument};

use super::types::{PerformanceStatistics, WeightAllocation, to_fixed};
use crate::errors::{Result, VolaError};
use crate::market_data::matrix::MarketMatrixProvider;
use crate::market_data::source::MarketDataSource;
use crate::market_data::types::{PriceField, PricePoint};
use crate::stats_utils::{ZERO_STD_EPSILON, annualize, mean, population_std};

/// Amounts invested at the start of a window. The low volatility benchmark
/// is only tracked when it has a starting amount.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StartValues {
    pub portfolio: f64,
    pub benchmark: f64,
    pub low_vol: Option<f64>,
}

impl StartValues {
    pub fn uniform(investment: f64) -> Self {
        Self { portfolio: investment, benchmark: investment, low_vol: Some(investment) }
    }
}

/// Window statistics before conversion to fixed point
#[derive(Debug, Clone, PartialEq)]
pub struct WindowStatistics {
    pub volatility: f64,
    pub return_pct: f64,
    pub sharpe: Option<f64>,
    pub benchmark_volatility: f64,
    pub benchmark_return_pct: f64,
    pub benchmark_lv_volatility: Option<f64>,
    pub benchmark_lv_return_pct: Option<f64>,
}

impl WindowStatistics {
    pub fn to_fixed(&self) -> Result<PerformanceStatistics> {
        Ok(PerformanceStatistics {
            volatility: to_fixed(self.volatility)?,
            return_pct: to_fixed(self.return_pct)?,
            sharpe: self.sharpe.map(to_fixed).transpose()?,
            benchmark_volatility: to_fixed(self.benchmark_volatility)?,
            benchmark_return_pct: to_fixed(self.benchmark_return_pct)?,
            benchmark_lv_volatility: self.benchmark_lv_volatility.map(to_fixed).transpose()?,
            benchmark_lv_return_pct: self.benchmark_lv_return_pct.map(to_fixed).transpose()?,
        })
    }
}

/// Daily value and change trajectory of one simulated holding
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    pub values: Vec<f64>,
    pub changes: Vec<f64>,
}

impl Trajectory {
    pub fn last_value(&self) -> Option<f64> {
        self.values.last().copied()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationOutput {
    pub stats: WindowStatistics,
    pub dates: Vec<NaiveDate>,
    pub portfolio: Trajectory,
    pub benchmark: Trajectory,
    pub low_vol: Option<Trajectory>,
}

/// Replays an allocation over a window against the benchmark indices
pub struct PerformanceSimulator<'p, 'a, S: MarketDataSource> {
    provider: &'p MarketMatrixProvider<'a, S>,
    benchmark_symbol: String,
    low_vol_symbol: String,
}

impl<'p, 'a, S: MarketDataSource> PerformanceSimulator<'p, 'a, S> {
    pub fn new(
        provider: &'p MarketMatrixProvider<'a, S>,
        benchmark_symbol: impl Into<String>,
        low_vol_symbol: impl Into<String>,
    ) -> Self {
        Self { provider, benchmark_symbol: benchmark_symbol.into(), low_vol_symbol: low_vol_symbol.into() }
    }

    /// Buy `allocation` at the first close of `[start, end]` and hold it.
    ///
    /// Shares round half to even unless `continuous`. Every trajectory is
    /// shifted so day zero equals its starting amount, which keeps uninvested
    /// cash in the value. Rows are restricted to dates every tracked series
    /// traded on.
    #[instrument(skip_all, fields(on_close = true, start = %start, end = %end, holdings = allocation.len(), continuous = continuous))]
    pub fn simulate(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        allocation: &WeightAllocation,
        start_values: StartValues,
        continuous: bool,
    ) -> Result<SimulationOutput> {
        if allocation.is_empty() {
            return Err(VolaError::InvalidInput("cannot simulate an empty allocation".to_string()));
        }

        let source = self.provider.source();
        let prices = self.provider.matrix(start, end, allocation.symbols(), PriceField::Close)?;
        let changes = self.provider.matrix(start, end, allocation.symbols(), PriceField::Change)?;
        if prices.dates != changes.dates {
            return Err(VolaError::inconsistent(
                allocation.symbols().join(","),
                "close and change matrices disagree on dates",
            ));
        }

        let benchmark = source.price_series(&self.benchmark_symbol, start, end)?;
        let low_vol = match start_values.low_vol {
            Some(_) if source.first_date(&self.low_vol_symbol).is_some_and(|first| first < start) => {
                Some(source.price_series(&self.low_vol_symbol, start, end)?)
            }
            _ => None,
        };

        // Common calendar of the portfolio and every tracked benchmark
        let mut common: BTreeSet<NaiveDate> = prices.dates.iter().copied().collect();
        for series in std::iter::once(&benchmark).chain(low_vol.as_ref()) {
            let traded: BTreeSet<NaiveDate> = series.iter().map(|p| p.date).collect();
            common.retain(|d| traded.contains(d));
        }
        if common.is_empty() {
            return Err(VolaError::unavailable(
                self.benchmark_symbol.as_str(),
                format!("no dates shared with the portfolio between {start} and {end}"),
            ));
        }
        if common.len() < prices.dates.len() {
            debug!(dropped = prices.dates.len() - common.len(), "Trimmed portfolio dates missing from benchmarks");
        }

        let rows: Vec<usize> =
            prices.dates.iter().enumerate().filter(|(_, d)| common.contains(d)).map(|(i, _)| i).collect();
        let dates: Vec<NaiveDate> = rows.iter().map(|i| prices.dates[*i]).collect();
        let close = prices.to_f64().select(Axis(0), &rows);
        let change = changes.to_f64().select(Axis(0), &rows);
        let trading_days = dates.len();

        let first = close.row(0);
        let weights = allocation.weights_array();
        let shares: Array1<f64> = Array1::from_iter(weights.iter().zip(first.iter()).map(|(w, p)| {
            let exact = w * start_values.portfolio / p;
            if continuous { exact } else { exact.round_ties_even() }
        }));
        let total_shares = shares.sum();
        if !(total_shares > 0.0) {
            return Err(VolaError::InvalidInput(format!(
                "investment of {} buys no shares",
                start_values.portfolio
            )));
        }

        let portfolio_changes = change.dot(&shares) / total_shares;
        let portfolio_values = shift_to(close.dot(&shares), start_values.portfolio);
        let portfolio_return = percent_change(start_values.portfolio, portfolio_values[trading_days - 1]);
        let portfolio_volatility = annualize(population_std(portfolio_changes.view()), trading_days);

        let benchmark = index_trajectory(&benchmark, &common, start_values.benchmark);
        let excess = &portfolio_changes - &Array1::from_vec(benchmark.trajectory.changes.clone());
        let sharpe = sharpe_ratio(excess.view(), trading_days);

        let low_vol = match (low_vol, start_values.low_vol) {
            (Some(series), Some(amount)) => Some(index_trajectory(&series, &common, amount)),
            _ => None,
        };

        let stats = WindowStatistics {
            volatility: portfolio_volatility,
            return_pct: portfolio_return,
            sharpe,
            benchmark_volatility: benchmark.volatility,
            benchmark_return_pct: benchmark.return_pct,
            benchmark_lv_volatility: low_vol.as_ref().map(|lv| lv.volatility),
            benchmark_lv_return_pct: low_vol.as_ref().map(|lv| lv.return_pct),
        };
        debug!(
            volatility = stats.volatility,
            return_pct = stats.return_pct,
            sharpe = ?stats.sharpe,
            trading_days,
            "Simulated window"
        );

        Ok(SimulationOutput {
            stats,
            dates,
            portfolio: Trajectory { values: portfolio_values.to_vec(), changes: portfolio_changes.to_vec() },
            benchmark: benchmark.trajectory,
            low_vol: low_vol.map(|lv| lv.trajectory),
        })
    }
}

struct IndexResult {
    trajectory: Trajectory,
    volatility: f64,
    return_pct: f64,
}

/// Whole units of an index bought with `amount`; the return follows the
/// index price itself
fn index_trajectory(series: &[PricePoint], dates: &BTreeSet<NaiveDate>, amount: f64) -> IndexResult {
    let rows: Vec<&PricePoint> = series.iter().filter(|p| dates.contains(&p.date)).collect();
    let closes = Array1::from_iter(rows.iter().map(|p| p.close_price));
    let changes = Array1::from_iter(rows.iter().map(|p| p.pct_change));

    let first = closes[0];
    let last = closes[closes.len() - 1];
    let units = if first > 0.0 { (amount / first).floor() } else { 0.0 };
    let values = shift_to(&closes * units, amount);

    IndexResult {
        volatility: annualize(population_std(changes.view()), rows.len()),
        return_pct: percent_change(first, last),
        trajectory: Trajectory { values: values.to_vec(), changes: changes.to_vec() },
    }
}

/// Shift `values` so the first element equals `start`
fn shift_to(values: Array1<f64>, start: f64) -> Array1<f64> {
    let offset = start - values[0];
    values + offset
}

fn percent_change(from: f64, to: f64) -> f64 {
    if from == 0.0 { 0.0 } else { 100.0 * (to - from) / from }
}

/// Annualized mean over std of excess returns, None when they do not vary
fn sharpe_ratio(excess: ArrayView1<f64>, trading_days: usize) -> Option<f64> {
    let std = population_std(excess);
    if std < ZERO_STD_EPSILON {
        return None;
    }
    Some(mean(excess) / std * (trading_days as f64).sqrt())
}
