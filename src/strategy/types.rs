use chrono::NaiveDate;
use ndarray::Array1;
use rust_decimal::Decimal;
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

use crate::errors::{Result, VolaError};

/// Current layout of `AllocationRecord`
pub const ALLOCATION_RECORD_VERSION: u16 = 1;

/// Decimal places kept for persisted percentages and currency
pub const FIXED_POINT_DP: u32 = 2;

/// Weights per symbol, ordered by symbol ascending
#[derive(Debug, Clone, PartialEq)]
pub struct WeightAllocation {
    symbols: Vec<String>,
    weights: Vec<f64>,
}

impl WeightAllocation {
    /// Pairs are sorted by symbol. Duplicate symbols and negative or
    /// non-finite weights are rejected.
    pub fn new(symbols: Vec<String>, weights: Vec<f64>) -> Result<Self> {
        if symbols.len() != weights.len() {
            return Err(VolaError::InvalidInput(format!(
                "{} symbols but {} weights",
                symbols.len(),
                weights.len()
            )));
        }
        if let Some(w) = weights.iter().find(|w| !w.is_finite() || **w < 0.0) {
            return Err(VolaError::InvalidInput(format!("invalid weight {w}")));
        }

        let mut pairs: Vec<(String, f64)> = symbols.into_iter().zip(weights).collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        if let Some(pair) = pairs.windows(2).find(|p| p[0].0 == p[1].0) {
            return Err(VolaError::InvalidInput(format!("duplicate symbol {}", pair[0].0)));
        }

        let (symbols, weights) = pairs.into_iter().unzip();
        Ok(Self { symbols, weights })
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn weights_array(&self) -> Array1<f64> {
        Array1::from_vec(self.weights.clone())
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn total(&self) -> f64 {
        self.weights.iter().sum()
    }

    pub fn weight_of(&self, symbol: &str) -> Option<f64> {
        let i = self.symbols.binary_search_by(|s| s.as_str().cmp(symbol)).ok()?;
        Some(self.weights[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.symbols.iter().map(String::as_str).zip(self.weights.iter().copied())
    }

    pub fn to_record(&self) -> AllocationRecord {
        AllocationRecord {
            version: ALLOCATION_RECORD_VERSION,
            symbols: self.symbols.clone(),
            weights: self.weights.clone(),
        }
    }
}

/// Serialized form of a `WeightAllocation`, independent of the table it is
/// stored in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationRecord {
    pub version: u16,
    pub symbols: Vec<String>,
    pub weights: Vec<f64>,
}

impl AllocationRecord {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let record: AllocationRecord = serde_json::from_str(raw)?;
        if record.version != ALLOCATION_RECORD_VERSION {
            return Err(VolaError::InvalidInput(format!(
                "unsupported allocation record version {}",
                record.version
            )));
        }
        Ok(record)
    }

    pub fn into_allocation(self) -> Result<WeightAllocation> {
        WeightAllocation::new(self.symbols, self.weights)
    }
}

/// Parameters identifying one portfolio configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortfolioKey {
    pub spread: u32,       // Max weight per asset is 1/spread
    pub period: u32,       // Minimization window in years
    pub low_vol_only: bool,
}

impl PortfolioKey {
    pub fn new(spread: u32, period: u32, low_vol_only: bool) -> Self {
        Self { spread, period, low_vol_only }
    }
}

impl fmt::Display for PortfolioKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "spread={},period={},lv={}", self.spread, self.period, self.low_vol_only)
    }
}

/// Symbols and sizes the strategy runs with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategySettings {
    pub reference_symbol: String,   // Trades on every exchange day
    pub benchmark_symbol: String,
    pub low_vol_benchmark_symbol: String,
    pub low_vol_subset_size: usize,
    pub backtest_start_year: i32,
}

impl Default for StrategySettings {
    fn default() -> Self {
        Self {
            reference_symbol: "KO".to_string(),
            benchmark_symbol: "^SP500TR".to_string(),
            low_vol_benchmark_symbol: "SPLV".to_string(),
            low_vol_subset_size: 100,
            backtest_start_year: super::strategy_constants::DEFAULT_BACKTEST_START_YEAR,
        }
    }
}

/// Live minimum-volatility snapshot for one configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Portfolio {
    pub key: PortfolioKey,
    pub allocation: WeightAllocation, // Non-zero weights only
    pub universe: Vec<String>,        // Candidate symbols handed to the solver
    pub volatility: Decimal,          // Annualized, observed-day convention
    pub computed_at: NaiveDate,
}

impl Portfolio {
    pub fn log_portfolio(&self) {
        let mut holdings: Vec<(&str, f64)> = self.allocation.iter().collect();
        holdings.sort_by(|a, b| b.1.total_cmp(&a.1));
        let summary = holdings
            .iter()
            .map(|(symbol, weight)| format!("{}: Weight={:.2}%", symbol, weight * 100.0))
            .collect::<Vec<_>>()
            .join("\n  ");

        info!(
            "Minimum volatility portfolio [{}] as of {} (sorted by weight):\n  {}\n\nPortfolio Summary:\n  Holdings: {} of {}\n  Total Weight: {:.2}%\n  Volatility: {}",
            self.key,
            self.computed_at,
            summary,
            self.allocation.len(),
            self.universe.len(),
            self.allocation.total() * 100.0,
            self.volatility
        );
    }
}

/// Allocation fixed at an anniversary and scored over the following year
#[derive(Debug, Clone, PartialEq)]
pub struct PastPortfolio {
    pub anniversary_year: i32,
    pub start_date: NaiveDate, // End of minimization, scoring runs for a year from here
    pub allocation: WeightAllocation,
    pub volatility: Decimal, // Minimized volatility over the trailing period
}

/// Stored performance of one past portfolio for one investment amount
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceStatistics {
    pub volatility: Decimal,
    pub return_pct: Decimal,
    pub sharpe: Option<Decimal>, // None when excess returns have zero variance
    pub benchmark_volatility: Decimal,
    pub benchmark_return_pct: Decimal,
    pub benchmark_lv_volatility: Option<Decimal>,
    pub benchmark_lv_return_pct: Option<Decimal>,
}

/// Convert a float to fixed point exactly once, at the persistence boundary
pub fn to_fixed(value: f64) -> Result<Decimal> {
    Decimal::from_f64(value)
        .map(|d| d.round_dp(FIXED_POINT_DP))
        .ok_or_else(|| VolaError::InvalidInput(format!("{value} has no fixed-point representation")))
}
