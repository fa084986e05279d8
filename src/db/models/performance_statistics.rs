use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlx::FromRow;

use super::key_to_columns;
use crate::errors::Result;
use crate::strategy::rolling::PeriodPerformance;
use crate::strategy::types::{PerformanceStatistics, PortfolioKey};

#[derive(Debug, FromRow)]
pub struct PerformanceStatisticsModel {
    pub spread: i32,
    pub period: i32,
    pub low_vol_only: bool,
    pub investment: i64,
    pub anniversary_year: i32,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub volatility: Decimal,
    pub return_pct: Decimal,
    pub sharpe: Option<Decimal>,
    pub benchmark_volatility: Decimal,
    pub benchmark_return_pct: Decimal,
    pub benchmark_lv_volatility: Option<Decimal>,
    pub benchmark_lv_return_pct: Option<Decimal>,
}

impl PerformanceStatisticsModel {
    pub fn from_period(key: &PortfolioKey, investment: i64, period: &PeriodPerformance) -> Result<Self> {
        let (spread, period_years, low_vol_only) = key_to_columns(key)?;
        let stats = &period.stats;
        Ok(Self {
            spread,
            period: period_years,
            low_vol_only,
            investment,
            anniversary_year: period.anniversary_year,
            start_date: period.start_date,
            end_date: period.end_date,
            volatility: stats.volatility,
            return_pct: stats.return_pct,
            sharpe: stats.sharpe,
            benchmark_volatility: stats.benchmark_volatility,
            benchmark_return_pct: stats.benchmark_return_pct,
            benchmark_lv_volatility: stats.benchmark_lv_volatility,
            benchmark_lv_return_pct: stats.benchmark_lv_return_pct,
        })
    }
}

impl From<PerformanceStatisticsModel> for PeriodPerformance {
    fn from(row: PerformanceStatisticsModel) -> Self {
        PeriodPerformance {
            anniversary_year: row.anniversary_year,
            start_date: row.start_date,
            end_date: row.end_date,
            stats: PerformanceStatistics {
                volatility: row.volatility,
                return_pct: row.return_pct,
                sharpe: row.sharpe,
                benchmark_volatility: row.benchmark_volatility,
                benchmark_return_pct: row.benchmark_return_pct,
                benchmark_lv_volatility: row.benchmark_lv_volatility,
                benchmark_lv_return_pct: row.benchmark_lv_return_pct,
            },
        }
    }
}
