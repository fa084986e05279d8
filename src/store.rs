use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::errors::Result;
use crate::strategy::rolling::{PeriodPerformance, RollingPortfolioSeries};
use crate::strategy::types::{Portfolio, PortfolioKey};

/// Persistence for computed portfolios, past portfolio chains and their
/// cached performance. Saving overwrites whatever is stored under the key.
#[async_trait]
pub trait PortfolioStore: Send + Sync {
    async fn save_portfolio(&self, portfolio: &Portfolio) -> Result<()>;

    async fn load_portfolio(&self, key: PortfolioKey) -> Result<Option<Portfolio>>;

    async fn save_series(&self, series: &RollingPortfolioSeries) -> Result<()>;

    async fn load_series(&self, key: PortfolioKey) -> Result<Option<RollingPortfolioSeries>>;

    async fn save_statistics(&self, key: PortfolioKey, investment: i64, periods: &[PeriodPerformance]) -> Result<()>;

    /// Cached periods in chronological order; empty if never computed
    async fn load_statistics(&self, key: PortfolioKey, investment: i64) -> Result<Vec<PeriodPerformance>>;
}

/// Store kept in process memory, for tests and dry runs
#[derive(Debug, Default)]
pub struct InMemoryPortfolioStore {
    portfolios: RwLock<BTreeMap<PortfolioKey, Portfolio>>,
    series: RwLock<BTreeMap<PortfolioKey, RollingPortfolioSeries>>,
    statistics: RwLock<BTreeMap<(PortfolioKey, i64), Vec<PeriodPerformance>>>,
}

impl InMemoryPortfolioStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PortfolioStore for InMemoryPortfolioStore {
    async fn save_portfolio(&self, portfolio: &Portfolio) -> Result<()> {
        self.portfolios.write().await.insert(portfolio.key, portfolio.clone());
        Ok(())
    }

    async fn load_portfolio(&self, key: PortfolioKey) -> Result<Option<Portfolio>> {
        Ok(self.portfolios.read().await.get(&key).cloned())
    }

    async fn save_series(&self, series: &RollingPortfolioSeries) -> Result<()> {
        debug!(key = %series.key(), links = series.len(), "Storing series in memory");
        self.series.write().await.insert(series.key(), series.clone());
        Ok(())
    }

    async fn load_series(&self, key: PortfolioKey) -> Result<Option<RollingPortfolioSeries>> {
        Ok(self.series.read().await.get(&key).cloned())
    }

    async fn save_statistics(&self, key: PortfolioKey, investment: i64, periods: &[PeriodPerformance]) -> Result<()> {
        let mut periods = periods.to_vec();
        periods.sort_by_key(|p| p.start_date);
        self.statistics.write().await.insert((key, investment), periods);
        Ok(())
    }

    async fn load_statistics(&self, key: PortfolioKey, investment: i64) -> Result<Vec<PeriodPerformance>> {
        Ok(self.statistics.read().await.get(&(key, investment)).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::rolling::Anniversary;
    use crate::strategy::types::{PastPortfolio, PerformanceStatistics, WeightAllocation};
    use chrono::NaiveDate;
    use rust_decimal::dec;

    fn past(year: i32) -> PastPortfolio {
        PastPortfolio {
            anniversary_year: year,
            start_date: NaiveDate::from_ymd_opt(year, 3, 31).unwrap(),
            allocation: WeightAllocation::new(vec!["KO".to_string(), "PG".to_string()], vec![0.4, 0.6]).unwrap(),
            volatility: dec!(9.87),
        }
    }

    fn period(year: i32) -> PeriodPerformance {
        PeriodPerformance {
            anniversary_year: year,
            start_date: NaiveDate::from_ymd_opt(year, 3, 31).unwrap(),
            end_date: NaiveDate::from_ymd_opt(year + 1, 3, 30).unwrap(),
            stats: PerformanceStatistics {
                volatility: dec!(10.5),
                return_pct: dec!(7.25),
                sharpe: None,
                benchmark_volatility: dec!(14.0),
                benchmark_return_pct: dec!(9.1),
                benchmark_lv_volatility: Some(dec!(11.2)),
                benchmark_lv_return_pct: Some(dec!(8.0)),
            },
        }
    }

    #[tokio::test]
    async fn series_and_statistics_round_trip() {
        let store = InMemoryPortfolioStore::new();
        let key = PortfolioKey::new(50, 4, false);
        let series = RollingPortfolioSeries::new(key, Anniversary::new(4, 1).unwrap(), vec![past(2014), past(2013)]);

        store.save_series(&series).await.unwrap();
        let loaded = store.load_series(key).await.unwrap().unwrap();
        assert_eq!(loaded.chain()[0].anniversary_year, 2013);
        assert!(store.load_series(PortfolioKey::new(25, 4, false)).await.unwrap().is_none());

        store.save_statistics(key, 10_000, &[period(2014), period(2013)]).await.unwrap();
        let cached = store.load_statistics(key, 10_000).await.unwrap();
        assert_eq!(cached.iter().map(|p| p.anniversary_year).collect::<Vec<_>>(), vec![2013, 2014]);
        assert!(store.load_statistics(key, 25_000).await.unwrap().is_empty());
    }
}
