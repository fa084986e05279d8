use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::PgPool;
use std::collections::HashMap;
use tracing::{debug, info, instrument};

use super::connection;
use super::models::{
    key_to_columns, past_portfolios::PastPortfolioModel, performance_statistics::PerformanceStatisticsModel,
    portfolios::PortfolioModel,
};
use super::queries::{
    index_memberships as membership_queries, past_portfolios as past_queries,
    performance_statistics as statistics_queries, portfolios as portfolio_queries, price_points as price_queries,
};
use super::schema;
use crate::config::Config;
use crate::errors::{Result, VolaError};
use crate::market_data::source::MarketSnapshot;
use crate::market_data::types::PricePoint;
use crate::store::PortfolioStore;
use crate::strategy::rolling::{PeriodPerformance, RollingPortfolioSeries};
use crate::strategy::types::{PastPortfolio, Portfolio, PortfolioKey};

pub struct DbManager {
    pub pool: PgPool,
}

impl DbManager {
    /// Creates a new database connection and initializes the schema
    pub async fn init(config: &Config) -> Result<Self> {
        let pool = connection::create_pool(config).await?;
        schema::init_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// Every stored row since `since` plus all index memberships, ready to be
    /// shared read-only with the workers
    #[instrument(skip(self), fields(on_close = true))]
    pub async fn load_market_snapshot(&self, since: NaiveDate) -> Result<MarketSnapshot> {
        let mut snapshot = MarketSnapshot::new();
        let rows = price_queries::get_price_points_since(&self.pool, since).await?;
        snapshot.extend(rows.into_iter().map(PricePoint::from));

        let mut memberships: HashMap<i32, Vec<String>> = HashMap::new();
        for row in membership_queries::get_all_memberships(&self.pool).await? {
            memberships.entry(row.year).or_default().push(row.symbol);
        }
        for (year, symbols) in memberships {
            snapshot.set_membership(year, symbols);
        }

        info!(symbols = snapshot.num_symbols(), rows = snapshot.num_rows(), "Market snapshot loaded");
        Ok(snapshot)
    }

    /// Upsert rows in one transaction
    pub async fn insert_price_points(&self, points: &[PricePoint]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for point in points {
            price_queries::upsert_price_point(&mut tx, point).await?;
        }
        tx.commit().await?;
        debug!(rows = points.len(), "Inserted price points");
        Ok(())
    }

    pub async fn set_index_membership(&self, year: i32, symbols: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        membership_queries::replace_membership(&mut tx, year, symbols).await?;
        tx.commit().await?;
        debug!(year, members = symbols.len(), "Index membership replaced");
        Ok(())
    }
}

#[async_trait]
impl PortfolioStore for DbManager {
    async fn save_portfolio(&self, portfolio: &Portfolio) -> Result<()> {
        let row = PortfolioModel::from_portfolio(portfolio)?;
        portfolio_queries::upsert_portfolio(&self.pool, &row).await?;
        Ok(())
    }

    async fn load_portfolio(&self, key: PortfolioKey) -> Result<Option<Portfolio>> {
        let (spread, period, low_vol_only) = key_to_columns(&key)?;
        portfolio_queries::get_portfolio(&self.pool, spread, period, low_vol_only)
            .await?
            .map(Portfolio::try_from)
            .transpose()
    }

    /// Replaces the stored chain as a whole
    async fn save_series(&self, series: &RollingPortfolioSeries) -> Result<()> {
        let key = series.key();
        let (spread, period, low_vol_only) = key_to_columns(&key)?;
        let rows = series
            .chain()
            .iter()
            .map(|past| PastPortfolioModel::from_past(&key, series.anniversary(), past))
            .collect::<Result<Vec<_>>>()?;

        let mut tx = self.pool.begin().await?;
        past_queries::delete_chain(&mut tx, spread, period, low_vol_only).await?;
        for row in &rows {
            past_queries::insert_past_portfolio(&mut tx, row).await?;
        }
        tx.commit().await?;
        debug!(key = %key, links = rows.len(), "Stored past portfolios");
        Ok(())
    }

    async fn load_series(&self, key: PortfolioKey) -> Result<Option<RollingPortfolioSeries>> {
        let (spread, period, low_vol_only) = key_to_columns(&key)?;
        let rows = past_queries::get_chain(&self.pool, spread, period, low_vol_only).await?;
        let Some(first) = rows.first() else { return Ok(None) };

        let anniversary = first.anniversary()?;
        if rows.iter().any(|r| r.anniversary_month != first.anniversary_month || r.anniversary_day != first.anniversary_day) {
            return Err(VolaError::InvalidInput(format!("stored chain for {key} mixes anniversaries")));
        }
        let chain = rows.into_iter().map(PastPortfolio::try_from).collect::<Result<Vec<_>>>()?;
        Ok(Some(RollingPortfolioSeries::new(key, anniversary, chain)))
    }

    async fn save_statistics(&self, key: PortfolioKey, investment: i64, periods: &[PeriodPerformance]) -> Result<()> {
        let rows = periods
            .iter()
            .map(|p| PerformanceStatisticsModel::from_period(&key, investment, p))
            .collect::<Result<Vec<_>>>()?;

        let mut tx = self.pool.begin().await?;
        for row in &rows {
            statistics_queries::upsert_statistics(&mut tx, row).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn load_statistics(&self, key: PortfolioKey, investment: i64) -> Result<Vec<PeriodPerformance>> {
        let (spread, period, low_vol_only) = key_to_columns(&key)?;
        let rows = statistics_queries::get_statistics(&self.pool, spread, period, low_vol_only, investment).await?;
        Ok(rows.into_iter().map(PeriodPerformance::from).collect())
    }
}
