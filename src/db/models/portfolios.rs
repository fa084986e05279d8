use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlx::FromRow;

use super::key_to_columns;
use crate::errors::{Result, VolaError};
use crate::strategy::types::{AllocationRecord, Portfolio, PortfolioKey};

#[derive(Debug, FromRow)]
pub struct PortfolioModel {
    pub spread: i32,
    pub period: i32,
    pub low_vol_only: bool,
    pub allocation: String, // AllocationRecord JSON
    pub universe: String,   // JSON array of symbols
    pub volatility: Decimal,
    pub computed_at: NaiveDate,
}

impl PortfolioModel {
    pub fn from_portfolio(portfolio: &Portfolio) -> Result<Self> {
        let (spread, period, low_vol_only) = key_to_columns(&portfolio.key)?;
        Ok(Self {
            spread,
            period,
            low_vol_only,
            allocation: portfolio.allocation.to_record().to_json()?,
            universe: serde_json::to_string(&portfolio.universe)?,
            volatility: portfolio.volatility,
            computed_at: portfolio.computed_at,
        })
    }
}

impl TryFrom<PortfolioModel> for Portfolio {
    type Error = VolaError;

    fn try_from(row: PortfolioModel) -> Result<Self> {
        Ok(Portfolio {
            key: PortfolioKey::new(
                u32::try_from(row.spread).map_err(|_| VolaError::InvalidInput(format!("stored spread {}", row.spread)))?,
                u32::try_from(row.period).map_err(|_| VolaError::InvalidInput(format!("stored period {}", row.period)))?,
                row.low_vol_only,
            ),
            allocation: AllocationRecord::from_json(&row.allocation)?.into_allocation()?,
            universe: serde_json::from_str(&row.universe)?,
            volatility: row.volatility,
            computed_at: row.computed_at,
        })
    }
}
