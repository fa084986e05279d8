use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlx::FromRow;

use super::key_to_columns;
use crate::errors::{Result, VolaError};
use crate::strategy::rolling::Anniversary;
use crate::strategy::types::{AllocationRecord, PastPortfolio, PortfolioKey};

#[derive(Debug, FromRow)]
pub struct PastPortfolioModel {
    pub spread: i32,
    pub period: i32,
    pub low_vol_only: bool,
    pub anniversary_year: i32,
    pub anniversary_month: i32,
    pub anniversary_day: i32,
    pub start_date: NaiveDate,
    pub allocation: String, // AllocationRecord JSON
    pub volatility: Decimal,
}

impl PastPortfolioModel {
    pub fn from_past(key: &PortfolioKey, anniversary: Anniversary, past: &PastPortfolio) -> Result<Self> {
        let (spread, period, low_vol_only) = key_to_columns(key)?;
        Ok(Self {
            spread,
            period,
            low_vol_only,
            anniversary_year: past.anniversary_year,
            anniversary_month: anniversary.month() as i32,
            anniversary_day: anniversary.day() as i32,
            start_date: past.start_date,
            allocation: past.allocation.to_record().to_json()?,
            volatility: past.volatility,
        })
    }

    pub fn anniversary(&self) -> Result<Anniversary> {
        let month = u32::try_from(self.anniversary_month)
            .map_err(|_| VolaError::InvalidInput(format!("stored month {}", self.anniversary_month)))?;
        let day = u32::try_from(self.anniversary_day)
            .map_err(|_| VolaError::InvalidInput(format!("stored day {}", self.anniversary_day)))?;
        Anniversary::new(month, day)
    }
}

impl TryFrom<PastPortfolioModel> for PastPortfolio {
    type Error = VolaError;

    fn try_from(row: PastPortfolioModel) -> Result<Self> {
        Ok(PastPortfolio {
            anniversary_year: row.anniversary_year,
            start_date: row.start_date,
            allocation: AllocationRecord::from_json(&row.allocation)?.into_allocation()?,
            volatility: row.volatility,
        })
    }
}
