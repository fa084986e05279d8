pub mod index_memberships;
pub mod past_portfolios;
pub mod performance_statistics;
pub mod portfolios;
pub mod price_points;

use crate::errors::{Result, VolaError};
use crate::strategy::types::PortfolioKey;

/// Postgres has no unsigned integers
pub fn key_to_columns(key: &PortfolioKey) -> Result<(i32, i32, bool)> {
    let spread = i32::try_from(key.spread).map_err(|_| VolaError::InvalidInput(format!("spread {} too large", key.spread)))?;
    let period = i32::try_from(key.period).map_err(|_| VolaError::InvalidInput(format!("period {} too large", key.period)))?;
    Ok((spread, period, key.low_vol_only))
}
