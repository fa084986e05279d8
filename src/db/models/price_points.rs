use chrono::NaiveDate;
use sqlx::FromRow;

use crate::market_data::types::PricePoint;

#[derive(Debug, FromRow)]
pub struct PricePointModel {
    pub symbol: String,
    pub date: NaiveDate,
    pub close_price: f64,
    pub pct_change: f64,
}

impl From<PricePointModel> for PricePoint {
    fn from(row: PricePointModel) -> Self {
        PricePoint { symbol: row.symbol, date: row.date, close_price: row.close_price, pct_change: row.pct_change }
    }
}
