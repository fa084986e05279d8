use chrono::NaiveDate;
use sqlx::{PgPool, Postgres, Transaction};

use crate::db::models::price_points::PricePointModel;
use crate::market_data::types::PricePoint;

/// Insert or overwrite one day of one symbol
pub async fn upsert_price_point(tx: &mut Transaction<'_, Postgres>, point: &PricePoint) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO price_points (symbol, date, close_price, pct_change)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (symbol, date)
        DO UPDATE SET close_price = EXCLUDED.close_price, pct_change = EXCLUDED.pct_change
        "#,
    )
    .bind(&point.symbol)
    .bind(point.date)
    .bind(point.close_price)
    .bind(point.pct_change)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Every stored row on or after `since`, ordered by symbol then date
pub async fn get_price_points_since(pool: &PgPool, since: NaiveDate) -> Result<Vec<PricePointModel>, sqlx::Error> {
    sqlx::query_as::<_, PricePointModel>(
        r#"
        SELECT symbol, date, close_price, pct_change
        FROM price_points
        WHERE date >= $1
        ORDER BY symbol ASC, date ASC
        "#,
    )
    .bind(since)
    .fetch_all(pool)
    .await
}
