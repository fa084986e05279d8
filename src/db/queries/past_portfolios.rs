use sqlx::{PgPool, Postgres, Transaction};

use crate::db::models::past_portfolios::PastPortfolioModel;

/// Drop the stored chain of one configuration
pub async fn delete_chain(
    tx: &mut Transaction<'_, Postgres>,
    spread: i32,
    period: i32,
    low_vol_only: bool,
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM past_portfolios WHERE spread = $1 AND period = $2 AND low_vol_only = $3")
        .bind(spread)
        .bind(period)
        .bind(low_vol_only)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub async fn insert_past_portfolio(
    tx: &mut Transaction<'_, Postgres>,
    row: &PastPortfolioModel,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO past_portfolios (
            spread, period, low_vol_only, anniversary_year, anniversary_month, anniversary_day,
            start_date, allocation, volatility
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(row.spread)
    .bind(row.period)
    .bind(row.low_vol_only)
    .bind(row.anniversary_year)
    .bind(row.anniversary_month)
    .bind(row.anniversary_day)
    .bind(row.start_date)
    .bind(&row.allocation)
    .bind(row.volatility)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Chain of one configuration, oldest first
pub async fn get_chain(
    pool: &PgPool,
    spread: i32,
    period: i32,
    low_vol_only: bool,
) -> Result<Vec<PastPortfolioModel>, sqlx::Error> {
    sqlx::query_as::<_, PastPortfolioModel>(
        r#"
        SELECT spread, period, low_vol_only, anniversary_year, anniversary_month, anniversary_day,
               start_date, allocation, volatility
        FROM past_portfolios
        WHERE spread = $1 AND period = $2 AND low_vol_only = $3
        ORDER BY start_date ASC
        "#,
    )
    .bind(spread)
    .bind(period)
    .bind(low_vol_only)
    .fetch_all(pool)
    .await
}
