use sqlx::PgPool;

use crate::db::models::portfolios::PortfolioModel;

pub async fn upsert_portfolio(pool: &PgPool, row: &PortfolioModel) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO portfolios (spread, period, low_vol_only, allocation, universe, volatility, computed_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (spread, period, low_vol_only)
        DO UPDATE SET allocation = EXCLUDED.allocation,
                      universe = EXCLUDED.universe,
                      volatility = EXCLUDED.volatility,
                      computed_at = EXCLUDED.computed_at
        "#,
    )
    .bind(row.spread)
    .bind(row.period)
    .bind(row.low_vol_only)
    .bind(&row.allocation)
    .bind(&row.universe)
    .bind(row.volatility)
    .bind(row.computed_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_portfolio(
    pool: &PgPool,
    spread: i32,
    period: i32,
    low_vol_only: bool,
) -> Result<Option<PortfolioModel>, sqlx::Error> {
    sqlx::query_as::<_, PortfolioModel>(
        r#"
        SELECT spread, period, low_vol_only, allocation, universe, volatility, computed_at
        FROM portfolios
        WHERE spread = $1 AND period = $2 AND low_vol_only = $3
        "#,
    )
    .bind(spread)
    .bind(period)
    .bind(low_vol_only)
    .fetch_optional(pool)
    .await
}
