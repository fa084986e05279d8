use sqlx::{PgPool, Postgres, Transaction};

use crate::db::models::performance_statistics::PerformanceStatisticsModel;

pub async fn upsert_statistics(
    tx: &mut Transaction<'_, Postgres>,
    row: &PerformanceStatisticsModel,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO performance_statistics (
            spread, period, low_vol_only, investment, anniversary_year, start_date, end_date,
            volatility, return_pct, sharpe, benchmark_volatility, benchmark_return_pct,
            benchmark_lv_volatility, benchmark_lv_return_pct
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        ON CONFLICT (spread, period, low_vol_only, investment, anniversary_year)
        DO UPDATE SET start_date = EXCLUDED.start_date,
                      end_date = EXCLUDED.end_date,
                      volatility = EXCLUDED.volatility,
                      return_pct = EXCLUDED.return_pct,
                      sharpe = EXCLUDED.sharpe,
                      benchmark_volatility = EXCLUDED.benchmark_volatility,
                      benchmark_return_pct = EXCLUDED.benchmark_return_pct,
                      benchmark_lv_volatility = EXCLUDED.benchmark_lv_volatility,
                      benchmark_lv_return_pct = EXCLUDED.benchmark_lv_return_pct
        "#,
    )
    .bind(row.spread)
    .bind(row.period)
    .bind(row.low_vol_only)
    .bind(row.investment)
    .bind(row.anniversary_year)
    .bind(row.start_date)
    .bind(row.end_date)
    .bind(row.volatility)
    .bind(row.return_pct)
    .bind(row.sharpe)
    .bind(row.benchmark_volatility)
    .bind(row.benchmark_return_pct)
    .bind(row.benchmark_lv_volatility)
    .bind(row.benchmark_lv_return_pct)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

pub async fn get_statistics(
    pool: &PgPool,
    spread: i32,
    period: i32,
    low_vol_only: bool,
    investment: i64,
) -> Result<Vec<PerformanceStatisticsModel>, sqlx::Error> {
    sqlx::query_as::<_, PerformanceStatisticsModel>(
        r#"
        SELECT spread, period, low_vol_only, investment, anniversary_year, start_date, end_date,
               volatility, return_pct, sharpe, benchmark_volatility, benchmark_return_pct,
               benchmark_lv_volatility, benchmark_lv_return_pct
        FROM performance_statistics
        WHERE spread = $1 AND period = $2 AND low_vol_only = $3 AND investment = $4
        ORDER BY start_date ASC
        "#,
    )
    .bind(spread)
    .bind(period)
    .bind(low_vol_only)
    .bind(investment)
    .fetch_all(pool)
    .await
}
