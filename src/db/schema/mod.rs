use sqlx::postgres::PgPool;

pub async fn init_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS price_points (
            symbol TEXT NOT NULL,
            date DATE NOT NULL,
            close_price DOUBLE PRECISION NOT NULL,
            pct_change DOUBLE PRECISION NOT NULL,
            PRIMARY KEY (symbol, date)
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_memberships (
            year INTEGER NOT NULL,
            symbol TEXT NOT NULL,
            PRIMARY KEY (year, symbol)
        );
        "#,
    )
    .execute(pool)
    .await?;

    // Allocations are AllocationRecord JSON
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS portfolios (
            spread INTEGER NOT NULL,
            period INTEGER NOT NULL,
            low_vol_only BOOLEAN NOT NULL,
            allocation TEXT NOT NULL,
            universe TEXT NOT NULL,
            volatility NUMERIC(12, 2) NOT NULL,
            computed_at DATE NOT NULL,
            PRIMARY KEY (spread, period, low_vol_only)
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS past_portfolios (
            spread INTEGER NOT NULL,
            period INTEGER NOT NULL,
            low_vol_only BOOLEAN NOT NULL,
            anniversary_year INTEGER NOT NULL,
            anniversary_month INTEGER NOT NULL,
            anniversary_day INTEGER NOT NULL,
            start_date DATE NOT NULL,
            allocation TEXT NOT NULL,
            volatility NUMERIC(12, 2) NOT NULL,
            PRIMARY KEY (spread, period, low_vol_only, anniversary_year)
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS performance_statistics (
            spread INTEGER NOT NULL,
            period INTEGER NOT NULL,
            low_vol_only BOOLEAN NOT NULL,
            investment BIGINT NOT NULL,
            anniversary_year INTEGER NOT NULL,
            start_date DATE NOT NULL,
            end_date DATE NOT NULL,
            volatility NUMERIC(12, 2) NOT NULL,
            return_pct NUMERIC(12, 2) NOT NULL,
            sharpe NUMERIC(12, 2),
            benchmark_volatility NUMERIC(12, 2) NOT NULL,
            benchmark_return_pct NUMERIC(12, 2) NOT NULL,
            benchmark_lv_volatility NUMERIC(12, 2),
            benchmark_lv_return_pct NUMERIC(12, 2),
            PRIMARY KEY (spread, period, low_vol_only, investment, anniversary_year)
        );
        "#,
    )
    .execute(pool)
    .await?;

    // Window queries scan one symbol by date
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_price_points_date
        ON price_points(date);
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
