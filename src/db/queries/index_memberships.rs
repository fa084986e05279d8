use sqlx::{PgPool, Postgres, Transaction};

use crate::db::models::index_memberships::IndexMembershipModel;

/// Replace the constituents of one year
pub async fn replace_membership(
    tx: &mut Transaction<'_, Postgres>,
    year: i32,
    symbols: &[String],
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM index_memberships WHERE year = $1")
        .bind(year)
        .execute(&mut **tx)
        .await?;

    for symbol in symbols {
        sqlx::query("INSERT INTO index_memberships (year, symbol) VALUES ($1, $2)")
            .bind(year)
            .bind(symbol)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

pub async fn get_all_memberships(pool: &PgPool) -> Result<Vec<IndexMembershipModel>, sqlx::Error> {
    sqlx::query_as::<_, IndexMembershipModel>(
        r#"
        SELECT year, symbol
        FROM index_memberships
        ORDER BY year ASC, symbol ASC
        "#,
    )
    .fetch_all(pool)
    .await
}
