use sqlx::FromRow;

#[derive(Debug, FromRow)]
pub struct IndexMembershipModel {
    pub year: i32,
    pub symbol: String,
}
