pub mod index_memberships;
pub mod past_portfolios;
pub mod performance_statistics;
pub mod portfolios;
pub mod price_points;
