pub mod batch;
pub mod config;
pub mod db;
pub mod errors;
pub mod logging;
pub mod market_data;
pub mod render;
pub mod stats_utils;
pub mod store;
pub mod strategy;
