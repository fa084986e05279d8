pub mod context;
pub mod engine;
pub mod materializer;
pub mod minimizer;
pub mod rolling;
pub mod simulator;
pub mod strategy_constants;
pub mod types;
