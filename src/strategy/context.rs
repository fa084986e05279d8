use super::simulator::PerformanceSimulator;
use super::types::StrategySettings;
use crate::market_data::matrix::MarketMatrixProvider;
use crate::market_data::source::MarketDataSource;
use crate::market_data::universe::SymbolUniverseResolver;

/// Read-only market view and settings shared by every strategy computation
pub struct StrategyContext<'p, 'a, S: MarketDataSource> {
    provider: &'p MarketMatrixProvider<'a, S>,
    settings: &'p StrategySettings,
}

impl<'p, 'a, S: MarketDataSource> StrategyContext<'p, 'a, S> {
    pub fn new(provider: &'p MarketMatrixProvider<'a, S>, settings: &'p StrategySettings) -> Self {
        Self { provider, settings }
    }

    pub fn provider(&self) -> &'p MarketMatrixProvider<'a, S> {
        self.provider
    }

    pub fn settings(&self) -> &'p StrategySettings {
        self.settings
    }

    pub fn resolver(&self) -> SymbolUniverseResolver<'p, 'a, S> {
        SymbolUniverseResolver::new(self.provider)
    }

    pub fn simulator(&self) -> PerformanceSimulator<'p, 'a, S> {
        PerformanceSimulator::new(
            self.provider,
            self.settings.benchmark_symbol.as_str(),
            self.settings.low_vol_benchmark_symbol.as_str(),
        )
    }
}
