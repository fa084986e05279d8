use chrono::{Duration, NaiveDate};
use rust_decimal::Decimal;
use tracing::{debug, instrument, warn};

use super::minimizer::{minimize_matrix, share_volatility};
use super::strategy_constants::{HISTORICAL_PRICE_LOOKBACK_DAYS, MIN_SHARE_PRICE, PLACEHOLDER_PRICE_MULTIPLIER};
use super::types::{WeightAllocation, to_fixed};
use crate::errors::{Result, VolaError};
use crate::market_data::matrix::MarketMatrixProvider;
use crate::market_data::source::MarketDataSource;
use crate::market_data::types::{MarketMatrix, PriceField};
use crate::stats_utils::annualize;

/// Live price feed used when materializing for today
pub trait QuoteSource: Sync {
    /// One positive price per symbol, in the order given
    fn latest_quotes(&self, symbols: &[String]) -> Result<Vec<f64>>;
}

/// One purchasable position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoldingLine {
    pub symbol: String,
    pub price: Decimal,
    pub shares: u64,
    pub amount: Decimal, // price * shares, to the cent
}

/// Whole shares per symbol. Symbols rounding to zero shares are absent.
#[derive(Debug)]
pub struct ShareAllocation {
    pub symbols: Vec<String>,
    pub shares: Vec<u64>,
    pub prices: Vec<f64>,
    pub volatility: Option<Decimal>, // Realized on the retained shares, annualized
    pub price_warning: Option<VolaError>,
}

impl ShareAllocation {
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Cash actually spent on the retained shares
    pub fn invested(&self) -> f64 {
        self.prices.iter().zip(&self.shares).map(|(p, s)| p * *s as f64).sum()
    }

    pub fn invested_fixed(&self) -> Result<Decimal> {
        to_fixed(self.invested())
    }

    pub fn line_items(&self) -> Result<Vec<HoldingLine>> {
        self.symbols
            .iter()
            .zip(&self.prices)
            .zip(&self.shares)
            .map(|((symbol, price), shares)| {
                Ok(HoldingLine {
                    symbol: symbol.clone(),
                    price: to_fixed(*price)?,
                    shares: *shares,
                    amount: to_fixed(price * *shares as f64)?,
                })
            })
            .collect()
    }
}

/// Turns weights into integer share counts for a concrete investment
pub struct AllocationMaterializer<'p, 'a, S: MarketDataSource> {
    provider: &'p MarketMatrixProvider<'a, S>,
    quotes: Option<&'p dyn QuoteSource>,
}

impl<'p, 'a, S: MarketDataSource> AllocationMaterializer<'p, 'a, S> {
    pub fn new(provider: &'p MarketMatrixProvider<'a, S>) -> Self {
        Self { provider, quotes: None }
    }

    pub fn with_quotes(mut self, quotes: &'p dyn QuoteSource) -> Self {
        self.quotes = Some(quotes);
        self
    }

    /// Shares for `allocation` priced at `end`.
    ///
    /// With `live`, quotes are requested only for positions worth at least
    /// `MIN_SHARE_PRICE`; the rest get a placeholder price that rounds them
    /// to zero shares. A failed or invalid quote falls back to historical
    /// closes and is reported through `price_warning`.
    ///
    /// When `changes` is given the realized volatility of the rounded shares
    /// is computed over its rows.
    #[instrument(skip_all, fields(on_close = true, end = %end, holdings = allocation.len(), investment = investment, live = live))]
    pub fn materialize(
        &self,
        end: NaiveDate,
        allocation: &WeightAllocation,
        investment: f64,
        live: bool,
        changes: Option<&MarketMatrix>,
    ) -> Result<ShareAllocation> {
        if allocation.is_empty() {
            return Err(VolaError::InvalidInput("cannot materialize an empty allocation".to_string()));
        }
        if !(investment > 0.0) {
            return Err(VolaError::InvalidInput(format!("investment must be positive, got {investment}")));
        }

        let (prices, price_warning) = if live {
            match self.live_prices(allocation, investment) {
                Ok(prices) => (prices, None),
                Err(e) => {
                    warn!(err = %e, "Live prices unavailable, falling back to historical closes");
                    (self.historical_prices(end, allocation.symbols())?, Some(e))
                }
            }
        } else {
            (self.historical_prices(end, allocation.symbols())?, None)
        };

        let mut symbols = Vec::with_capacity(allocation.len());
        let mut shares = Vec::with_capacity(allocation.len());
        let mut kept_prices = Vec::with_capacity(allocation.len());
        for ((symbol, weight), price) in allocation.iter().zip(prices) {
            let count = whole_shares(weight * investment, price);
            if count == 0 {
                continue;
            }
            symbols.push(symbol.to_string());
            shares.push(count);
            kept_prices.push(price);
        }
        debug!(retained = symbols.len(), dropped = allocation.len() - symbols.len(), "Rounded weights to shares");

        let volatility = match changes {
            Some(changes) if !symbols.is_empty() => {
                let columns = changes.select_columns(&symbols).ok_or_else(|| {
                    VolaError::InvalidInput("changes matrix does not cover the allocation".to_string())
                })?;
                let counts = ndarray::Array1::from_iter(shares.iter().map(|s| *s as f64));
                let daily = share_volatility(counts.view(), &columns);
                Some(to_fixed(annualize(daily, changes.trading_days()))?)
            }
            _ => None,
        };

        Ok(ShareAllocation { symbols, shares, prices: kept_prices, volatility, price_warning })
    }

    /// Most recent close within the lookback window ending at `end`
    pub fn historical_prices(&self, end: NaiveDate, symbols: &[String]) -> Result<Vec<f64>> {
        let start = end - Duration::days(HISTORICAL_PRICE_LOOKBACK_DAYS);
        let closes = self.provider.matrix(start, end, symbols, PriceField::Close)?;
        closes
            .latest_row()
            .ok_or_else(|| VolaError::unavailable(symbols.join(","), format!("no close between {start} and {end}")))
    }

    fn live_prices(&self, allocation: &WeightAllocation, investment: f64) -> Result<Vec<f64>> {
        let quotes = self
            .quotes
            .ok_or_else(|| VolaError::PriceRetrievalFailure("no quote source configured".to_string()))?;

        let needed: Vec<String> = allocation
            .iter()
            .filter(|(_, w)| w * investment >= MIN_SHARE_PRICE)
            .map(|(s, _)| s.to_string())
            .collect();
        let quoted = quotes
            .latest_quotes(&needed)
            .map_err(|e| VolaError::PriceRetrievalFailure(e.to_string()))?;
        if quoted.len() != needed.len() {
            return Err(VolaError::PriceRetrievalFailure(format!(
                "requested {} quotes, received {}",
                needed.len(),
                quoted.len()
            )));
        }
        if let Some((symbol, price)) = needed.iter().zip(&quoted).find(|(_, p)| !(**p > 0.0) || !p.is_finite()) {
            return Err(VolaError::PriceRetrievalFailure(format!("invalid quote {price} for {symbol}")));
        }

        let placeholder = investment * PLACEHOLDER_PRICE_MULTIPLIER;
        let mut quoted = needed.iter().zip(quoted);
        let mut next = quoted.next();
        let prices = allocation
            .symbols()
            .iter()
            .map(|symbol| match next {
                Some((wanted, price)) if wanted == symbol => {
                    next = quoted.next();
                    price
                }
                _ => placeholder,
            })
            .collect();
        Ok(prices)
    }
}

/// `round_half_even(amount / price)`, zero for unusable prices
fn whole_shares(amount: f64, price: f64) -> u64 {
    if !(price > 0.0) || !price.is_finite() {
        return 0;
    }
    let shares = (amount / price).round_ties_even();
    if shares > 0.0 { shares as u64 } else { 0 }
}

/// Minimize over `[start, end]` and buy the result at `end` prices
pub fn calculate_portfolio_with_investment<S: MarketDataSource>(
    materializer: &AllocationMaterializer<'_, '_, S>,
    start: NaiveDate,
    end: NaiveDate,
    min_spread: u32,
    symbols: &[String],
    investment: f64,
    live: bool,
) -> Result<ShareAllocation> {
    let changes = materializer.provider.matrix(start, end, symbols, PriceField::Change)?;
    let portfolio = minimize_matrix(&changes, min_spread)?;
    materializer.materialize(end, &portfolio.allocation, investment, live, Some(&changes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::source::MarketSnapshot;
    use crate::market_data::types::PricePoint;
    use rust_decimal::dec;
    use std::sync::Mutex;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2016, 3, d).unwrap()
    }

    fn add(snapshot: &mut MarketSnapshot, symbol: &str, days: &[u32], close: f64, change: f64) {
        for d in days {
            snapshot.insert(PricePoint { symbol: symbol.to_string(), date: day(*d), close_price: close, pct_change: change });
        }
    }

    fn syms(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn fixture() -> MarketSnapshot {
        let mut snapshot = MarketSnapshot::new();
        add(&mut snapshot, "KO", &[10, 11, 14, 15], 42.0, 0.5);
        add(&mut snapshot, "A", &[10, 11, 14, 15], 40.0, 0.5);
        add(&mut snapshot, "ACE", &[10, 11, 14, 15], 100.0, 0.5);
        add(&mut snapshot, "CB", &[10, 11, 14, 15], 60.0, 0.5);
        snapshot
    }

    struct FixedQuotes {
        prices: Vec<f64>,
        requested: Mutex<Vec<String>>,
    }

    impl QuoteSource for FixedQuotes {
        fn latest_quotes(&self, symbols: &[String]) -> Result<Vec<f64>> {
            self.requested.lock().unwrap().extend(symbols.iter().cloned());
            Ok(self.prices.clone())
        }
    }

    #[test]
    fn fixture_portfolio_has_shares_and_zero_volatility() {
        let snapshot = fixture();
        let provider = MarketMatrixProvider::new(&snapshot, "KO");
        let materializer = AllocationMaterializer::new(&provider);

        let result = calculate_portfolio_with_investment(
            &materializer,
            day(13),
            day(15),
            1,
            &syms(&["A", "ACE", "CB"]),
            10_000.0,
            false,
        )
        .unwrap();

        assert!(!result.is_empty());
        assert_eq!(result.symbols.len(), result.shares.len());
        assert_eq!(result.prices.len(), result.shares.len());
        assert!(result.shares.iter().all(|s| *s > 0));
        assert_eq!(result.volatility, Some(dec!(0.00)));
        assert!(result.price_warning.is_none());
    }

    #[test]
    fn tiny_weights_round_to_no_shares() {
        let snapshot = fixture();
        let provider = MarketMatrixProvider::new(&snapshot, "KO");
        let allocation = WeightAllocation::new(syms(&["A", "ACE"]), vec![0.9995, 0.0005]).unwrap();

        let result = AllocationMaterializer::new(&provider).materialize(day(15), &allocation, 1_000.0, false, None).unwrap();
        assert_eq!(result.symbols, syms(&["A"]));
        // 999.5 / 40 = 24.9875
        assert_eq!(result.shares, vec![25]);
        assert_eq!(result.invested_fixed().unwrap(), dec!(1000.00));
        assert!(result.volatility.is_none());
    }

    #[test]
    fn shares_round_half_to_even() {
        assert_eq!(whole_shares(50.0, 20.0), 2);
        assert_eq!(whole_shares(70.0, 20.0), 4);
        assert_eq!(whole_shares(10.0, 0.0), 0);
    }

    #[test]
    fn live_quotes_only_for_meaningful_positions() {
        let snapshot = fixture();
        let provider = MarketMatrixProvider::new(&snapshot, "KO");
        let quotes = FixedQuotes { prices: vec![50.0], requested: Mutex::new(Vec::new()) };
        let allocation = WeightAllocation::new(syms(&["A", "CB"]), vec![0.9999, 0.0001]).unwrap();

        let result = AllocationMaterializer::new(&provider)
            .with_quotes(&quotes)
            .materialize(day(15), &allocation, 5_000.0, true, None)
            .unwrap();

        // CB is worth 0.5 and is priced at the placeholder
        assert_eq!(*quotes.requested.lock().unwrap(), syms(&["A"]));
        assert_eq!(result.symbols, syms(&["A"]));
        assert_eq!(result.prices, vec![50.0]);
        assert!(result.price_warning.is_none());
    }

    #[test]
    fn bad_quote_falls_back_to_history_with_warning() {
        let snapshot = fixture();
        let provider = MarketMatrixProvider::new(&snapshot, "KO");
        let quotes = FixedQuotes { prices: vec![50.0, -1.0], requested: Mutex::new(Vec::new()) };
        let allocation = WeightAllocation::new(syms(&["A", "CB"]), vec![0.5, 0.5]).unwrap();

        let result = AllocationMaterializer::new(&provider)
            .with_quotes(&quotes)
            .materialize(day(15), &allocation, 12_000.0, true, None)
            .unwrap();

        assert!(matches!(result.price_warning, Some(VolaError::PriceRetrievalFailure(_))));
        assert_eq!(result.prices, vec![40.0, 60.0]);
        assert_eq!(result.shares, vec![150, 100]);
        let lines = result.line_items().unwrap();
        assert_eq!(lines[1].amount, dec!(6000.00));
    }
}
