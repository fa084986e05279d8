use chrono::{Datelike, Duration, NaiveDate};
use rayon::prelude::*;
use std::collections::BTreeSet;
use tracing::{debug, info, instrument};

use super::matrix::MarketMatrixProvider;
use super::source::MarketDataSource;
use super::types::PriceField;
use crate::errors::{Result, VolaError};
use crate::stats_utils::{column_std, mode};

/// Largest calendar gap a symbol may have and still be kept by the strict
/// resolver (its missing dates are excluded instead)
pub const MAX_REPAIRABLE_GAP: usize = 3;

/// Lookback for the low-volatility ranking
pub const LOW_VOL_LOOKBACK_DAYS: i64 = 365;

/// How the minimization window's symbols are validated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniverseCheck {
    /// Modal trading-day count only
    Relaxed,
    /// Modal trading-date set, see `valid_symbols_strict`
    Strict,
}

/// Symbols sharing one trading calendar, plus the dates dropped to get there
#[derive(Debug, Clone, PartialEq)]
pub struct StrictUniverse {
    pub symbols: Vec<String>,
    pub excluded_dates: BTreeSet<NaiveDate>,
    pub calendar: Vec<NaiveDate>,
}

/// Derives consistent symbol sets for a period
pub struct SymbolUniverseResolver<'p, 'a, S: MarketDataSource> {
    provider: &'p MarketMatrixProvider<'a, S>,
}

impl<'p, 'a, S: MarketDataSource> SymbolUniverseResolver<'p, 'a, S> {
    pub fn new(provider: &'p MarketMatrixProvider<'a, S>) -> Self {
        Self { provider }
    }

    /// Members whose number of reference-calendar trading days in
    /// `[start, end]` equals the modal count. Fast, but two symbols with the
    /// same count can still differ on individual dates.
    pub fn valid_symbols(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        index_membership: &BTreeSet<String>,
    ) -> Result<Vec<String>> {
        let valid_dates: BTreeSet<NaiveDate> = self.provider.valid_dates(start, end)?.into_iter().collect();

        let counts: Vec<(String, usize)> = self
            .member_dates(start, end, index_membership)
            .into_iter()
            .map(|(symbol, dates)| {
                let count = dates.intersection(&valid_dates).count();
                (symbol, count)
            })
            .filter(|(_, count)| *count > 0)
            .collect();

        let Some(mode_count) = mode(counts.iter().map(|(_, c)| *c)) else {
            return Ok(Vec::new());
        };

        let symbols: Vec<String> = counts
            .into_iter()
            .filter(|(_, count)| *count == mode_count)
            .map(|(symbol, _)| symbol)
            .collect();
        debug!(start = %start, end = %end, mode_count, valid = symbols.len(), "Resolved valid symbols");
        Ok(symbols)
    }

    /// Symbols sharing the modal trading-date set exactly.
    ///
    /// A symbol with fewer dates that are all part of the modal set is kept
    /// when it lacks at most `MAX_REPAIRABLE_GAP` dates; those dates are
    /// excluded for the whole universe instead. Any other deviation drops the
    /// symbol. Slower than `valid_symbols`; use it wherever exclusion
    /// decisions feed data mutation.
    pub fn valid_symbols_strict(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        index_membership: &BTreeSet<String>,
    ) -> Result<StrictUniverse> {
        let members: Vec<(String, BTreeSet<NaiveDate>)> = self
            .member_dates(start, end, index_membership)
            .into_iter()
            .filter(|(_, dates)| !dates.is_empty())
            .collect();

        let Some(mode_count) = mode(members.iter().map(|(_, d)| d.len())) else {
            return Ok(StrictUniverse { symbols: Vec::new(), excluded_dates: BTreeSet::new(), calendar: Vec::new() });
        };
        let Some(mode_set) = mode(members.iter().filter(|(_, d)| d.len() == mode_count).map(|(_, d)| d.clone()))
        else {
            return Err(VolaError::inconsistent("universe", "no modal trading calendar"));
        };

        let mut symbols = Vec::new();
        let mut excluded_dates = BTreeSet::new();
        let mut dropped = Vec::new();
        for (symbol, dates) in members {
            if dates == mode_set {
                symbols.push(symbol);
                continue;
            }
            let gap = mode_set.len().saturating_sub(dates.len());
            if dates.len() < mode_count && dates.is_subset(&mode_set) && gap <= MAX_REPAIRABLE_GAP {
                excluded_dates.extend(mode_set.difference(&dates).copied());
                symbols.push(symbol);
            } else {
                dropped.push(symbol);
            }
        }

        if !dropped.is_empty() || !excluded_dates.is_empty() {
            info!(
                start = %start,
                end = %end,
                dropped = ?dropped,
                excluded_dates = excluded_dates.len(),
                "Strict universe repaired"
            );
        }

        let calendar = mode_set.difference(&excluded_dates).copied().collect();
        Ok(StrictUniverse { symbols, excluded_dates, calendar })
    }

    /// The `k` symbols with the lowest std of daily % change over the
    /// trailing year ending at `as_of`, least volatile first
    pub fn lowest_volatility_subset(&self, symbols: &[String], as_of: NaiveDate, k: usize) -> Result<Vec<String>> {
        if symbols.is_empty() {
            return Ok(Vec::new());
        }
        let start = as_of - Duration::days(LOW_VOL_LOOKBACK_DAYS);
        let changes = self.provider.matrix(start, as_of, symbols, PriceField::Change)?;
        let stds = column_std(changes.to_f64().view());

        let mut ranked: Vec<(f64, String)> = stds.iter().copied().zip(changes.symbols).collect();
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        Ok(ranked.into_iter().take(k).map(|(_, s)| s).collect())
    }

    /// Symbols fit for minimizing over `[start, end]` and then being scored
    /// over the year after `end`.
    ///
    /// Uses the index constituents of `end.year()`. Symbols that stop trading
    /// during the scoring year cannot be backtested and are excluded here.
    /// The scoring year is always checked with the relaxed rule.
    #[instrument(skip(self), fields(on_close = true))]
    pub fn backtest_symbols(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        low_vol_only: bool,
        low_vol_size: usize,
        check: UniverseCheck,
    ) -> Result<Vec<String>> {
        let membership = self.provider.source().index_membership(end.year())?;
        let minimization = match check {
            UniverseCheck::Relaxed => self.valid_symbols(start, end, &membership)?,
            UniverseCheck::Strict => self.valid_symbols_strict(start, end, &membership)?.symbols,
        };
        let scoring = self.valid_symbols(end, end + Duration::days(365), &membership)?;
        let scoring: BTreeSet<String> = scoring.into_iter().collect();

        let symbols: Vec<String> = minimization.into_iter().filter(|s| scoring.contains(s)).collect();
        if low_vol_only {
            return self.lowest_volatility_subset(&symbols, end, low_vol_size);
        }
        Ok(symbols)
    }

    /// Symbols valid over the trailing window only, for a live snapshot
    pub fn current_symbols(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        low_vol_only: bool,
        low_vol_size: usize,
    ) -> Result<Vec<String>> {
        let membership = self.provider.source().index_membership(end.year())?;
        let symbols = self.valid_symbols(start, end, &membership)?;
        if low_vol_only {
            return self.lowest_volatility_subset(&symbols, end, low_vol_size);
        }
        Ok(symbols)
    }

    /// Dates in `[start, end]` for every member, sorted by symbol.
    /// Members without data get an empty set.
    fn member_dates(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        index_membership: &BTreeSet<String>,
    ) -> Vec<(String, BTreeSet<NaiveDate>)> {
        let source = self.provider.source();
        index_membership
            .par_iter()
            .map(|symbol| {
                let dates = match source.price_series(symbol, start, end) {
                    Ok(rows) => rows.into_iter().map(|p| p.date).collect(),
                    Err(e) => {
                        debug!(symbol = %symbol, err = %e, "Skipping member without data");
                        BTreeSet::new()
                    }
                };
                (symbol.clone(), dates)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::source::MarketSnapshot;
    use crate::market_data::types::PricePoint;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2015, 6, d).unwrap()
    }

    fn add(snapshot: &mut MarketSnapshot, symbol: &str, days: &[u32], changes: &[f64]) {
        for (i, d) in days.iter().enumerate() {
            snapshot.insert(PricePoint {
                symbol: symbol.to_string(),
                date: day(*d),
                close_price: 10.0,
                pct_change: changes.get(i).copied().unwrap_or(0.0),
            });
        }
    }

    fn membership(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn fixture() -> MarketSnapshot {
        let mut snapshot = MarketSnapshot::new();
        let full = [1, 2, 3, 4, 5, 8, 9, 10];
        add(&mut snapshot, "KO", &full, &[]);
        add(&mut snapshot, "AAA", &full, &[]);
        add(&mut snapshot, "BBB", &full, &[]);
        add(&mut snapshot, "CCC", &[1, 2, 3, 4, 5, 8, 9], &[]); // one day short
        add(&mut snapshot, "DDD", &[1, 2, 3], &[]); // listed late / ceased
        add(&mut snapshot, "EEE", &[1, 2, 3, 4, 5, 6, 8, 9], &[]); // same count, other dates
        snapshot
    }

    #[test]
    fn relaxed_keeps_modal_count() {
        let snapshot = fixture();
        let provider = MarketMatrixProvider::new(&snapshot, "KO");
        let resolver = SymbolUniverseResolver::new(&provider);

        let members = membership(&["AAA", "BBB", "CCC", "DDD", "EEE", "ZZZ"]);
        let symbols = resolver.valid_symbols(day(1), day(30), &members).unwrap();
        // EEE's extra day 6 is not a reference day, so it counts 7 like CCC
        assert_eq!(symbols, vec!["AAA".to_string(), "BBB".to_string()]);
    }

    #[test]
    fn strict_repairs_small_gaps_and_drops_misfits() {
        let snapshot = fixture();
        let provider = MarketMatrixProvider::new(&snapshot, "KO");
        let resolver = SymbolUniverseResolver::new(&provider);

        let members = membership(&["AAA", "BBB", "CCC", "DDD", "EEE", "KO"]);
        let universe = resolver.valid_symbols_strict(day(1), day(30), &members).unwrap();
        assert_eq!(universe.symbols, vec!["AAA", "BBB", "CCC", "KO"]);
        assert_eq!(universe.excluded_dates, BTreeSet::from([day(10)]));
        assert_eq!(universe.calendar.len(), 7);
    }

    /// Fixture plus FFF, which also trades on the non-reference day 6.
    /// CCC has no row on day 10, the last day of the scoring window.
    fn backtest_fixture() -> MarketSnapshot {
        let mut snapshot = fixture();
        add(&mut snapshot, "FFF", &[1, 2, 3, 4, 5, 6, 8, 9, 10], &[]);
        snapshot.set_membership(2015, ["AAA", "BBB", "CCC", "FFF", "KO"]);
        snapshot
    }

    #[test]
    fn backtest_symbols_drop_what_stops_trading() {
        let snapshot = backtest_fixture();
        let provider = MarketMatrixProvider::new(&snapshot, "KO");
        let resolver = SymbolUniverseResolver::new(&provider);

        let symbols = resolver.backtest_symbols(day(1), day(9), false, 100, UniverseCheck::Relaxed).unwrap();
        assert_eq!(symbols, vec!["AAA", "BBB", "FFF", "KO"]);
    }

    #[test]
    fn strict_check_also_drops_off_calendar_symbols() {
        let snapshot = backtest_fixture();
        let provider = MarketMatrixProvider::new(&snapshot, "KO");
        let resolver = SymbolUniverseResolver::new(&provider);

        let symbols = resolver.backtest_symbols(day(1), day(9), false, 100, UniverseCheck::Strict).unwrap();
        assert_eq!(symbols, vec!["AAA", "BBB", "KO"]);
    }

    #[test]
    fn low_vol_subset_ranks_by_std() {
        let mut snapshot = MarketSnapshot::new();
        let days = [1, 2, 3, 4];
        add(&mut snapshot, "KO", &days, &[0.0, 0.0, 0.0, 0.0]);
        add(&mut snapshot, "WILD", &days, &[5.0, -5.0, 5.0, -5.0]);
        add(&mut snapshot, "CALM", &days, &[0.1, -0.1, 0.1, -0.1]);
        add(&mut snapshot, "FLAT", &days, &[1.0, 1.0, 1.0, 1.0]);
        let provider = MarketMatrixProvider::new(&snapshot, "KO");
        let resolver = SymbolUniverseResolver::new(&provider);

        let symbols: Vec<String> = ["WILD", "CALM", "FLAT"].iter().map(|s| s.to_string()).collect();
        let subset = resolver.lowest_volatility_subset(&symbols, day(4), 2).unwrap();
        assert_eq!(subset, vec!["FLAT", "CALM"]);
    }
}
