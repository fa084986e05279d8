use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet};

use super::types::PricePoint;
use crate::errors::{Result, VolaError};

/// Read access to stored daily history and index constituents.
///
/// Implementations must be shareable across rayon workers; the core never
/// mutates a source.
pub trait MarketDataSource: Sync {
    /// Ordered (ascending date) rows for `symbol` inside `[start, end]`.
    /// Fails with `DataUnavailable` when no rows exist in range.
    fn price_series(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<PricePoint>>;

    /// Constituents of the tracked index on January 1st of `year`.
    fn index_membership(&self, year: i32) -> Result<BTreeSet<String>>;

    /// Earliest stored date for `symbol`, if any
    fn first_date(&self, symbol: &str) -> Option<NaiveDate>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct DailyBar {
    close_price: f64,
    pct_change: f64,
}

/// Immutable in-memory copy of the market data a computation needs.
///
/// Loaded once (from Postgres or fixtures) and then shared read-only by every
/// worker.
#[derive(Debug, Clone, Default)]
pub struct MarketSnapshot {
    series: BTreeMap<String, BTreeMap<NaiveDate, DailyBar>>,
    memberships: BTreeMap<i32, BTreeSet<String>>,
}

impl MarketSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the (symbol, date) row
    pub fn insert(&mut self, point: PricePoint) {
        self.series
            .entry(point.symbol)
            .or_default()
            .insert(point.date, DailyBar { close_price: point.close_price, pct_change: point.pct_change });
    }

    pub fn extend<I: IntoIterator<Item = PricePoint>>(&mut self, points: I) {
        for point in points {
            self.insert(point);
        }
    }

    pub fn set_membership<I, S>(&mut self, year: i32, symbols: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.memberships.insert(year, symbols.into_iter().map(Into::into).collect());
    }

    pub fn num_symbols(&self) -> usize {
        self.series.len()
    }

    pub fn num_rows(&self) -> usize {
        self.series.values().map(BTreeMap::len).sum()
    }

    /// Most recent stored date for `symbol`
    pub fn last_date(&self, symbol: &str) -> Option<NaiveDate> {
        self.series.get(symbol)?.keys().next_back().copied()
    }

    /// Close on the most recent stored date for `symbol`
    pub fn last_close(&self, symbol: &str) -> Option<f64> {
        self.series.get(symbol)?.values().next_back().map(|bar| bar.close_price)
    }

    /// Every symbol with stored history, plus every index member
    pub fn known_symbols(&self) -> BTreeSet<String> {
        let mut symbols: BTreeSet<String> = self.series.keys().cloned().collect();
        for members in self.memberships.values() {
            symbols.extend(members.iter().cloned());
        }
        symbols
    }
}

impl MarketDataSource for MarketSnapshot {
    fn price_series(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<PricePoint>> {
        let rows: Vec<PricePoint> = self
            .series
            .get(symbol)
            .map(|bars| {
                bars.range(start..=end)
                    .map(|(date, bar)| PricePoint {
                        symbol: symbol.to_string(),
                        date: *date,
                        close_price: bar.close_price,
                        pct_change: bar.pct_change,
                    })
                    .collect()
            })
            .unwrap_or_default();

        if rows.is_empty() {
            return Err(VolaError::unavailable(symbol, format!("no rows between {start} and {end}")));
        }
        Ok(rows)
    }

    fn index_membership(&self, year: i32) -> Result<BTreeSet<String>> {
        self.memberships
            .get(&year)
            .cloned()
            .ok_or_else(|| VolaError::unavailable("index", format!("no constituent list for {year}")))
    }

    fn first_date(&self, symbol: &str) -> Option<NaiveDate> {
        self.series.get(symbol)?.keys().next().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2016, 3, d).unwrap()
    }

    fn point(symbol: &str, d: u32, close: f64) -> PricePoint {
        PricePoint { symbol: symbol.to_string(), date: day(d), close_price: close, pct_change: 0.0 }
    }

    #[test]
    fn price_series_is_ordered_and_bounded() {
        let mut snapshot = MarketSnapshot::new();
        snapshot.extend([point("KO", 16, 3.0), point("KO", 14, 1.0), point("KO", 15, 2.0)]);

        let rows = snapshot.price_series("KO", day(14), day(15)).unwrap();
        assert_eq!(rows.iter().map(|r| r.date).collect::<Vec<_>>(), vec![day(14), day(15)]);
        assert_eq!(snapshot.first_date("KO"), Some(day(14)));
        assert_eq!(snapshot.last_date("KO"), Some(day(16)));
        assert_eq!(snapshot.last_close("KO"), Some(3.0));
        assert_eq!(snapshot.last_close("XYZ"), None);
    }

    #[test]
    fn known_symbols_include_members_without_history() {
        let mut snapshot = MarketSnapshot::new();
        snapshot.insert(point("KO", 14, 1.0));
        snapshot.set_membership(2016, ["AAPL", "KO"]);
        assert_eq!(snapshot.known_symbols().into_iter().collect::<Vec<_>>(), vec!["AAPL", "KO"]);
    }

    #[test]
    fn missing_rows_are_data_unavailable() {
        let mut snapshot = MarketSnapshot::new();
        snapshot.insert(point("KO", 14, 1.0));

        let err = snapshot.price_series("KO", day(20), day(25)).unwrap_err();
        assert!(matches!(err, VolaError::DataUnavailable { .. }));
        assert!(snapshot.price_series("XYZ", day(1), day(31)).is_err());
    }

    #[test]
    fn duplicate_rows_overwrite() {
        let mut snapshot = MarketSnapshot::new();
        snapshot.insert(point("KO", 14, 1.0));
        snapshot.insert(point("KO", 14, 5.0));
        assert_eq!(snapshot.num_rows(), 1);
        assert_eq!(snapshot.price_series("KO", day(14), day(14)).unwrap()[0].close_price, 5.0);
    }
}
