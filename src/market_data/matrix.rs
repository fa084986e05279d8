use chrono::NaiveDate;
use ndarray::Array2;
use std::collections::BTreeSet;
use tracing::{debug, warn};

use super::source::MarketDataSource;
use super::types::{MarketMatrix, PriceField, PricePoint};
use super::universe::MAX_REPAIRABLE_GAP;
use crate::errors::{Result, VolaError};
use crate::stats_utils::mode;

/// Builds aligned date-by-symbol matrices from a `MarketDataSource`,
/// repairing calendar gaps between symbols.
#[derive(Debug, Clone)]
pub struct MarketMatrixProvider<'a, S: MarketDataSource> {
    source: &'a S,
    reference_symbol: String,
}

impl<'a, S: MarketDataSource> MarketMatrixProvider<'a, S> {
    /// `reference_symbol` must trade on every exchange day of the history
    pub fn new(source: &'a S, reference_symbol: impl Into<String>) -> Self {
        Self { source, reference_symbol: reference_symbol.into() }
    }

    pub fn source(&self) -> &'a S {
        self.source
    }

    pub fn reference_symbol(&self) -> &str {
        &self.reference_symbol
    }

    /// Trading calendar of the reference symbol inside `[start, end]`
    pub fn valid_dates(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<NaiveDate>> {
        Ok(self
            .source
            .price_series(&self.reference_symbol, start, end)?
            .into_iter()
            .map(|p| p.date)
            .collect())
    }

    /// T×N matrix of `field` for `symbols` over `[start, end]`.
    ///
    /// Rows are dates (ascending), columns are symbols (ascending). When the
    /// symbols do not share one calendar, every date in the symmetric
    /// difference between a symbol's dates and the consensus calendar is
    /// dropped for all symbols. A symbol sharing no date at all with the
    /// consensus calendar cannot be repaired and fails the call.
    pub fn matrix(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        symbols: &[String],
        field: PriceField,
    ) -> Result<MarketMatrix> {
        let symbols: Vec<String> = symbols.iter().cloned().collect::<BTreeSet<_>>().into_iter().collect();
        if symbols.is_empty() {
            return Err(VolaError::InvalidInput("matrix requested for an empty symbol list".to_string()));
        }

        let mut series = symbols
            .iter()
            .map(|s| self.source.price_series(s, start, end))
            .collect::<Result<Vec<Vec<PricePoint>>>>()?;

        let date_sets: Vec<BTreeSet<NaiveDate>> =
            series.iter().map(|rows| rows.iter().map(|p| p.date).collect()).collect();
        let raw_rows: usize = series.iter().map(Vec::len).sum();

        if date_sets.windows(2).any(|pair| pair[0] != pair[1]) {
            let consensus = self.consensus_dates(start, end, &date_sets);
            let excluded = dates_to_exclude(&symbols, &date_sets, &consensus)?;
            warn!(
                start = %start,
                end = %end,
                raw_rows,
                num_symbols = symbols.len(),
                excluded_dates = excluded.len(),
                "Inconsistent trading calendars, excluding offending dates"
            );
            for rows in series.iter_mut() {
                rows.retain(|p| !excluded.contains(&p.date));
            }
        }

        build_matrix(symbols, series, field)
    }

    /// Reference calendar if available, else the most common date set
    fn consensus_dates(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        date_sets: &[BTreeSet<NaiveDate>],
    ) -> BTreeSet<NaiveDate> {
        match self.valid_dates(start, end) {
            Ok(dates) => dates.into_iter().collect(),
            Err(e) => {
                debug!(err = %e, "Reference calendar unavailable, using modal date set");
                mode(date_sets.iter().cloned()).unwrap_or_default()
            }
        }
    }
}

/// Union of every symbol's symmetric difference against `consensus`.
/// A symbol missing more than `MAX_REPAIRABLE_GAP` consensus dates and
/// trading on no other day cannot be repaired.
fn dates_to_exclude(
    symbols: &[String],
    date_sets: &[BTreeSet<NaiveDate>],
    consensus: &BTreeSet<NaiveDate>,
) -> Result<BTreeSet<NaiveDate>> {
    let mut excluded = BTreeSet::new();
    for (symbol, dates) in symbols.iter().zip(date_sets) {
        if dates == consensus {
            continue;
        }
        if dates.is_disjoint(consensus) {
            // Usually a merger or ticker change; needs a manual remap
            return Err(VolaError::inconsistent(
                symbol.as_str(),
                "trading dates are disjoint from the consensus calendar",
            ));
        }
        if dates.is_subset(consensus) {
            // Only missing dates: ceased or suspended while the rest traded on
            let missing = consensus.len() - dates.len();
            if missing > MAX_REPAIRABLE_GAP {
                return Err(VolaError::inconsistent(
                    symbol.as_str(),
                    format!("missing {missing} consensus dates, last traded {:?}", dates.last()),
                ));
            }
            warn!(symbol = %symbol, missing, "Symbol lacks consensus dates, excluding them for every symbol");
        }
        let offending: Vec<NaiveDate> = dates.symmetric_difference(consensus).copied().collect();
        debug!(symbol = %symbol, offending = offending.len(), "Symbol calendar differs from consensus");
        excluded.extend(offending);
    }
    Ok(excluded)
}

fn build_matrix(symbols: Vec<String>, series: Vec<Vec<PricePoint>>, field: PriceField) -> Result<MarketMatrix> {
    let num_symbols = symbols.len();
    let num_rows: usize = series.iter().map(Vec::len).sum();
    let dates: Vec<NaiveDate> = series[0].iter().map(|p| p.date).collect();
    let num_dates = dates.len();

    if num_dates == 0 {
        return Err(VolaError::inconsistent(symbols.join(","), "no common trading dates left in window"));
    }
    if num_rows != num_dates * num_symbols {
        return Err(VolaError::inconsistent(
            symbols.join(","),
            format!("{num_rows} rows cannot form a {num_dates}x{num_symbols} matrix"),
        ));
    }
    if let Some((symbol, _)) = symbols
        .iter()
        .zip(&series)
        .find(|(_, rows)| rows.iter().map(|p| p.date).ne(dates.iter().copied()))
    {
        return Err(VolaError::inconsistent(symbol.as_str(), "calendar still differs after repair"));
    }

    let mut values = Vec::with_capacity(num_rows);
    for t in 0..num_dates {
        for rows in &series {
            values.push(field.extract(&rows[t]) as f32);
        }
    }
    let values = Array2::from_shape_vec((num_dates, num_symbols), values)
        .map_err(|e| VolaError::inconsistent(symbols.join(","), e.to_string()))?;

    Ok(MarketMatrix { dates, symbols, values })
}
