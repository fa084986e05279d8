use chrono::{Duration, NaiveDate};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use tracing::{debug, info, instrument};

use super::import::CsvHistoryDirectory;
use super::source::MarketSnapshot;
use super::types::PricePoint;
use crate::batch::BatchReport;
use crate::errors::Result;

/// Symbols with no stored row newer than this are treated as ceased
pub const STALE_AFTER_DAYS: i64 = 360;

/// One history request for the fetch pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub symbol: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Work out which symbols need new history up to `yesterday`.
///
/// Symbols never loaded are requested from `new_since` when given, and
/// skipped otherwise. Up-to-date symbols and symbols whose last row is
/// older than the stale cutoff are skipped and reported.
pub fn plan_updates(
    snapshot: &MarketSnapshot,
    symbols: &[String],
    new_since: Option<NaiveDate>,
    yesterday: NaiveDate,
) -> (Vec<FetchRequest>, BatchReport<()>) {
    let stale_cutoff = yesterday - Duration::days(STALE_AFTER_DAYS);
    let mut requests = Vec::new();
    let mut report = BatchReport::default();

    for symbol in symbols {
        match snapshot.last_date(symbol) {
            None => match new_since {
                Some(start) if start <= yesterday => {
                    requests.push(FetchRequest { symbol: symbol.clone(), start, end: yesterday })
                }
                _ => report.skip(symbol.as_str(), "no stored history"),
            },
            Some(last) if last >= yesterday => report.skip(symbol.as_str(), "already up to date"),
            Some(last) if last < stale_cutoff => report.skip(symbol.as_str(), format!("stale since {last}")),
            Some(last) => requests.push(FetchRequest {
                symbol: symbol.clone(),
                start: last + Duration::days(1),
                end: yesterday,
            }),
        }
    }
    (requests, report)
}

/// Run `fetch` for every request with up to `concurrency` in flight.
///
/// Network latency dominates, so `concurrency` is normally far above the
/// core count. A failed symbol lands in the report's skip list.
#[instrument(skip_all, fields(on_close = true, requests = requests.len(), concurrency = concurrency))]
pub async fn fetch_price_histories<F, Fut>(
    requests: Vec<FetchRequest>,
    concurrency: usize,
    fetch: F,
) -> BatchReport<Vec<PricePoint>>
where
    F: Fn(FetchRequest) -> Fut,
    Fut: Future<Output = Result<Vec<PricePoint>>>,
{
    let results: Vec<(String, Result<Vec<PricePoint>>)> = stream::iter(requests)
        .map(|request| {
            let symbol = request.symbol.clone();
            let pending = fetch(request);
            async move { (symbol, pending.await) }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut report = BatchReport::from_results(results);
    report.succeeded.sort_by(|a, b| a.0.cmp(&b.0));
    debug!(fetched = report.succeeded.len(), skipped = report.skipped.len(), "Price histories fetched");
    report
}

/// Merge fetched rows into a snapshot, returning the number of rows added
pub fn apply_to_snapshot(snapshot: &mut MarketSnapshot, report: &BatchReport<Vec<PricePoint>>) -> usize {
    let mut inserted = 0;
    for (_, rows) in &report.succeeded {
        inserted += rows.len();
        snapshot.extend(rows.iter().cloned());
    }
    inserted
}

/// Bring `snapshot` up to `yesterday` from a CSV export directory.
///
/// Returns the fetched rows (to persist) and the symbols skipped while
/// planning.
#[instrument(skip_all, fields(on_close = true, symbols = symbols.len(), root = %source.root().display()))]
pub async fn refresh_snapshot(
    snapshot: &mut MarketSnapshot,
    source: &CsvHistoryDirectory,
    symbols: &[String],
    new_since: NaiveDate,
    yesterday: NaiveDate,
    concurrency: usize,
) -> (BatchReport<Vec<PricePoint>>, BatchReport<()>) {
    let (requests, planned) = plan_updates(snapshot, symbols, Some(new_since), yesterday);
    let previous: HashMap<String, f64> = requests
        .iter()
        .filter_map(|r| snapshot.last_close(&r.symbol).map(|close| (r.symbol.clone(), close)))
        .collect();

    let fetched = fetch_price_histories(requests, concurrency, |request| {
        let source = source.clone();
        let previous_close = previous.get(&request.symbol).copied();
        async move { source.read_history(&request, previous_close).await }
    })
    .await;

    let inserted = apply_to_snapshot(snapshot, &fetched);
    info!(inserted, fetched = fetched.succeeded.len(), skipped = planned.skipped.len() + fetched.skipped.len(), "Snapshot refreshed");
    (fetched, planned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::VolaError;
    use crate::market_data::source::MarketDataSource;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2016, 3, d).unwrap()
    }

    fn snapshot() -> MarketSnapshot {
        let mut snapshot = MarketSnapshot::new();
        for (symbol, date) in [("KO", day(10)), ("AAA", day(15)), ("OLD", NaiveDate::from_ymd_opt(2014, 1, 2).unwrap())] {
            snapshot.insert(PricePoint { symbol: symbol.to_string(), date, close_price: 1.0, pct_change: 0.0 });
        }
        snapshot
    }

    #[test]
    fn plan_skips_current_stale_and_unknown() {
        let symbols: Vec<String> = ["AAA", "KO", "NEW", "OLD"].iter().map(|s| s.to_string()).collect();
        let (requests, report) = plan_updates(&snapshot(), &symbols, None, day(15));

        assert_eq!(requests, vec![FetchRequest { symbol: "KO".to_string(), start: day(11), end: day(15) }]);
        assert_eq!(report.skipped_items(), vec!["AAA", "NEW", "OLD"]);
    }

    #[test]
    fn new_symbols_are_requested_from_the_history_start() {
        let symbols: Vec<String> = ["KO", "NEW"].iter().map(|s| s.to_string()).collect();
        let (requests, report) = plan_updates(&snapshot(), &symbols, Some(day(1)), day(15));

        assert_eq!(requests[1], FetchRequest { symbol: "NEW".to_string(), start: day(1), end: day(15) });
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn refresh_reads_only_the_missing_rows() {
        let dir = std::env::temp_dir().join(format!("minvol_refresh_{}", std::process::id()));
        let _ = tokio::fs::remove_dir_all(&dir).await;
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("KO.csv"), "date,close\n2016-03-10,1.0\n2016-03-11,1.1\n2016-03-14,1.21\n")
            .await
            .unwrap();
        tokio::fs::write(dir.join("NEW.csv"), "2016-03-09,10\n2016-03-10,12\n").await.unwrap();

        let mut snap = snapshot();
        let symbols: Vec<String> = ["KO", "NEW", "GONE"].iter().map(|s| s.to_string()).collect();
        let source = CsvHistoryDirectory::new(&dir);
        let (fetched, planned) = refresh_snapshot(&mut snap, &source, &symbols, day(1), day(15), 4).await;

        assert!(planned.is_clean());
        assert_eq!(fetched.skipped_items(), vec!["GONE"]);
        let (_, ko) = fetched.succeeded.iter().find(|(s, _)| s == "KO").unwrap();
        assert_eq!(ko.iter().map(|p| p.date).collect::<Vec<_>>(), vec![day(11), day(14)]);
        assert!(ko.iter().all(|p| (p.pct_change - 10.0).abs() < 1e-9));
        assert_eq!(snap.last_date("KO"), Some(day(14)));
        // The first row of a new symbol is only the reference close
        assert_eq!(snap.last_date("NEW"), Some(day(10)));
        assert_eq!(snap.price_series("NEW", day(1), day(15)).unwrap().len(), 1);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn one_failed_symbol_does_not_abort_the_batch() {
        let requests = vec![
            FetchRequest { symbol: "KO".to_string(), start: day(11), end: day(11) },
            FetchRequest { symbol: "BAD".to_string(), start: day(11), end: day(11) },
        ];
        let report = fetch_price_histories(requests, 8, |request| async move {
            if request.symbol == "BAD" {
                return Err(VolaError::unavailable(request.symbol, "http 404"));
            }
            Ok(vec![PricePoint { symbol: request.symbol, date: request.start, close_price: 2.0, pct_change: 1.0 }])
        })
        .await;

        assert_eq!(report.succeeded.len(), 1);
        assert_eq!(report.skipped_items(), vec!["BAD"]);

        let mut snap = snapshot();
        assert_eq!(apply_to_snapshot(&mut snap, &report), 1);
        assert_eq!(snap.last_date("KO"), Some(day(11)));
    }
}
