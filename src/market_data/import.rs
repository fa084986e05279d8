use chrono::NaiveDate;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, instrument};

use super::fetcher::FetchRequest;
use super::types::PricePoint;
use crate::errors::{Result, VolaError};

const MEMBERSHIP_PREFIX: &str = "index_";
const MEMBERSHIP_SUFFIX: &str = ".txt";

/// Daily closes exported as one `<symbol>.csv` per symbol (`date,close`
/// lines, optional header) and index constituents as `index_<year>.txt`
/// (one symbol per line).
#[derive(Debug, Clone)]
pub struct CsvHistoryDirectory {
    root: PathBuf,
}

impl CsvHistoryDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Rows for `request`, with daily % change chained from
    /// `previous_close`. Without a previous close the first row in range
    /// only serves as the reference and is not returned.
    #[instrument(skip(self, request), fields(symbol = %request.symbol))]
    pub async fn read_history(&self, request: &FetchRequest, previous_close: Option<f64>) -> Result<Vec<PricePoint>> {
        let path = self.root.join(format!("{}.csv", request.symbol));
        let raw = fs::read_to_string(&path)
            .await
            .map_err(|e| VolaError::unavailable(request.symbol.as_str(), format!("{}: {e}", path.display())))?;

        let mut closes = parse_closes(&request.symbol, &raw)?;
        closes.retain(|(date, _)| *date >= request.start && *date <= request.end);
        closes.sort_by_key(|(date, _)| *date);
        closes.dedup_by_key(|(date, _)| *date);

        let points = with_changes(&request.symbol, previous_close, &closes);
        debug!(rows = points.len(), "Read price history");
        Ok(points)
    }

    /// Every `index_<year>.txt` in the directory, by ascending year
    pub async fn read_memberships(&self) -> Result<Vec<(i32, Vec<String>)>> {
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| VolaError::unavailable("index", format!("{}: {e}", self.root.display())))?;

        let mut memberships = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| VolaError::unavailable("index", format!("{}: {e}", self.root.display())))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(year) = membership_year(&name) else { continue };
            let raw = fs::read_to_string(entry.path())
                .await
                .map_err(|e| VolaError::unavailable("index", format!("{name}: {e}")))?;
            let symbols: Vec<String> =
                raw.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_string).collect();
            memberships.push((year, symbols));
        }
        memberships.sort_by_key(|(year, _)| *year);
        Ok(memberships)
    }
}

fn membership_year(file_name: &str) -> Option<i32> {
    file_name.strip_prefix(MEMBERSHIP_PREFIX)?.strip_suffix(MEMBERSHIP_SUFFIX)?.parse().ok()
}

fn parse_closes(symbol: &str, raw: &str) -> Result<Vec<(NaiveDate, f64)>> {
    let mut closes = Vec::new();
    for (n, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || (n == 0 && line.to_ascii_lowercase().starts_with("date")) {
            continue;
        }
        let mut fields = line.split(',').map(str::trim);
        let (Some(date), Some(close)) = (fields.next(), fields.next()) else {
            return Err(VolaError::inconsistent(symbol, format!("line {}: expected date,close", n + 1)));
        };
        let date = NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .map_err(|e| VolaError::inconsistent(symbol, format!("line {}: {e}", n + 1)))?;
        let close: f64 = close
            .parse()
            .map_err(|e| VolaError::inconsistent(symbol, format!("line {}: {e}", n + 1)))?;
        if !close.is_finite() || close < 0.0 {
            return Err(VolaError::inconsistent(symbol, format!("line {}: invalid close {close}", n + 1)));
        }
        closes.push((date, close));
    }
    Ok(closes)
}

/// Percent change against the previous close; a zero previous close yields
/// the close itself
fn with_changes(symbol: &str, previous_close: Option<f64>, closes: &[(NaiveDate, f64)]) -> Vec<PricePoint> {
    let (mut previous, rows) = match previous_close {
        Some(close) => (close, closes),
        None => match closes.split_first() {
            Some(((_, first), rest)) => (*first, rest),
            None => return Vec::new(),
        },
    };

    let mut points = Vec::with_capacity(rows.len());
    for (date, close) in rows {
        let pct_change = if previous == 0.0 { *close } else { (close - previous) * 100.0 / previous };
        points.push(PricePoint { symbol: symbol.to_string(), date: *date, close_price: *close, pct_change });
        previous = *close;
    }
    points
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2016, 3, d).unwrap()
    }

    async fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("minvol_import_{name}_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir).await;
        fs::create_dir_all(&dir).await.unwrap();
        dir
    }

    #[test]
    fn changes_chain_from_previous_close() {
        let closes = [(day(14), 110.0), (day(15), 99.0)];
        let points = with_changes("KO", Some(100.0), &closes);
        assert_eq!(points.len(), 2);
        assert_abs_diff_eq!(points[0].pct_change, 10.0, epsilon = 1e-12);
        assert_abs_diff_eq!(points[1].pct_change, -10.0, epsilon = 1e-12);

        // New symbol: the first close is only the reference
        let points = with_changes("KO", None, &closes);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].date, day(15));

        let points = with_changes("KO", Some(0.0), &closes[..1]);
        assert_eq!(points[0].pct_change, 110.0);
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert_eq!(parse_closes("KO", "Date,Close\n2016-03-14,41.5\n").unwrap(), vec![(day(14), 41.5)]);
        assert!(matches!(
            parse_closes("KO", "2016-03-14\n").unwrap_err(),
            VolaError::DataInconsistency { .. }
        ));
        assert!(parse_closes("KO", "14/03/2016,41.5\n").is_err());
        assert!(parse_closes("KO", "2016-03-14,-1\n").is_err());
    }

    #[tokio::test]
    async fn reads_histories_and_memberships() {
        let dir = scratch_dir("read").await;
        fs::write(dir.join("KO.csv"), "date,close\n2016-03-15,42\n2016-03-11,40\n2016-03-14,41\n").await.unwrap();
        fs::write(dir.join("index_2016.txt"), "KO\nAAPL\n\n").await.unwrap();
        fs::write(dir.join("index_2015.txt"), "KO\n").await.unwrap();
        fs::write(dir.join("notes.txt"), "ignored").await.unwrap();
        let source = CsvHistoryDirectory::new(&dir);

        let request = FetchRequest { symbol: "KO".to_string(), start: day(12), end: day(31) };
        let rows = source.read_history(&request, Some(40.0)).await.unwrap();
        assert_eq!(rows.iter().map(|r| r.date).collect::<Vec<_>>(), vec![day(14), day(15)]);
        assert_abs_diff_eq!(rows[0].pct_change, 2.5, epsilon = 1e-12);

        let missing = FetchRequest { symbol: "XYZ".to_string(), ..request };
        assert!(matches!(
            source.read_history(&missing, None).await.unwrap_err(),
            VolaError::DataUnavailable { .. }
        ));

        let memberships = source.read_memberships().await.unwrap();
        assert_eq!(memberships, vec![(2015, vec!["KO".to_string()]), (2016, vec!["KO".to_string(), "AAPL".to_string()])]);

        fs::remove_dir_all(&dir).await.unwrap();
    }
}
