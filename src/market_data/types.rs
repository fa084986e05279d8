use chrono::NaiveDate;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// One daily observation for one symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub symbol: String,
    pub date: NaiveDate,
    pub close_price: f64,
    pub pct_change: f64, // Day-over-day % change of the adjusted close
}

/// Numeric column selected when building a matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceField {
    Close,
    Change,
}

impl PriceField {
    pub fn extract(self, point: &PricePoint) -> f64 {
        match self {
            PriceField::Close => point.close_price,
            PriceField::Change => point.pct_change,
        }
    }
}

/// Date-by-symbol matrix with its row and column labels
#[derive(Debug, Clone)]
pub struct MarketMatrix {
    pub dates: Vec<NaiveDate>,     // Rows, ascending
    pub symbols: Vec<String>,      // Columns, ascending
    pub values: Array2<f32>,
}

impl MarketMatrix {
    pub fn trading_days(&self) -> usize {
        self.values.nrows()
    }

    pub fn column_index(&self, symbol: &str) -> Option<usize> {
        self.symbols.binary_search_by(|s| s.as_str().cmp(symbol)).ok()
    }

    /// Matrix promoted to f64 for solver and simulation math
    pub fn to_f64(&self) -> Array2<f64> {
        self.values.mapv(f64::from)
    }

    /// Sub-matrix restricted to `symbols`, in the order given.
    /// Returns None if any symbol is not a column.
    pub fn select_columns(&self, symbols: &[String]) -> Option<Array2<f64>> {
        let indices = symbols
            .iter()
            .map(|s| self.column_index(s))
            .collect::<Option<Vec<usize>>>()?;
        Some(self.to_f64().select(ndarray::Axis(1), &indices))
    }

    /// Last row, i.e. the most recent observation of every symbol
    pub fn latest_row(&self) -> Option<Vec<f64>> {
        let last = self.values.nrows().checked_sub(1)?;
        Some(self.values.row(last).iter().map(|v| f64::from(*v)).collect())
    }
}
