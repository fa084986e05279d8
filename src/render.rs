use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt::Write;

use crate::errors::{Result, VolaError};

/// One named line on a chart; None where the line has no value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledSeries {
    pub label: String,
    pub values: Vec<Option<f64>>,
}

impl LabeledSeries {
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into(), values: Vec::new() }
    }
}

/// Dates plus every series drawn against them
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChartData {
    pub dates: Vec<NaiveDate>,
    pub series: Vec<LabeledSeries>,
}

impl ChartData {
    /// Every series must have one value per date
    pub fn validate(&self) -> Result<()> {
        for series in &self.series {
            if series.values.len() != self.dates.len() {
                return Err(VolaError::InvalidInput(format!(
                    "series {} has {} values for {} dates",
                    series.label,
                    series.values.len(),
                    self.dates.len()
                )));
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Turns chart data into a presentable artifact
pub trait Renderer {
    type Artifact;

    fn render(&self, chart: &ChartData) -> Result<Self::Artifact>;
}

/// `date,label1,label2,...` with blank cells for missing values
#[derive(Debug, Clone, Copy)]
pub struct CsvRenderer {
    precision: usize,
}

impl Default for CsvRenderer {
    fn default() -> Self {
        Self { precision: 2 }
    }
}

impl CsvRenderer {
    pub fn with_precision(precision: usize) -> Self {
        Self { precision }
    }
}

impl Renderer for CsvRenderer {
    type Artifact = String;

    fn render(&self, chart: &ChartData) -> Result<String> {
        chart.validate()?;

        let mut out = String::from("date");
        for series in &chart.series {
            out.push(',');
            out.push_str(&series.label);
        }
        out.push('\n');

        for (row, date) in chart.dates.iter().enumerate() {
            out.push_str(&date.to_string());
            for series in &chart.series {
                out.push(',');
                if let Some(value) = series.values[row] {
                    // Writing to a String cannot fail
                    let _ = write!(out, "{:.*}", self.precision, value);
                }
            }
            out.push('\n');
        }
        Ok(out)
    }
}
