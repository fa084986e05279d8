use std::fmt::Display;
use tracing::{info, warn};

/// Outcome of a batch that must not abort on a single failure
#[derive(Debug)]
pub struct BatchReport<T> {
    pub succeeded: Vec<(String, T)>,
    pub skipped: Vec<(String, String)>, // (item, reason)
}

impl<T> Default for BatchReport<T> {
    fn default() -> Self {
        Self { succeeded: Vec::new(), skipped: Vec::new() }
    }
}

impl<T> BatchReport<T> {
    /// Aggregate tagged worker results once every worker has finished
    pub fn from_results<I, E>(results: I) -> Self
    where
        I: IntoIterator<Item = (String, Result<T, E>)>,
        E: Display,
    {
        let mut report = Self::default();
        for (item, result) in results {
            match result {
                Ok(value) => report.succeeded.push((item, value)),
                Err(e) => report.skipped.push((item, e.to_string())),
            }
        }
        report
    }

    pub fn skip(&mut self, item: impl Into<String>, reason: impl Into<String>) {
        self.skipped.push((item.into(), reason.into()));
    }

    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty()
    }

    pub fn skipped_items(&self) -> Vec<&str> {
        self.skipped.iter().map(|(item, _)| item.as_str()).collect()
    }

    pub fn log_summary(&self, operation: &str) {
        if self.is_clean() {
            info!(operation, succeeded = self.succeeded.len(), "Batch completed");
        } else {
            warn!(
                operation,
                succeeded = self.succeeded.len(),
                skipped = self.skipped.len(),
                skipped_items = ?self.skipped_items(),
                "Batch completed with skipped items"
            );
        }
    }
}
