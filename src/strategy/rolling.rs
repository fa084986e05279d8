use chrono::{Datelike, Duration, NaiveDate};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, instrument};

use super::context::StrategyContext;
use super::minimizer::calculate_portfolio;
use super::simulator::{SimulationOutput, StartValues};
use super::strategy_constants::{DAYS_PER_PERIOD_YEAR, SCORING_WINDOW_DAYS};
use super::types::{PastPortfolio, PerformanceStatistics, Portfolio, PortfolioKey, to_fixed};
use crate::batch::BatchReport;
use crate::errors::{Result, VolaError};
use crate::market_data::source::MarketDataSource;
use crate::market_data::universe::UniverseCheck;
use crate::render::{ChartData, LabeledSeries};

/// Month and day on which every past portfolio of a series is rebalanced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anniversary {
    month: u32,
    day: u32,
}

impl Anniversary {
    /// Feb 29 becomes Feb 28 so every year has the date
    pub fn new(month: u32, day: u32) -> Result<Self> {
        let anniversary = Self::normalized(month, day);
        NaiveDate::from_ymd_opt(2001, anniversary.month, anniversary.day)
            .ok_or_else(|| VolaError::InvalidInput(format!("invalid anniversary {month}-{day}")))?;
        Ok(anniversary)
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self::normalized(date.month(), date.day())
    }

    fn normalized(month: u32, day: u32) -> Self {
        if month == 2 && day == 29 { Self { month, day: 28 } } else { Self { month, day } }
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn day(&self) -> u32 {
        self.day
    }

    /// Day before the anniversary in `year`; minimization ends here
    pub fn anchor(&self, year: i32) -> Result<NaiveDate> {
        NaiveDate::from_ymd_opt(year, self.month, self.day)
            .map(|date| date - Duration::days(1))
            .ok_or_else(|| VolaError::InvalidInput(format!("no anniversary {}-{} in {year}", self.month, self.day)))
    }
}

/// `[end - period years, end]`
pub fn minimization_window(key: &PortfolioKey, end: NaiveDate) -> (NaiveDate, NaiveDate) {
    (end - Duration::days(DAYS_PER_PERIOD_YEAR * i64::from(key.period)), end)
}

/// Minimum-volatility allocation fixed at the `year` anniversary
pub fn compute_past_portfolio<S: MarketDataSource>(
    ctx: &StrategyContext<'_, '_, S>,
    key: &PortfolioKey,
    anniversary: Anniversary,
    year: i32,
    check: UniverseCheck,
) -> Result<PastPortfolio> {
    let (start, end) = minimization_window(key, anniversary.anchor(year)?);
    let symbols =
        ctx.resolver().backtest_symbols(start, end, key.low_vol_only, ctx.settings().low_vol_subset_size, check)?;
    if symbols.is_empty() {
        return Err(VolaError::unavailable("*", format!("no symbols valid for {key} in {year}")));
    }

    let portfolio = calculate_portfolio(ctx.provider(), start, end, key.spread, &symbols)?;
    debug!(key = %key, year, holdings = portfolio.allocation.len(), universe = symbols.len(), "Computed past portfolio");
    Ok(PastPortfolio {
        anniversary_year: year,
        start_date: end,
        allocation: portfolio.allocation,
        volatility: to_fixed(portfolio.volatility)?,
    })
}

impl Portfolio {
    /// Minimum-volatility snapshot over the `key.period` years up to `as_of`,
    /// drawn from the index members of `as_of`'s year
    #[instrument(skip_all, fields(on_close = true, key = %key, as_of = %as_of))]
    pub fn compute<S: MarketDataSource>(
        ctx: &StrategyContext<'_, '_, S>,
        key: PortfolioKey,
        as_of: NaiveDate,
    ) -> Result<Self> {
        let (start, end) = minimization_window(&key, as_of);
        let universe =
            ctx.resolver().current_symbols(start, end, key.low_vol_only, ctx.settings().low_vol_subset_size)?;
        if universe.is_empty() {
            return Err(VolaError::unavailable("*", format!("no symbols valid for {key} as of {as_of}")));
        }
        let minimized = calculate_portfolio(ctx.provider(), start, end, key.spread, &universe)?;
        Ok(Portfolio {
            key,
            allocation: minimized.allocation,
            universe,
            volatility: to_fixed(minimized.volatility)?,
            computed_at: as_of,
        })
    }
}

/// Scored performance of one link of the chain
#[derive(Debug, Clone, PartialEq)]
pub struct PeriodPerformance {
    pub anniversary_year: i32,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub stats: PerformanceStatistics,
}

/// Chained simulation of a whole series for one investment
#[derive(Debug, Clone, PartialEq)]
pub struct Backtest {
    pub investment: f64,
    pub periods: Vec<PeriodPerformance>,
    pub chart: ChartData,
}

/// Past portfolios of one configuration, one per anniversary year
#[derive(Debug, Clone, PartialEq)]
pub struct RollingPortfolioSeries {
    key: PortfolioKey,
    anniversary: Anniversary,
    chain: Vec<PastPortfolio>,
}

impl RollingPortfolioSeries {
    pub fn new(key: PortfolioKey, anniversary: Anniversary, mut chain: Vec<PastPortfolio>) -> Self {
        chain.sort_by_key(|p| p.start_date);
        Self { key, anniversary, chain }
    }

    pub fn key(&self) -> PortfolioKey {
        self.key
    }

    pub fn anniversary(&self) -> Anniversary {
        self.anniversary
    }

    pub fn chain(&self) -> &[PastPortfolio] {
        &self.chain
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// Series anchored on `today`'s month and day covering
    /// `start_year..today.year()`. Years that cannot be computed are reported
    /// and left out of the chain.
    #[instrument(skip_all, fields(on_close = true, key = %key, start_year = start_year, today = %today))]
    pub fn create_from<S: MarketDataSource>(
        ctx: &StrategyContext<'_, '_, S>,
        key: PortfolioKey,
        start_year: i32,
        today: NaiveDate,
    ) -> (Self, BatchReport<()>) {
        let mut series = Self::new(key, Anniversary::from_date(today), Vec::new());
        let years: Vec<i32> = (start_year..today.year()).collect();
        let report = series.recompute(ctx, &years);
        report.log_summary("create past portfolios");
        (series, report)
    }

    /// Recompute every year from the first stored link up to
    /// `today.year() - 1` against current data. Gaps left by years that
    /// failed earlier are retried; years before the first link are not.
    ///
    /// A year that fails keeps its previous entry, if any.
    #[instrument(skip_all, fields(on_close = true, key = %self.key, today = %today))]
    pub fn refresh<S: MarketDataSource>(&mut self, ctx: &StrategyContext<'_, '_, S>, today: NaiveDate) -> BatchReport<()> {
        let last_year = today.year() - 1;
        let first_year = self.chain.first().map(|p| p.anniversary_year).unwrap_or(last_year);

        let mut years: Vec<i32> = (first_year..=last_year).collect();
        years.extend(self.chain.iter().map(|p| p.anniversary_year).filter(|y| *y > last_year));
        let report = self.recompute(ctx, &years);
        report.log_summary("refresh past portfolios");
        report
    }

    fn recompute<S: MarketDataSource>(&mut self, ctx: &StrategyContext<'_, '_, S>, years: &[i32]) -> BatchReport<()> {
        let key = self.key;
        let anniversary = self.anniversary;
        let results: Vec<(i32, Result<PastPortfolio>)> = years
            .par_iter()
            .map(|year| (*year, compute_past_portfolio(ctx, &key, anniversary, *year, UniverseCheck::Relaxed)))
            .collect();

        let mut by_year: BTreeMap<i32, PastPortfolio> =
            self.chain.drain(..).map(|p| (p.anniversary_year, p)).collect();
        let mut report = BatchReport::default();
        for (year, result) in results {
            match result {
                Ok(past) => {
                    by_year.insert(year, past);
                    report.succeeded.push((year.to_string(), ()));
                }
                Err(e) => report.skip(year.to_string(), e.to_string()),
            }
        }
        self.chain = by_year.into_values().collect();
        report
    }

    /// Simulate every link for a year with annual rebalancing. Each link
    /// starts with the values the previous one ended on.
    #[instrument(skip_all, fields(on_close = true, key = %self.key, investment = investment))]
    pub fn backtest<S: MarketDataSource>(&self, ctx: &StrategyContext<'_, '_, S>, investment: f64) -> Result<Backtest> {
        let first = self
            .chain
            .first()
            .ok_or_else(|| VolaError::InvalidInput(format!("no past portfolios for {}", self.key)))?;

        let simulator = ctx.simulator();
        let mut chart = ChartBuilder::new(ctx, first.start_date - Duration::days(1), investment);
        let mut values = StartValues::uniform(investment);
        let mut periods = Vec::with_capacity(self.chain.len());

        for past in &self.chain {
            let end_date = past.start_date + Duration::days(SCORING_WINDOW_DAYS);
            let out = simulator.simulate(past.start_date, end_date, &past.allocation, values, false)?;
            chart.append(&out);
            values = chained_values(values, &out);
            periods.push(PeriodPerformance {
                anniversary_year: past.anniversary_year,
                start_date: past.start_date,
                end_date,
                stats: out.stats.to_fixed()?,
            });
        }

        info!(
            key = %self.key,
            periods = periods.len(),
            final_value = values.portfolio,
            final_benchmark = values.benchmark,
            "Backtest complete"
        );
        Ok(Backtest { investment, periods, chart: chart.finish() })
    }

    /// Hold the first allocation from its start date until `until`
    /// without rebalancing
    #[instrument(skip_all, fields(on_close = true, key = %self.key, investment = investment, until = %until))]
    pub fn backtest_buy_and_hold<S: MarketDataSource>(
        &self,
        ctx: &StrategyContext<'_, '_, S>,
        investment: f64,
        until: NaiveDate,
    ) -> Result<Backtest> {
        let first = self
            .chain
            .first()
            .ok_or_else(|| VolaError::InvalidInput(format!("no past portfolios for {}", self.key)))?;
        if until <= first.start_date {
            return Err(VolaError::InvalidInput(format!("hold end {until} is not after {}", first.start_date)));
        }

        let out = ctx.simulator().simulate(first.start_date, until, &first.allocation, StartValues::uniform(investment), false)?;
        let mut chart = ChartBuilder::new(ctx, first.start_date - Duration::days(1), investment);
        chart.append(&out);

        Ok(Backtest {
            investment,
            periods: vec![PeriodPerformance {
                anniversary_year: first.anniversary_year,
                start_date: first.start_date,
                end_date: until,
                stats: out.stats.to_fixed()?,
            }],
            chart: chart.finish(),
        })
    }
}

/// Ending values of a window; the low volatility benchmark keeps its value
/// through windows it was not tracked in
fn chained_values(previous: StartValues, out: &SimulationOutput) -> StartValues {
    StartValues {
        portfolio: out.portfolio.last_value().unwrap_or(previous.portfolio),
        benchmark: out.benchmark.last_value().unwrap_or(previous.benchmark),
        low_vol: Some(
            out.low_vol
                .as_ref()
                .and_then(|t| t.last_value())
                .or(previous.low_vol)
                .unwrap_or(previous.portfolio),
        ),
    }
}

/// Concatenates window trajectories into one chart, skipping dates already
/// covered by the previous window
struct ChartBuilder {
    dates: Vec<NaiveDate>,
    portfolio: LabeledSeries,
    benchmark: LabeledSeries,
    low_vol: LabeledSeries,
}

impl ChartBuilder {
    fn new<S: MarketDataSource>(ctx: &StrategyContext<'_, '_, S>, day_before: NaiveDate, investment: f64) -> Self {
        let settings = ctx.settings();
        let mut builder = Self {
            dates: vec![day_before],
            portfolio: LabeledSeries::new("Portfolio"),
            benchmark: LabeledSeries::new(settings.benchmark_symbol.as_str()),
            low_vol: LabeledSeries::new(settings.low_vol_benchmark_symbol.as_str()),
        };
        builder.portfolio.values.push(Some(investment));
        builder.benchmark.values.push(Some(investment));
        builder.low_vol.values.push(Some(investment));
        builder
    }

    fn append(&mut self, out: &SimulationOutput) {
        let Some(&last) = self.dates.last() else { return };
        for (i, date) in out.dates.iter().enumerate() {
            if *date <= last {
                continue;
            }
            self.dates.push(*date);
            self.portfolio.values.push(out.portfolio.values.get(i).copied());
            self.benchmark.values.push(out.benchmark.values.get(i).copied());
            self.low_vol.values.push(out.low_vol.as_ref().and_then(|t| t.values.get(i).copied()));
        }
    }

    fn finish(self) -> ChartData {
        ChartData { dates: self.dates, series: vec![self.portfolio, self.benchmark, self.low_vol] }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::matrix::MarketMatrixProvider;
    use crate::market_data::source::MarketSnapshot;
    use crate::market_data::types::PricePoint;
    use crate::strategy::types::StrategySettings;
    use chrono::Weekday;

    const SYMBOLS: [&str; 4] = ["AAA", "BBB", "CCC", "KO"];

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    /// Weekday history from 2011 through 2016 with deterministic wiggles
    fn fixture() -> MarketSnapshot {
        let mut snapshot = MarketSnapshot::new();
        let all: Vec<&str> = SYMBOLS.iter().copied().chain(["^SP500TR", "SPLV"]).collect();
        for (k, symbol) in all.iter().enumerate() {
            let mut price = 50.0 + 10.0 * k as f64;
            let mut day = date(2011, 1, 3);
            let mut t = 0.0;
            while day <= date(2016, 12, 30) {
                if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
                    let change = 0.4 * (t * 0.9 + k as f64).sin() + 0.3 * (t * 0.37 * (k + 1) as f64).cos() + 0.02;
                    price *= 1.0 + change / 100.0;
                    snapshot.insert(PricePoint { symbol: symbol.to_string(), date: day, close_price: price, pct_change: change });
                    t += 1.0;
                }
                day += Duration::days(1);
            }
        }
        for year in 2011..=2016 {
            snapshot.set_membership(year, SYMBOLS);
        }
        snapshot
    }

    #[test]
    fn anniversary_anchor_is_the_day_before() {
        let anniversary = Anniversary::from_date(date(2016, 2, 29));
        assert_eq!((anniversary.month(), anniversary.day()), (2, 28));
        assert_eq!(anniversary.anchor(2015).unwrap(), date(2015, 2, 27));
        assert!(Anniversary::new(13, 1).is_err());
        assert_eq!(Anniversary::new(1, 1).unwrap().anchor(2014).unwrap(), date(2013, 12, 31));
    }

    #[test]
    fn create_refresh_and_backtest() {
        let snapshot = fixture();
        let provider = MarketMatrixProvider::new(&snapshot, "KO");
        let settings = StrategySettings::default();
        let ctx = StrategyContext::new(&provider, &settings);
        let key = PortfolioKey::new(2, 1, false);

        let (mut series, report) = RollingPortfolioSeries::create_from(&ctx, key, 2013, date(2015, 6, 15));
        assert!(report.is_clean(), "{:?}", report.skipped);
        assert_eq!(series.chain().iter().map(|p| p.anniversary_year).collect::<Vec<_>>(), vec![2013, 2014]);
        assert_eq!(series.chain()[0].start_date, date(2013, 6, 14));
        for past in series.chain() {
            assert!(past.allocation.weights().iter().all(|w| *w <= 0.5 + 1e-9));
        }

        // Same day and data: nothing changes
        let before = series.clone();
        assert!(series.refresh(&ctx, date(2015, 6, 15)).is_clean());
        assert_eq!(series, before);

        // A year later exactly one link is appended
        series.refresh(&ctx, date(2016, 6, 15));
        assert_eq!(series.len(), 3);
        assert_eq!(series.chain()[2].anniversary_year, 2015);
        assert_eq!(series.chain()[..2], before.chain()[..]);

        let backtest = series.backtest(&ctx, 10_000.0).unwrap();
        assert_eq!(backtest.periods.len(), 3);
        backtest.chart.validate().unwrap();
        assert!(backtest.chart.dates.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(backtest.chart.series[0].values[0], Some(10_000.0));
        assert!(backtest.chart.series[0].values.iter().all(Option::is_some));
    }

    #[test]
    fn refresh_fills_years_missing_from_the_chain() {
        let snapshot = fixture();
        let provider = MarketMatrixProvider::new(&snapshot, "KO");
        let settings = StrategySettings::default();
        let ctx = StrategyContext::new(&provider, &settings);
        let key = PortfolioKey::new(2, 1, false);
        let anniversary = Anniversary::new(6, 15).unwrap();

        let chain: Vec<PastPortfolio> = [2013, 2015]
            .iter()
            .map(|year| compute_past_portfolio(&ctx, &key, anniversary, *year, UniverseCheck::Relaxed).unwrap())
            .collect();
        let mut series = RollingPortfolioSeries::new(key, anniversary, chain);

        assert!(series.refresh(&ctx, date(2016, 6, 15)).is_clean());
        assert_eq!(series.chain().iter().map(|p| p.anniversary_year).collect::<Vec<_>>(), vec![2013, 2014, 2015]);
    }

    #[test]
    fn low_vol_series_holds_the_quietest_symbols() {
        let snapshot = fixture();
        let provider = MarketMatrixProvider::new(&snapshot, "KO");
        let settings = StrategySettings { low_vol_subset_size: 2, ..StrategySettings::default() };
        let ctx = StrategyContext::new(&provider, &settings);
        let key = PortfolioKey::new(2, 1, true);

        let (series, report) = RollingPortfolioSeries::create_from(&ctx, key, 2013, date(2015, 6, 15));
        assert!(report.is_clean(), "{:?}", report.skipped);
        assert_eq!(series.len(), 2);

        let resolver = ctx.resolver();
        for past in series.chain() {
            let (start, end) = minimization_window(&key, past.start_date);
            let all = resolver.backtest_symbols(start, end, false, 0, UniverseCheck::Relaxed).unwrap();
            assert_eq!(all.len(), SYMBOLS.len());
            let mut quietest = resolver.lowest_volatility_subset(&all, end, 2).unwrap();
            quietest.sort();

            // Spread 2 over two symbols forces an even split
            assert_eq!(past.allocation.symbols(), &quietest[..]);
            for weight in past.allocation.weights() {
                assert!((weight - 0.5).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn buy_and_hold_uses_first_allocation() {
        let snapshot = fixture();
        let provider = MarketMatrixProvider::new(&snapshot, "KO");
        let settings = StrategySettings::default();
        let ctx = StrategyContext::new(&provider, &settings);

        let (series, _) = RollingPortfolioSeries::create_from(&ctx, PortfolioKey::new(1, 1, false), 2013, date(2015, 3, 2));
        let held = series.backtest_buy_and_hold(&ctx, 25_000.0, date(2015, 3, 1)).unwrap();
        assert_eq!(held.periods.len(), 1);
        assert_eq!(held.periods[0].start_date, date(2013, 3, 1));
        assert!(series.backtest_buy_and_hold(&ctx, 25_000.0, date(2012, 1, 1)).is_err());
    }

    #[test]
    fn live_portfolio_respects_spread() {
        let snapshot = fixture();
        let provider = MarketMatrixProvider::new(&snapshot, "KO");
        let settings = StrategySettings::default();
        let ctx = StrategyContext::new(&provider, &settings);

        let portfolio = Portfolio::compute(&ctx, PortfolioKey::new(3, 2, false), date(2016, 9, 30)).unwrap();
        assert_eq!(portfolio.universe.len(), SYMBOLS.len());
        assert!(portfolio.allocation.len() >= 3);
        assert!((portfolio.allocation.total() - 1.0).abs() < 1e-6);
    }
}
