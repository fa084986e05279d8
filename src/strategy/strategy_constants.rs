// --- PRICING CONSTANTS ---
/// Positions worth less than this are not quoted live
pub const MIN_SHARE_PRICE: f64 = 1.0;
/// Unquoted positions are priced at investment * this, which rounds them to zero shares
pub const PLACEHOLDER_PRICE_MULTIPLIER: f64 = 3.0;
/// Calendar days searched backwards for a historical close
pub const HISTORICAL_PRICE_LOOKBACK_DAYS: i64 = 5;

// --- BACKTEST CONSTANTS ---
/// Length of the scoring year following an anniversary
pub const SCORING_WINDOW_DAYS: i64 = 365;
/// Days per year of minimization period
pub const DAYS_PER_PERIOD_YEAR: i64 = 365;
/// First year the low volatility benchmark has data for
pub const DEFAULT_BACKTEST_START_YEAR: i32 = 2012;

// --- CONFIGURATION GRID ---
pub const DEFAULT_SPREADS: [u32; 4] = [25, 50, 75, 100];
pub const DEFAULT_PERIODS: [u32; 5] = [1, 2, 4, 8, 12];
pub const DEFAULT_LOW_VOL_FLAGS: [bool; 2] = [true, false];
/// Investments the backtests are cached for
pub const DEFAULT_INVESTMENTS: [i64; 6] = [10_000, 25_000, 50_000, 100_000, 250_000, 1_000_000];
