use argmin::core::{
    ArgminError, CostFunction, Error, Executor, Gradient, IterState, Problem, Solver, State, TerminationReason,
    TerminationStatus, KV,
};
use chrono::NaiveDate;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::types::WeightAllocation;
use crate::errors::{Result, VolaError};
use crate::market_data::matrix::MarketMatrixProvider;
use crate::market_data::source::MarketDataSource;
use crate::market_data::types::{MarketMatrix, PriceField};
use crate::stats_utils::{annualize, population_std};

/// Weights below this are snapped to zero. Even at a 100m investment such a
/// weight buys less than a cent.
pub const EFFECTIVE_ZERO: f64 = 1e-8;

pub const DEFAULT_MAX_ITERS: u64 = 20_000;
pub const DEFAULT_TOLERANCE: f64 = 1e-10;

/// Seed for the single perturbed restart, fixed so reruns are reproducible
const PERTURBATION_SEED: u64 = 0x5eed_0f_7015;
const PERTURBATION_SCALE: f64 = 0.5;
const POWER_ITERATIONS: usize = 50;
const BISECTION_ITERATIONS: usize = 200;
const MIN_STEP: f64 = 1e-30;

type SolverState = IterState<Vec<f64>, Vec<f64>, (), (), (), f64>;

/// Long-only minimum-variance solver with a per-asset cap of `1/min_spread`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolatilityMinimizer {
    min_spread: u32,
    max_iters: u64,
    tolerance: f64,
}

/// Solver output over the full input universe (zeros included)
#[derive(Debug, Clone, PartialEq)]
pub struct MinimizedWeights {
    pub weights: Array1<f64>,
    pub daily_volatility: f64,
    pub trading_days: usize,
    pub iterations: u64,
}

impl MinimizedWeights {
    pub fn annualized_volatility(&self) -> f64 {
        annualize(self.daily_volatility, self.trading_days)
    }
}

/// Non-zero allocation for a period with its annualized volatility
#[derive(Debug, Clone, PartialEq)]
pub struct MinimumVolatilityPortfolio {
    pub allocation: WeightAllocation,
    pub volatility: f64,
    pub trading_days: usize,
}

impl VolatilityMinimizer {
    pub fn new(min_spread: u32) -> Result<Self> {
        if min_spread == 0 {
            return Err(VolaError::InvalidInput("min_spread must be at least 1".to_string()));
        }
        Ok(Self { min_spread, max_iters: DEFAULT_MAX_ITERS, tolerance: DEFAULT_TOLERANCE })
    }

    pub fn with_max_iters(mut self, max_iters: u64) -> Self {
        self.max_iters = max_iters;
        self
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn min_spread(&self) -> u32 {
        self.min_spread
    }

    /// Upper bound on any single weight
    pub fn cap(&self) -> f64 {
        1.0 / f64::from(self.min_spread)
    }

    /// Minimize `std(changes · w)` subject to `sum(w) = 1` and
    /// `0 <= w_i <= 1/min_spread`, starting from uniform weights.
    ///
    /// One restart from a perturbed guess is attempted before giving up with
    /// `OptimizationFailure`.
    #[instrument(skip_all, fields(on_close = true, assets = changes.ncols(), days = changes.nrows(), min_spread = self.min_spread))]
    pub fn minimize(&self, changes: &Array2<f64>) -> Result<MinimizedWeights> {
        let (days, assets) = changes.dim();
        if days == 0 || assets == 0 {
            return Err(VolaError::InvalidInput(format!("cannot minimize over a {days}x{assets} matrix")));
        }
        if changes.iter().any(|v| !v.is_finite()) {
            return Err(VolaError::InvalidInput("changes matrix contains non-finite values".to_string()));
        }
        let cap = self.cap();
        if (assets as f64) * cap < 1.0 - 1e-12 {
            return Err(VolaError::OptimizationFailure(format!(
                "infeasible: {assets} assets cannot be fully invested with a cap of 1/{}",
                self.min_spread
            )));
        }

        let covariance = population_covariance(changes);
        let uniform = vec![1.0 / assets as f64; assets];

        let (mut weights, iterations) = match self.solve(&covariance, uniform.clone()) {
            Ok(solution) => solution,
            Err(e) => {
                warn!(err = %e, "Minimization did not converge, retrying from perturbed weights");
                self.solve(&covariance, perturb(&uniform, cap))?
            }
        };

        weights.mapv_inplace(|w| if w < EFFECTIVE_ZERO { 0.0 } else { w });
        let daily_volatility = portfolio_volatility(weights.view(), changes);
        debug!(iterations, daily_volatility, held = weights.iter().filter(|w| **w > 0.0).count(), "Minimization converged");

        Ok(MinimizedWeights { weights, daily_volatility, trading_days: days, iterations })
    }

    fn solve(&self, covariance: &Array2<f64>, initial: Vec<f64>) -> Result<(Array1<f64>, u64)> {
        let lipschitz = 2.0 * largest_eigenvalue(covariance);
        let step = if lipschitz > f64::EPSILON { 1.0 / lipschitz } else { 1.0 };

        let problem = VarianceProblem { covariance: covariance.clone() };
        let solver = ProjectedGradient::new(self.cap(), step, self.tolerance);

        let result = Executor::new(problem, solver)
            .configure(|state| state.param(initial).max_iters(self.max_iters))
            .run()
            .map_err(|e| VolaError::OptimizationFailure(e.to_string()))?;

        let state = result.state();
        match state.get_termination_status() {
            TerminationStatus::Terminated(TerminationReason::SolverConverged) => {}
            status => {
                return Err(VolaError::OptimizationFailure(format!(
                    "solver stopped after {} iterations: {status:?}",
                    state.get_iter()
                )));
            }
        }

        let best = state
            .get_best_param()
            .cloned()
            .ok_or_else(|| VolaError::OptimizationFailure("solver returned no parameters".to_string()))?;
        Ok((Array1::from_vec(best), state.get_iter()))
    }
}

/// Daily std of the weighted portfolio change
pub fn portfolio_volatility(weights: ArrayView1<f64>, changes: &Array2<f64>) -> f64 {
    population_std(changes.dot(&weights).view())
}

/// Daily std of the portfolio change implied by integer share counts
pub fn share_volatility(shares: ArrayView1<f64>, changes: &Array2<f64>) -> f64 {
    let total = shares.sum();
    if total <= 0.0 {
        return 0.0;
    }
    population_std((changes.dot(&shares) / total).view())
}

/// Minimum-volatility allocation over `[start, end]` restricted to non-zero
/// weights, with volatility annualized over the observed trading days
pub fn calculate_portfolio<S: MarketDataSource>(
    provider: &MarketMatrixProvider<'_, S>,
    start: NaiveDate,
    end: NaiveDate,
    min_spread: u32,
    symbols: &[String],
) -> Result<MinimumVolatilityPortfolio> {
    let changes = provider.matrix(start, end, symbols, PriceField::Change)?;
    minimize_matrix(&changes, min_spread)
}

/// Same as `calculate_portfolio` for an already built changes matrix
pub fn minimize_matrix(changes: &MarketMatrix, min_spread: u32) -> Result<MinimumVolatilityPortfolio> {
    let minimizer = VolatilityMinimizer::new(min_spread)?;
    let solution = minimizer.minimize(&changes.to_f64())?;

    let (held_symbols, held_weights): (Vec<String>, Vec<f64>) = changes
        .symbols
        .iter()
        .zip(solution.weights.iter())
        .filter(|(_, w)| **w > 0.0)
        .map(|(s, w)| (s.clone(), *w))
        .unzip();

    Ok(MinimumVolatilityPortfolio {
        allocation: WeightAllocation::new(held_symbols, held_weights)?,
        volatility: solution.annualized_volatility(),
        trading_days: solution.trading_days,
    })
}

/// Population covariance (ddof = 0) of the columns of `changes`
fn population_covariance(changes: &Array2<f64>) -> Array2<f64> {
    let days = changes.nrows() as f64;
    let means = changes.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(changes.ncols()));
    let centered = changes - &means;
    centered.t().dot(&centered) / days
}

/// Power iteration estimate of the largest eigenvalue of a PSD matrix
fn largest_eigenvalue(matrix: &Array2<f64>) -> f64 {
    let n = matrix.nrows();
    let mut v = Array1::from_elem(n, 1.0 / (n as f64).sqrt());
    let mut eigenvalue = 0.0;
    for _ in 0..POWER_ITERATIONS {
        let next = matrix.dot(&v);
        let norm = next.dot(&next).sqrt();
        if norm <= f64::EPSILON {
            return 0.0;
        }
        v = next / norm;
        eigenvalue = v.dot(&matrix.dot(&v));
    }
    eigenvalue
}

/// Euclidean projection onto `{w : 0 <= w_i <= cap, sum(w) = 1}`.
///
/// Finds the shift `tau` with `sum(clamp(y_i - tau, 0, cap)) = 1` by
/// bisection. Requires `len * cap >= 1`.
fn project_capped_simplex(y: &[f64], cap: f64) -> Vec<f64> {
    let filled = |tau: f64| -> f64 { y.iter().map(|v| (v - tau).clamp(0.0, cap)).sum() };

    let mut lo = y.iter().copied().fold(f64::INFINITY, f64::min) - cap; // sum = len * cap
    let mut hi = y.iter().copied().fold(f64::NEG_INFINITY, f64::max); // sum = 0
    for _ in 0..BISECTION_ITERATIONS {
        let mid = 0.5 * (lo + hi);
        if filled(mid) > 1.0 {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo <= f64::EPSILON * hi.abs().max(1.0) {
            break;
        }
    }
    let tau = 0.5 * (lo + hi);
    y.iter().map(|v| (v - tau).clamp(0.0, cap)).collect()
}

fn perturb(initial: &[f64], cap: f64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(PERTURBATION_SEED);
    let jittered: Vec<f64> = initial
        .iter()
        .map(|w| w * (1.0 + PERTURBATION_SCALE * rng.random_range(-1.0..1.0)))
        .collect();
    project_capped_simplex(&jittered, cap)
}

/// `w' Σ w`; the square of the daily portfolio std
struct VarianceProblem {
    covariance: Array2<f64>,
}

impl CostFunction for VarianceProblem {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, weights: &Self::Param) -> std::result::Result<Self::Output, Error> {
        let w = ArrayView1::from(weights.as_slice());
        Ok(w.dot(&self.covariance.dot(&w)))
    }
}

impl Gradient for VarianceProblem {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, weights: &Self::Param) -> std::result::Result<Self::Gradient, Error> {
        let w = ArrayView1::from(weights.as_slice());
        Ok((self.covariance.dot(&w) * 2.0).to_vec())
    }
}

/// Projected gradient descent with backtracking. Every iterate is feasible.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProjectedGradient {
    cap: f64,
    step: f64,
    tolerance: f64,
    gradient_mapping: f64, // |x_{k+1} - x_k| / step of the last iteration
    relative_decrease: f64,
}

impl ProjectedGradient {
    fn new(cap: f64, step: f64, tolerance: f64) -> Self {
        Self { cap, step, tolerance, gradient_mapping: f64::INFINITY, relative_decrease: f64::INFINITY }
    }
}

impl<O> Solver<O, SolverState> for ProjectedGradient
where
    O: CostFunction<Param = Vec<f64>, Output = f64> + Gradient<Param = Vec<f64>, Gradient = Vec<f64>>,
{
    const NAME: &'static str = "Projected gradient";

    fn init(
        &mut self,
        problem: &mut Problem<O>,
        mut state: SolverState,
    ) -> std::result::Result<(SolverState, Option<KV>), Error> {
        let initial = state.take_param().ok_or_else(|| ArgminError::NotInitialized {
            text: "initial weights must be set".to_string(),
        })?;
        let feasible = project_capped_simplex(&initial, self.cap);
        let cost = problem.cost(&feasible)?;
        Ok((state.param(feasible).cost(cost), None))
    }

    fn next_iter(
        &mut self,
        problem: &mut Problem<O>,
        mut state: SolverState,
    ) -> std::result::Result<(SolverState, Option<KV>), Error> {
        let current = state.take_param().ok_or_else(|| ArgminError::NotInitialized {
            text: "no current weights".to_string(),
        })?;
        let cost = problem.cost(&current)?;
        let gradient = problem.gradient(&current)?;

        let mut step = self.step;
        loop {
            let shifted: Vec<f64> = current.iter().zip(&gradient).map(|(w, g)| w - step * g).collect();
            let candidate = project_capped_simplex(&shifted, self.cap);
            let delta: Vec<f64> = candidate.iter().zip(&current).map(|(c, w)| c - w).collect();
            let delta_sq: f64 = delta.iter().map(|d| d * d).sum();
            let linear: f64 = gradient.iter().zip(&delta).map(|(g, d)| g * d).sum();
            let new_cost = problem.cost(&candidate)?;

            // Sufficient decrease for the quadratic model at this step size
            let bound = cost + linear + delta_sq / (2.0 * step);
            if new_cost <= bound + 1e-15 * cost.abs().max(1.0) || step < MIN_STEP {
                self.step = step;
                self.gradient_mapping = delta_sq.sqrt() / step;
                self.relative_decrease = (cost - new_cost) / cost.abs().max(f64::MIN_POSITIVE);
                return Ok((state.param(candidate).cost(new_cost), None));
            }
            step *= 0.5;
        }
    }

    fn terminate(&mut self, _state: &SolverState) -> TerminationStatus {
        if self.gradient_mapping <= self.tolerance || self.relative_decrease.abs() <= f64::EPSILON {
            return TerminationStatus::Terminated(TerminationReason::SolverConverged);
        }
        TerminationStatus::NotTerminated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn assert_feasible(weights: &Array1<f64>, min_spread: u32) {
        let cap = 1.0 / f64::from(min_spread);
        assert_abs_diff_eq!(weights.sum(), 1.0, epsilon = 1e-6);
        for w in weights {
            assert!(*w >= 0.0 && *w <= cap + 1e-9, "weight {w} outside [0, {cap}]");
        }
    }

    #[test]
    fn projection_respects_caps_and_budget() {
        let projected = project_capped_simplex(&[0.9, 0.05, 0.3, -0.2], 0.4);
        assert_abs_diff_eq!(projected.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        assert!(projected.iter().all(|w| *w >= 0.0 && *w <= 0.4 + 1e-12));
        assert_abs_diff_eq!(projected[0], 0.4, epsilon = 1e-12);
    }

    #[test]
    fn identical_assets_have_zero_volatility() {
        let changes = array![[1.0, 1.0, 1.0], [1.0, 1.0, 1.0], [1.0, 1.0, 1.0], [1.0, 1.0, 1.0]];
        let result = VolatilityMinimizer::new(1).unwrap().minimize(&changes).unwrap();
        assert_feasible(&result.weights, 1);
        assert_abs_diff_eq!(result.daily_volatility, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(result.annualized_volatility(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn picks_the_quiet_asset() {
        // Asset 1 is flat, asset 0 and 2 swing independently of each other
        let changes = array![[2.0, 0.0, 1.0], [-2.0, 0.0, 1.0], [2.0, 0.0, -1.0], [-2.0, 0.0, -1.0]];
        let result = VolatilityMinimizer::new(1).unwrap().minimize(&changes).unwrap();
        assert_feasible(&result.weights, 1);
        assert_abs_diff_eq!(result.weights[1], 1.0, epsilon = 1e-4);
        assert_abs_diff_eq!(result.daily_volatility, 0.0, epsilon = 1e-4);
    }

    #[test]
    fn hedging_pair_cancels_out() {
        // Perfectly anti-correlated with 2:1 amplitude; 1/3, 2/3 is riskless
        let changes = array![[2.0, -1.0], [-2.0, 1.0], [4.0, -2.0], [-4.0, 2.0]];
        let result = VolatilityMinimizer::new(1).unwrap().minimize(&changes).unwrap();
        assert_abs_diff_eq!(result.weights[0], 1.0 / 3.0, epsilon = 1e-4);
        assert_abs_diff_eq!(result.weights[1], 2.0 / 3.0, epsilon = 1e-4);
    }

    #[test]
    fn spread_caps_every_weight() {
        let changes = array![
            [0.1, 1.0, -1.5, 2.0, 0.3],
            [-0.1, -1.0, 1.5, -2.5, 0.2],
            [0.2, 0.5, -0.5, 1.0, -0.4],
            [0.0, -0.7, 0.9, -1.2, 0.1],
            [-0.2, 0.2, 0.1, 0.4, -0.3]
        ];
        let result = VolatilityMinimizer::new(4).unwrap().minimize(&changes).unwrap();
        assert_feasible(&result.weights, 4);
        assert_eq!(result.trading_days, 5);
    }

    #[test]
    fn infeasible_spread_is_an_optimization_failure() {
        let changes = array![[1.0, 2.0], [2.0, 1.0]];
        let err = VolatilityMinimizer::new(3).unwrap().minimize(&changes).unwrap_err();
        assert!(matches!(err, VolaError::OptimizationFailure(_)));
        assert!(VolatilityMinimizer::new(0).is_err());
    }

    #[test]
    fn exhausted_iterations_fail_after_the_restart() {
        let changes = array![[2.0, -1.0], [-2.0, 1.0], [4.0, -2.0], [-4.0, 2.0]];
        let err = VolatilityMinimizer::new(1).unwrap().with_max_iters(1).minimize(&changes).unwrap_err();
        assert!(matches!(err, VolaError::OptimizationFailure(ref msg) if msg.contains("1 iterations")), "{err}");
    }

    #[test]
    fn effective_zero_weights_are_snapped() {
        let changes = array![[0.0, 5.0], [0.0, -5.0], [0.0, 5.0]];
        let result = VolatilityMinimizer::new(1).unwrap().minimize(&changes).unwrap();
        assert_eq!(result.weights[1], 0.0);
        assert_abs_diff_eq!(result.weights[0], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn repeated_runs_are_identical() {
        let changes = array![[0.5, -0.2, 0.1], [-0.3, 0.4, 0.0], [0.2, 0.1, -0.3], [0.1, -0.4, 0.2]];
        let minimizer = VolatilityMinimizer::new(2).unwrap();
        let first = minimizer.minimize(&changes).unwrap();
        let second = minimizer.minimize(&changes).unwrap();
        assert_eq!(first.weights, second.weights);
    }

    #[test]
    fn share_volatility_normalizes_by_share_count() {
        let changes = array![[1.0, 3.0], [3.0, 1.0]];
        let vol = share_volatility(array![10.0, 10.0].view(), &changes);
        assert_abs_diff_eq!(vol, 0.0, epsilon = 1e-12);
        assert_eq!(share_volatility(array![0.0, 0.0].view(), &changes), 0.0);
    }
}
