//! # Peak Performance (Stage 1)
//!
//! $$
//! \mathcal{P}^\* = \max_{\mathbf{w}} \mathcal{P}(\mathbf{w}) \quad\text{s.t.}\quad
//! \sum_i |w_i| = L,\ 0 \le w_i \le \bar w_{\text{loose}}
//! $$
//!
//! Finds the best achievable value of the chosen objective under loose bounds.
//! The value becomes the performance floor anchor of the diversification stage.

use tracing::debug;
use tracing::warn;

use super::metrics::MarketModel;
use super::metrics::herfindahl_regularization;
use super::solver::PositionBounds;
use super::solver::RescaleFailure;
use super::solver::SolverSettings;
use super::solver::minimize_bounded;
use super::types::SolverNotice;
use super::types::Stage;
use super::types::StrategyType;

/// Loose position bounds of the peak-performance stage.
#[derive(Clone, Debug, PartialEq)]
pub struct PeakBounds {
  /// Single-position cap.
  pub max_position: f64,
  /// Positions below this are zeroed after the solve.
  pub min_position: f64,
}

impl Default for PeakBounds {
  fn default() -> Self {
    Self {
      max_position: 0.30,
      min_position: 0.01,
    }
  }
}

/// Stage 1 output.
#[derive(Clone, Debug)]
pub struct PeakPerformance {
  pub weights: Vec<f64>,
  /// Higher-is-better score of `weights`.
  pub peak_performance: f64,
  pub converged: bool,
  pub notices: Vec<SolverNotice>,
}

/// Minimized form of the strategy objective, without regularization.
pub fn stage1_objective(model: &MarketModel<'_>, strategy: StrategyType, w: &[f64]) -> f64 {
  match strategy {
    StrategyType::MaxSharpe => -model.sharpe(w),
    StrategyType::MinVolatility => model.volatility(w),
    StrategyType::MaxReturn => -model.expected_return(w),
    StrategyType::RiskParity => model.risk_parity_error(w),
  }
}

/// Solve Stage 1. Never fails: on solver trouble the best available iterate is used.
pub fn solve_peak_performance(
  model: &MarketModel<'_>,
  strategy: StrategyType,
  leverage: f64,
  peak_bounds: &PeakBounds,
  settings: &SolverSettings,
) -> PeakPerformance {
  let n = model.n_assets();
  let mut notices = Vec::new();

  let mut bounds = PositionBounds::uniform(n, 0.0, peak_bounds.max_position);
  if bounds.make_feasible(leverage) {
    warn!(
      n,
      cap = peak_bounds.max_position,
      "stage 1 caps cannot carry the leverage, relaxing"
    );
    notices.push(SolverNotice::BoundsRelaxed {
      stage: Stage::PeakPerformance,
    });
  }

  let start = vec![leverage / n as f64; n];
  let scale = stage1_objective(model, strategy, &start).abs().max(1e-8);
  let objective =
    |w: &[f64]| stage1_objective(model, strategy, w) + herfindahl_regularization(w, scale);

  let (solved, converged) = match minimize_bounded(objective, &bounds, leverage, &start, settings) {
    Some(outcome) => (outcome.weights, outcome.converged),
    None => {
      let fallback = bounds.weights_from_params(&bounds.params_from_weights(&start), leverage);
      (fallback, false)
    }
  };

  if !converged {
    warn!(%strategy, "stage 1 did not converge, using last iterate");
    notices.push(SolverNotice::Stage1NonConvergence);
  }

  let trimmed: Vec<f64> = solved
    .iter()
    .map(|&w| if w < peak_bounds.min_position { 0.0 } else { w })
    .collect();

  let weights = match bounds.rescale(&trimmed, leverage) {
    Ok(w) => w,
    Err(RescaleFailure::Collapsed) => {
      warn!("stage 1 cleanup collapsed the weights, keeping the raw solve");
      notices.push(SolverNotice::DegenerateRenormalization {
        stage: Stage::PeakPerformance,
      });
      solved
    }
    Err(RescaleFailure::Infeasible) => {
      debug!("stage 1 cleanup cannot carry the leverage within caps, keeping the raw solve");
      solved
    }
  };

  let peak_performance = model.performance(strategy, &weights);
  debug!(%strategy, peak_performance, converged, "stage 1 finished");

  PeakPerformance {
    weights,
    peak_performance,
    converged,
    notices,
  }
}
