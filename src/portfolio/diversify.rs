//! # Diversification Maximizer (Stage 2)
//!
//! $$
//! \min_{\mathbf{w}} \sum_i (w_i/L)^2 + \lambda_s\,\phi_{\text{sparse}}(\mathbf{w})
//! \quad\text{s.t.}\quad \mathcal{P}(\mathbf{w}) \ge \mathcal{P}^\* - |\mathcal{P}^\*|(1-\rho)
//! $$
//!
//! Given the Stage 1 peak as a performance floor, finds the most diversified
//! weight vector that also respects the concentration, risk-budget, drawdown
//! and (when rebalancing) turnover limits of the risk profile.
//!
//! Leverage and position bounds are hard: every iterate satisfies them. The
//! remaining limits are squared-hinge penalties large enough to dominate the
//! concentration objective whenever they are violated.

use tracing::debug;
use tracing::warn;

use super::metrics::MarketModel;
use super::metrics::concentration;
use super::metrics::performance_floor;
use super::metrics::top_k_share;
use super::peak::PeakPerformance;
use super::profile::RiskProfileConfig;
use super::rebalance::GradualRebalance;
use super::solver::PositionBounds;
use super::solver::RescaleFailure;
use super::solver::SOLVER_TOLERANCE;
use super::solver::SolverSettings;
use super::solver::minimize_bounded;
use super::types::SolverNotice;
use super::types::Stage;
use super::types::StrategyType;

/// Weight of every violated hard-limit penalty.
const PENALTY_WEIGHT: f64 = 1e4;
/// Weight of the soft shortfall below `target_holdings`.
const SPARSITY_WEIGHT: f64 = 0.05;
/// Smallest scale used to normalize performance shortfalls.
const PERFORMANCE_SCALE_FLOOR: f64 = 1e-2;
/// Lowest volatility-scaled cap.
const MIN_POSITION_CAP: f64 = 0.01;

/// Default Stage 2 bounds: volatility-scaled caps, long-only.
pub fn diversification_bounds(model: &MarketModel<'_>, profile: &RiskProfileConfig) -> PositionBounds {
  PositionBounds::volatility_scaled(
    &model.asset_volatilities().to_vec(),
    model.median_volatility(),
    profile.max_position_base,
    MIN_POSITION_CAP,
  )
}

/// Smooth count of positions at or above `threshold`.
pub fn soft_meaningful_count(w: &[f64], threshold: f64) -> f64 {
  let width = 0.25 * threshold.max(1e-6);
  w.iter()
    .map(|x| {
      let z = (x.abs() - threshold) / width;
      if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
      } else {
        let e = z.exp();
        e / (1.0 + e)
      }
    })
    .sum()
}

fn hinge(x: f64) -> f64 {
  x.max(0.0)
}

/// Penalized Stage 2 objective.
#[derive(Clone)]
pub struct DiversificationObjective<'a> {
  model: &'a MarketModel<'a>,
  strategy: StrategyType,
  floor: f64,
  performance_scale: f64,
  meaningful_threshold: f64,
  min_positions: f64,
  target_positions: f64,
  top_3_limit: f64,
  top_5_limit: f64,
  risk_budget: f64,
  max_drawdown: Option<f64>,
  rebalance: Option<&'a GradualRebalance>,
}

impl<'a> DiversificationObjective<'a> {
  pub fn new(
    model: &'a MarketModel<'a>,
    strategy: StrategyType,
    profile: &RiskProfileConfig,
    peak_performance: f64,
    rebalance: Option<&'a GradualRebalance>,
  ) -> Self {
    let n = model.n_assets();
    Self {
      model,
      strategy,
      floor: performance_floor(peak_performance, profile.acceptable_performance_ratio),
      performance_scale: peak_performance.abs().max(PERFORMANCE_SCALE_FLOOR),
      meaningful_threshold: profile.meaningful_threshold,
      min_positions: profile.effective_min_diversification(n) as f64,
      target_positions: profile.effective_target_holdings(n) as f64,
      top_3_limit: profile.effective_top_limit(3, n),
      top_5_limit: profile.effective_top_limit(5, n),
      risk_budget: profile.effective_risk_budget(n),
      max_drawdown: profile.max_drawdown_tolerance,
      rebalance,
    }
  }

  pub fn floor(&self) -> f64 {
    self.floor
  }

  /// Sum of squared normalized limit violations, zero when every limit holds.
  pub fn violation(&self, w: &[f64]) -> f64 {
    let performance = hinge(self.floor - self.model.performance(self.strategy, w))
      / self.performance_scale;
    performance.powi(2) + self.limit_violation(w)
  }

  /// [`Self::violation`] without the performance floor.
  pub fn limit_violation(&self, w: &[f64]) -> f64 {
    let count = soft_meaningful_count(w, self.meaningful_threshold);

    let positions = hinge(self.min_positions - count) / self.min_positions.max(1.0);
    let top_3 = hinge(top_k_share(w, 3) - self.top_3_limit);
    let top_5 = hinge(top_k_share(w, 5) - self.top_5_limit);
    let risk_budget: f64 = self
      .model
      .risk_contributions(w)
      .iter()
      .map(|rc| hinge(rc - self.risk_budget).powi(2))
      .sum();
    let drawdown = self
      .max_drawdown
      .map(|limit| hinge(self.model.max_drawdown(w) - limit))
      .unwrap_or(0.0);
    let turnover = self
      .rebalance
      .map(|plan| plan.turnover_excess(w))
      .unwrap_or(0.0);

    positions.powi(2)
      + top_3.powi(2)
      + top_5.powi(2)
      + risk_budget
      + drawdown.powi(2)
      + turnover.powi(2)
  }

  pub fn evaluate(&self, w: &[f64]) -> f64 {
    let count = soft_meaningful_count(w, self.meaningful_threshold);
    let sparsity = hinge(self.target_positions - count) / self.target_positions.max(1.0);

    concentration(w) + SPARSITY_WEIGHT * sparsity.powi(2) + PENALTY_WEIGHT * self.violation(w)
  }

  /// Best performance within the diversification limits, floor ignored.
  pub fn evaluate_performance_first(&self, w: &[f64]) -> f64 {
    -self.model.performance(self.strategy, w) / self.performance_scale
      + PENALTY_WEIGHT * self.limit_violation(w)
  }
}

/// Stage 2 output.
#[derive(Clone, Debug)]
pub struct DiversifiedPortfolio {
  pub weights: Vec<f64>,
  /// Higher-is-better score of `weights`.
  pub objective_value: f64,
  pub performance_floor: f64,
  pub notices: Vec<SolverNotice>,
}

/// Zero dust below half the meaningful threshold and restore leverage.
///
/// `None` means the solver produced nothing usable; both that and a collapsed
/// cleanup fall back to the Stage 1 weights and record why. The flag is true
/// when the fallback was taken.
pub fn settle_weights(
  solved: Option<Vec<f64>>,
  bounds: &PositionBounds,
  profile: &RiskProfileConfig,
  leverage: f64,
  peak: &PeakPerformance,
  notices: &mut Vec<SolverNotice>,
) -> (Vec<f64>, bool) {
  let Some(solved) = solved else {
    warn!("stage 2 solve failed, falling back to stage 1");
    notices.push(SolverNotice::Stage2Fallback);
    return (peak.weights.clone(), true);
  };

  match cleanup(&solved, bounds, profile, leverage) {
    Ok(w) => (w, false),
    Err(RescaleFailure::Collapsed) => {
      warn!("stage 2 cleanup collapsed the weights, falling back to stage 1");
      notices.push(SolverNotice::DegenerateRenormalization {
        stage: Stage::Diversification,
      });
      (peak.weights.clone(), true)
    }
    Err(RescaleFailure::Infeasible) => {
      debug!("stage 2 cleanup cannot carry the leverage within caps, keeping the raw solve");
      (solved, false)
    }
  }
}

fn cleanup(
  solved: &[f64],
  bounds: &PositionBounds,
  profile: &RiskProfileConfig,
  leverage: f64,
) -> Result<Vec<f64>, RescaleFailure> {
  let dust = 0.5 * profile.meaningful_threshold;
  let trimmed: Vec<f64> = solved
    .iter()
    .zip(bounds.lower.iter())
    .map(|(&w, &lo)| if w < dust && lo <= 1e-12 { 0.0 } else { w })
    .collect();
  bounds.rescale(&trimmed, leverage)
}

/// Re-solve for the best performance the limits allow, starting from `start`.
///
/// When that point clears the floor the diversification objective runs once
/// more from there. Returns weights only if they beat `start`.
fn recover_performance(
  objective: &DiversificationObjective<'_>,
  bounds: &PositionBounds,
  profile: &RiskProfileConfig,
  leverage: f64,
  start: &[f64],
  settings: &SolverSettings,
) -> Option<Vec<f64>> {
  let model = objective.model;
  let strategy = objective.strategy;
  let floor = objective.floor();
  let score = |w: &[f64]| model.performance(strategy, w);
  let settle = |w: Vec<f64>| cleanup(&w, bounds, profile, leverage).unwrap_or(w);

  let first = |w: &[f64]| objective.evaluate_performance_first(w);
  let mut best = settle(minimize_bounded(first, bounds, leverage, start, settings)?.weights);

  if score(&best) >= floor - SOLVER_TOLERANCE {
    let spread = |w: &[f64]| objective.evaluate(w);
    if let Some(outcome) = minimize_bounded(spread, bounds, leverage, &best, settings) {
      let again = settle(outcome.weights);
      if score(&again) >= floor - SOLVER_TOLERANCE {
        best = again;
      }
    }
  }

  let before = score(start);
  let after = score(&best);
  debug!(before, after, floor, "performance recovery finished");
  (after > before).then_some(best)
}

/// Solve Stage 2.
///
/// With a `rebalance` plan its bounds replace the default volatility-scaled
/// caps, its turnover limit joins the penalties and its trade cleanup runs on
/// the final vector. Solver failure or a collapsed cleanup falls back to the
/// Stage 1 weights. A solve that ends below the performance floor is retried
/// performance-first, so a missed floor is missed by as little as the limits
/// allow.
pub fn solve_diversified(
  model: &MarketModel<'_>,
  strategy: StrategyType,
  profile: &RiskProfileConfig,
  leverage: f64,
  peak: &PeakPerformance,
  rebalance: Option<&GradualRebalance>,
  settings: &SolverSettings,
) -> DiversifiedPortfolio {
  let n = model.n_assets();
  let mut notices = Vec::new();

  let (mut bounds, relaxed) = match rebalance {
    Some(plan) => (plan.bounds().clone(), plan.relaxed()),
    None => (diversification_bounds(model, profile), false),
  };
  if bounds.make_feasible(leverage) || relaxed {
    warn!(
      n,
      base = profile.max_position_base,
      "stage 2 caps cannot carry the leverage, relaxing"
    );
    notices.push(SolverNotice::BoundsRelaxed {
      stage: Stage::Diversification,
    });
  }

  let objective = DiversificationObjective::new(model, strategy, profile, peak.peak_performance, rebalance);
  let floor = objective.floor();
  let start = vec![leverage / n as f64; n];

  let cost = |w: &[f64]| objective.evaluate(w);
  let solved = match minimize_bounded(cost, &bounds, leverage, &start, settings) {
    Some(outcome) => {
      if !outcome.converged {
        warn!(%strategy, "stage 2 did not converge, using last iterate");
        notices.push(SolverNotice::Stage2NonConvergence);
      }
      Some(outcome.weights)
    }
    None => None,
  };

  let (mut weights, fell_back) =
    settle_weights(solved, &bounds, profile, leverage, peak, &mut notices);

  if !fell_back && model.performance(strategy, &weights) < floor - SOLVER_TOLERANCE {
    let recovered =
      recover_performance(&objective, &bounds, profile, leverage, &weights, settings);
    if let Some(recovered) = recovered {
      weights = recovered;
    }
  }

  if let Some(plan) = rebalance {
    let (finalized, notice) = plan.finalize(&weights, leverage);
    weights = finalized;
    notices.extend(notice);
  }

  let objective_value = model.performance(strategy, &weights);
  if objective_value < floor - SOLVER_TOLERANCE {
    warn!(
      floor,
      achieved = objective_value,
      "performance floor unreachable within the diversification limits"
    );
    notices.push(SolverNotice::PerformanceFloorMissed {
      floor,
      achieved: objective_value,
    });
  }

  debug!(%strategy, objective_value, floor, "stage 2 finished");

  DiversifiedPortfolio {
    weights,
    objective_value,
    performance_floor: floor,
    notices,
  }
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;

  use super::*;
  use crate::portfolio::metrics::effective_holdings;
  use crate::portfolio::metrics::gross_leverage;
  use crate::portfolio::metrics::meaningful_count;
  use crate::portfolio::peak::PeakBounds;
  use crate::portfolio::peak::solve_peak_performance;
  use crate::portfolio::testing::SyntheticMarket;
  use crate::portfolio::types::RiskTolerance;

  fn profile(tier: RiskTolerance) -> RiskProfileConfig {
    RiskProfileConfig::for_tier(tier, StrategyType::MaxSharpe)
  }

  fn run(
    market: &crate::portfolio::ReturnMatrix,
    strategy: StrategyType,
    tier: RiskTolerance,
  ) -> (PeakPerformance, DiversifiedPortfolio) {
    let model = MarketModel::new(market, 0.0, 252.0);
    let settings = SolverSettings::default();
    let peak = solve_peak_performance(&model, strategy, 1.0, &PeakBounds::default(), &settings);
    let div = solve_diversified(&model, strategy, &profile(tier), 1.0, &peak, None, &settings);
    (peak, div)
  }

  #[test]
  fn soft_count_tracks_hard_count_away_from_threshold() {
    let w = [0.2, 0.2, 0.001, 0.0, 0.1];
    assert_abs_diff_eq!(soft_meaningful_count(&w, 0.01), 3.0, epsilon = 1e-3);
    assert_eq!(meaningful_count(&w, 0.01), 3);
  }

  #[test]
  fn violation_is_zero_for_a_compliant_portfolio() {
    let market = SyntheticMarket::uniform(30, 0.08, 0.2, 0.3).build();
    let model = MarketModel::new(&market, 0.0, 252.0);
    let p = profile(RiskTolerance::Moderate);
    let eq = vec![1.0 / 30.0; 30];
    let peak = model.performance(StrategyType::MaxSharpe, &eq);
    let objective = DiversificationObjective::new(&model, StrategyType::MaxSharpe, &p, peak, None);

    assert_eq!(objective.violation(&eq), 0.0);
    assert_abs_diff_eq!(objective.evaluate(&eq), 1.0 / 30.0, epsilon = 1e-9);
  }

  #[test]
  fn violation_penalizes_concentration_breaches() {
    let market = SyntheticMarket::uniform(30, 0.08, 0.2, 0.3).build();
    let model = MarketModel::new(&market, 0.0, 252.0);
    let p = profile(RiskTolerance::Conservative);
    let mut w = vec![0.0; 30];
    w[..5].copy_from_slice(&[0.2; 5]);
    let objective = DiversificationObjective::new(&model, StrategyType::MaxSharpe, &p, 0.1, None);

    assert!(objective.violation(&w) > 0.1);
  }

  #[test]
  fn conservative_min_volatility_spreads_across_forty_assets() {
    let vols: Vec<f64> = (0..40).map(|i| 0.18 + 0.004 * (i % 10) as f64).collect();
    let market = SyntheticMarket::new(vec![0.07; 40], vols, vec![0.55; 40]).build();
    let (peak, div) = run(&market, StrategyType::MinVolatility, RiskTolerance::Conservative);

    assert_abs_diff_eq!(gross_leverage(&div.weights), 1.0, epsilon = 1e-3);
    assert!(meaningful_count(&div.weights, 0.01) >= 18);
    assert!(top_k_share(&div.weights, 3) <= 0.15 + 1e-6);
    assert!(div.weights.iter().all(|&w| (0.0..=0.06 + 1e-9).contains(&w)));
    assert!(div.objective_value >= div.performance_floor - SOLVER_TOLERANCE);
    assert!(effective_holdings(&div.weights) >= 18.0);
    assert!(peak.weights.iter().all(|&w| w <= 0.30 + 1e-9));
  }

  #[test]
  fn floor_uses_the_profile_ratio() {
    let market = SyntheticMarket::uniform(12, 0.10, 0.2, 0.3).build();
    let (peak, div) = run(&market, StrategyType::MaxSharpe, RiskTolerance::Moderate);

    assert_abs_diff_eq!(
      div.performance_floor,
      peak.peak_performance * 0.94,
      epsilon = 1e-12
    );
  }

  #[test]
  fn drawdown_tolerance_shapes_the_solution() {
    let market = SyntheticMarket::uniform(20, 0.08, 0.2, 0.3).build();
    let model = MarketModel::new(&market, 0.0, 252.0);
    let mut p = profile(RiskTolerance::Moderate);
    p.max_drawdown_tolerance = Some(1e-6);
    let eq = vec![0.05; 20];
    let peak = model.performance(StrategyType::MaxSharpe, &eq);
    let objective = DiversificationObjective::new(&model, StrategyType::MaxSharpe, &p, peak, None);

    assert!(model.max_drawdown(&eq) > 1e-6);
    assert!(objective.violation(&eq) > 0.0);
  }

  fn stage1(weights: Vec<f64>) -> PeakPerformance {
    PeakPerformance {
      weights,
      peak_performance: 0.1,
      converged: true,
      notices: Vec::new(),
    }
  }

  #[test]
  fn failed_solve_falls_back_to_stage1() {
    let bounds = PositionBounds::uniform(4, 0.0, 0.4);
    let peak = stage1(vec![0.3, 0.3, 0.3, 0.1]);
    let mut notices = Vec::new();
    let (w, fell_back) = settle_weights(
      None,
      &bounds,
      &profile(RiskTolerance::Moderate),
      1.0,
      &peak,
      &mut notices,
    );

    assert!(fell_back);
    assert_eq!(w, peak.weights);
    assert_eq!(notices, vec![SolverNotice::Stage2Fallback]);
    assert!(notices[0].degrades());
  }

  #[test]
  fn collapsed_cleanup_falls_back_to_stage1() {
    let bounds = PositionBounds::uniform(4, 0.0, 0.4);
    let peak = stage1(vec![0.3, 0.3, 0.3, 0.1]);
    let mut notices = Vec::new();
    let (w, fell_back) = settle_weights(
      Some(vec![0.001; 4]),
      &bounds,
      &profile(RiskTolerance::Moderate),
      1.0,
      &peak,
      &mut notices,
    );

    assert!(fell_back);
    assert_eq!(w, peak.weights);
    assert_eq!(
      notices,
      vec![SolverNotice::DegenerateRenormalization {
        stage: Stage::Diversification
      }]
    );
  }

  #[test]
  fn cleanup_zeroes_dust_and_restores_leverage() {
    let bounds = PositionBounds::uniform(4, 0.0, 0.5);
    let peak = stage1(vec![0.25; 4]);
    let mut notices = Vec::new();
    let (w, fell_back) = settle_weights(
      Some(vec![0.4, 0.3, 0.298, 0.002]),
      &bounds,
      &profile(RiskTolerance::Moderate),
      1.0,
      &peak,
      &mut notices,
    );

    assert!(!fell_back);
    assert!(notices.is_empty());
    assert_eq!(w[3], 0.0);
    assert_abs_diff_eq!(w.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
  }

  #[test]
  fn unreachable_floor_still_gets_the_best_performance_the_caps_allow() {
    let mut mus = vec![0.05; 30];
    mus[0] = 0.50;
    let market = SyntheticMarket::new(mus, vec![0.2; 30], vec![0.3_f64.sqrt(); 30]).build();
    let (_, div) = run(&market, StrategyType::MaxReturn, RiskTolerance::Conservative);

    // return is 0.05 + 0.45 * w0 and w0 is capped at 6%
    assert!(div.weights[0] >= 0.058, "w0 {}", div.weights[0]);
    assert!(div.weights[0] <= 0.06 + 1e-9);
    assert!(div.objective_value >= 0.0765, "achieved {}", div.objective_value);
    assert!(div
      .notices
      .iter()
      .any(|n| matches!(n, SolverNotice::PerformanceFloorMissed { .. })));
  }
}
