//! # Explainer
//!
//! $$
//! \mathrm{RC}_i = \frac{w_i (\Sigma \mathbf{w})_i}{\mathbf{w}^\top \Sigma \mathbf{w}},\qquad
//! \rho_{i,p} = \frac{(\Sigma \mathbf{w})_i}{\sigma_i \sigma_p}
//! $$
//!
//! Deterministic, read-only account of a final weight vector. Every number is
//! recomputed through the same [`MarketModel`] and limit helpers the solver
//! stages use, so the explanation cannot drift from the optimizer.

use serde::Serialize;

use super::data::ReturnMatrix;
use super::diversify::diversification_bounds;
use super::metrics::MarketModel;
use super::metrics::effective_holdings;
use super::metrics::gross_leverage;
use super::metrics::performance_floor;
use super::metrics::performance_retained;
use super::metrics::top_k_share;
use super::metrics::turnover;
use super::profile::RiskProfileConfig;
use super::types::OptimizationResult;
use super::types::SolverNotice;
use super::types::StrategyType;
use crate::error::Result;

/// Relative distance to a limit within which it counts as binding.
pub const BINDING_MARGIN: f64 = 0.05;
const TOP_HOLDINGS: usize = 5;

/// Inputs beyond the weights and returns.
#[derive(Clone, Debug)]
pub struct ExplainContext<'a> {
  pub strategy: StrategyType,
  pub risk_free: f64,
  pub periods_per_year: f64,
  pub profile: Option<&'a RiskProfileConfig>,
  pub peak_performance: Option<f64>,
  pub stage1_weights: Option<&'a [f64]>,
  pub current_weights: Option<&'a [f64]>,
  pub notices: &'a [SolverNotice],
}

impl<'a> ExplainContext<'a> {
  pub fn new(strategy: StrategyType, risk_free: f64, periods_per_year: f64) -> Self {
    Self {
      strategy,
      risk_free,
      periods_per_year,
      profile: None,
      peak_performance: None,
      stage1_weights: None,
      current_weights: None,
      notices: &[],
    }
  }

  pub fn with_profile(mut self, profile: &'a RiskProfileConfig, peak_performance: f64) -> Self {
    self.profile = Some(profile);
    self.peak_performance = Some(peak_performance);
    self
  }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExecutiveSummary {
  pub headline: String,
  pub strategy: StrategyType,
  pub leverage: f64,
  pub expected_return: f64,
  pub volatility: f64,
  pub sharpe: f64,
  pub max_drawdown: f64,
  pub effective_holdings: f64,
  pub top_3_concentration: f64,
  pub top_5_concentration: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HoldingRationale {
  pub asset_id: String,
  pub weight: f64,
  pub expected_return: f64,
  pub volatility: f64,
  pub sharpe: f64,
  pub correlation_to_portfolio: f64,
  pub risk_contribution: f64,
  pub reason: String,
}

/// Performance given up against diversification gained.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Tradeoff {
  pub score_label: &'static str,
  pub peak_performance: f64,
  pub achieved_performance: f64,
  pub performance_floor: Option<f64>,
  /// Share of the peak score kept.
  pub performance_retained: f64,
  pub peak_effective_holdings: Option<f64>,
  pub effective_holdings: f64,
  pub statement: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
  PositionCap,
  TopThreeConcentration,
  TopFiveConcentration,
  MinimumDiversification,
  RiskBudget,
  MaxDrawdown,
  PerformanceFloor,
  Turnover,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BindingConstraint {
  pub kind: ConstraintKind,
  /// Measured value; the largest one for per-asset limits.
  pub value: f64,
  pub limit: f64,
  /// `value / limit`, inverted for floors so that 1.0 means exactly at the limit.
  pub utilization: f64,
  pub assets: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RiskContributionEntry {
  pub asset_id: String,
  pub weight: f64,
  pub risk_contribution: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "level", rename_all = "snake_case")]
pub enum Confidence {
  Full,
  Reduced { reasons: Vec<String> },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Explanation {
  pub summary: ExecutiveSummary,
  pub top_holdings: Vec<HoldingRationale>,
  pub tradeoff: Option<Tradeoff>,
  pub binding_constraints: Vec<BindingConstraint>,
  pub risk_breakdown: Vec<RiskContributionEntry>,
  pub assumptions: Vec<String>,
  pub confidence: Confidence,
}

fn upper_binding(
  kind: ConstraintKind,
  value: f64,
  limit: f64,
  assets: Vec<String>,
) -> Option<BindingConstraint> {
  (limit > 0.0 && value >= limit * (1.0 - BINDING_MARGIN)).then(|| BindingConstraint {
    kind,
    value,
    limit,
    utilization: value / limit,
    assets,
  })
}

fn holding_reason(strategy: StrategyType, h: &HoldingRationale, median_vol: f64) -> String {
  let risk = if h.volatility < median_vol {
    "below-median volatility"
  } else {
    "above-median volatility"
  };
  let driver = match strategy {
    StrategyType::MaxSharpe => format!("stand-alone Sharpe {:.2}", h.sharpe),
    StrategyType::MinVolatility => format!("volatility {:.1}%", h.volatility * 100.0),
    StrategyType::MaxReturn => format!("expected return {:.1}%", h.expected_return * 100.0),
    StrategyType::RiskParity => format!("risk share {:.1}%", h.risk_contribution * 100.0),
  };
  format!(
    "{driver}, {risk}, correlation {:.2} to the portfolio",
    h.correlation_to_portfolio
  )
}

/// Explain `weights` without re-optimizing.
pub fn explain(weights: &[f64], returns: &ReturnMatrix, ctx: &ExplainContext<'_>) -> Result<Explanation> {
  returns.check_aligned("weights", weights.len())?;
  if let Some(stage1) = ctx.stage1_weights {
    returns.check_aligned("stage 1 weights", stage1.len())?;
  }
  if let Some(current) = ctx.current_weights {
    returns.check_aligned("current weights", current.len())?;
  }

  let n = returns.n_assets();
  let ids = returns.asset_ids();
  let model = MarketModel::new(returns, ctx.risk_free, ctx.periods_per_year);
  let leverage = gross_leverage(weights);
  let rc = model.risk_contributions(weights);
  let corr = model.correlation_to_portfolio(weights);
  let holdings = effective_holdings(weights);

  let summary = ExecutiveSummary {
    headline: format!(
      "{} portfolio over {:.1} effective holdings: expected return {:.1}%, volatility {:.1}%, Sharpe {:.2}",
      ctx.strategy,
      holdings,
      model.expected_return(weights) * 100.0,
      model.volatility(weights) * 100.0,
      model.sharpe(weights)
    ),
    strategy: ctx.strategy,
    leverage,
    expected_return: model.expected_return(weights),
    volatility: model.volatility(weights),
    sharpe: model.sharpe(weights),
    max_drawdown: model.max_drawdown(weights),
    effective_holdings: holdings,
    top_3_concentration: top_k_share(weights, 3),
    top_5_concentration: top_k_share(weights, 5),
  };

  let mut order: Vec<usize> = (0..n).filter(|&i| weights[i].abs() > 1e-12).collect();
  order.sort_by(|&a, &b| weights[b].abs().total_cmp(&weights[a].abs()).then(a.cmp(&b)));

  let median_vol = model.median_volatility();
  let top_holdings = order
    .iter()
    .take(TOP_HOLDINGS)
    .map(|&i| {
      let mut h = HoldingRationale {
        asset_id: ids[i].clone(),
        weight: weights[i],
        expected_return: model.asset_returns()[i],
        volatility: model.asset_volatilities()[i],
        sharpe: model.asset_sharpe(i),
        correlation_to_portfolio: corr[i],
        risk_contribution: rc[i],
        reason: String::new(),
      };
      h.reason = holding_reason(ctx.strategy, &h, median_vol);
      h
    })
    .collect();

  let achieved = model.performance(ctx.strategy, weights);
  let tradeoff = ctx.peak_performance.map(|peak| {
    let floor = ctx
      .profile
      .map(|p| performance_floor(peak, p.acceptable_performance_ratio));
    let retained = performance_retained(peak, achieved);
    let peak_holdings = ctx.stage1_weights.map(effective_holdings);
    let statement = match peak_holdings {
      Some(before) => format!(
        "kept {:.1}% of the peak {} ({:.4} vs {:.4}) while moving from {:.1} to {:.1} effective holdings",
        retained * 100.0,
        ctx.strategy.score_label(),
        achieved,
        peak,
        before,
        holdings
      ),
      None => format!(
        "kept {:.1}% of the peak {} ({:.4} vs {:.4}) at {:.1} effective holdings",
        retained * 100.0,
        ctx.strategy.score_label(),
        achieved,
        peak,
        holdings
      ),
    };
    Tradeoff {
      score_label: ctx.strategy.score_label(),
      peak_performance: peak,
      achieved_performance: achieved,
      performance_floor: floor,
      performance_retained: retained,
      peak_effective_holdings: peak_holdings,
      effective_holdings: holdings,
      statement,
    }
  });

  let binding_constraints = match ctx.profile {
    Some(profile) => binding_constraints(&model, weights, profile, ctx, achieved),
    None => Vec::new(),
  };

  let mut risk_breakdown: Vec<RiskContributionEntry> = order
    .iter()
    .map(|&i| RiskContributionEntry {
      asset_id: ids[i].clone(),
      weight: weights[i],
      risk_contribution: rc[i],
    })
    .collect();
  risk_breakdown.sort_by(|a, b| b.risk_contribution.total_cmp(&a.risk_contribution));

  let assumptions = vec![
    format!(
      "moments estimated from {} historical periods, annualized with {} periods per year",
      returns.n_periods(),
      ctx.periods_per_year
    ),
    format!("risk-free rate {:.2}% per year", ctx.risk_free * 100.0),
    format!("leverage is the sum of absolute weights, here {leverage:.3}"),
    "drawdown replays the weights over the full historical return path".to_string(),
    "no transaction costs, taxes or liquidity limits are modelled".to_string(),
  ];

  let reasons: Vec<String> = ctx
    .notices
    .iter()
    .filter(|notice| notice.degrades())
    .map(|notice| notice.to_string())
    .collect();
  let confidence = if reasons.is_empty() {
    Confidence::Full
  } else {
    Confidence::Reduced { reasons }
  };

  Ok(Explanation {
    summary,
    top_holdings,
    tradeoff,
    binding_constraints,
    risk_breakdown,
    assumptions,
    confidence,
  })
}

fn binding_constraints(
  model: &MarketModel<'_>,
  weights: &[f64],
  profile: &RiskProfileConfig,
  ctx: &ExplainContext<'_>,
  achieved: f64,
) -> Vec<BindingConstraint> {
  let n = model.n_assets();
  let ids = model.returns().asset_ids();
  let leverage = gross_leverage(weights);
  let mut out = Vec::new();

  let mut caps = diversification_bounds(model, profile);
  caps.make_feasible(leverage);
  let at_cap: Vec<usize> = (0..n)
    .filter(|&i| caps.upper[i] > 0.0 && weights[i].abs() >= caps.upper[i] * (1.0 - BINDING_MARGIN))
    .collect();
  if let Some(&worst) = at_cap
    .iter()
    .max_by(|&&a, &&b| (weights[a].abs() / caps.upper[a]).total_cmp(&(weights[b].abs() / caps.upper[b])))
  {
    out.push(BindingConstraint {
      kind: ConstraintKind::PositionCap,
      value: weights[worst].abs(),
      limit: caps.upper[worst],
      utilization: weights[worst].abs() / caps.upper[worst],
      assets: at_cap.iter().map(|&i| ids[i].clone()).collect(),
    });
  }

  out.extend(upper_binding(
    ConstraintKind::TopThreeConcentration,
    top_k_share(weights, 3),
    profile.effective_top_limit(3, n),
    Vec::new(),
  ));
  out.extend(upper_binding(
    ConstraintKind::TopFiveConcentration,
    top_k_share(weights, 5),
    profile.effective_top_limit(5, n),
    Vec::new(),
  ));

  let min_positions = profile.effective_min_diversification(n) as f64;
  let meaningful = weights
    .iter()
    .filter(|w| w.abs() >= profile.meaningful_threshold)
    .count() as f64;
  if meaningful <= min_positions * (1.0 + BINDING_MARGIN) {
    out.push(BindingConstraint {
      kind: ConstraintKind::MinimumDiversification,
      value: meaningful,
      limit: min_positions,
      utilization: if meaningful > 0.0 { min_positions / meaningful } else { f64::INFINITY },
      assets: Vec::new(),
    });
  }

  let budget = profile.effective_risk_budget(n);
  let rc = model.risk_contributions(weights);
  let heavy: Vec<usize> = (0..n).filter(|&i| rc[i] >= budget * (1.0 - BINDING_MARGIN)).collect();
  if !heavy.is_empty() {
    let largest = heavy.iter().map(|&i| rc[i]).fold(f64::MIN, f64::max);
    out.extend(upper_binding(
      ConstraintKind::RiskBudget,
      largest,
      budget,
      heavy.iter().map(|&i| ids[i].clone()).collect(),
    ));
  }

  if let Some(limit) = profile.max_drawdown_tolerance {
    out.extend(upper_binding(
      ConstraintKind::MaxDrawdown,
      model.max_drawdown(weights),
      limit,
      Vec::new(),
    ));
  }

  if let Some(peak) = ctx.peak_performance {
    let floor = performance_floor(peak, profile.acceptable_performance_ratio);
    let slack = achieved - floor;
    if slack <= BINDING_MARGIN * floor.abs().max(1e-12) {
      out.push(BindingConstraint {
        kind: ConstraintKind::PerformanceFloor,
        value: achieved,
        limit: floor,
        utilization: 1.0 - slack / floor.abs().max(1e-12),
        assets: Vec::new(),
      });
    }
  }

  if let Some(current) = ctx.current_weights {
    out.extend(upper_binding(
      ConstraintKind::Turnover,
      turnover(weights, current),
      profile.max_turnover_per_rebalance,
      Vec::new(),
    ));
  }

  out
}

/// Explain a finished optimization with the context it carries.
pub fn explain_result(
  result: &OptimizationResult,
  returns: &ReturnMatrix,
  risk_free: f64,
  periods_per_year: f64,
) -> Result<Explanation> {
  let ctx = ExplainContext {
    stage1_weights: Some(result.stage1_weights.as_slice()),
    current_weights: result.current_weights.as_deref(),
    notices: &result.notices,
    ..ExplainContext::new(result.strategy, risk_free, periods_per_year)
      .with_profile(&result.profile, result.peak_performance)
  };
  explain(&result.weights, returns, &ctx)
}
