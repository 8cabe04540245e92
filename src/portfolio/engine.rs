//! # Portfolio Engine
//!
//! $$
//! \mathbf{w}^\* = \operatorname{Diversify}\big(\operatorname{Peak}(\mu, \Sigma),\ \mathcal{C}(\text{tier})\big)
//! $$
//!
//! High-level orchestration API: profile translation, the two solver stages,
//! gradual rebalancing, validation and explanation in one call.

use rayon::prelude::*;
use serde::Serialize;
use tracing::debug;
use tracing::info;

use super::data::ReturnMatrix;
use super::diversify::diversification_bounds;
use super::diversify::solve_diversified;
use super::explain::Explanation;
use super::explain::explain_result;
use super::metrics::MarketModel;
use super::metrics::gross_leverage;
use super::peak::PeakBounds;
use super::peak::solve_peak_performance;
use super::profile::RiskProfileConfig;
use super::rebalance::GradualRebalance;
use super::rebalance::has_holdings;
use super::solver::SolverSettings;
use super::types::OptimizationResult;
use super::types::RiskTolerance;
use super::types::StrategyType;
use super::validator::ValidationReport;
use super::validator::validate_weights;
use crate::error::PortfolioError;
use crate::error::Result;

/// Runtime configuration for [`PortfolioEngine`].
#[derive(Clone, Debug)]
pub struct PortfolioEngineConfig {
  /// Objective optimized by Stage 1 and defended by Stage 2.
  pub strategy: StrategyType,
  /// Tier the constraint bundle is derived from.
  pub risk_tolerance: RiskTolerance,
  /// Annual risk-free rate used in Sharpe computations.
  pub risk_free: f64,
  /// Target sum of absolute weights.
  pub target_leverage: f64,
  /// Periods per year used to annualize moments.
  pub periods_per_year: f64,
  /// Loose Stage 1 bounds.
  pub peak_bounds: PeakBounds,
  /// Iteration and accuracy settings shared by both stages.
  pub solver: SolverSettings,
  /// Hand-built constraint bundle replacing the tier defaults.
  pub profile_override: Option<RiskProfileConfig>,
}

impl Default for PortfolioEngineConfig {
  fn default() -> Self {
    Self {
      strategy: StrategyType::MaxSharpe,
      risk_tolerance: RiskTolerance::Moderate,
      risk_free: 0.0,
      target_leverage: 1.0,
      periods_per_year: 252.0,
      peak_bounds: PeakBounds::default(),
      solver: SolverSettings::default(),
      profile_override: None,
    }
  }
}

impl PortfolioEngineConfig {
  /// Default configuration for string keys, e.g. `("max_sharpe", "moderate")`.
  pub fn from_keys(strategy: &str, risk_tolerance: &str) -> Result<Self> {
    Ok(Self {
      strategy: strategy.parse()?,
      risk_tolerance: risk_tolerance.parse()?,
      ..Self::default()
    })
  }

  pub fn validate(&self) -> Result<()> {
    let invalid = |msg: String| -> Result<()> { Err(PortfolioError::Configuration(msg)) };

    if !(self.target_leverage.is_finite() && self.target_leverage > 0.0) {
      return invalid(format!("target_leverage must be positive, got {}", self.target_leverage));
    }
    if !(self.periods_per_year.is_finite() && self.periods_per_year > 0.0) {
      return invalid(format!("periods_per_year must be positive, got {}", self.periods_per_year));
    }
    if !self.risk_free.is_finite() {
      return invalid(format!("risk_free must be finite, got {}", self.risk_free));
    }
    let PeakBounds {
      max_position,
      min_position,
    } = self.peak_bounds;
    if !(max_position > 0.0 && min_position >= 0.0 && min_position < max_position) {
      return invalid(format!(
        "peak bounds need 0 <= min_position < max_position, got [{min_position}, {max_position}]"
      ));
    }
    if self.solver.max_iters == 0 || self.solver.lbfgs_memory == 0 || !(self.solver.fd_step > 0.0) {
      return invalid("solver settings need positive max_iters, lbfgs_memory and fd_step".to_string());
    }
    if let Some(profile) = &self.profile_override {
      profile.validate()?;
    }
    Ok(())
  }
}

/// Everything a presentation layer needs from one call.
#[derive(Clone, Debug, Serialize)]
pub struct PortfolioReport {
  pub result: OptimizationResult,
  pub validation: ValidationReport,
  pub explanation: Explanation,
}

/// Single entry-point engine for two-stage portfolio construction.
#[derive(Clone, Debug)]
pub struct PortfolioEngine {
  config: PortfolioEngineConfig,
}

impl PortfolioEngine {
  /// Construct a new engine with explicit configuration.
  pub fn new(config: PortfolioEngineConfig) -> Self {
    Self { config }
  }

  /// Borrow engine configuration.
  pub fn config(&self) -> &PortfolioEngineConfig {
    &self.config
  }

  /// Constraint bundle the next solve will run under.
  pub fn profile(&self) -> Result<RiskProfileConfig> {
    let profile = match &self.config.profile_override {
      Some(profile) => profile.clone(),
      None => RiskProfileConfig::for_tier(self.config.risk_tolerance, self.config.strategy),
    };
    profile.validate()?;
    Ok(profile)
  }

  /// Same engine for another tier. A profile override is dropped.
  pub fn with_tolerance(&self, risk_tolerance: RiskTolerance) -> Self {
    Self::new(PortfolioEngineConfig {
      risk_tolerance,
      profile_override: None,
      ..self.config.clone()
    })
  }

  /// Run both stages and return the final weights with diagnostics.
  ///
  /// `current` holds the existing portfolio as fractions of equity. When it
  /// holds anything the solve becomes a gradual rebalance; a current gross
  /// exposure different from the target leverage is rescaled to it first.
  pub fn optimize(&self, returns: &ReturnMatrix, current: Option<&[f64]>) -> Result<OptimizationResult> {
    self.config.validate()?;
    let profile = self.profile()?;
    let leverage = self.config.target_leverage;
    let strategy = self.config.strategy;

    let current = match current {
      Some(c) => Some(self.prepare_current(returns, c)?),
      None => None,
    };

    let model = MarketModel::new(returns, self.config.risk_free, self.config.periods_per_year);
    let peak = solve_peak_performance(
      &model,
      strategy,
      leverage,
      &self.config.peak_bounds,
      &self.config.solver,
    );

    let rebalance = current
      .as_deref()
      .filter(|c| has_holdings(Some(*c)))
      .map(|c| GradualRebalance::new(c, &diversification_bounds(&model, &profile), &profile));

    let diversified = solve_diversified(
      &model,
      strategy,
      &profile,
      leverage,
      &peak,
      rebalance.as_ref(),
      &self.config.solver,
    );

    let mut notices = peak.notices.clone();
    notices.extend(diversified.notices);
    let degraded = notices.iter().any(|notice| notice.degrades());
    let diagnostics = model.diagnostics(
      &diversified.weights,
      profile.meaningful_threshold,
      current.as_deref(),
    );

    info!(
      %strategy,
      tolerance = %profile.risk_tolerance,
      assets = returns.n_assets(),
      effective_holdings = diagnostics.effective_holdings,
      objective = diversified.objective_value,
      peak = peak.peak_performance,
      degraded,
      "portfolio constructed"
    );

    Ok(OptimizationResult {
      asset_ids: returns.asset_ids().to_vec(),
      weights: diversified.weights,
      leverage,
      strategy,
      risk_tolerance: profile.risk_tolerance,
      objective_value: diversified.objective_value,
      peak_performance: peak.peak_performance,
      performance_floor: diversified.performance_floor,
      stage1_weights: peak.weights,
      current_weights: current,
      profile,
      diagnostics,
      notices,
      degraded,
    })
  }

  /// Optimize, then validate and explain the result.
  pub fn construct(&self, returns: &ReturnMatrix, current: Option<&[f64]>) -> Result<PortfolioReport> {
    let result = self.optimize(returns, current)?;
    let validation = validate_weights(
      &result.weights,
      &result.asset_ids,
      returns,
      Some(&result.profile),
      self.config.periods_per_year,
    )?;
    let explanation = explain_result(
      &result,
      returns,
      self.config.risk_free,
      self.config.periods_per_year,
    )?;

    Ok(PortfolioReport {
      result,
      validation,
      explanation,
    })
  }

  /// Run [`Self::construct`] once per tier in parallel. Reports keep the order of `tiers`.
  pub fn construct_tiers(
    &self,
    returns: &ReturnMatrix,
    tiers: &[RiskTolerance],
    current: Option<&[f64]>,
  ) -> Result<Vec<PortfolioReport>> {
    tiers
      .par_iter()
      .map(|&tier| self.with_tolerance(tier).construct(returns, current))
      .collect()
  }

  fn prepare_current(&self, returns: &ReturnMatrix, current: &[f64]) -> Result<Vec<f64>> {
    returns.check_aligned("current weights", current.len())?;
    if let Some(i) = current.iter().position(|w| !w.is_finite() || *w < 0.0) {
      return Err(PortfolioError::InvalidData(format!(
        "current weight at index {i} must be finite and non-negative, got {}",
        current[i]
      )));
    }

    let gross = gross_leverage(current);
    let leverage = self.config.target_leverage;
    if gross > 1e-12 && (gross - leverage).abs() > 1e-9 {
      debug!(gross, leverage, "rescaling current portfolio to the target leverage");
      return Ok(current.iter().map(|w| w * leverage / gross).collect());
    }
    Ok(current.to_vec())
  }
}
