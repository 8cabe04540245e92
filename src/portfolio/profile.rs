//! # Risk Profile
//!
//! $$
//! (\text{tolerance}, \text{strategy}) \mapsto \mathcal{C} = \{\bar w, c_3, c_5, n_{\min}, \dots\}
//! $$
//!
//! Translates a risk tolerance tier into the constraint bundle both solver
//! stages and the validator read. The strategy is accepted but does not alter
//! the bundle: diversification floors are independent of the objective.

use std::str::FromStr;

use serde::Serialize;

use super::types::RiskTolerance;
use super::types::StrategyType;
use crate::error::PortfolioError;
use crate::error::Result;

/// Every constraint knob of one solve. Built once per call and read-only afterwards.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RiskProfileConfig {
  /// Tier this bundle was derived from.
  pub risk_tolerance: RiskTolerance,
  /// Base single-position cap before volatility scaling.
  pub max_position_base: f64,
  /// Cap on the three largest positions, as a share of leverage.
  pub max_top_3_concentration: f64,
  /// Cap on the five largest positions, as a share of leverage.
  pub max_top_5_concentration: f64,
  /// Minimum count of meaningful positions.
  pub min_diversification: usize,
  /// Count of meaningful positions below which the sparsity penalty applies.
  pub target_holdings: usize,
  /// Cap on each asset's normalized risk contribution.
  pub risk_budget_per_asset: f64,
  /// Cap on the replayed historical maximum drawdown.
  pub max_drawdown_tolerance: Option<f64>,
  /// Cap on `sum(|new - current|) / 2` per rebalance.
  pub max_turnover_per_rebalance: f64,
  /// Cap on the change of any single position per rebalance.
  pub max_position_change: f64,
  /// Trades smaller than this are snapped back to the current weight.
  pub min_trade_threshold: f64,
  /// Fraction of the Stage 1 peak that Stage 2 must preserve.
  pub acceptable_performance_ratio: f64,
  /// Weight at which a position counts as meaningful.
  pub meaningful_threshold: f64,
}

impl RiskProfileConfig {
  /// Built-in bundle for a tier. `strategy` is deliberately ignored.
  pub fn for_tier(risk_tolerance: RiskTolerance, _strategy: StrategyType) -> Self {
    match risk_tolerance {
      RiskTolerance::Conservative => Self {
        risk_tolerance,
        max_position_base: 0.06,
        max_top_3_concentration: 0.15,
        max_top_5_concentration: 0.23,
        min_diversification: 18,
        target_holdings: 25,
        risk_budget_per_asset: 0.08,
        max_drawdown_tolerance: Some(0.25),
        max_turnover_per_rebalance: 0.20,
        max_position_change: 0.05,
        min_trade_threshold: 0.005,
        acceptable_performance_ratio: 0.90,
        meaningful_threshold: 0.01,
      },
      RiskTolerance::Moderate => Self {
        risk_tolerance,
        max_position_base: 0.10,
        max_top_3_concentration: 0.25,
        max_top_5_concentration: 0.38,
        min_diversification: 14,
        target_holdings: 18,
        risk_budget_per_asset: 0.12,
        max_drawdown_tolerance: Some(0.35),
        max_turnover_per_rebalance: 0.30,
        max_position_change: 0.08,
        min_trade_threshold: 0.005,
        acceptable_performance_ratio: 0.94,
        meaningful_threshold: 0.01,
      },
      RiskTolerance::Aggressive => Self {
        risk_tolerance,
        max_position_base: 0.15,
        max_top_3_concentration: 0.35,
        max_top_5_concentration: 0.55,
        min_diversification: 10,
        target_holdings: 12,
        risk_budget_per_asset: 0.20,
        max_drawdown_tolerance: None,
        max_turnover_per_rebalance: 0.40,
        max_position_change: 0.12,
        min_trade_threshold: 0.0025,
        acceptable_performance_ratio: 0.97,
        meaningful_threshold: 0.01,
      },
    }
  }

  /// Check every knob is finite and in range.
  pub fn validate(&self) -> Result<()> {
    let unit_fractions = [
      ("max_position_base", self.max_position_base),
      ("max_top_3_concentration", self.max_top_3_concentration),
      ("max_top_5_concentration", self.max_top_5_concentration),
      ("risk_budget_per_asset", self.risk_budget_per_asset),
      ("max_turnover_per_rebalance", self.max_turnover_per_rebalance),
      ("max_position_change", self.max_position_change),
      ("acceptable_performance_ratio", self.acceptable_performance_ratio),
      ("meaningful_threshold", self.meaningful_threshold),
    ];
    for (name, value) in unit_fractions {
      if !value.is_finite() || value <= 0.0 || value > 1.0 {
        return Err(PortfolioError::Configuration(format!(
          "{name} must be in (0, 1], got {value}"
        )));
      }
    }

    if !self.min_trade_threshold.is_finite() || !(0.0..1.0).contains(&self.min_trade_threshold) {
      return Err(PortfolioError::Configuration(format!(
        "min_trade_threshold must be in [0, 1), got {}",
        self.min_trade_threshold
      )));
    }

    if let Some(dd) = self.max_drawdown_tolerance {
      if !dd.is_finite() || dd <= 0.0 || dd > 1.0 {
        return Err(PortfolioError::Configuration(format!(
          "max_drawdown_tolerance must be in (0, 1], got {dd}"
        )));
      }
    }

    if self.min_diversification == 0 || self.target_holdings == 0 {
      return Err(PortfolioError::Configuration(
        "min_diversification and target_holdings must be at least 1".to_string(),
      ));
    }

    if self.max_top_3_concentration > self.max_top_5_concentration {
      return Err(PortfolioError::Configuration(format!(
        "max_top_3_concentration ({}) exceeds max_top_5_concentration ({})",
        self.max_top_3_concentration, self.max_top_5_concentration
      )));
    }

    Ok(())
  }

  /// Meaningful-count floor, capped at the universe size.
  pub fn effective_min_diversification(&self, n_assets: usize) -> usize {
    self.min_diversification.min(n_assets)
  }

  /// Sparsity target, capped at the universe size.
  pub fn effective_target_holdings(&self, n_assets: usize) -> usize {
    self.target_holdings.min(n_assets)
  }

  /// Top-k cap as a share of leverage, raised to `k / n` so equal weight is admissible.
  pub fn effective_top_limit(&self, k: usize, n_assets: usize) -> f64 {
    let limit = if k <= 3 {
      self.max_top_3_concentration
    } else {
      self.max_top_5_concentration
    };
    limit.max(k.min(n_assets) as f64 / n_assets.max(1) as f64)
  }

  /// Per-asset risk budget, raised to `1.25 / n` for small universes.
  pub fn effective_risk_budget(&self, n_assets: usize) -> f64 {
    self
      .risk_budget_per_asset
      .max(1.25 / n_assets.max(1) as f64)
      .min(1.0)
  }
}

/// Translate string keys into a validated constraint bundle.
pub fn translate(risk_tolerance: &str, strategy: &str) -> Result<RiskProfileConfig> {
  let tier = RiskTolerance::from_str(risk_tolerance)?;
  let strategy = StrategyType::from_str(strategy)?;
  let config = RiskProfileConfig::for_tier(tier, strategy);
  config.validate()?;
  Ok(config)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn caps_increase_and_floors_decrease_with_tolerance() {
    let tiers: Vec<RiskProfileConfig> = RiskTolerance::ALL
      .iter()
      .map(|&t| RiskProfileConfig::for_tier(t, StrategyType::MaxSharpe))
      .collect();

    for pair in tiers.windows(2) {
      assert!(pair[0].max_position_base < pair[1].max_position_base);
      assert!(pair[0].min_diversification > pair[1].min_diversification);
      assert!(pair[0].max_top_3_concentration < pair[1].max_top_3_concentration);
    }
  }

  #[test]
  fn conservative_and_aggressive_anchor_values() {
    let c = translate("conservative", "max_sharpe").unwrap();
    assert_eq!(c.max_position_base, 0.06);
    assert_eq!(c.min_diversification, 18);
    assert_eq!(c.max_top_3_concentration, 0.15);

    let a = translate("aggressive", "max_sharpe").unwrap();
    assert_eq!(a.max_position_base, 0.15);
    assert_eq!(a.min_diversification, 10);
    assert_eq!(a.max_top_3_concentration, 0.35);
  }

  #[test]
  fn strategy_does_not_change_the_bundle() {
    for tier in RiskTolerance::ALL {
      let base = RiskProfileConfig::for_tier(tier, StrategyType::MaxSharpe);
      for strategy in StrategyType::ALL {
        assert_eq!(RiskProfileConfig::for_tier(tier, strategy), base);
      }
    }
  }

  #[test]
  fn unknown_keys_are_rejected() {
    assert!(matches!(
      translate("yolo", "max_sharpe"),
      Err(PortfolioError::Configuration(_))
    ));
    assert!(matches!(
      translate("moderate", "momentum"),
      Err(PortfolioError::Configuration(_))
    ));
  }

  #[test]
  fn validate_rejects_out_of_range_knobs() {
    let mut c = RiskProfileConfig::for_tier(RiskTolerance::Moderate, StrategyType::MaxSharpe);
    c.acceptable_performance_ratio = 1.2;
    assert!(c.validate().is_err());

    let mut c = RiskProfileConfig::for_tier(RiskTolerance::Moderate, StrategyType::MaxSharpe);
    c.max_top_3_concentration = 0.5;
    c.max_top_5_concentration = 0.4;
    assert!(c.validate().is_err());

    let mut c = RiskProfileConfig::for_tier(RiskTolerance::Moderate, StrategyType::MaxSharpe);
    c.max_drawdown_tolerance = Some(f64::NAN);
    assert!(c.validate().is_err());
  }

  #[test]
  fn effective_limits_admit_equal_weight_in_small_universes() {
    let c = RiskProfileConfig::for_tier(RiskTolerance::Conservative, StrategyType::MaxSharpe);

    assert_eq!(c.effective_min_diversification(5), 5);
    assert!((c.effective_top_limit(3, 5) - 0.6).abs() < 1e-12);
    assert!((c.effective_top_limit(3, 40) - 0.15).abs() < 1e-12);
    assert!(c.effective_risk_budget(5) >= 0.2);
  }
}
