//! # Wisdom Validator
//!
//! $$
//! \text{score} = \max\Big(0,\ 100 - \sum_{v \in V} \text{penalty}(v)\Big)
//! $$
//!
//! Read-only realism checks on a final weight vector. Each rule is evaluated
//! independently against shares of gross exposure and reports at most one
//! violation naming every offending asset.

use impl_new_derive::ImplNew;
use serde::Serialize;

use super::data::ReturnMatrix;
use super::metrics::MarketModel;
use super::metrics::gross_leverage;
use super::metrics::top_k_share;
use super::profile::RiskProfileConfig;
use crate::error::PortfolioError;
use crate::error::Result;

const MAX_SINGLE_POSITION: f64 = 0.25;
const MAX_TOP_3: f64 = 0.50;
const MEANINGFUL_WEIGHT: f64 = 0.01;
const MAX_TINY_POSITIONS: usize = 3;
const HIGH_VOLATILITY: f64 = 0.60;
const MAX_HIGH_VOLATILITY_WEIGHT: f64 = 0.10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
  Low,
  Medium,
  High,
}

impl Severity {
  /// Score deduction of one violation.
  pub fn penalty(&self) -> u32 {
    match self {
      Severity::Low => 5,
      Severity::Medium => 10,
      Severity::High => 20,
    }
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WisdomRule {
  SinglePositionLimit,
  TopThreeConcentration,
  MinimumDiversification,
  TinyPositions,
  HighVolatilityExposure,
}

impl WisdomRule {
  pub const ALL: [WisdomRule; 5] = [
    WisdomRule::SinglePositionLimit,
    WisdomRule::TopThreeConcentration,
    WisdomRule::MinimumDiversification,
    WisdomRule::TinyPositions,
    WisdomRule::HighVolatilityExposure,
  ];

  pub fn id(&self) -> &'static str {
    match self {
      WisdomRule::SinglePositionLimit => "single_position_limit",
      WisdomRule::TopThreeConcentration => "top_3_concentration",
      WisdomRule::MinimumDiversification => "minimum_diversification",
      WisdomRule::TinyPositions => "tiny_positions",
      WisdomRule::HighVolatilityExposure => "high_volatility_exposure",
    }
  }

  pub fn severity(&self) -> Severity {
    match self {
      WisdomRule::SinglePositionLimit => Severity::High,
      WisdomRule::TinyPositions => Severity::Low,
      _ => Severity::Medium,
    }
  }
}

#[derive(ImplNew, Clone, Debug, PartialEq, Serialize)]
pub struct Violation {
  pub rule: WisdomRule,
  pub severity: Severity,
  pub message: String,
  /// Offending asset ids, empty for portfolio-level rules.
  pub assets: Vec<String>,
  /// Measured value that broke the rule.
  pub value: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ValidationReport {
  pub violations: Vec<Violation>,
  /// 100 minus the deductions of every violation, floored at 0.
  pub score: u32,
}

impl ValidationReport {
  fn from_violations(violations: Vec<Violation>) -> Self {
    let deducted: u32 = violations.iter().map(|v| v.severity.penalty()).sum();
    Self {
      score: 100u32.saturating_sub(deducted),
      violations,
    }
  }

  pub fn is_clean(&self) -> bool {
    self.violations.is_empty()
  }

  pub fn violated(&self, rule: WisdomRule) -> Option<&Violation> {
    self.violations.iter().find(|v| v.rule == rule)
  }
}

fn offenders(ids: &[String], shares: &[f64], pred: impl Fn(usize, f64) -> bool) -> Vec<String> {
  shares
    .iter()
    .enumerate()
    .filter(|(i, s)| pred(*i, **s))
    .map(|(i, _)| ids[i].clone())
    .collect()
}

/// Run every rule against `weights`. The weight vector is never modified.
///
/// The minimum-diversification rule needs a configured minimum and is skipped
/// when `profile` is `None`.
pub fn validate_weights(
  weights: &[f64],
  asset_ids: &[String],
  returns: &ReturnMatrix,
  profile: Option<&RiskProfileConfig>,
  periods_per_year: f64,
) -> Result<ValidationReport> {
  let n = returns.n_assets();
  returns.check_aligned("weights", weights.len())?;
  if asset_ids.len() != n {
    return Err(PortfolioError::DimensionMismatch {
      what: "asset ids",
      expected: n,
      actual: asset_ids.len(),
    });
  }

  let gross = gross_leverage(weights);
  let shares: Vec<f64> = if gross > 1e-15 {
    weights.iter().map(|w| w.abs() / gross).collect()
  } else {
    vec![0.0; n]
  };
  let mut violations = Vec::new();

  let oversized = offenders(asset_ids, &shares, |_, s| s > MAX_SINGLE_POSITION);
  if !oversized.is_empty() {
    let largest = shares.iter().fold(0.0_f64, |m, s| m.max(*s));
    violations.push(Violation::new(
      WisdomRule::SinglePositionLimit,
      WisdomRule::SinglePositionLimit.severity(),
      format!(
        "{} position(s) above {:.0}% of exposure, largest {:.1}%",
        oversized.len(),
        MAX_SINGLE_POSITION * 100.0,
        largest * 100.0
      ),
      oversized,
      largest,
    ));
  }

  let top_3 = top_k_share(weights, 3);
  if top_3 > MAX_TOP_3 {
    violations.push(Violation::new(
      WisdomRule::TopThreeConcentration,
      WisdomRule::TopThreeConcentration.severity(),
      format!(
        "top 3 positions hold {:.1}% of exposure, limit {:.0}%",
        top_3 * 100.0,
        MAX_TOP_3 * 100.0
      ),
      Vec::new(),
      top_3,
    ));
  }

  if let Some(profile) = profile {
    let min_positions = profile.min_diversification.min(n);
    let threshold = profile.meaningful_threshold;
    let meaningful = shares.iter().filter(|s| **s >= threshold).count();
    if meaningful < min_positions {
      violations.push(Violation::new(
        WisdomRule::MinimumDiversification,
        WisdomRule::MinimumDiversification.severity(),
        format!("{meaningful} meaningful positions, minimum {min_positions}"),
        Vec::new(),
        meaningful as f64,
      ));
    }
  }

  let tiny = offenders(asset_ids, &shares, |_, s| s > 0.0 && s < MEANINGFUL_WEIGHT);
  if tiny.len() > MAX_TINY_POSITIONS {
    let count = tiny.len();
    violations.push(Violation::new(
      WisdomRule::TinyPositions,
      WisdomRule::TinyPositions.severity(),
      format!(
        "{count} positions below {:.0}% of exposure",
        MEANINGFUL_WEIGHT * 100.0
      ),
      tiny,
      count as f64,
    ));
  }

  let model = MarketModel::new(returns, 0.0, periods_per_year);
  let vols = model.asset_volatilities();
  let volatile = offenders(asset_ids, &shares, |i, s| {
    vols[i] > HIGH_VOLATILITY && s > MAX_HIGH_VOLATILITY_WEIGHT
  });
  if !volatile.is_empty() {
    let worst = (0..n)
      .filter(|&i| vols[i] > HIGH_VOLATILITY && shares[i] > MAX_HIGH_VOLATILITY_WEIGHT)
      .map(|i| vols[i])
      .fold(0.0_f64, f64::max);
    violations.push(Violation::new(
      WisdomRule::HighVolatilityExposure,
      WisdomRule::HighVolatilityExposure.severity(),
      format!(
        "{} asset(s) above {:.0}% volatility held above {:.0}%",
        volatile.len(),
        HIGH_VOLATILITY * 100.0,
        MAX_HIGH_VOLATILITY_WEIGHT * 100.0
      ),
      volatile,
      worst,
    ));
  }

  Ok(ValidationReport::from_violations(violations))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::portfolio::testing::SyntheticMarket;
  use crate::portfolio::types::RiskTolerance;
  use crate::portfolio::types::StrategyType;

  fn check(weights: &[f64], returns: &ReturnMatrix, profile: Option<&RiskProfileConfig>) -> ValidationReport {
    validate_weights(weights, returns.asset_ids(), returns, profile, 252.0).unwrap()
  }

  #[test]
  fn equal_weights_over_a_broad_universe_are_clean() {
    let market = SyntheticMarket::uniform(20, 0.08, 0.2, 0.3).build();
    let report = check(&[0.05; 20], &market, None);

    assert!(report.is_clean());
    assert_eq!(report.score, 100);
  }

  #[test]
  fn concentrated_portfolio_breaks_position_and_top_three_rules() {
    let market = SyntheticMarket::uniform(12, 0.08, 0.2, 0.3).build();
    let mut w = vec![0.0; 12];
    w[0] = 0.4;
    w[1] = 0.3;
    w[2] = 0.1;
    w[3] = 0.1;
    w[4] = 0.1;
    let aggressive = RiskProfileConfig::for_tier(RiskTolerance::Aggressive, StrategyType::MaxSharpe);
    let report = check(&w, &market, Some(&aggressive));

    let single = report.violated(WisdomRule::SinglePositionLimit).unwrap();
    assert_eq!(single.assets, vec!["A0".to_string(), "A1".to_string()]);
    assert_eq!(single.severity, Severity::High);
    assert!(report.violated(WisdomRule::TopThreeConcentration).is_some());
    assert!(report.violated(WisdomRule::MinimumDiversification).is_some());
    // high 20 + medium 10 + medium 10
    assert_eq!(report.score, 60);
  }

  #[test]
  fn rules_use_shares_of_gross_exposure() {
    let market = SyntheticMarket::uniform(8, 0.08, 0.2, 0.3).build();
    // 2x leverage, every share 12.5%
    let report = check(&[0.25; 8], &market, None);

    assert!(report.violated(WisdomRule::SinglePositionLimit).is_none());
    assert!(report.violated(WisdomRule::TopThreeConcentration).is_none());
  }

  #[test]
  fn minimum_diversification_follows_the_profile() {
    let market = SyntheticMarket::uniform(30, 0.08, 0.2, 0.3).build();
    let mut w = vec![0.0; 30];
    w[..15].copy_from_slice(&[1.0 / 15.0; 15]);
    let conservative = RiskProfileConfig::for_tier(RiskTolerance::Conservative, StrategyType::MaxSharpe);
    let aggressive = RiskProfileConfig::for_tier(RiskTolerance::Aggressive, StrategyType::MaxSharpe);

    assert!(check(&w, &market, Some(&conservative))
      .violated(WisdomRule::MinimumDiversification)
      .is_some());
    assert!(check(&w, &market, Some(&aggressive)).is_clean());
  }

  #[test]
  fn minimum_diversification_needs_a_profile() {
    let market = SyntheticMarket::uniform(12, 0.08, 0.2, 0.3).build();
    let mut w = vec![0.0; 12];
    w[..5].copy_from_slice(&[0.2; 5]);

    assert!(check(&w, &market, None)
      .violated(WisdomRule::MinimumDiversification)
      .is_none());
  }

  #[test]
  fn tiny_positions_are_flagged_past_three() {
    let market = SyntheticMarket::uniform(16, 0.08, 0.2, 0.3).build();
    let mut w = vec![0.08; 16];
    for x in w.iter_mut().take(4) {
      *x = 0.005;
    }
    let total: f64 = w.iter().sum();
    w.iter_mut().for_each(|x| *x /= total);
    let report = check(&w, &market, None);

    let tiny = report.violated(WisdomRule::TinyPositions).unwrap();
    assert_eq!(tiny.assets.len(), 4);
    assert_eq!(report.score, 95);
  }

  #[test]
  fn volatile_assets_held_heavily_are_flagged() {
    let mut vols = vec![0.2; 12];
    vols[5] = 0.8;
    let market = SyntheticMarket::new(vec![0.08; 12], vols, vec![0.4; 12]).build();
    let mut w = vec![0.08; 12];
    w[5] = 0.12;
    let report = check(&w, &market, None);

    let v = report.violated(WisdomRule::HighVolatilityExposure).unwrap();
    assert_eq!(v.assets, vec!["A5".to_string()]);
    assert!(v.value > 0.6);
  }

  #[test]
  fn score_never_drops_below_zero() {
    let report = ValidationReport::from_violations(
      (0..6)
        .map(|_| {
          Violation::new(
            WisdomRule::SinglePositionLimit,
            Severity::High,
            String::new(),
            Vec::new(),
            1.0,
          )
        })
        .collect(),
    );
    assert_eq!(report.score, 0);
  }

  #[test]
  fn misaligned_inputs_are_rejected() {
    let market = SyntheticMarket::uniform(4, 0.08, 0.2, 0.3).build();
    assert!(matches!(
      validate_weights(&[0.5, 0.5], market.asset_ids(), &market, None, 252.0),
      Err(PortfolioError::DimensionMismatch { .. })
    ));
  }
}
