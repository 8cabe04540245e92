//! # Portfolio Types
//!
//! $$
//! \mathbf{w}^\*=\arg\min_{\mathbf{w}} \sum_i w_i^2 \quad\text{s.t.}\quad \mathcal{P}(\mathbf{w}) \ge \rho\,\mathcal{P}^\*
//! $$
//!
//! Shared enums and result containers for two-stage portfolio construction.

use std::fmt::Display;
use std::str::FromStr;

use serde::Serialize;

use super::metrics::performance_retained;
use super::profile::RiskProfileConfig;
use crate::error::PortfolioError;

/// Performance objective optimized in Stage 1 and defended as a floor in Stage 2.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyType {
  /// Maximize `(annualized return - risk_free) / annualized volatility`.
  MaxSharpe,
  /// Minimize annualized portfolio volatility.
  MinVolatility,
  /// Maximize annualized weighted mean return.
  MaxReturn,
  /// Equalize risk contributions.
  RiskParity,
}

impl StrategyType {
  pub const ALL: [StrategyType; 4] = [
    StrategyType::MaxSharpe,
    StrategyType::MinVolatility,
    StrategyType::MaxReturn,
    StrategyType::RiskParity,
  ];

  /// Name of the performance score reported for this strategy.
  pub fn score_label(&self) -> &'static str {
    match self {
      StrategyType::MaxSharpe => "sharpe ratio",
      StrategyType::MinVolatility => "negative annualized volatility",
      StrategyType::MaxReturn => "annualized return",
      StrategyType::RiskParity => "negative risk-parity error",
    }
  }
}

impl FromStr for StrategyType {
  type Err = PortfolioError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().replace('-', "_").as_str() {
      "max_sharpe" | "sharpe" | "maxsharpe" => Ok(Self::MaxSharpe),
      "min_volatility" | "min_vol" | "minvol" | "min_variance" => Ok(Self::MinVolatility),
      "max_return" | "return" | "maxreturn" => Ok(Self::MaxReturn),
      "risk_parity" | "riskparity" | "erc" => Ok(Self::RiskParity),
      _ => Err(PortfolioError::unknown_key("strategy", s)),
    }
  }
}

impl Display for StrategyType {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      StrategyType::MaxSharpe => write!(f, "max_sharpe"),
      StrategyType::MinVolatility => write!(f, "min_volatility"),
      StrategyType::MaxReturn => write!(f, "max_return"),
      StrategyType::RiskParity => write!(f, "risk_parity"),
    }
  }
}

/// Risk tolerance tier chosen by the investor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTolerance {
  Conservative,
  Moderate,
  Aggressive,
}

impl RiskTolerance {
  pub const ALL: [RiskTolerance; 3] = [
    RiskTolerance::Conservative,
    RiskTolerance::Moderate,
    RiskTolerance::Aggressive,
  ];
}

impl FromStr for RiskTolerance {
  type Err = PortfolioError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "conservative" | "low" => Ok(Self::Conservative),
      "moderate" | "medium" | "balanced" => Ok(Self::Moderate),
      "aggressive" | "high" => Ok(Self::Aggressive),
      _ => Err(PortfolioError::unknown_key("risk tolerance", s)),
    }
  }
}

impl Display for RiskTolerance {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      RiskTolerance::Conservative => write!(f, "conservative"),
      RiskTolerance::Moderate => write!(f, "moderate"),
      RiskTolerance::Aggressive => write!(f, "aggressive"),
    }
  }
}

/// Pipeline stage a notice originates from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
  PeakPerformance,
  Diversification,
}

/// Non-fatal condition absorbed during a solve.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SolverNotice {
  /// Stage 1 hit its iteration cap; the best iterate was used.
  Stage1NonConvergence,
  /// Stage 2 hit its iteration cap; the best iterate was used.
  Stage2NonConvergence,
  /// Stage 2 failed entirely and the Stage 1 weights were returned.
  Stage2Fallback,
  /// Post-solve cleanup collapsed the weights; the prior weights were kept.
  DegenerateRenormalization { stage: Stage },
  /// Position caps could not carry the target leverage and were scaled up.
  BoundsRelaxed { stage: Stage },
  /// The diversification bounds made the performance floor unreachable.
  PerformanceFloorMissed { floor: f64, achieved: f64 },
  /// Proposed trades were scaled back to respect the turnover limit.
  TurnoverScaled { factor: f64 },
}

impl SolverNotice {
  /// Whether this notice lowers confidence in the result.
  pub fn degrades(&self) -> bool {
    !matches!(self, SolverNotice::TurnoverScaled { .. })
  }
}

impl Display for Stage {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Stage::PeakPerformance => write!(f, "peak-performance stage"),
      Stage::Diversification => write!(f, "diversification stage"),
    }
  }
}

impl Display for SolverNotice {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      SolverNotice::Stage1NonConvergence => {
        write!(f, "peak-performance stage hit its iteration cap")
      }
      SolverNotice::Stage2NonConvergence => {
        write!(f, "diversification stage hit its iteration cap")
      }
      SolverNotice::Stage2Fallback => {
        write!(f, "diversification solve failed, peak-performance weights returned")
      }
      SolverNotice::DegenerateRenormalization { stage } => {
        write!(f, "{stage} cleanup collapsed the weights, prior weights kept")
      }
      SolverNotice::BoundsRelaxed { stage } => {
        write!(f, "{stage} position caps were raised to carry the leverage")
      }
      SolverNotice::PerformanceFloorMissed { floor, achieved } => write!(
        f,
        "performance floor {floor:.4} not reached, achieved {achieved:.4}"
      ),
      SolverNotice::TurnoverScaled { factor } => {
        write!(f, "trades scaled by {factor:.3} to respect the turnover limit")
      }
    }
  }
}

/// Concentration and risk diagnostics of a weight vector.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PortfolioDiagnostics {
  /// `1 / sum((w_i / L)^2)`.
  pub effective_holdings: f64,
  /// Positions at or above the meaningful threshold.
  pub meaningful_positions: usize,
  /// Largest absolute weight.
  pub max_position: f64,
  /// Share of gross exposure in the three largest positions.
  pub top_3_concentration: f64,
  /// Share of gross exposure in the five largest positions.
  pub top_5_concentration: f64,
  /// Historical maximum drawdown of the weight vector replayed over the return path.
  pub max_drawdown: f64,
  /// `sum(|new - current|) / 2` when a current portfolio was supplied.
  pub turnover: Option<f64>,
  /// Annualized expected return.
  pub expected_return: f64,
  /// Annualized volatility.
  pub volatility: f64,
  /// Sharpe ratio against the configured risk-free rate.
  pub sharpe: f64,
}

/// Output of the two-stage optimizer. Read-only once produced.
#[derive(Clone, Debug, Serialize)]
pub struct OptimizationResult {
  /// Asset identifiers aligned to `weights`.
  pub asset_ids: Vec<String>,
  /// Final target weights.
  pub weights: Vec<f64>,
  /// Target gross leverage the weights sum to in absolute value.
  pub leverage: f64,
  pub strategy: StrategyType,
  pub risk_tolerance: RiskTolerance,
  /// Performance score achieved by `weights`.
  pub objective_value: f64,
  /// Performance score of the Stage 1 weights.
  pub peak_performance: f64,
  /// Minimum score Stage 2 had to preserve.
  pub performance_floor: f64,
  /// Stage 1 weights, kept for explanation and fallback disclosure.
  pub stage1_weights: Vec<f64>,
  /// Current portfolio when the solve was a gradual rebalance.
  pub current_weights: Option<Vec<f64>>,
  /// Constraint bundle the solve ran under.
  pub profile: RiskProfileConfig,
  pub diagnostics: PortfolioDiagnostics,
  /// Non-fatal conditions absorbed during the solve.
  pub notices: Vec<SolverNotice>,
  /// True when any notice reduces confidence in the result.
  pub degraded: bool,
}

impl OptimizationResult {
  /// Weight of an asset by id.
  pub fn weight_of(&self, asset_id: &str) -> Option<f64> {
    self
      .asset_ids
      .iter()
      .position(|id| id == asset_id)
      .map(|i| self.weights[i])
  }

  /// Share of the peak score kept by the final weights.
  pub fn performance_ratio(&self) -> f64 {
    performance_retained(self.peak_performance, self.objective_value)
  }
}
