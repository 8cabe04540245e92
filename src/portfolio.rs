//! # Portfolio
//!
//! $$
//! \min_{\mathbf{w}} \sum_i (w_i/L)^2 \quad\text{s.t.}\quad
//! \mathcal{P}(\mathbf{w}) \ge \mathcal{P}^\* - |\mathcal{P}^\*|(1-\rho),\ \sum_i |w_i| = L
//! $$
//!
//! Two-stage, diversification-first portfolio construction: find the peak of
//! the chosen objective, then the most diversified weights that keep most of it.

pub mod data;
pub mod diversify;
pub mod engine;
pub mod explain;
pub mod metrics;
pub mod peak;
pub mod profile;
pub mod rebalance;
pub mod solver;
#[cfg(test)]
mod testing;
pub mod types;
pub mod validator;

pub use data::MIN_ASSETS;
pub use data::MIN_PERIODS;
pub use data::ReturnMatrix;
pub use data::align_return_series;
pub use data::log_returns_series;
pub use diversify::DiversifiedPortfolio;
pub use diversify::solve_diversified;
pub use engine::PortfolioEngine;
pub use engine::PortfolioEngineConfig;
pub use engine::PortfolioReport;
pub use explain::BindingConstraint;
pub use explain::Confidence;
pub use explain::ConstraintKind;
pub use explain::ExplainContext;
pub use explain::Explanation;
pub use explain::explain;
pub use explain::explain_result;
pub use metrics::MarketModel;
pub use metrics::effective_holdings;
pub use metrics::herfindahl_regularization;
pub use metrics::turnover;
pub use peak::PeakBounds;
pub use peak::PeakPerformance;
pub use peak::solve_peak_performance;
pub use profile::RiskProfileConfig;
pub use profile::translate;
pub use rebalance::GradualRebalance;
pub use rebalance::trade_quantities;
pub use solver::SolverSettings;
pub use types::OptimizationResult;
pub use types::PortfolioDiagnostics;
pub use types::RiskTolerance;
pub use types::SolverNotice;
pub use types::Stage;
pub use types::StrategyType;
pub use validator::Severity;
pub use validator::ValidationReport;
pub use validator::Violation;
pub use validator::WisdomRule;
pub use validator::validate_weights;
