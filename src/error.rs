//! # Errors
//!
//! $$
//! \text{fatal} \Rightarrow \texttt{Err}(\cdot),\qquad \text{non-fatal} \Rightarrow \text{notice} + \text{degraded}
//! $$
//!
//! Fatal error taxonomy of the portfolio construction pipeline. Solver
//! non-convergence and degenerate renormalization are not errors: they are
//! absorbed and reported as [`crate::portfolio::SolverNotice`] values.

use thiserror::Error;

/// Fatal failures. No partial result is produced when one of these is returned.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PortfolioError {
  /// Unknown tolerance/strategy key or an out-of-range configuration knob.
  #[error("configuration error: {0}")]
  Configuration(String),

  /// Too few aligned periods or too few assets to optimize.
  #[error(
    "insufficient data: need at least {min_periods} periods and {min_assets} assets, got {periods} periods and {assets} assets"
  )]
  InsufficientData {
    periods: usize,
    assets: usize,
    min_periods: usize,
    min_assets: usize,
  },

  /// An auxiliary vector is not aligned to the return matrix columns.
  #[error("dimension mismatch for {what}: expected {expected}, got {actual}")]
  DimensionMismatch {
    what: &'static str,
    expected: usize,
    actual: usize,
  },

  /// Input values violate a data precondition (non-finite returns, duplicate ids, ...).
  #[error("invalid data: {0}")]
  InvalidData(String),
}

impl PortfolioError {
  pub(crate) fn unknown_key(kind: &str, value: &str) -> Self {
    Self::Configuration(format!("unknown {kind} '{value}'"))
  }
}

pub type Result<T> = std::result::Result<T, PortfolioError>;
