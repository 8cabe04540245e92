//! # Portfolio Data
//!
//! $$
//! R \in \mathbb{R}^{T \times N},\qquad R_{t,i} = \text{return of asset } i \text{ in period } t
//! $$
//!
//! Return matrix container and helpers to build one from raw series.

use std::collections::HashSet;

use ndarray::Array2;
use ndarray::ArrayView1;
use ndarray::Axis;

use crate::error::PortfolioError;
use crate::error::Result;

/// Minimum number of aligned periods required before any optimization.
pub const MIN_PERIODS: usize = 30;
/// Minimum number of assets required before any optimization.
pub const MIN_ASSETS: usize = 2;

/// Log returns of a close-price series. Steps touching a non-positive price are skipped.
pub fn log_returns_series(closes: &[f64]) -> Vec<f64> {
  closes
    .windows(2)
    .filter(|pair| pair[0] > 0.0 && pair[1] > 0.0)
    .map(|pair| (pair[1] / pair[0]).ln())
    .collect()
}

/// Keep the most recent common tail of every series.
pub fn align_return_series(series: &[Vec<f64>]) -> Vec<Vec<f64>> {
  let tail = series.iter().map(Vec::len).min().unwrap_or(0);
  series.iter().map(|s| s[s.len() - tail..].to_vec()).collect()
}

/// Date-aligned per-period returns, one column per asset.
///
/// Immutable once built. Construction enforces the minimum history length,
/// the minimum universe size, finiteness of every value and unique asset ids.
#[derive(Clone, Debug)]
pub struct ReturnMatrix {
  asset_ids: Vec<String>,
  returns: Array2<f64>,
}

impl ReturnMatrix {
  /// Build from a `periods x assets` array.
  pub fn new(asset_ids: Vec<String>, returns: Array2<f64>) -> Result<Self> {
    let (periods, assets) = returns.dim();
    if periods < MIN_PERIODS || assets < MIN_ASSETS {
      return Err(PortfolioError::InsufficientData {
        periods,
        assets,
        min_periods: MIN_PERIODS,
        min_assets: MIN_ASSETS,
      });
    }

    if asset_ids.len() != assets {
      return Err(PortfolioError::DimensionMismatch {
        what: "asset ids",
        expected: assets,
        actual: asset_ids.len(),
      });
    }

    let mut seen = HashSet::with_capacity(assets);
    for id in &asset_ids {
      if !seen.insert(id.as_str()) {
        return Err(PortfolioError::InvalidData(format!(
          "duplicate asset id '{id}'"
        )));
      }
    }

    for (i, column) in returns.axis_iter(Axis(1)).enumerate() {
      if let Some(t) = column.iter().position(|v| !v.is_finite()) {
        return Err(PortfolioError::InvalidData(format!(
          "non-finite return for asset '{}' at period {t}",
          asset_ids[i]
        )));
      }
    }

    Ok(Self { asset_ids, returns })
  }

  /// Build from equally long per-asset columns.
  pub fn from_columns(asset_ids: Vec<String>, columns: &[Vec<f64>]) -> Result<Self> {
    let periods = columns.first().map(|c| c.len()).unwrap_or(0);
    if let Some(bad) = columns.iter().find(|c| c.len() != periods) {
      return Err(PortfolioError::DimensionMismatch {
        what: "return column length",
        expected: periods,
        actual: bad.len(),
      });
    }

    let returns = Array2::from_shape_fn((periods, columns.len()), |(t, i)| columns[i][t]);
    Self::new(asset_ids, returns)
  }

  /// Build from per-asset series of differing lengths, keeping the common tail.
  pub fn from_series(asset_ids: Vec<String>, series: &[Vec<f64>]) -> Result<Self> {
    Self::from_columns(asset_ids, &align_return_series(series))
  }

  pub fn asset_ids(&self) -> &[String] {
    &self.asset_ids
  }

  pub fn returns(&self) -> &Array2<f64> {
    &self.returns
  }

  pub fn n_assets(&self) -> usize {
    self.returns.ncols()
  }

  pub fn n_periods(&self) -> usize {
    self.returns.nrows()
  }

  /// Return path of a single asset.
  pub fn column(&self, asset: usize) -> ArrayView1<'_, f64> {
    self.returns.column(asset)
  }

  /// Check that a weight-like vector is aligned to the asset columns.
  pub(crate) fn check_aligned(&self, what: &'static str, len: usize) -> Result<()> {
    if len != self.n_assets() {
      return Err(PortfolioError::DimensionMismatch {
        what,
        expected: self.n_assets(),
        actual: len,
      });
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn ids(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("A{i}")).collect()
  }

  #[test]
  fn rejects_short_history() {
    let cols = vec![vec![0.01; 29], vec![0.02; 29]];
    let err = ReturnMatrix::from_columns(ids(2), &cols).unwrap_err();

    assert!(matches!(
      err,
      PortfolioError::InsufficientData { periods: 29, .. }
    ));
  }

  #[test]
  fn rejects_single_asset() {
    let cols = vec![vec![0.01; 40]];
    let err = ReturnMatrix::from_columns(ids(1), &cols).unwrap_err();

    assert!(matches!(err, PortfolioError::InsufficientData { assets: 1, .. }));
  }

  #[test]
  fn rejects_non_finite_values() {
    let mut bad = vec![0.01; 40];
    bad[7] = f64::NAN;
    let cols = vec![vec![0.01; 40], bad];
    let err = ReturnMatrix::from_columns(ids(2), &cols).unwrap_err();

    assert!(matches!(err, PortfolioError::InvalidData(_)));
  }

  #[test]
  fn rejects_duplicate_ids() {
    let cols = vec![vec![0.01; 40], vec![0.02; 40]];
    let err = ReturnMatrix::from_columns(vec!["X".into(), "X".into()], &cols).unwrap_err();

    assert!(matches!(err, PortfolioError::InvalidData(_)));
  }

  #[test]
  fn from_series_keeps_common_tail() {
    let long: Vec<f64> = (0..50).map(|i| i as f64 * 1e-3).collect();
    let short: Vec<f64> = (0..35).map(|i| -(i as f64) * 1e-3).collect();
    let m = ReturnMatrix::from_series(ids(2), &[long.clone(), short]).unwrap();

    assert_eq!(m.n_periods(), 35);
    assert_eq!(m.column(0)[0], long[15]);
  }

  #[test]
  fn log_returns_skip_non_positive_prices() {
    let r = log_returns_series(&[100.0, 110.0, 0.0, 121.0]);
    assert_eq!(r.len(), 1);
    assert!((r[0] - (1.1f64).ln()).abs() < 1e-12);
  }
}
