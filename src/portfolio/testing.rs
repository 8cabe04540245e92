//! Deterministic synthetic markets with exactly controlled moments.
//!
//! Each asset return is `mu/P + sigma/sqrt(P) * (beta * f_t + sqrt(1 - beta^2) * e_{i,t})`
//! where `f` and every `e_i` are mutually orthogonal, zero-mean, unit sample
//! variance sinusoids. Sample means, volatilities and correlations are therefore
//! exact up to floating point, and the fast oscillation keeps drawdowns small.

use std::f64::consts::PI;

use ndarray::Array2;

use super::data::ReturnMatrix;

const PERIODS_PER_YEAR: f64 = 252.0;

#[derive(Clone, Debug)]
pub(crate) struct SyntheticMarket {
  mus: Vec<f64>,
  vols: Vec<f64>,
  loadings: Vec<f64>,
  periods: usize,
}

impl SyntheticMarket {
  /// `n` identical assets with pairwise correlation `rho`.
  pub fn uniform(n: usize, mu: f64, vol: f64, rho: f64) -> Self {
    Self::new(vec![mu; n], vec![vol; n], vec![rho.max(0.0).sqrt(); n])
  }

  /// Per-asset annual drift, annual volatility and common-factor loading.
  pub fn new(mus: Vec<f64>, vols: Vec<f64>, loadings: Vec<f64>) -> Self {
    Self {
      mus,
      vols,
      loadings,
      periods: 252,
    }
  }

  pub fn periods(mut self, periods: usize) -> Self {
    self.periods = periods;
    self
  }

  fn basis(&self, freq: usize, cosine: bool, t: usize) -> f64 {
    let big_t = self.periods as f64;
    let phase = 2.0 * PI * freq as f64 * t as f64 / big_t;
    let unit = (2.0 * (big_t - 1.0) / big_t).sqrt();
    if cosine {
      unit * phase.cos()
    } else {
      unit * phase.sin()
    }
  }

  pub fn build(&self) -> ReturnMatrix {
    let n = self.mus.len();
    let top = self.periods / 2 - 1;
    assert!(n < top, "too many assets for {} periods", self.periods);

    let data = Array2::from_shape_fn((self.periods, n), |(t, i)| {
      let beta = self.loadings[i].clamp(-1.0, 1.0);
      let shock = beta * self.basis(top, true, t)
        + (1.0 - beta * beta).sqrt() * self.basis(top - i, false, t);
      self.mus[i] / PERIODS_PER_YEAR + self.vols[i] / PERIODS_PER_YEAR.sqrt() * shock
    });
    let ids = (0..n).map(|i| format!("A{i}")).collect();

    ReturnMatrix::new(ids, data).expect("synthetic market is valid")
  }
}
