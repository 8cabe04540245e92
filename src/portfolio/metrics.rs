//! # Portfolio Metrics
//!
//! $$
//! \sigma_p^2 = \mathbf{w}^\top \Sigma \mathbf{w},\qquad
//! RC_i = \frac{w_i (\Sigma \mathbf{w})_i}{\sigma_p^2},\qquad
//! N_{\text{eff}} = \Big(\sum_i (w_i/L)^2\Big)^{-1}
//! $$
//!
//! Annualized market statistics and every portfolio-level measure the
//! solvers, the validator and the explainer share. Keeping them in one place
//! means an explanation reports exactly the numbers the solver optimized.

use ndarray::Array1;
use ndarray::Array2;
use ndarray::ArrayView1;
use ndarray::Axis;

use super::data::ReturnMatrix;
use super::types::PortfolioDiagnostics;
use super::types::StrategyType;

/// Relative magnitude of the Herfindahl regularization against the objective scale.
pub const REGULARIZATION_STRENGTH: f64 = 0.01;

/// Annualized first and second moments of a return matrix.
#[derive(Clone, Debug)]
pub struct MarketModel<'a> {
  returns: &'a ReturnMatrix,
  mean: Array1<f64>,
  cov: Array2<f64>,
  vol: Array1<f64>,
  risk_free: f64,
  periods_per_year: f64,
}

impl<'a> MarketModel<'a> {
  pub fn new(returns: &'a ReturnMatrix, risk_free: f64, periods_per_year: f64) -> Self {
    let data = returns.returns();
    let n_periods = data.nrows();
    let period_mean = data
      .mean_axis(Axis(0))
      .unwrap_or_else(|| Array1::zeros(data.ncols()));

    let centered = data - &period_mean;
    let denom = n_periods.saturating_sub(1).max(1) as f64;
    let cov = centered.t().dot(&centered) * (periods_per_year / denom);
    let vol = cov.diag().mapv(|v| v.max(0.0).sqrt());
    let mean = period_mean * periods_per_year;

    Self {
      returns,
      mean,
      cov,
      vol,
      risk_free,
      periods_per_year,
    }
  }

  pub fn returns(&self) -> &ReturnMatrix {
    self.returns
  }

  pub fn n_assets(&self) -> usize {
    self.mean.len()
  }

  pub fn risk_free(&self) -> f64 {
    self.risk_free
  }

  pub fn periods_per_year(&self) -> f64 {
    self.periods_per_year
  }

  /// Annualized mean return per asset.
  pub fn asset_returns(&self) -> &Array1<f64> {
    &self.mean
  }

  /// Annualized volatility per asset.
  pub fn asset_volatilities(&self) -> &Array1<f64> {
    &self.vol
  }

  /// Annualized covariance matrix.
  pub fn covariance(&self) -> &Array2<f64> {
    &self.cov
  }

  pub fn median_volatility(&self) -> f64 {
    let mut v = self.vol.to_vec();
    v.sort_by(|a, b| a.total_cmp(b));
    let n = v.len();
    if n == 0 {
      0.0
    } else if n % 2 == 1 {
      v[n / 2]
    } else {
      0.5 * (v[n / 2 - 1] + v[n / 2])
    }
  }

  /// Stand-alone Sharpe ratio of one asset.
  pub fn asset_sharpe(&self, asset: usize) -> f64 {
    let vol = self.vol[asset];
    if vol > 1e-12 {
      (self.mean[asset] - self.risk_free) / vol
    } else {
      0.0
    }
  }

  pub fn expected_return(&self, w: &[f64]) -> f64 {
    ArrayView1::from(w).dot(&self.mean)
  }

  fn cov_times(&self, w: &[f64]) -> Array1<f64> {
    self.cov.dot(&ArrayView1::from(w))
  }

  pub fn variance(&self, w: &[f64]) -> f64 {
    ArrayView1::from(w).dot(&self.cov_times(w)).max(0.0)
  }

  pub fn volatility(&self, w: &[f64]) -> f64 {
    self.variance(w).sqrt()
  }

  pub fn sharpe(&self, w: &[f64]) -> f64 {
    let vol = self.volatility(w);
    if vol > 1e-12 {
      (self.expected_return(w) - self.risk_free) / vol
    } else {
      0.0
    }
  }

  /// Normalized risk contributions; they sum to one for a non-zero portfolio.
  pub fn risk_contributions(&self, w: &[f64]) -> Vec<f64> {
    let sigma_w = self.cov_times(w);
    let var: f64 = w.iter().zip(sigma_w.iter()).map(|(a, b)| a * b).sum();
    if var < 1e-30 {
      return vec![0.0; w.len()];
    }
    w.iter()
      .zip(sigma_w.iter())
      .map(|(wi, swi)| wi * swi / var)
      .collect()
  }

  /// Sum of squared deviations of risk contributions from the equal-risk target.
  pub fn risk_parity_error(&self, w: &[f64]) -> f64 {
    let n = w.len();
    if n == 0 {
      return 0.0;
    }
    let target = 1.0 / n as f64;
    self
      .risk_contributions(w)
      .iter()
      .map(|rc| (rc - target).powi(2))
      .sum()
  }

  /// Correlation of each asset with the portfolio return.
  pub fn correlation_to_portfolio(&self, w: &[f64]) -> Vec<f64> {
    let sigma_w = self.cov_times(w);
    let port_vol = self.volatility(w);
    sigma_w
      .iter()
      .zip(self.vol.iter())
      .map(|(cov_ip, vol_i)| {
        let denom = vol_i * port_vol;
        if denom > 1e-15 {
          (cov_ip / denom).clamp(-1.0, 1.0)
        } else {
          0.0
        }
      })
      .collect()
  }

  /// Per-period portfolio returns for a fixed weight vector.
  pub fn portfolio_path(&self, w: &[f64]) -> Array1<f64> {
    self.returns.returns().dot(&ArrayView1::from(w))
  }

  /// Maximum peak-to-trough loss of the weight vector replayed over the full path.
  pub fn max_drawdown(&self, w: &[f64]) -> f64 {
    let mut equity = 1.0_f64;
    let mut peak = 1.0_f64;
    let mut mdd = 0.0_f64;
    for r in self.portfolio_path(w).iter() {
      equity *= (1.0 + r).max(0.0);
      peak = peak.max(equity);
      if peak > 0.0 {
        mdd = mdd.max((peak - equity) / peak);
      }
    }
    mdd
  }

  /// Higher-is-better performance score of `strategy`.
  pub fn performance(&self, strategy: StrategyType, w: &[f64]) -> f64 {
    match strategy {
      StrategyType::MaxSharpe => self.sharpe(w),
      StrategyType::MinVolatility => -self.volatility(w),
      StrategyType::MaxReturn => self.expected_return(w),
      StrategyType::RiskParity => -self.risk_parity_error(w),
    }
  }

  pub fn diagnostics(
    &self,
    w: &[f64],
    meaningful_threshold: f64,
    current: Option<&[f64]>,
  ) -> PortfolioDiagnostics {
    PortfolioDiagnostics {
      effective_holdings: effective_holdings(w),
      meaningful_positions: meaningful_count(w, meaningful_threshold),
      max_position: w.iter().fold(0.0_f64, |m, x| m.max(x.abs())),
      top_3_concentration: top_k_share(w, 3),
      top_5_concentration: top_k_share(w, 5),
      max_drawdown: self.max_drawdown(w),
      turnover: current.map(|c| turnover(w, c)),
      expected_return: self.expected_return(w),
      volatility: self.volatility(w),
      sharpe: self.sharpe(w),
    }
  }
}

/// Sum of absolute weights.
pub fn gross_leverage(w: &[f64]) -> f64 {
  w.iter().map(|x| x.abs()).sum()
}

/// Herfindahl index of exposure shares, `sum((w_i / L)^2)` with `L = sum(|w|)`.
pub fn concentration(w: &[f64]) -> f64 {
  let gross = gross_leverage(w);
  if gross < 1e-15 {
    return 1.0;
  }
  w.iter().map(|x| (x / gross).powi(2)).sum()
}

/// `1 / concentration`; equals `N` for `N` equal positions at any leverage.
pub fn effective_holdings(w: &[f64]) -> f64 {
  let gross = gross_leverage(w);
  if gross < 1e-15 {
    return 0.0;
  }
  1.0 / concentration(w)
}

/// Share of gross exposure held in the `k` largest positions.
pub fn top_k_share(w: &[f64], k: usize) -> f64 {
  let gross = gross_leverage(w);
  if gross < 1e-15 {
    return 0.0;
  }
  let mut abs: Vec<f64> = w.iter().map(|x| x.abs()).collect();
  abs.sort_by(|a, b| b.total_cmp(a));
  abs.iter().take(k).sum::<f64>() / gross
}

/// Positions whose absolute weight reaches `threshold`.
pub fn meaningful_count(w: &[f64], threshold: f64) -> usize {
  w.iter().filter(|x| x.abs() >= threshold).count()
}

/// One-way turnover `sum(|new - current|) / 2`.
pub fn turnover(new: &[f64], current: &[f64]) -> f64 {
  new
    .iter()
    .zip(current.iter())
    .map(|(a, b)| (a - b).abs())
    .sum::<f64>()
    / 2.0
}

/// Minimum score the diversification stage must keep.
///
/// Equals `peak * ratio` for a positive peak and stays below a negative peak.
pub fn performance_floor(peak: f64, ratio: f64) -> f64 {
  peak - peak.abs() * (1.0 - ratio)
}

/// Fraction of the peak score kept by `achieved`, `1 - (peak - achieved) / |peak|`.
///
/// Matches `achieved / peak` for a positive peak and is comparable against the
/// same ratio used by [`performance_floor`] when the peak is negative.
pub fn performance_retained(peak: f64, achieved: f64) -> f64 {
  if peak.abs() < 1e-12 {
    return 1.0;
  }
  1.0 - (peak - achieved) / peak.abs()
}

/// Small concentration reward subtracted from a minimized objective.
///
/// Its magnitude never exceeds `REGULARIZATION_STRENGTH * |objective_scale|`,
/// because the exposure Herfindahl index lies in `[1/n, 1]`. It breaks the
/// symmetry of equal-weight stationary points without moving a true optimum
/// by more than that bound.
pub fn herfindahl_regularization(w: &[f64], objective_scale: f64) -> f64 {
  -REGULARIZATION_STRENGTH * objective_scale.abs() * concentration(w)
}
