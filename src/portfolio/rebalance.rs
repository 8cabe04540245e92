//! # Gradual Rebalance
//!
//! $$
//! \tfrac12 \sum_i |w_i - c_i| \le T_{\max},\qquad
//! \max(0, c_i - \Delta) \le w_i \le \min(\bar w_i, c_i + \Delta)
//! $$
//!
//! Keeps a re-optimization within bounded turnover of an existing portfolio,
//! and derives concrete trade quantities from target and current weights.

use tracing::debug;

use super::metrics::turnover;
use super::profile::RiskProfileConfig;
use super::solver::PositionBounds;
use super::types::SolverNotice;
use crate::error::PortfolioError;
use crate::error::Result;

/// Bisection steps of the turnover blend.
const BLEND_STEPS: usize = 64;

/// Whether a supplied current portfolio holds anything.
pub fn has_holdings(current: Option<&[f64]>) -> bool {
  current.is_some_and(|c| c.iter().any(|w| w.abs() > 1e-12))
}

/// Least-turnover point of `bounds` carrying the same total as `current`.
///
/// Only positions held above their cap sit outside the box; their excess is
/// handed to the others in proportion to headroom.
fn anchor_in_box(current: &[f64], bounds: &PositionBounds) -> Vec<f64> {
  let mut anchor: Vec<f64> = current
    .iter()
    .zip(bounds.upper.iter())
    .map(|(&c, &hi)| c.min(hi))
    .collect();
  let excess: f64 = current.iter().zip(anchor.iter()).map(|(c, a)| c - a).sum();
  let headroom: f64 = anchor
    .iter()
    .zip(bounds.upper.iter())
    .map(|(a, hi)| hi - a)
    .sum();

  if excess > 1e-15 && headroom > 1e-15 {
    let share = (excess / headroom).min(1.0);
    for (a, &hi) in anchor.iter_mut().zip(bounds.upper.iter()) {
      *a += share * (hi - *a);
    }
  }
  anchor
}

/// Turnover and per-position constraints relative to a current portfolio.
#[derive(Clone, Debug)]
pub struct GradualRebalance {
  current: Vec<f64>,
  anchor: Vec<f64>,
  bounds: PositionBounds,
  max_turnover: f64,
  min_trade: f64,
  relaxed: bool,
}

impl GradualRebalance {
  /// Build the rebalance box from current weights and the default position caps.
  ///
  /// Positions currently below `min_trade_threshold` may be closed entirely.
  /// A position held above its cap can only shrink by `max_position_change`.
  /// When the box cannot carry the current gross exposure its caps are scaled
  /// up, see [`Self::relaxed`].
  pub fn new(current: &[f64], caps: &PositionBounds, profile: &RiskProfileConfig) -> Self {
    let delta = profile.max_position_change;
    let min_trade = profile.min_trade_threshold;

    let (lower, upper): (Vec<f64>, Vec<f64>) = current
      .iter()
      .zip(caps.upper.iter())
      .map(|(&c, &cap)| {
        let lo = if c < min_trade { 0.0 } else { (c - delta).max(0.0) };
        let hi = cap.min(c + delta).max(lo);
        (lo, hi)
      })
      .unzip();

    let mut bounds = PositionBounds { lower, upper };
    let relaxed = bounds.make_feasible(current.iter().sum());
    let anchor = anchor_in_box(current, &bounds);

    Self {
      current: current.to_vec(),
      anchor,
      bounds,
      max_turnover: profile.max_turnover_per_rebalance,
      min_trade,
      relaxed,
    }
  }

  pub fn current(&self) -> &[f64] {
    &self.current
  }

  pub fn bounds(&self) -> &PositionBounds {
    &self.bounds
  }

  pub fn max_turnover(&self) -> f64 {
    self.max_turnover
  }

  /// Whether the caps had to be scaled up to carry the current exposure.
  pub fn relaxed(&self) -> bool {
    self.relaxed
  }

  /// Amount by which `w` exceeds the turnover limit, zero when within it.
  pub fn turnover_excess(&self, w: &[f64]) -> f64 {
    (turnover(w, &self.current) - self.max_turnover).max(0.0)
  }

  /// Clamp into the box, snap micro-trades back, restore leverage over the
  /// traded positions and cap turnover.
  ///
  /// The result always lies inside [`Self::bounds`]. The returned notice is set
  /// when trades had to be scaled back to respect the turnover limit.
  pub fn finalize(&self, w: &[f64], leverage: f64) -> (Vec<f64>, Option<SolverNotice>) {
    let PositionBounds { lower, upper } = &self.bounds;
    let clamped: Vec<f64> = w
      .iter()
      .zip(lower.iter().zip(upper.iter()))
      .map(|(&x, (&lo, &hi))| x.clamp(lo, hi))
      .collect();

    let mut proposal = clamped.clone();
    let mut traded = vec![true; proposal.len()];
    for (i, x) in proposal.iter_mut().enumerate() {
      let c = self.current[i];
      let inside = c >= lower[i] && c <= upper[i];
      if inside && (*x - c).abs() < self.min_trade {
        *x = c;
        traded[i] = false;
      }
    }

    let out = match self.bounds.rescale_where(&proposal, &traded, leverage) {
      Ok(out) => out,
      Err(snapped) => {
        let everything = vec![true; clamped.len()];
        match self.bounds.rescale_where(&clamped, &everything, leverage) {
          Ok(out) => out,
          Err(failure) => {
            debug!(
              ?snapped,
              ?failure,
              "trade cleanup cannot restore the leverage, keeping the clamped proposal"
            );
            clamped
          }
        }
      }
    };

    let moved = turnover(&out, &self.current);
    if moved <= self.max_turnover + 1e-12 {
      return (out, None);
    }

    let factor = self.blend_factor(&out);
    let blended: Vec<f64> = self
      .anchor
      .iter()
      .zip(out.iter())
      .map(|(&a, &x)| a + factor * (x - a))
      .collect();
    debug!(moved, factor, "scaled trades back to the turnover limit");
    (blended, Some(SolverNotice::TurnoverScaled { factor }))
  }

  /// Largest step from the anchor toward `w` that stays within the turnover limit.
  ///
  /// Turnover is convex along the segment, so bisection finds the crossing.
  fn blend_factor(&self, w: &[f64]) -> f64 {
    let at = |f: f64| {
      let point: Vec<f64> = self
        .anchor
        .iter()
        .zip(w.iter())
        .map(|(&a, &x)| a + f * (x - a))
        .collect();
      turnover(&point, &self.current)
    };

    if at(0.0) >= self.max_turnover {
      return 0.0;
    }
    let (mut lo, mut hi) = (0.0, 1.0);
    for _ in 0..BLEND_STEPS {
      let mid = 0.5 * (lo + hi);
      if at(mid) <= self.max_turnover {
        lo = mid;
      } else {
        hi = mid;
      }
    }
    lo
  }
}

/// Units to trade per asset: `(target - current) * equity / price`.
pub fn trade_quantities(
  target: &[f64],
  current: &[f64],
  equity: f64,
  prices: &[f64],
) -> Result<Vec<f64>> {
  let n = target.len();
  for (what, len) in [("current weights", current.len()), ("prices", prices.len())] {
    if len != n {
      return Err(PortfolioError::DimensionMismatch {
        what,
        expected: n,
        actual: len,
      });
    }
  }
  if !equity.is_finite() {
    return Err(PortfolioError::InvalidData(format!(
      "equity must be finite, got {equity}"
    )));
  }
  if let Some(i) = prices.iter().position(|p| !p.is_finite() || *p <= 0.0) {
    return Err(PortfolioError::InvalidData(format!(
      "price at index {i} must be positive, got {}",
      prices[i]
    )));
  }

  Ok(
    target
      .iter()
      .zip(current.iter())
      .zip(prices.iter())
      .map(|((t, c), p)| (t - c) * equity / p)
      .collect(),
  )
}
