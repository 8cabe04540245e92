//! # Bounded Leverage Solver
//!
//! $$
//! w_i(\mathbf{x}) = \ell_i + (u_i - \ell_i)\,\mathrm{sigmoid}(x_i + \tau(\mathbf{x})),\qquad
//! \sum_i w_i(\mathbf{x}) = L
//! $$
//!
//! Every iterate satisfies the leverage equality and the position box by
//! construction, so both solver stages only have to penalize their remaining
//! constraints. Minimization runs through argmin: L-BFGS first, Nelder-Mead
//! from the same start if L-BFGS errors.

use argmin::core::CostFunction;
use argmin::core::Executor;
use argmin::core::Gradient;
use argmin::core::State;
use argmin::core::TerminationReason;
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::neldermead::NelderMead;
use argmin::solver::quasinewton::LBFGS;
use tracing::debug;
use tracing::warn;

/// Absolute tolerance for leverage, bounds and performance-floor checks.
pub const SOLVER_TOLERANCE: f64 = 1e-3;

/// Iteration and accuracy knobs shared by both stages.
#[derive(Clone, Debug, PartialEq)]
pub struct SolverSettings {
  /// L-BFGS iteration cap; Nelder-Mead gets ten times this.
  pub max_iters: u64,
  /// L-BFGS history length.
  pub lbfgs_memory: usize,
  /// Forward-difference step in parameter space.
  pub fd_step: f64,
  pub tolerance_grad: f64,
  pub tolerance_cost: f64,
}

impl Default for SolverSettings {
  fn default() -> Self {
    Self {
      max_iters: 300,
      lbfgs_memory: 7,
      fd_step: 1e-7,
      tolerance_grad: 1e-9,
      tolerance_cost: 1e-12,
    }
  }
}

/// Why a renormalization could not produce a valid weight vector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RescaleFailure {
  /// Nothing meaningful was left to scale.
  Collapsed,
  /// The remaining positions cannot carry the leverage within their bounds.
  Infeasible,
}

/// Per-position box `[lower_i, upper_i]`.
#[derive(Clone, Debug, PartialEq)]
pub struct PositionBounds {
  pub lower: Vec<f64>,
  pub upper: Vec<f64>,
}

fn sigmoid(z: f64) -> f64 {
  if z >= 0.0 {
    1.0 / (1.0 + (-z).exp())
  } else {
    let e = z.exp();
    e / (1.0 + e)
  }
}

impl PositionBounds {
  pub fn uniform(n: usize, lower: f64, upper: f64) -> Self {
    Self {
      lower: vec![lower; n],
      upper: vec![upper; n],
    }
  }

  /// Caps `base * median_vol / vol_i` clipped to `[floor, base]`.
  ///
  /// Lower-volatility assets earn larger caps, up to `base`.
  pub fn volatility_scaled(vols: &[f64], median_vol: f64, base: f64, floor: f64) -> Self {
    let floor = floor.min(base);
    let upper = vols
      .iter()
      .map(|&vol| {
        if vol > 1e-12 {
          (base * median_vol / vol).clamp(floor, base)
        } else {
          base
        }
      })
      .collect();
    Self {
      lower: vec![0.0; vols.len()],
      upper,
    }
  }

  pub fn len(&self) -> usize {
    self.upper.len()
  }

  pub fn is_empty(&self) -> bool {
    self.upper.is_empty()
  }

  /// Whether every weight lies inside its box up to `tol`.
  pub fn contains(&self, w: &[f64], tol: f64) -> bool {
    w.iter()
      .zip(self.lower.iter().zip(self.upper.iter()))
      .all(|(&x, (&lo, &hi))| x >= lo - tol && x <= hi + tol)
  }

  /// Scale caps up or floors down until `sum(lower) <= leverage <= sum(upper)`.
  ///
  /// Returns true when a bound had to move.
  pub fn make_feasible(&mut self, leverage: f64) -> bool {
    let n = self.len();
    if n == 0 {
      return false;
    }
    let mut relaxed = false;

    let sum_hi: f64 = self.upper.iter().sum();
    if sum_hi < leverage - 1e-12 {
      if sum_hi > 1e-15 {
        let factor = leverage / sum_hi;
        self.upper.iter_mut().for_each(|u| *u *= factor);
      } else {
        self.upper = vec![leverage / n as f64; n];
      }
      relaxed = true;
    }

    let sum_lo: f64 = self.lower.iter().sum();
    if sum_lo > leverage + 1e-12 {
      let factor = leverage / sum_lo;
      self.lower.iter_mut().for_each(|l| *l *= factor);
      relaxed = true;
    }

    for (lo, hi) in self.lower.iter().zip(self.upper.iter_mut()) {
      if *hi < *lo {
        *hi = *lo;
        relaxed = true;
      }
    }
    relaxed
  }

  fn fill(&self, x: &[f64], tau: f64) -> (f64, f64) {
    let mut total = 0.0;
    let mut slope = 0.0;
    for ((&xi, &lo), &hi) in x.iter().zip(self.lower.iter()).zip(self.upper.iter()) {
      let span = hi - lo;
      if span <= 1e-15 {
        total += lo;
        continue;
      }
      let s = sigmoid(xi + tau);
      total += lo + span * s;
      slope += span * s * (1.0 - s);
    }
    (total, slope)
  }

  /// Map unconstrained parameters to weights inside the box summing to `leverage`.
  pub fn weights_from_params(&self, x: &[f64], leverage: f64) -> Vec<f64> {
    let sum_lo: f64 = self.lower.iter().sum();
    let sum_hi: f64 = self.upper.iter().sum();
    if leverage <= sum_lo + 1e-12 {
      return self.lower.clone();
    }
    if leverage >= sum_hi - 1e-12 {
      return self.upper.clone();
    }

    let x: Vec<f64> = x
      .iter()
      .map(|v| if v.is_finite() { v.clamp(-1e6, 1e6) } else { 0.0 })
      .collect();
    let max_x = x.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let min_x = x.iter().cloned().fold(f64::INFINITY, f64::min);

    // fill(tau) is increasing in tau; [a, b] always brackets the root.
    let mut a = -max_x - 40.0;
    let mut b = -min_x + 40.0;
    let mut tau = 0.0_f64.clamp(a, b);
    let tol = 1e-13 * leverage.abs().max(1.0);

    for _ in 0..200 {
      let (total, slope) = self.fill(&x, tau);
      let err = total - leverage;
      if err.abs() <= tol {
        break;
      }
      if err > 0.0 {
        b = tau;
      } else {
        a = tau;
      }
      let newton = if slope > 1e-300 {
        tau - err / slope
      } else {
        f64::NAN
      };
      tau = if newton.is_finite() && newton > a && newton < b {
        newton
      } else {
        0.5 * (a + b)
      };
    }

    x.iter()
      .zip(self.lower.iter().zip(self.upper.iter()))
      .map(|(&xi, (&lo, &hi))| {
        let span = hi - lo;
        if span <= 1e-15 {
          lo
        } else {
          lo + span * sigmoid(xi + tau)
        }
      })
      .collect()
  }

  /// Parameters whose image under [`Self::weights_from_params`] is close to `w`.
  pub fn params_from_weights(&self, w: &[f64]) -> Vec<f64> {
    w.iter()
      .zip(self.lower.iter().zip(self.upper.iter()))
      .map(|(&wi, (&lo, &hi))| {
        let span = hi - lo;
        if span <= 1e-15 {
          return 0.0;
        }
        let frac = ((wi - lo) / span).clamp(1e-9, 1.0 - 1e-9);
        (frac / (1.0 - frac)).ln()
      })
      .collect()
  }

  /// Proportionally rescale the non-zero positions to `leverage`, respecting the box.
  ///
  /// Zero entries stay zero. Positions that hit a bound are pinned there and the
  /// remainder is redistributed over the free ones.
  pub fn rescale(&self, w: &[f64], leverage: f64) -> Result<Vec<f64>, RescaleFailure> {
    let movable: Vec<bool> = w.iter().map(|&x| x > 0.0).collect();
    self.rescale_where(w, &movable, leverage)
  }

  /// Like [`Self::rescale`], but only entries flagged in `movable` are scaled.
  ///
  /// The others are held at their current value.
  pub fn rescale_where(
    &self,
    w: &[f64],
    movable: &[bool],
    leverage: f64,
  ) -> Result<Vec<f64>, RescaleFailure> {
    let n = w.len();
    let mut out: Vec<f64> = w.iter().map(|x| x.max(0.0)).collect();
    let mut free: Vec<bool> = movable.iter().take(n).copied().collect();
    free.resize(n, false);

    let live: f64 = out.iter().sum();
    if live < 1e-9 {
      return Err(RescaleFailure::Collapsed);
    }

    for _ in 0..=n {
      let pinned: f64 = (0..n).filter(|&i| !free[i]).map(|i| out[i]).sum();
      let loose: f64 = (0..n).filter(|&i| free[i]).map(|i| out[i]).sum();
      if loose <= 1e-15 {
        break;
      }

      let scale = (leverage - pinned) / loose;
      let mut changed = false;
      for i in 0..n {
        if !free[i] {
          continue;
        }
        out[i] *= scale;
        if out[i] > self.upper[i] {
          out[i] = self.upper[i];
          free[i] = false;
          changed = true;
        } else if out[i] < self.lower[i] {
          out[i] = self.lower[i];
          free[i] = false;
          changed = true;
        }
      }
      if !changed {
        break;
      }
    }

    let total: f64 = out.iter().sum();
    if (total - leverage).abs() > 1e-9 {
      return Err(RescaleFailure::Infeasible);
    }
    Ok(out)
  }
}

/// Result of one bounded minimization.
#[derive(Clone, Debug)]
pub struct SolveOutcome {
  pub weights: Vec<f64>,
  pub cost: f64,
  /// False when the iteration cap was reached.
  pub converged: bool,
}

#[derive(Clone)]
struct BoundedLeverageProblem<'a, F> {
  objective: F,
  bounds: &'a PositionBounds,
  leverage: f64,
  fd_step: f64,
}

impl<F> BoundedLeverageProblem<'_, F>
where
  F: Fn(&[f64]) -> f64,
{
  fn eval(&self, x: &[f64]) -> f64 {
    let w = self.bounds.weights_from_params(x, self.leverage);
    let c = (self.objective)(&w);
    if c.is_finite() { c } else { 1e10 }
  }
}

impl<F> CostFunction for BoundedLeverageProblem<'_, F>
where
  F: Fn(&[f64]) -> f64,
{
  type Param = Vec<f64>;
  type Output = f64;

  fn cost(&self, x: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
    Ok(self.eval(x))
  }
}

impl<F> Gradient for BoundedLeverageProblem<'_, F>
where
  F: Fn(&[f64]) -> f64,
{
  type Param = Vec<f64>;
  type Gradient = Vec<f64>;

  fn gradient(&self, x: &Self::Param) -> Result<Self::Gradient, argmin::core::Error> {
    let mut grad = vec![0.0; x.len()];
    let f0 = self.eval(x);
    let mut x_plus = x.clone();

    for i in 0..x.len() {
      let eps = self.fd_step * x[i].abs().max(1.0);
      x_plus[i] = x[i] + eps;
      grad[i] = (self.eval(&x_plus) - f0) / eps;
      x_plus[i] = x[i];
    }

    Ok(grad)
  }
}

fn run_lbfgs<F>(
  problem: BoundedLeverageProblem<'_, F>,
  x0: Vec<f64>,
  settings: &SolverSettings,
) -> Result<(Vec<f64>, bool), argmin::core::Error>
where
  F: Fn(&[f64]) -> f64,
{
  let linesearch = MoreThuenteLineSearch::new().with_c(1e-4, 0.9)?;
  let solver = LBFGS::new(linesearch, settings.lbfgs_memory)
    .with_tolerance_grad(settings.tolerance_grad)?
    .with_tolerance_cost(settings.tolerance_cost)?;

  let fallback = x0.clone();
  let res = Executor::new(problem, solver)
    .configure(|state| state.param(x0).max_iters(settings.max_iters))
    .run()?;

  let converged = !matches!(
    res.state().get_termination_reason(),
    Some(TerminationReason::MaxItersReached)
  );
  let best = res.state.best_param.unwrap_or(fallback);
  Ok((best, converged))
}

fn run_nelder_mead<F>(
  problem: BoundedLeverageProblem<'_, F>,
  x0: Vec<f64>,
  settings: &SolverSettings,
) -> Result<(Vec<f64>, bool), argmin::core::Error>
where
  F: Fn(&[f64]) -> f64,
{
  let n = x0.len();
  let mut simplex = Vec::with_capacity(n + 1);
  simplex.push(x0.clone());
  for i in 0..n {
    let mut point = x0.clone();
    point[i] += 1.0;
    simplex.push(point);
  }

  let solver = NelderMead::new(simplex).with_sd_tolerance(1e-10)?;
  let res = Executor::new(problem, solver)
    .configure(|state| state.max_iters(settings.max_iters * 10))
    .run()?;

  let converged = !matches!(
    res.state().get_termination_reason(),
    Some(TerminationReason::MaxItersReached)
  );
  let best = res.state.best_param.unwrap_or(x0);
  Ok((best, converged))
}

/// Minimize `objective` over weights in `bounds` summing to `leverage`, starting near `start`.
///
/// Returns `None` only when every solver errored.
pub fn minimize_bounded<F>(
  objective: F,
  bounds: &PositionBounds,
  leverage: f64,
  start: &[f64],
  settings: &SolverSettings,
) -> Option<SolveOutcome>
where
  F: Fn(&[f64]) -> f64 + Clone,
{
  let sum_lo: f64 = bounds.lower.iter().sum();
  let sum_hi: f64 = bounds.upper.iter().sum();
  if leverage <= sum_lo + 1e-12 || leverage >= sum_hi - 1e-12 {
    // the box pins every weight
    let weights = bounds.weights_from_params(&vec![0.0; bounds.len()], leverage);
    let cost = objective(&weights);
    return Some(SolveOutcome {
      weights,
      cost,
      converged: true,
    });
  }

  let problem = BoundedLeverageProblem {
    objective,
    bounds,
    leverage,
    fd_step: settings.fd_step,
  };
  let x0 = bounds.params_from_weights(start);

  let (x_best, converged) = match run_lbfgs(problem.clone(), x0.clone(), settings) {
    Ok(found) => found,
    Err(err) => {
      warn!(error = %err, "L-BFGS failed, retrying with Nelder-Mead");
      match run_nelder_mead(problem.clone(), x0, settings) {
        Ok(found) => found,
        Err(err) => {
          warn!(error = %err, "Nelder-Mead failed");
          return None;
        }
      }
    }
  };

  let weights = bounds.weights_from_params(&x_best, leverage);
  let cost = problem.eval(&x_best);
  debug!(cost, converged, "bounded solve finished");

  if weights.iter().all(|w| w.is_finite()) {
    Some(SolveOutcome {
      weights,
      cost,
      converged,
    })
  } else {
    None
  }
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;

  use super::*;

  #[test]
  fn params_map_into_box_with_exact_leverage() {
    let bounds = PositionBounds::uniform(6, 0.0, 0.3);
    let x = vec![3.0, -2.0, 0.5, 10.0, -40.0, 0.0];
    let w = bounds.weights_from_params(&x, 1.0);

    assert_abs_diff_eq!(w.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
    assert!(bounds.contains(&w, 0.0));
  }

  #[test]
  fn params_round_trip_near_interior_weights() {
    let bounds = PositionBounds::uniform(4, 0.0, 0.5);
    let start = vec![0.25; 4];
    let w = bounds.weights_from_params(&bounds.params_from_weights(&start), 1.0);

    for x in w {
      assert_abs_diff_eq!(x, 0.25, epsilon = 1e-9);
    }
  }

  #[test]
  fn infeasible_caps_are_scaled_up_to_leverage() {
    let mut bounds = PositionBounds::uniform(5, 0.0, 0.1);
    assert!(bounds.make_feasible(1.0));
    assert_abs_diff_eq!(bounds.upper.iter().sum::<f64>(), 1.0, epsilon = 1e-12);

    let w = bounds.weights_from_params(&[0.0; 5], 1.0);
    for x in w {
      assert_abs_diff_eq!(x, 0.2, epsilon = 1e-12);
    }
  }

  #[test]
  fn feasible_box_is_left_alone() {
    let mut bounds = PositionBounds::uniform(20, 0.0, 0.06);
    assert!(!bounds.make_feasible(1.0));
  }

  #[test]
  fn volatility_scaling_rewards_calm_assets() {
    let b = PositionBounds::volatility_scaled(&[0.1, 0.2, 0.4, 5.0], 0.2, 0.1, 0.01);

    assert_abs_diff_eq!(b.upper[0], 0.1, epsilon = 1e-12);
    assert_abs_diff_eq!(b.upper[1], 0.1, epsilon = 1e-12);
    assert_abs_diff_eq!(b.upper[2], 0.05, epsilon = 1e-12);
    assert_abs_diff_eq!(b.upper[3], 0.01, epsilon = 1e-12);
  }

  #[test]
  fn rescale_pins_capped_positions() {
    let bounds = PositionBounds::uniform(4, 0.0, 0.4);
    let w = bounds.rescale(&[0.5, 0.2, 0.1, 0.0], 1.0).unwrap();

    assert_abs_diff_eq!(w[0], 0.4, epsilon = 1e-12);
    assert_abs_diff_eq!(w[3], 0.0, epsilon = 1e-12);
    assert_abs_diff_eq!(w.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
  }

  #[test]
  fn rescale_reports_collapse_and_infeasibility() {
    let bounds = PositionBounds::uniform(3, 0.0, 0.4);
    assert_eq!(
      bounds.rescale(&[0.0, 0.0, 0.0], 1.0),
      Err(RescaleFailure::Collapsed)
    );
    assert_eq!(
      bounds.rescale(&[0.3, 0.0, 0.3], 1.0),
      Err(RescaleFailure::Infeasible)
    );
  }

  #[test]
  fn rescale_where_holds_fixed_entries() {
    let bounds = PositionBounds::uniform(4, 0.0, 0.3);
    let w = bounds
      .rescale_where(&[0.25, 0.25, 0.30, 0.192], &[false, false, true, true], 1.0)
      .unwrap();

    assert_eq!(w[0], 0.25);
    assert_eq!(w[1], 0.25);
    assert_abs_diff_eq!(w[2], 0.30, epsilon = 1e-12);
    assert_abs_diff_eq!(w[3], 0.20, epsilon = 1e-12);
    assert!(bounds.contains(&w, 1e-12));
  }

  #[test]
  fn iteration_cap_reports_non_convergence() {
    let bounds = PositionBounds::uniform(6, 0.0, 0.6);
    let target = [0.4, 0.3, 0.15, 0.1, 0.05, 0.0];
    let objective = |w: &[f64]| {
      w.iter()
        .zip(target.iter())
        .map(|(a, b)| (a - b).powi(2))
        .sum::<f64>()
    };
    let settings = SolverSettings {
      max_iters: 1,
      ..SolverSettings::default()
    };
    let out = minimize_bounded(objective, &bounds, 1.0, &[1.0 / 6.0; 6], &settings).unwrap();

    assert!(!out.converged);
    assert_abs_diff_eq!(out.weights.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
    assert!(bounds.contains(&out.weights, 0.0));
  }

  #[test]
  fn minimizes_a_quadratic_inside_the_box() {
    let bounds = PositionBounds::uniform(4, 0.0, 0.6);
    let target = [0.55, 0.25, 0.15, 0.05];
    let objective = |w: &[f64]| {
      w.iter()
        .zip(target.iter())
        .map(|(a, b)| (a - b).powi(2))
        .sum::<f64>()
    };
    let out = minimize_bounded(objective, &bounds, 1.0, &[0.25; 4], &SolverSettings::default())
      .unwrap();

    for (w, t) in out.weights.iter().zip(target.iter()) {
      assert_abs_diff_eq!(w, t, epsilon = 1e-3);
    }
    assert_abs_diff_eq!(out.weights.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
  }
}
