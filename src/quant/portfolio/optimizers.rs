//! # Portfolio Optimizers
//!
//! $$
//! \min_{\mathbf{w}} \ \mathbf{w}^\top \Sigma \mathbf{w}
//! \quad \text{s.t.} \quad \mathbf{1}^\top \mathbf{w} = 1,\ \ \mu^\top \mathbf{w} \ge r_{\min},\ \ 0 \le w_i \le w_{\max}
//! $$
//!
//! Long-only minimum-variance solve under a return floor.
//!
//! The problem is a convex QP, so it is solved with a primal active-set method:
//! each iteration solves the equality-constrained KKT system for the current
//! working set, then either steps to the nearest blocking constraint or drops
//! the constraint with the most negative multiplier.

use nalgebra::DMatrix;
use nalgebra::DVector;
use ndarray::Array1;
use ndarray::Array2;

use crate::error::Error;
use crate::error::Result;

/// Solver limits and the per-asset weight cap.
#[derive(Clone, Copy, Debug)]
pub struct SolverOptions {
  /// Upper bound on any single weight.
  pub w_max: f64,
  /// Maximum active-set iterations before giving up.
  pub max_iter: usize,
  /// Convergence tolerance for step length and multipliers.
  pub tolerance: f64,
}

impl Default for SolverOptions {
  fn default() -> Self {
    Self {
      w_max: 1.0,
      max_iter: 500,
      tolerance: 1e-9,
    }
  }
}

/// Output of [`find_min_variance`].
#[derive(Clone, Debug)]
pub struct MinVariance {
  /// Weights, summing to one and within `[0, w_max]`.
  pub weights: Array1<f64>,
  /// `w' mu`.
  pub expected_return: f64,
  /// `sqrt(max(w' Sigma w, 0))`.
  pub volatility: f64,
  /// Active-set iterations used.
  pub iterations: usize,
}

/// Linear inequality `a' w >= b`.
struct Inequality {
  a: DVector<f64>,
  b: f64,
}

fn failure(iterations: usize, reason: impl Into<String>) -> Error {
  Error::OptimizerFailure {
    iterations,
    reason: reason.into(),
  }
}

/// `w' Sigma w`.
pub fn portfolio_variance(w: &Array1<f64>, cov: &Array2<f64>) -> f64 {
  w.dot(&cov.dot(w))
}

/// Weights proportional to `sqrt(max(mu_i, 0))`; uniform if no asset has positive mean.
pub fn initial_guess(mu: &Array1<f64>) -> Array1<f64> {
  let n = mu.len();
  let pos: Array1<f64> = mu.mapv(|r| r.max(0.0).sqrt());
  let total = pos.sum();
  if total > 1e-15 {
    pos / total
  } else {
    Array1::from_elem(n, 1.0 / n as f64)
  }
}

/// Push mass above `w_max` onto the uncapped weights, proportionally.
fn cap_to_box(mut w: Array1<f64>, w_max: f64) -> Option<Array1<f64>> {
  let n = w.len();
  for _ in 0..=n {
    let mut excess = 0.0;
    for wi in w.iter_mut() {
      if *wi > w_max {
        excess += *wi - w_max;
        *wi = w_max;
      }
    }
    if excess <= 1e-15 {
      return Some(w);
    }

    let free: Vec<usize> = (0..n).filter(|&i| w[i] < w_max - 1e-15).collect();
    if free.is_empty() {
      return None;
    }
    let free_mass: f64 = free.iter().map(|&i| w[i]).sum();
    for &i in &free {
      w[i] += if free_mass > 1e-15 {
        excess * w[i] / free_mass
      } else {
        excess / free.len() as f64
      };
    }
  }
  None
}

/// Highest-return fully invested portfolio under the cap: fill best assets first.
fn max_return_vertex(mu: &Array1<f64>, w_max: f64) -> Option<Array1<f64>> {
  let mut order: Vec<usize> = (0..mu.len()).collect();
  order.sort_by(|&a, &b| mu[b].total_cmp(&mu[a]));

  let mut w = Array1::<f64>::zeros(mu.len());
  let mut remaining = 1.0_f64;
  for i in order {
    if remaining <= 0.0 {
      break;
    }
    let take = remaining.min(w_max);
    w[i] = take;
    remaining -= take;
  }
  (remaining <= 1e-12).then_some(w)
}

/// Solve the KKT system of the equality-constrained subproblem.
///
/// Returns the step `p` and the multipliers (budget constraint first, then
/// the working set in order).
fn solve_kkt(
  g: &DMatrix<f64>,
  grad: &DVector<f64>,
  constraints: &[Inequality],
  working: &[usize],
) -> Option<(DVector<f64>, DVector<f64>)> {
  let n = grad.len();
  let m = 1 + working.len();
  let mut k = DMatrix::<f64>::zeros(n + m, n + m);
  k.view_mut((0, 0), (n, n)).copy_from(g);

  let budget = DVector::<f64>::from_element(n, 1.0);
  let rows = std::iter::once(&budget).chain(working.iter().map(|&c| &constraints[c].a));
  for (j, a) in rows.enumerate() {
    for i in 0..n {
      k[(i, n + j)] = -a[i];
      k[(n + j, i)] = a[i];
    }
  }

  let mut rhs = DVector::<f64>::zeros(n + m);
  for i in 0..n {
    rhs[i] = -grad[i];
  }

  let sol = k
    .clone()
    .lu()
    .solve(&rhs)
    .or_else(|| k.svd(true, true).solve(&rhs, 1e-14).ok())?;
  if !sol.iter().all(|v| v.is_finite()) {
    return None;
  }

  Some((sol.rows(0, n).into_owned(), sol.rows(n, m).into_owned()))
}

/// Minimum-variance long-only portfolio with `w' mu >= r_min`.
///
/// Fails with [`Error::OptimizerFailure`] when the constraints are infeasible,
/// the KKT system is singular, or `max_iter` is exhausted.
pub fn find_min_variance(
  mu: &Array1<f64>,
  cov: &Array2<f64>,
  r_min: f64,
  opts: &SolverOptions,
) -> Result<MinVariance> {
  let n = mu.len();
  if n == 0 {
    return Err(failure(0, "no assets"));
  }
  if cov.dim() != (n, n) {
    return Err(failure(0, format!("covariance shape {:?} does not match {n} assets", cov.dim())));
  }
  if !mu.iter().chain(cov.iter()).all(|v| v.is_finite()) || !r_min.is_finite() {
    return Err(failure(0, "non-finite inputs"));
  }

  let w_max = opts.w_max;
  let tol = opts.tolerance;
  let vertex = max_return_vertex(mu, w_max)
    .ok_or_else(|| failure(0, format!("w_max = {w_max} cannot reach full investment in {n} assets")))?;
  let best_return = mu.dot(&vertex);
  if best_return < r_min - tol * (1.0 + r_min.abs()) {
    return Err(failure(
      0,
      format!("r_min = {r_min:.6} exceeds the best attainable return {best_return:.6}"),
    ));
  }

  let mut start = cap_to_box(initial_guess(mu), w_max).unwrap_or_else(|| vertex.clone());
  let start_return = mu.dot(&start);
  if start_return < r_min {
    let t = ((r_min - start_return) / (best_return - start_return)).clamp(0.0, 1.0);
    start = &start * (1.0 - t) + &vertex * t;
  }

  let trace_mean = (0..n).map(|i| cov[[i, i]]).sum::<f64>() / n as f64;
  let ridge = 1e-10 * trace_mean.abs().max(1e-12);
  let g = DMatrix::<f64>::from_fn(n, n, |i, j| 2.0 * cov[[i, j]] + if i == j { ridge } else { 0.0 });

  let mut constraints = Vec::with_capacity(2 * n + 1);
  constraints.push(Inequality {
    a: DVector::from_iterator(n, mu.iter().copied()),
    b: r_min,
  });
  for i in 0..n {
    let mut a = DVector::<f64>::zeros(n);
    a[i] = 1.0;
    constraints.push(Inequality { a, b: 0.0 });
  }
  for i in 0..n {
    let mut a = DVector::<f64>::zeros(n);
    a[i] = -1.0;
    constraints.push(Inequality { a, b: -w_max });
  }

  let mut w = DVector::from_iterator(n, start.iter().copied());
  let mut working: Vec<usize> = Vec::new();

  for iteration in 1..=opts.max_iter {
    let grad = &g * &w;
    let (p, lambdas) = solve_kkt(&g, &grad, &constraints, &working)
      .ok_or_else(|| failure(iteration, "singular KKT system"))?;

    if p.amax() <= tol * (1.0 + w.amax()) {
      let scale = tol * (1.0 + grad.amax());
      let release = working
        .iter()
        .zip(lambdas.iter().skip(1))
        .filter(|(_, l)| **l < -scale)
        .min_by(|a, b| a.1.total_cmp(b.1))
        .map(|(c, _)| *c);

      match release {
        Some(c) => working.retain(|&k| k != c),
        None => return Ok(finish(&w, mu, cov, w_max, iteration)),
      }
      continue;
    }

    let mut alpha = 1.0;
    let mut blocking = None;
    for (c, ineq) in constraints.iter().enumerate() {
      if working.contains(&c) {
        continue;
      }
      let ap = ineq.a.dot(&p);
      if ap < -1e-14 {
        let step = ((ineq.b - ineq.a.dot(&w)) / ap).max(0.0);
        if step < alpha {
          alpha = step;
          blocking = Some(c);
        }
      }
    }

    w.axpy(alpha, &p, 1.0);
    if let Some(c) = blocking {
      working.push(c);
    }
  }

  Err(failure(opts.max_iter, "iteration limit reached"))
}

fn finish(
  w: &DVector<f64>,
  mu: &Array1<f64>,
  cov: &Array2<f64>,
  w_max: f64,
  iterations: usize,
) -> MinVariance {
  let mut weights: Array1<f64> = w.iter().map(|x| x.clamp(0.0, w_max)).collect();
  let total = weights.sum();
  if total > 0.0 {
    weights.mapv_inplace(|x| (x / total).min(w_max));
  }

  let expected_return = weights.dot(mu);
  let volatility = portfolio_variance(&weights, cov).max(0.0).sqrt();

  MinVariance {
    weights,
    expected_return,
    volatility,
    iterations,
  }
}
