//! Weighted ridge regression used as LIME's local surrogate model.

use ndarray::{prelude::*, Zip};

use crate::errors::{Result, XaiError};

#[derive(Debug, Clone, PartialEq)]
pub struct LinearSurrogate {
    pub coefficients: Array1<f32>,
    pub intercept: f32,
    /// Weighted coefficient of determination on the training samples.
    pub score: f32,
}

/// Minimise `sum_i w_i (y_i - b - x_i . beta)^2 + alpha |beta|^2`. The intercept is not
/// penalised.
pub fn fit_weighted_ridge(
    features: ArrayView2<'_, f32>,
    targets: ArrayView1<'_, f32>,
    weights: ArrayView1<'_, f32>,
    alpha: f32,
) -> Result<LinearSurrogate> {
    let (n, d) = features.dim();
    if targets.len() != n || weights.len() != n {
        return Err(XaiError::shape(
            format!("{n} targets and weights"),
            &[targets.len(), weights.len()],
        ));
    }
    let x = features.mapv(f64::from);
    let y = targets.mapv(f64::from);
    let w = weights.mapv(|v| f64::from(v).max(0.0));
    let total = w.sum();
    if n == 0 || total <= 0.0 {
        return Err(XaiError::invalid_input(
            "weights",
            "need at least one sample with positive weight",
        ));
    }

    let x_mean = x.t().dot(&w) / total;
    let y_mean = y.dot(&w) / total;
    let xc = &x - &x_mean.view().insert_axis(Axis(0));
    let yc = &y - y_mean;

    let weighted = &xc * &w.view().insert_axis(Axis(1));
    let mut gram = weighted.t().dot(&xc);
    for i in 0..d {
        gram[[i, i]] += f64::from(alpha);
    }
    let rhs = weighted.t().dot(&yc);
    let beta = solve_spd(gram, rhs)?;

    let intercept = y_mean - x_mean.dot(&beta);
    let fitted = x.dot(&beta) + intercept;
    let residual: f64 = Zip::from(&y)
        .and(&fitted)
        .and(&w)
        .fold(0.0, |acc, &yi, &fi, &wi| acc + wi * (yi - fi).powi(2));
    let spread: f64 = Zip::from(&y)
        .and(&w)
        .fold(0.0, |acc, &yi, &wi| acc + wi * (yi - y_mean).powi(2));
    let score = if spread > 0.0 { 1.0 - residual / spread } else { 1.0 };

    Ok(LinearSurrogate {
        coefficients: beta.mapv(|v| v as f32),
        intercept: intercept as f32,
        score: score as f32,
    })
}

/// Cholesky solve of a symmetric positive-definite system.
fn solve_spd(mut a: Array2<f64>, b: Array1<f64>) -> Result<Array1<f64>> {
    let n = b.len();
    for j in 0..n {
        let mut diag = a[[j, j]];
        for k in 0..j {
            diag -= a[[j, k]] * a[[j, k]];
        }
        if diag <= 0.0 || !diag.is_finite() {
            return Err(XaiError::Integrity {
                message: format!("surrogate system is not positive definite at pivot {j}"),
            });
        }
        let diag = diag.sqrt();
        a[[j, j]] = diag;
        for i in (j + 1)..n {
            let mut value = a[[i, j]];
            for k in 0..j {
                value -= a[[i, k]] * a[[j, k]];
            }
            a[[i, j]] = value / diag;
        }
    }

    let mut z = Array1::<f64>::zeros(n);
    for i in 0..n {
        let mut value = b[i];
        for k in 0..i {
            value -= a[[i, k]] * z[k];
        }
        z[i] = value / a[[i, i]];
    }
    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let mut value = z[i];
        for k in (i + 1)..n {
            value -= a[[k, i]] * x[k];
        }
        x[i] = value / a[[i, i]];
    }
    Ok(x)
}
