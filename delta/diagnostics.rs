//! Log-scale residuals of the magnitude model and a summary of their spatial
//! clustering.

use crate::delta::data::{self, Observation};
use crate::delta::hurdle::HurdleError;
use crate::gam::model::{FittedModel, PredictScale};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt;

/// `residual = fitted_log - ln(density)` for one positive observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Residual {
    pub x: f64,
    pub y: f64,
    pub depth: f64,
    pub density: f64,
    pub fitted_log: f64,
    pub residual: f64,
}

/// Residuals of a magnitude model at the positive observations. Zero-density rows
/// are skipped since `ln(0)` is undefined.
pub fn magnitude_residuals<M: FittedModel>(
    model: &M,
    observations: &[Observation],
) -> Result<Vec<Residual>, HurdleError> {
    let positives = data::positive_observations(observations);
    if positives.is_empty() {
        return Ok(Vec::new());
    }
    let covariates = data::covariates(&positives)?;
    let eta = model.predict(&covariates, PredictScale::Link, false)?.estimate;
    Ok(positives
        .iter()
        .zip(eta.iter())
        .map(|(obs, &fitted_log)| Residual {
            x: obs.x,
            y: obs.y,
            depth: obs.depth,
            density: obs.density,
            fitted_log,
            residual: fitted_log - obs.density.ln(),
        })
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResidualSummary {
    pub count: usize,
    pub mean: f64,
    pub root_mean_square: f64,
    /// Fraction of nearest-neighbour pairs whose residuals share a sign. Near 0.5
    /// for spatially independent residuals; `None` with fewer than two residuals.
    pub sign_agreement: Option<f64>,
    pub neighbours: usize,
}

impl fmt::Display for ResidualSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "n = {}, mean = {:.4}, rms = {:.4}",
            self.count, self.mean, self.root_mean_square
        )?;
        match self.sign_agreement {
            Some(share) => write!(f, ", {}-NN sign agreement = {:.3}", self.neighbours, share),
            None => Ok(()),
        }
    }
}

fn same_sign(a: f64, b: f64) -> bool {
    a.signum() == b.signum() || (a == 0.0 && b == 0.0)
}

pub fn summarize_residuals(residuals: &[Residual], neighbours: usize) -> ResidualSummary {
    let count = residuals.len();
    let (mean, root_mean_square) = if count == 0 {
        (f64::NAN, f64::NAN)
    } else {
        let n = count as f64;
        let sum: f64 = residuals.iter().map(|r| r.residual).sum();
        let sum_sq: f64 = residuals.iter().map(|r| r.residual * r.residual).sum();
        (sum / n, (sum_sq / n).sqrt())
    };

    let k = neighbours.min(count.saturating_sub(1));
    let sign_agreement = (k > 0).then(|| {
        let mut agree = 0usize;
        let mut pairs = 0usize;
        for (i, ri) in residuals.iter().enumerate() {
            let distance = |j: usize| (residuals[j].x - ri.x).hypot(residuals[j].y - ri.y);
            let nearest = (0..count)
                .filter(|&j| j != i)
                .k_smallest_by(k, |&a, &b| distance(a).total_cmp(&distance(b)));
            for j in nearest {
                pairs += 1;
                if same_sign(ri.residual, residuals[j].residual) {
                    agree += 1;
                }
            }
        }
        agree as f64 / pairs as f64
    });

    ResidualSummary {
        count,
        mean,
        root_mean_square,
        sign_agreement,
        neighbours: k,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn residual(x: f64, value: f64) -> Residual {
        Residual {
            x,
            y: 0.0,
            depth: 0.0,
            density: 1.0,
            fitted_log: value,
            residual: value,
        }
    }

    #[test]
    fn summary_statistics() {
        let rs = [residual(0.0, 1.0), residual(1.0, -1.0), residual(2.0, 2.0), residual(3.0, -2.0)];
        let summary = summarize_residuals(&rs, 4);
        assert_eq!(summary.count, 4);
        assert_abs_diff_eq!(summary.mean, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(summary.root_mean_square, 2.5_f64.sqrt(), epsilon = 1e-12);
        assert_eq!(summary.neighbours, 3);
    }

    #[test]
    fn clustered_signs_agree_with_neighbours() {
        // Positives on the left, negatives on the right.
        let rs: Vec<Residual> = (0..10)
            .map(|i| residual(i as f64, if i < 5 { 0.5 } else { -0.5 }))
            .collect();
        let clustered = summarize_residuals(&rs, 1).sign_agreement.unwrap();
        assert!(clustered > 0.7, "{clustered}");

        let alternating: Vec<Residual> = (0..10)
            .map(|i| residual(i as f64, if i % 2 == 0 { 0.5 } else { -0.5 }))
            .collect();
        // Only the two end points reach a same-sign neighbour, at distance 2.
        let share = summarize_residuals(&alternating, 2).sign_agreement.unwrap();
        assert_abs_diff_eq!(share, 0.1, epsilon = 1e-12);
    }

    #[test]
    fn single_residual_has_no_neighbours() {
        let summary = summarize_residuals(&[residual(0.0, 1.0)], 4);
        assert_eq!(summary.sign_agreement, None);
        assert_eq!(summary.count, 1);
    }
}
