use crate::gam::construction::ModelLayout;
use crate::gam::estimate::EstimationError;
use crate::gam::faer_ndarray::{FaerCholesky, FaerCholeskyFactor};
use crate::gam::family::Family;
use faer::Side;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip, s};
use serde::{Deserialize, Serialize};

/// Linear predictors beyond this magnitude in a Binomial fit mean the fitted
/// probabilities are numerically 0 or 1: the data are separable.
const SEPARATION_ETA: f64 = 30.0;
/// Smallest acceptable ratio between Cholesky pivots of the penalized Hessian.
const RANK_TOLERANCE: f64 = 1e-7;
const MAX_STEP_HALVINGS: usize = 30;

/// Convergence controls for the P-IRLS inner loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PirlsOptions {
    pub max_iterations: usize,
    pub convergence_tolerance: f64,
}

impl Default for PirlsOptions {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            convergence_tolerance: 1e-8,
        }
    }
}

/// The status of the P-IRLS convergence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PirlsStatus {
    /// Converged successfully within tolerance.
    Converged,
    /// Reached maximum iterations without converging.
    MaxIterationsReached,
    /// Every step halving failed to reduce the penalized deviance.
    StepHalvingFailed,
}

/// Holds the result of a P-IRLS fit for fixed smoothing parameters.
#[derive(Clone, Debug)]
pub struct PirlsResult {
    pub beta: Array1<f64>,
    /// `X'WX + S_lambda` at convergence.
    pub penalized_hessian: Array2<f64>,
    /// The unpenalized deviance.
    pub deviance: f64,
    /// `beta' S_lambda beta`.
    pub penalty_term: f64,
    pub mu: Array1<f64>,
    pub edf: f64,
    pub status: PirlsStatus,
    pub iteration: usize,
    /// Relative change in penalized deviance at the last iteration.
    pub last_change: f64,
}

/// Moves `candidate` halfway back towards `previous` until its penalized deviance
/// is finite and no larger than `target`. Returns the accepted step, its value and
/// the number of halvings, or the last value reached when every halving fails.
fn backtrack<F>(
    previous: &Array1<f64>,
    mut candidate: Array1<f64>,
    mut value: f64,
    target: f64,
    penalized_deviance: F,
) -> Result<(Array1<f64>, f64, usize), f64>
where
    F: Fn(&Array1<f64>) -> f64,
{
    let mut halvings = 0;
    while !(value.is_finite() && value <= target) {
        if halvings == MAX_STEP_HALVINGS {
            return Err(value);
        }
        candidate = (&candidate + previous) * 0.5;
        value = penalized_deviance(&candidate);
        halvings += 1;
    }
    Ok((candidate, value, halvings))
}

/// Fits a penalized GLM for a fixed vector of smoothing parameters.
///
/// The loop starts from family-specific means rather than from `beta = 0`, solves
/// the penalized weighted least-squares problem at each iteration, and halves the
/// step while the penalized deviance increases. Convergence is declared when the
/// relative change in penalized deviance falls below the tolerance.
pub fn fit_model_for_fixed_lambda(
    lambdas: ArrayView1<f64>,
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    prior_weights: ArrayView1<f64>,
    s_list: &[Array2<f64>],
    layout: &ModelLayout,
    family: Family,
    options: &PirlsOptions,
) -> Result<PirlsResult, EstimationError> {
    let s_lambda = construct_s_lambda(lambdas, s_list, layout);
    let link = family.link();

    let mu_start = family.initial_mu(y);
    let mut eta = mu_start.mapv(|m| link.link(m));
    let (mut mu, mut weights, mut z) = update_glm_vectors(y, &eta, family, prior_weights);
    let mut beta: Option<Array1<f64>> = None;
    let mut last_penalized_deviance = f64::INFINITY;
    let mut status = PirlsStatus::MaxIterationsReached;
    let mut iteration = 0;
    let mut last_change = f64::INFINITY;
    let penalized_deviance_at = |b: &Array1<f64>| {
        let mu_b = x.dot(b).mapv(|e| link.inverse(e));
        family.deviance(y, mu_b.view(), prior_weights) + b.dot(&s_lambda.dot(b))
    };

    for iter in 1..=options.max_iterations {
        iteration = iter;

        let beta_trial = solve_penalized_least_squares(x, z.view(), weights.view(), &s_lambda)?;
        if !beta_trial.iter().all(|v| v.is_finite()) {
            log::error!("Non-finite coefficients at P-IRLS iteration {iter}");
            return Err(EstimationError::PirlsDidNotConverge {
                max_iterations: options.max_iterations,
                last_change: f64::NAN,
            });
        }

        let trial_value = penalized_deviance_at(&beta_trial);

        // The first iterate has no previous coefficients to step back towards.
        let (candidate, penalized_deviance) = match beta.as_ref() {
            None => (beta_trial, trial_value),
            Some(previous) => match backtrack(
                previous,
                beta_trial,
                trial_value,
                last_penalized_deviance,
                &penalized_deviance_at,
            ) {
                Ok((accepted, value, halvings)) => {
                    if halvings > 0 {
                        log::debug!("P-IRLS iteration {iter}: {halvings} step halvings");
                    }
                    (accepted, value)
                }
                Err(value) => {
                    // The previous iterate stands. A failed step that is flat within
                    // tolerance still counts as converged.
                    let excess = (value - last_penalized_deviance) / (last_penalized_deviance.abs() + 0.1);
                    if excess < options.convergence_tolerance {
                        log::debug!("P-IRLS iteration {iter}: no further descent, relative excess {excess:.3e}");
                        status = PirlsStatus::Converged;
                    } else {
                        log::warn!(
                            "P-IRLS iteration {iter}: {MAX_STEP_HALVINGS} step halvings failed to reduce the penalized deviance"
                        );
                        status = PirlsStatus::StepHalvingFailed;
                    }
                    break;
                }
            },
        };
        let eta_trial = x.dot(&candidate);

        let change = (last_penalized_deviance - penalized_deviance).abs()
            / (penalized_deviance.abs() + 0.1);
        log::debug!(
            "[P-IRLS Iter #{iter}] penalized deviance {penalized_deviance:.8e}, relative change {change:.3e}"
        );

        beta = Some(candidate);
        eta = eta_trial;
        let (mu_next, weights_next, z_next) = update_glm_vectors(y, &eta, family, prior_weights);
        mu = mu_next;
        weights = weights_next;
        z = z_next;
        last_penalized_deviance = penalized_deviance;
        last_change = change;

        if change < options.convergence_tolerance {
            status = PirlsStatus::Converged;
            break;
        }
    }

    let beta = beta.ok_or(EstimationError::PirlsDidNotConverge {
        max_iterations: options.max_iterations,
        last_change: f64::NAN,
    })?;
    let max_abs_eta = eta.iter().fold(0.0_f64, |acc, &e| acc.max(e.abs()));
    if family == Family::Binomial && max_abs_eta > SEPARATION_ETA {
        return Err(EstimationError::PerfectSeparation { max_abs_eta });
    }

    let (xtwx, hessian) = penalized_hessian(x, weights.view(), &s_lambda);
    let factor = checked_cholesky(&hessian)?;
    let edf = calculate_edf(&factor, &xtwx);
    let deviance = family.deviance(y, mu.view(), prior_weights);
    let penalty_term = beta.dot(&s_lambda.dot(&beta));

    if status == PirlsStatus::MaxIterationsReached {
        log::debug!(
            "P-IRLS reached {} iterations without converging",
            options.max_iterations
        );
    }

    Ok(PirlsResult {
        beta,
        penalized_hessian: hessian,
        deviance,
        penalty_term,
        mu,
        edf,
        status,
        iteration,
        last_change,
    })
}

/// Computes the IRLS mean, working weights and working response for the current
/// linear predictor.
pub fn update_glm_vectors(
    y: ArrayView1<f64>,
    eta: &Array1<f64>,
    family: Family,
    prior_weights: ArrayView1<f64>,
) -> (Array1<f64>, Array1<f64>, Array1<f64>) {
    const MIN_WEIGHT: f64 = 1e-10;
    let link = family.link();
    let mu = eta.mapv(|e| link.inverse(e));
    let mut weights = Array1::zeros(eta.len());
    let mut z = Array1::zeros(eta.len());
    Zip::from(&mut weights)
        .and(&mut z)
        .and(eta)
        .and(&mu)
        .and(y)
        .and(prior_weights)
        .for_each(|w, zi, &e, &m, &yi, &pw| {
            let d = link.mu_eta(e).max(MIN_WEIGHT);
            *w = (pw * d * d / family.variance(m)).max(MIN_WEIGHT);
            *zi = e + (yi - m) / d;
        });
    (mu, weights, z)
}

/// Helper to construct the summed, weighted penalty matrix `S_lambda` at full size.
pub fn construct_s_lambda(
    lambdas: ArrayView1<f64>,
    s_list: &[Array2<f64>],
    layout: &ModelLayout,
) -> Array2<f64> {
    let p = layout.total_coeffs;
    let mut s_lambda = Array2::zeros((p, p));
    for block in &layout.penalty_map {
        let range = block.col_range.clone();
        s_lambda
            .slice_mut(s![range.clone(), range])
            .scaled_add(lambdas[block.penalty_idx], &s_list[block.penalty_idx]);
    }
    s_lambda
}

/// Returns `X'WX` and `X'WX + S_lambda`.
fn penalized_hessian(
    x: ArrayView2<f64>,
    weights: ArrayView1<f64>,
    s_lambda: &Array2<f64>,
) -> (Array2<f64>, Array2<f64>) {
    let wx = &x * &weights.insert_axis(Axis(1));
    let xtwx = x.t().dot(&wx);
    let h = &xtwx + s_lambda;
    (xtwx, h)
}

/// Cholesky-factors a penalized Hessian, reporting numerical rank deficiency.
pub fn checked_cholesky(h: &Array2<f64>) -> Result<FaerCholeskyFactor, EstimationError> {
    let factor = h
        .cholesky(Side::Lower)
        .map_err(|_| EstimationError::RankDeficient { pivot_ratio: 0.0 })?;
    let pivot_ratio = factor.pivot_ratio();
    if !(pivot_ratio > RANK_TOLERANCE) {
        return Err(EstimationError::RankDeficient { pivot_ratio });
    }
    Ok(factor)
}

/// Solves `(X'WX + S) beta = X'Wz` for one P-IRLS step.
fn solve_penalized_least_squares(
    x: ArrayView2<f64>,
    z: ArrayView1<f64>,
    weights: ArrayView1<f64>,
    s_lambda: &Array2<f64>,
) -> Result<Array1<f64>, EstimationError> {
    let (_, h) = penalized_hessian(x, weights, s_lambda);
    let factor = checked_cholesky(&h)?;
    let rhs = x.t().dot(&(&z * &weights));
    Ok(factor.solve_vec(&rhs))
}

/// Effective degrees of freedom `tr((X'WX + S)^-1 X'WX)`.
fn calculate_edf(factor: &FaerCholeskyFactor, xtwx: &Array2<f64>) -> f64 {
    factor.solve_mat(xtwx).diag().sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gam::construction::{Covariates, ModelSpec, build_design_and_penalty_matrices};
    use approx::assert_abs_diff_eq;
    use ndarray::{Array, array};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::{Distribution, Gamma as GammaDist};

    fn intercept_only(n: usize) -> (Array2<f64>, ModelLayout) {
        (Array2::ones((n, 1)), ModelLayout::new(0, None))
    }

    #[test]
    fn binomial_intercept_recovers_sample_proportion() {
        let y = array![0.0, 1.0, 1.0, 0.0, 1.0];
        let (x, layout) = intercept_only(y.len());
        let w = Array1::ones(y.len());
        let fit = fit_model_for_fixed_lambda(
            Array1::zeros(0).view(),
            x.view(),
            y.view(),
            w.view(),
            &[],
            &layout,
            Family::Binomial,
            &PirlsOptions::default(),
        )
        .unwrap();
        assert_eq!(fit.status, PirlsStatus::Converged);
        assert_abs_diff_eq!(fit.mu[0], 0.6, epsilon = 1e-6);
        assert_abs_diff_eq!(fit.beta[0], (0.6_f64 / 0.4).ln(), epsilon = 1e-6);
        assert_abs_diff_eq!(fit.edf, 1.0, epsilon = 1e-10);
    }

    #[test]
    fn gamma_intercept_recovers_sample_mean() {
        let y = array![1.0, 2.0, 4.0, 9.0];
        let (x, layout) = intercept_only(y.len());
        let w = Array1::ones(y.len());
        let fit = fit_model_for_fixed_lambda(
            Array1::zeros(0).view(),
            x.view(),
            y.view(),
            w.view(),
            &[],
            &layout,
            Family::Gamma,
            &PirlsOptions::default(),
        )
        .unwrap();
        assert_abs_diff_eq!(fit.mu[0], 4.0, epsilon = 1e-6);
        assert!(fit.deviance > 0.0);
    }

    #[test]
    fn gamma_log_link_recovers_depth_slope() {
        let n = 2000;
        let mut rng = StdRng::seed_from_u64(7);
        let depth = Array::linspace(-1.0, 1.0, n);
        let shape = 5.0;
        let y = depth.mapv(|d: f64| {
            let mean = (1.0 + 0.8 * d).exp();
            GammaDist::new(shape, mean / shape).unwrap().sample(&mut rng)
        });
        let cov = Covariates::new(Array1::zeros(n), Array1::zeros(n), depth.clone()).unwrap();
        let (x, s_list, layout, _) =
            build_design_and_penalty_matrices(&cov, &ModelSpec::Linear { depth_degree: 1 })
                .unwrap();
        let w = Array1::ones(n);
        let fit = fit_model_for_fixed_lambda(
            Array1::zeros(0).view(),
            x.view(),
            y.view(),
            w.view(),
            &s_list,
            &layout,
            Family::Gamma,
            &PirlsOptions::default(),
        )
        .unwrap();
        // The design uses standardized depth; convert the slope back.
        let sd = (depth.mapv(|d| d * d).sum() / (n as f64 - 1.0)).sqrt();
        assert!((fit.beta[1] / sd - 0.8).abs() < 0.1, "slope {}", fit.beta[1] / sd);
        assert!((fit.beta[0] - 1.0).abs() < 0.1, "intercept {}", fit.beta[0]);
    }

    #[test]
    fn separable_binomial_data_is_reported() {
        let n = 40;
        let depth = Array::linspace(0.0, 1.0, n);
        let y = depth.mapv(|d| if d > 0.5 { 1.0 } else { 0.0 });
        let cov = Covariates::new(Array1::zeros(n), Array1::zeros(n), depth).unwrap();
        let (x, s_list, layout, _) =
            build_design_and_penalty_matrices(&cov, &ModelSpec::Linear { depth_degree: 1 })
                .unwrap();
        let w = Array1::ones(n);
        let err = fit_model_for_fixed_lambda(
            Array1::zeros(0).view(),
            x.view(),
            y.view(),
            w.view(),
            &s_list,
            &layout,
            Family::Binomial,
            &PirlsOptions::default(),
        )
        .unwrap_err();
        assert!(
            matches!(
                err,
                EstimationError::PerfectSeparation { .. } | EstimationError::RankDeficient { .. }
            ),
            "unexpected error {err:?}"
        );
    }

    #[test]
    fn duplicated_columns_are_rank_deficient() {
        let n = 20;
        let mut rng = StdRng::seed_from_u64(3);
        let col = Array1::from_shape_fn(n, |_| rng.gen_range(0.0..1.0));
        let mut x = Array2::ones((n, 3));
        x.column_mut(1).assign(&col);
        x.column_mut(2).assign(&col);
        let layout = ModelLayout {
            intercept_col: 0,
            depth_cols: 1..3,
            spatial_cols: None,
            penalty_map: Vec::new(),
            total_coeffs: 3,
            num_penalties: 0,
        };
        let y = col.mapv(|v| 1.0 + v);
        let w = Array1::ones(n);
        let err = fit_model_for_fixed_lambda(
            Array1::zeros(0).view(),
            x.view(),
            y.view(),
            w.view(),
            &[],
            &layout,
            Family::Gamma,
            &PirlsOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, EstimationError::RankDeficient { .. }));
    }

    #[test]
    fn backtracking_halves_towards_previous_iterate() {
        let quadratic = |b: &Array1<f64>| (b[0] - 1.0).powi(2);
        let previous = array![0.0];
        let (accepted, value, halvings) =
            backtrack(&previous, array![4.0], 9.0, 1.0, quadratic).unwrap();
        assert_eq!(halvings, 1);
        assert_eq!(accepted, array![2.0]);
        assert_eq!(value, 1.0);

        let (accepted, _, halvings) = backtrack(&previous, array![1.5], 0.25, 1.0, quadratic).unwrap();
        assert_eq!(halvings, 0);
        assert_eq!(accepted, array![1.5]);
    }

    #[test]
    fn exhausted_halvings_are_reported() {
        let previous = array![0.0];
        let uphill = |b: &Array1<f64>| 2.0 + b[0].abs();
        assert_eq!(backtrack(&previous, array![1.0], 3.0, 1.0, uphill), Err(2.0 + 0.5_f64.powi(30)));

        let undefined = |_: &Array1<f64>| f64::NAN;
        assert!(backtrack(&previous, array![1.0], f64::NAN, 1.0, undefined).unwrap_err().is_nan());
    }

    #[test]
    fn heavier_penalty_lowers_effective_degrees_of_freedom() {
        let n = 10;
        let x = Array2::from_shape_fn((n, 3), |(i, j)| if j == 0 { 1.0 } else { ((i * (j + 1)) % 7) as f64 });
        let layout = ModelLayout {
            intercept_col: 0,
            depth_cols: 1..1,
            spatial_cols: Some(1..3),
            penalty_map: vec![crate::gam::construction::PenalizedBlock {
                term_name: "test".to_string(),
                col_range: 1..3,
                penalty_idx: 0,
            }],
            total_coeffs: 3,
            num_penalties: 1,
        };
        let s_list = vec![Array2::eye(2)];
        let y = Array1::from_shape_fn(n, |i| 1.0 + (i % 3) as f64);
        let w = Array1::ones(n);
        let fit_at = |lambda: f64| {
            fit_model_for_fixed_lambda(
                array![lambda].view(),
                x.view(),
                y.view(),
                w.view(),
                &s_list,
                &layout,
                Family::Gamma,
                &PirlsOptions::default(),
            )
            .unwrap()
        };
        let light = fit_at(1e-6);
        let heavy = fit_at(1e6);
        assert!(light.edf > 2.9);
        assert!(heavy.edf < 1.01);
        assert!(heavy.edf >= 1.0 - 1e-9);
    }
}
