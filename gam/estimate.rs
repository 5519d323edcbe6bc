//! # Model estimation via penalized likelihood
//!
//! The fit is a nested optimization:
//!
//! 1.  **Outer loop (BFGS):** chooses the log smoothing parameters `rho`, one per
//!     penalty, by minimizing either the negative Laplace approximate marginal
//!     likelihood (LAML) or generalized cross-validation (GCV). A grid of seeds is
//!     evaluated first and the best one starts the quasi-Newton search.
//!
//! 2.  **Inner loop (P-IRLS):** for each trial `rho`, finds the coefficients by
//!     penalized iteratively reweighted least squares.
//!
//! Unpenalized specs skip the outer loop and are fitted by P-IRLS alone.

use wolfe_bfgs::{Bfgs, BfgsSolution};

use crate::gam::construction::{
    ConstructionError, Covariates, ModelLayout, ModelSpec, build_design_and_penalty_matrices,
};
use crate::gam::faer_ndarray::{FaerEigh, FaerLinalgError, log_pseudo_determinant};
use crate::gam::family::{Family, ResponseError};
use crate::gam::model::TrainedModel;
use crate::gam::pirls::{self, PirlsOptions, PirlsResult, PirlsStatus};
use crate::gam::seeding::{RHO_BOUNDS, SeedStrategy, generate_rho_candidates};

use faer::Side;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Zip, s};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use thiserror::Error;

/// Returned by the cost closure when a trial `rho` cannot be evaluated.
const FAILED_COST: f64 = 1e10;
const GRADIENT_STEP: f64 = 1e-4;

/// A comprehensive error type for the model estimation process.
#[derive(Error, Debug)]
pub enum EstimationError {
    #[error("Failed to build the design and penalty matrices: {0}")]
    Construction(#[from] ConstructionError),

    #[error("Invalid response: {0}")]
    Response(#[from] ResponseError),

    #[error("Response has {response} values but the covariates have {covariates} rows.")]
    ResponseLengthMismatch { response: usize, covariates: usize },

    #[error("Only {n} observations were supplied; at least {required} are needed for this model.")]
    InsufficientData { n: usize, required: usize },

    #[error(
        "The penalized Hessian is numerically rank deficient (pivot ratio {pivot_ratio:.3e}). \
         The design has collinear or unidentifiable columns."
    )]
    RankDeficient { pivot_ratio: f64 },

    #[error(
        "Perfect or quasi-perfect separation: the linear predictor reached |eta| = {max_abs_eta:.1}. \
         The presence data can be split exactly by the covariates."
    )]
    PerfectSeparation { max_abs_eta: f64 },

    #[error(
        "The P-IRLS inner loop did not converge within {max_iterations} iterations. Last deviance change was {last_change:.6e}."
    )]
    PirlsDidNotConverge {
        max_iterations: usize,
        last_change: f64,
    },

    #[error("A linear algebra routine failed: {0}")]
    Linalg(#[from] FaerLinalgError),

    #[error("Smoothing parameter selection failed: {0}")]
    SmoothingOptimizationFailed(String),
}

/// Criterion minimized when selecting smoothing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmoothingCriterion {
    Laml,
    Gcv,
}

impl SmoothingCriterion {
    /// LAML for known-scale families, GCV when the scale must be estimated.
    pub fn default_for(family: Family) -> Self {
        if family.has_known_scale() {
            SmoothingCriterion::Laml
        } else {
            SmoothingCriterion::Gcv
        }
    }
}

/// Convergence controls for both loops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitOptions {
    pub max_iterations: usize,
    pub convergence_tolerance: f64,
    pub smoothing_max_iterations: usize,
    pub smoothing_tolerance: f64,
    /// Overrides the family default when set.
    pub criterion: Option<SmoothingCriterion>,
    pub seeding: SeedStrategy,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            convergence_tolerance: 1e-8,
            smoothing_max_iterations: 100,
            smoothing_tolerance: 1e-6,
            criterion: None,
            seeding: SeedStrategy::Light,
        }
    }
}

impl FitOptions {
    fn pirls(&self) -> PirlsOptions {
        PirlsOptions {
            max_iterations: self.max_iterations,
            convergence_tolerance: self.convergence_tolerance,
        }
    }
}

/// The single fitting entry point. The `spec` selects the covariate structure; the
/// `family` selects the response distribution and link.
pub fn fit_model(
    covariates: &Covariates,
    response: ArrayView1<f64>,
    family: Family,
    spec: &ModelSpec,
    options: &FitOptions,
) -> Result<TrainedModel, EstimationError> {
    if response.len() != covariates.len() {
        return Err(EstimationError::ResponseLengthMismatch {
            response: response.len(),
            covariates: covariates.len(),
        });
    }
    family.validate_response(response)?;
    log::info!(
        "Fitting {family} model ({}) to {} observations.",
        spec_label(spec),
        response.len()
    );

    let (x_matrix, s_list, layout, blueprint) = build_design_and_penalty_matrices(covariates, spec)?;
    let unpenalized = layout.depth_cols.end;
    if response.len() < unpenalized {
        return Err(EstimationError::InsufficientData {
            n: response.len(),
            required: unpenalized,
        });
    }
    log_layout_info(&layout);

    let prior_weights = Array1::ones(response.len());
    let state = SmoothingState::new(
        x_matrix.view(),
        response.view(),
        prior_weights.view(),
        &s_list,
        &layout,
        family,
        options,
    )?;

    let rho = if layout.num_penalties == 0 {
        Array1::zeros(0)
    } else {
        state.select_rho()?
    };
    let lambdas = rho.mapv(f64::exp);

    // Fit one last time at the selected smoothing parameters.
    let fit = pirls::fit_model_for_fixed_lambda(
        lambdas.view(),
        x_matrix.view(),
        response,
        prior_weights.view(),
        &s_list,
        &layout,
        family,
        &options.pirls(),
    )?;
    if fit.status != PirlsStatus::Converged {
        return Err(EstimationError::PirlsDidNotConverge {
            max_iterations: options.max_iterations,
            last_change: fit.last_change,
        });
    }

    let scale = estimate_scale(family, response, &fit);
    let factor = pirls::checked_cholesky(&fit.penalized_hessian)?;
    let covariance = factor.inverse() * scale;

    log::info!(
        "Fit complete after {} P-IRLS iterations: deviance {:.4}, edf {:.3}, scale {:.4}, lambdas {:?}",
        fit.iteration,
        fit.deviance,
        fit.edf,
        scale,
        lambdas.to_vec()
    );

    let (depth_min, depth_max) = covariates
        .depth
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &d| (lo.min(d), hi.max(d)));

    Ok(TrainedModel {
        family,
        blueprint,
        coefficients: fit.beta,
        covariance,
        lambdas: lambdas.to_vec(),
        scale,
        edf: fit.edf,
        deviance: fit.deviance,
        n_obs: response.len(),
        depth_range: (depth_min, depth_max),
    })
}

fn spec_label(spec: &ModelSpec) -> String {
    match spec {
        ModelSpec::Linear { depth_degree } => format!("GLM, depth degree {depth_degree}"),
        ModelSpec::AdditiveSpatial { depth_degree, .. } => {
            format!("GAM, depth degree {depth_degree} + te(x,y)")
        }
    }
}

/// Helper to log the final model structure.
fn log_layout_info(layout: &ModelLayout) {
    log::info!("Model structure has {} total coefficients.", layout.total_coeffs);
    log::debug!("  - Intercept: column {}.", layout.intercept_col);
    if !layout.depth_cols.is_empty() {
        log::debug!("  - Depth polynomial: {} coefficients.", layout.depth_cols.len());
    }
    if let Some(cols) = &layout.spatial_cols {
        log::debug!("  - Spatial smooth: {} coefficients.", cols.len());
    }
    for block in &layout.penalty_map {
        log::debug!("  - Penalty {}: {}", block.penalty_idx, block.term_name);
    }
}

/// Dispersion of the fitted model: 1 for the Binomial family, otherwise the
/// Pearson estimate `sum(w (y - mu)^2 / V(mu)) / (n - edf)`.
fn estimate_scale(family: Family, y: ArrayView1<f64>, fit: &PirlsResult) -> f64 {
    if family.has_known_scale() {
        return 1.0;
    }
    let residual_df = y.len() as f64 - fit.edf;
    if residual_df <= 1e-8 {
        log::warn!(
            "No residual degrees of freedom (n = {}, edf = {:.3}); the {family} scale cannot be estimated and standard errors are undefined.",
            y.len(),
            fit.edf
        );
        return f64::NAN;
    }
    let pearson = Zip::from(y)
        .and(&fit.mu)
        .fold(0.0, |acc, &yi, &mi| acc + (yi - mi).powi(2) / family.variance(mi));
    pearson / residual_df
}

/// Holds the state for the outer smoothing-parameter search, including a cache of
/// inner-loop fits keyed by the exact bits of `rho`.
struct SmoothingState<'a> {
    x: ArrayView2<'a, f64>,
    y: ArrayView1<'a, f64>,
    prior_weights: ArrayView1<'a, f64>,
    s_list: &'a [Array2<f64>],
    layout: &'a ModelLayout,
    family: Family,
    criterion: SmoothingCriterion,
    options: &'a FitOptions,
    /// Rank of the summed penalty; fixed regardless of `rho`.
    penalty_rank: usize,
    cache: RefCell<HashMap<Vec<u64>, PirlsResult>>,
}

impl<'a> SmoothingState<'a> {
    fn new(
        x: ArrayView2<'a, f64>,
        y: ArrayView1<'a, f64>,
        prior_weights: ArrayView1<'a, f64>,
        s_list: &'a [Array2<f64>],
        layout: &'a ModelLayout,
        family: Family,
        options: &'a FitOptions,
    ) -> Result<Self, EstimationError> {
        let penalty_rank = match s_list.first() {
            Some(first) => {
                let total = s_list.iter().skip(1).fold(first.clone(), |acc, s| acc + s);
                log_pseudo_determinant(&total, 1e-10)?.1
            }
            None => 0,
        };
        let criterion = options
            .criterion
            .unwrap_or_else(|| SmoothingCriterion::default_for(family));
        Ok(Self {
            x,
            y,
            prior_weights,
            s_list,
            layout,
            family,
            criterion,
            options,
            penalty_rank,
            cache: RefCell::new(HashMap::new()),
        })
    }

    fn fit_at(&self, rho: &Array1<f64>) -> Result<PirlsResult, EstimationError> {
        let key: Vec<u64> = rho.iter().map(|v| v.to_bits()).collect();
        if let Some(hit) = self.cache.borrow().get(&key) {
            return Ok(hit.clone());
        }
        let fit = pirls::fit_model_for_fixed_lambda(
            rho.mapv(f64::exp).view(),
            self.x,
            self.y,
            self.prior_weights,
            self.s_list,
            self.layout,
            self.family,
            &self.options.pirls(),
        )?;
        self.cache.borrow_mut().insert(key, fit.clone());
        Ok(fit)
    }

    /// `log|S_lambda|+` over the largest `penalty_rank` eigenvalues of the summed
    /// block penalty, so the count of terms does not change with `rho`.
    fn penalty_log_det(&self, rho: &Array1<f64>) -> Result<f64, EstimationError> {
        let Some(first) = self.s_list.first() else {
            return Ok(0.0);
        };
        let mut total = Array2::zeros(first.raw_dim());
        for (s, &r) in self.s_list.iter().zip(rho.iter()) {
            total.scaled_add(r.exp(), s);
        }
        let (eigenvalues, _) = total.eigh(Side::Lower)?;
        let n = eigenvalues.len();
        Ok(eigenvalues
            .slice(s![n - self.penalty_rank..])
            .iter()
            .map(|&v| v.max(f64::MIN_POSITIVE).ln())
            .sum())
    }

    fn compute_cost(&self, rho: &Array1<f64>) -> Result<f64, EstimationError> {
        let fit = self.fit_at(rho)?;
        let n = self.y.len() as f64;
        match self.criterion {
            SmoothingCriterion::Gcv => {
                let denom = n - fit.edf;
                if denom <= 0.0 {
                    return Ok(f64::INFINITY);
                }
                Ok(n * fit.deviance / (denom * denom))
            }
            SmoothingCriterion::Laml => {
                let log_det_s = self.penalty_log_det(rho)?;
                let log_det_h = pirls::checked_cholesky(&fit.penalized_hessian)?.log_determinant();
                let penalized_deviance = fit.deviance + fit.penalty_term;
                if self.family.has_known_scale() {
                    return Ok(0.5 * penalized_deviance - 0.5 * log_det_s + 0.5 * log_det_h);
                }
                // Profile out the scale for estimated-scale families.
                let p = self.layout.total_coeffs as f64;
                let null_dim = p - self.penalty_rank as f64;
                let residual_df = n - null_dim;
                if residual_df <= 0.0 || penalized_deviance <= 0.0 {
                    return Ok(f64::INFINITY);
                }
                let phi = penalized_deviance / residual_df;
                Ok(penalized_deviance / (2.0 * phi) - 0.5 * (log_det_s - self.penalty_rank as f64 * phi.ln())
                    + 0.5 * (log_det_h - p * phi.ln())
                    + 0.5 * residual_df * (2.0 * std::f64::consts::PI * phi).ln())
            }
        }
    }

    /// Cost with failures mapped to a large finite value so line searches can back
    /// off instead of aborting.
    fn bounded_cost(&self, rho: &Array1<f64>) -> f64 {
        let rho = rho.mapv(|v| v.clamp(RHO_BOUNDS.0, RHO_BOUNDS.1));
        match self.compute_cost(&rho) {
            Ok(cost) if cost.is_finite() => cost,
            Ok(cost) => {
                log::debug!("Non-finite criterion {cost} at rho {:?}", rho.to_vec());
                FAILED_COST
            }
            Err(e) => {
                log::debug!("Criterion evaluation failed at rho {:?}: {e}", rho.to_vec());
                FAILED_COST
            }
        }
    }

    /// Central-difference gradient of the bounded cost.
    fn numeric_gradient(&self, rho: &Array1<f64>) -> Array1<f64> {
        let mut grad = Array1::zeros(rho.len());
        for k in 0..rho.len() {
            let mut forward = rho.clone();
            let mut backward = rho.clone();
            forward[k] += GRADIENT_STEP;
            backward[k] -= GRADIENT_STEP;
            grad[k] = (self.bounded_cost(&forward) - self.bounded_cost(&backward)) / (2.0 * GRADIENT_STEP);
        }
        grad
    }

    fn select_rho(&self) -> Result<Array1<f64>, EstimationError> {
        let seeds = generate_rho_candidates(self.layout.num_penalties, self.options.seeding);
        let mut best: Option<(Array1<f64>, f64)> = None;
        for seed in seeds {
            let cost = self.bounded_cost(&seed);
            log::debug!("Seed {:?}: criterion {cost:.6}", seed.to_vec());
            if cost < FAILED_COST && best.as_ref().is_none_or(|(_, c)| cost < *c) {
                best = Some((seed, cost));
            }
        }
        let (best_seed, best_cost) = best.ok_or_else(|| {
            EstimationError::SmoothingOptimizationFailed(
                "no candidate smoothing parameters produced a valid fit".to_string(),
            )
        })?;
        log::info!(
            "Best {:?} seed {:?} with criterion {best_cost:.6}",
            self.criterion,
            best_seed.to_vec()
        );

        let cost_and_grad = |rho: &Array1<f64>| -> (f64, Array1<f64>) {
            (self.bounded_cost(rho), self.numeric_gradient(rho))
        };
        let outcome = Bfgs::new(best_seed.clone(), cost_and_grad)
            .with_tolerance(self.options.smoothing_tolerance)
            .with_max_iterations(self.options.smoothing_max_iterations)
            .run();

        let rho = match outcome {
            Ok(BfgsSolution {
                final_point,
                final_value,
                iterations,
                ..
            }) if final_value <= best_cost => {
                log::info!("BFGS finished in {iterations} iterations with criterion {final_value:.6}");
                final_point.mapv(|v| v.clamp(RHO_BOUNDS.0, RHO_BOUNDS.1))
            }
            Ok(solution) => {
                log::warn!(
                    "BFGS ended at criterion {:.6}, worse than the best seed; keeping the seed",
                    solution.final_value
                );
                best_seed
            }
            Err(e) => {
                log::warn!("BFGS failed ({e:?}); falling back to the best seed");
                best_seed
            }
        };
        Ok(rho)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gam::basis::BasisConfig;
    use crate::gam::model::{FittedModel, PredictScale};
    use approx::assert_abs_diff_eq;
    use ndarray::{Array, array};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::{Distribution, Gamma as GammaDist};

    fn spatial_spec() -> ModelSpec {
        ModelSpec::AdditiveSpatial {
            depth_degree: 1,
            x_basis: BasisConfig { num_knots: 4, degree: 3 },
            y_basis: BasisConfig { num_knots: 4, degree: 3 },
            penalty_order: 2,
        }
    }

    /// Gamma magnitudes whose mean varies strongly along x and barely along y.
    fn spatial_survey(n: usize, seed: u64) -> (Covariates, Array1<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let x: Array1<f64> = Array1::from_shape_fn(n, |_| rng.gen_range(0.0..10.0));
        let y = Array1::from_shape_fn(n, |_| rng.gen_range(0.0..10.0));
        let depth = Array1::from_shape_fn(n, |_| rng.gen_range(50.0..250.0));
        let shape = 8.0;
        let response = Array1::from_shape_fn(n, |i| {
            let mean = (1.0 + (x[i] * 0.6).sin() + 0.002 * depth[i]).exp();
            GammaDist::new(shape, mean / shape).unwrap().sample(&mut rng)
        });
        (Covariates::new(x, y, depth).unwrap(), response)
    }

    #[test]
    fn intercept_only_binomial_matches_proportion() {
        let n = 9;
        let cov = Covariates::new(Array1::zeros(n), Array1::zeros(n), Array::linspace(1.0, 9.0, n)).unwrap();
        let y = array![1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0];
        let model = fit_model(
            &cov,
            y.view(),
            Family::Binomial,
            &ModelSpec::Linear { depth_degree: 0 },
            &FitOptions::default(),
        )
        .unwrap();
        let pred = model.predict(&cov, PredictScale::Response, false).unwrap();
        assert!(pred.estimate.iter().all(|&p| (p - 1.0 / 3.0).abs() < 1e-6));
        assert_eq!(model.scale, 1.0);
        assert!(model.lambdas.is_empty());
    }

    #[test]
    fn constant_response_is_rejected() {
        let n = 5;
        let cov = Covariates::new(Array1::zeros(n), Array1::zeros(n), Array::linspace(1.0, 5.0, n)).unwrap();
        let err = fit_model(
            &cov,
            Array1::from_elem(n, 1.0).view(),
            Family::Binomial,
            &ModelSpec::Linear { depth_degree: 1 },
            &FitOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            EstimationError::Response(ResponseError::NoVariation { count: 5, .. })
        ));
    }

    #[test]
    fn too_few_observations_for_polynomial() {
        let cov = Covariates::new(Array1::zeros(2), Array1::zeros(2), array![1.0, 2.0]).unwrap();
        let err = fit_model(
            &cov,
            array![1.0, 2.0].view(),
            Family::Gamma,
            &ModelSpec::Linear { depth_degree: 2 },
            &FitOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, EstimationError::InsufficientData { n: 2, required: 3 }));
    }

    #[test]
    fn unconverged_inner_loop_is_an_error() {
        let n = 200;
        let mut rng = StdRng::seed_from_u64(13);
        let depth = Array::linspace(50.0, 250.0, n);
        let y = depth.mapv(|d: f64| {
            let mean = (0.5 + 0.01 * d).exp();
            GammaDist::new(3.0, mean / 3.0).unwrap().sample(&mut rng)
        });
        let cov = Covariates::new(Array1::zeros(n), Array1::zeros(n), depth).unwrap();
        let options = FitOptions {
            max_iterations: 1,
            ..FitOptions::default()
        };
        let err = fit_model(&cov, y.view(), Family::Gamma, &ModelSpec::Linear { depth_degree: 1 }, &options)
            .unwrap_err();
        assert!(
            matches!(err, EstimationError::PirlsDidNotConverge { max_iterations: 1, .. }),
            "unexpected error {err:?}"
        );
    }

    #[test]
    fn gamma_glm_estimates_scale_and_errors() {
        let n = 500;
        let mut rng = StdRng::seed_from_u64(11);
        let depth = Array::linspace(50.0, 250.0, n);
        let shape = 4.0;
        let y = depth.mapv(|d: f64| {
            let mean = (0.5 + 0.01 * d).exp();
            GammaDist::new(shape, mean / shape).unwrap().sample(&mut rng)
        });
        let cov = Covariates::new(Array1::zeros(n), Array1::zeros(n), depth).unwrap();
        let model = fit_model(
            &cov,
            y.view(),
            Family::Gamma,
            &ModelSpec::Linear { depth_degree: 1 },
            &FitOptions::default(),
        )
        .unwrap();
        // Gamma dispersion is 1 / shape.
        assert!((model.scale - 0.25).abs() < 0.05, "scale {}", model.scale);
        assert_abs_diff_eq!(model.edf, 2.0, epsilon = 1e-8);
        let center = Covariates::new(array![0.0], array![0.0], array![150.0]).unwrap();
        let pred = model.predict(&center, PredictScale::Link, true).unwrap();
        assert!((pred.estimate[0] - 2.0).abs() < 0.1);
        let se = pred.standard_error.unwrap()[0];
        // Roughly sqrt(phi / n) at the center of the data.
        assert!(se > 0.01 && se < 0.05, "se {se}");
    }

    #[test]
    fn spatial_gam_selects_anisotropic_smoothing() {
        let (cov, y) = spatial_survey(400, 5);
        let model = fit_model(&cov, y.view(), Family::Gamma, &spatial_spec(), &FitOptions::default()).unwrap();
        assert_eq!(model.lambdas.len(), 2);
        assert!(model.edf > 3.0);
        // y carries no signal, so it should be smoothed more heavily than x.
        assert!(model.lambdas[1] > model.lambdas[0], "lambdas {:?}", model.lambdas);
    }

    #[test]
    fn spatial_gam_beats_depth_only_glm() {
        let (cov, y) = spatial_survey(400, 9);
        let options = FitOptions::default();
        let glm = fit_model(&cov, y.view(), Family::Gamma, &ModelSpec::Linear { depth_degree: 1 }, &options)
            .unwrap();
        let gam = fit_model(&cov, y.view(), Family::Gamma, &spatial_spec(), &options).unwrap();
        assert!(gam.deviance < 0.8 * glm.deviance, "gam {} glm {}", gam.deviance, glm.deviance);
    }

    #[test]
    fn laml_can_be_forced_for_gamma() {
        let (cov, y) = spatial_survey(300, 21);
        let options = FitOptions {
            criterion: Some(SmoothingCriterion::Laml),
            ..FitOptions::default()
        };
        let model = fit_model(&cov, y.view(), Family::Gamma, &spatial_spec(), &options).unwrap();
        assert!(model.scale.is_finite() && model.scale > 0.0);
        assert!(model.lambdas.iter().all(|l| l.is_finite() && *l > 0.0));
    }
}
