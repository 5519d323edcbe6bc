//! Marginal effect of depth with location held at the sample mean.

use crate::delta::config::ProfileConfig;
use crate::delta::data::{Observation, Support};
use crate::delta::hurdle::{DeltaModel, HurdleError};
use crate::gam::construction::Covariates;
use crate::gam::model::{FittedModel, PredictScale, Prediction};
use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// One depth of the profile. Intervals are built on the link scale and
/// back-transformed, so they are asymmetric on the natural scale. The combined
/// curve has no interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProfilePoint {
    pub depth: f64,
    pub magnitude: f64,
    pub magnitude_lower: f64,
    pub magnitude_upper: f64,
    pub presence: f64,
    pub presence_lower: f64,
    pub presence_upper: f64,
    pub combined: f64,
}

fn link_interval<M: FittedModel + ?Sized>(
    model: &M,
    covariates: &Covariates,
    z: f64,
) -> Result<(Array1<f64>, Array1<f64>, Array1<f64>), HurdleError> {
    let Prediction {
        estimate,
        standard_error,
    } = model.predict(covariates, PredictScale::Link, true)?;
    let se = standard_error.unwrap_or_else(|| Array1::from_elem(estimate.len(), f64::NAN));
    let link = model.family().link();
    let lower = (&estimate - &(&se * z)).mapv(|e| link.inverse(e));
    let upper = (&estimate + &(&se * z)).mapv(|e| link.inverse(e));
    Ok((estimate.mapv(|e| link.inverse(e)), lower, upper))
}

/// Evaluates both components along `config.points` evenly spaced depths spanning
/// the support, at the mean observed location.
pub fn marginal_depth_profile<P: FittedModel, M: FittedModel>(
    model: &DeltaModel<P, M>,
    observations: &[Observation],
    support: &Support,
    config: &ProfileConfig,
) -> Result<Vec<ProfilePoint>, HurdleError> {
    let n_obs = observations.len().max(1) as f64;
    let mean_x = observations.iter().map(|o| o.x).sum::<f64>() / n_obs;
    let mean_y = observations.iter().map(|o| o.y).sum::<f64>() / n_obs;
    let depth = Array1::linspace(support.depth_min, support.depth_max, config.points);
    let n = depth.len();
    let covariates = Covariates::new(Array1::from_elem(n, mean_x), Array1::from_elem(n, mean_y), depth.clone())
        .map_err(|e| HurdleError::Model(e.into()))?;

    let (magnitude, magnitude_lower, magnitude_upper) = link_interval(&model.magnitude, &covariates, config.z)?;
    let (presence, presence_lower, presence_upper) = link_interval(&model.presence, &covariates, config.z)?;

    Ok((0..n)
        .map(|i| ProfilePoint {
            depth: depth[i],
            magnitude: magnitude[i],
            magnitude_lower: magnitude_lower[i],
            magnitude_upper: magnitude_upper[i],
            presence: presence[i],
            presence_lower: presence_lower[i],
            presence_upper: presence_upper[i],
            combined: presence[i] * magnitude[i],
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gam::construction::{DepthScaling, DesignBlueprint, ModelSpec};
    use crate::gam::family::Family;
    use crate::gam::model::TrainedModel;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn linear_model(family: Family, coefficients: Array1<f64>, variance: f64) -> TrainedModel {
        TrainedModel {
            family,
            blueprint: DesignBlueprint {
                spec: ModelSpec::Linear { depth_degree: 1 },
                depth_scaling: DepthScaling {
                    center: 150.0,
                    scale: 50.0,
                },
                spatial: None,
            },
            coefficients,
            covariance: array![[variance, 0.0], [0.0, variance]],
            lambdas: Vec::new(),
            scale: 1.0,
            edf: 2.0,
            deviance: 0.0,
            n_obs: 20,
            depth_range: (100.0, 200.0),
        }
    }

    #[test]
    fn profile_intervals_bracket_estimates() {
        let model = DeltaModel::new(
            linear_model(Family::Binomial, array![0.2, -0.5], 0.04),
            linear_model(Family::Gamma, array![1.5, 0.3], 0.01),
        )
        .unwrap();
        let observations = [
            Observation { x: 1.0, y: 2.0, depth: 100.0, density: 0.0 },
            Observation { x: 3.0, y: 4.0, depth: 200.0, density: 1.0 },
        ];
        let support = Support {
            depth_min: 100.0,
            depth_max: 200.0,
            latitude_cutoff: 2.0,
        };
        let config = ProfileConfig {
            points: 11,
            ..ProfileConfig::default()
        };
        let profile = marginal_depth_profile(&model, &observations, &support, &config).unwrap();
        assert_eq!(profile.len(), 11);
        assert_eq!(profile[0].depth, 100.0);
        assert_eq!(profile[10].depth, 200.0);
        for point in &profile {
            assert!(point.magnitude_lower < point.magnitude && point.magnitude < point.magnitude_upper);
            assert!(point.presence_lower < point.presence && point.presence < point.presence_upper);
            assert!(point.presence_upper < 1.0 && point.presence_lower > 0.0);
            assert_abs_diff_eq!(point.combined, point.presence * point.magnitude, epsilon = 1e-12);
            assert!(point.combined > 0.0 && point.combined < point.magnitude);
        }
        // At the center depth the magnitude interval is exp(1.5 +/- 1.96 * 0.1).
        let mid = &profile[5];
        assert_abs_diff_eq!(mid.magnitude, 1.5_f64.exp(), epsilon = 1e-12);
        assert_abs_diff_eq!(mid.magnitude_upper, (1.5_f64 + 0.196).exp(), epsilon = 1e-12);
    }
}
