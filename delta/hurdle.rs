//! # The delta (hurdle) combiner
//!
//! The unconditional expectation of a zero-inflated positive response factors as
//! `E[Y] = P(Y > 0) * E[Y | Y > 0]`. A presence model estimates the first factor on
//! every observation; a magnitude model estimates the second on the positive ones.

use crate::delta::data::{self, DataError, Located, Observation};
use crate::gam::construction::{Covariates, ModelSpec};
use crate::gam::estimate::{EstimationError, FitOptions, fit_model};
use crate::gam::family::Family;
use crate::gam::model::{FittedModel, ModelError, PredictScale, TrainedModel};
use ndarray::{Array1, Zip};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HurdleError {
    #[error("Fitting the {role} model failed: {source}")]
    Estimation {
        role: &'static str,
        source: EstimationError,
    },
    #[error("Prediction failed: {0}")]
    Model(#[from] ModelError),
    #[error("Data error: {0}")]
    Data(#[from] DataError),
    #[error("No observation has a positive density; the magnitude model cannot be fitted.")]
    NoPositiveObservations,
    #[error("The {role} model must use the {expected} family, found {found}.")]
    FamilyMismatch {
        role: &'static str,
        expected: Family,
        found: Family,
    },
}

/// One grid site with its presence, magnitude and combined predictions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CombinedPrediction {
    pub x: f64,
    pub y: f64,
    pub depth: f64,
    pub positive_prediction: f64,
    pub binary_prediction: f64,
    pub combined_prediction: f64,
}

/// Natural-scale predictions of both components and their product.
#[derive(Debug, Clone)]
pub struct Components {
    pub presence: Array1<f64>,
    pub magnitude: Array1<f64>,
    pub combined: Array1<f64>,
}

/// A presence model paired with a magnitude model.
#[derive(Debug, Clone)]
pub struct DeltaModel<P, M> {
    pub presence: P,
    pub magnitude: M,
}

impl<P: FittedModel, M: FittedModel> DeltaModel<P, M> {
    /// Pairs two fitted models, checking each has the family its role requires.
    pub fn new(presence: P, magnitude: M) -> Result<Self, HurdleError> {
        for (role, expected, found) in [
            ("presence", Family::Binomial, presence.family()),
            ("magnitude", Family::Gamma, magnitude.family()),
        ] {
            if found != expected {
                return Err(HurdleError::FamilyMismatch {
                    role,
                    expected,
                    found,
                });
            }
        }
        Ok(Self { presence, magnitude })
    }

    pub fn components(&self, covariates: &Covariates) -> Result<Components, HurdleError> {
        let presence = self
            .presence
            .predict(covariates, PredictScale::Response, false)?
            .estimate;
        let magnitude = self
            .magnitude
            .predict(covariates, PredictScale::Response, false)?
            .estimate;
        let mut combined = Array1::zeros(presence.len());
        Zip::from(&mut combined)
            .and(&presence)
            .and(&magnitude)
            .for_each(|c, &p, &m| *c = p * m);
        Ok(Components {
            presence,
            magnitude,
            combined,
        })
    }

    /// Combined predictions at each site, in input order.
    pub fn predict_sites<T: Located>(&self, sites: &[T]) -> Result<Vec<CombinedPrediction>, HurdleError> {
        let covariates = data::covariates(sites)?;
        let parts = self.components(&covariates)?;
        Ok(sites
            .iter()
            .enumerate()
            .map(|(i, site)| CombinedPrediction {
                x: site.x(),
                y: site.y(),
                depth: site.depth(),
                positive_prediction: parts.magnitude[i],
                binary_prediction: parts.presence[i],
                combined_prediction: parts.combined[i],
            })
            .collect())
    }
}

/// Fits the presence model on every observation and the magnitude model on the
/// positive ones.
pub fn fit_delta_model(
    observations: &[Observation],
    presence_spec: &ModelSpec,
    magnitude_spec: &ModelSpec,
    options: &FitOptions,
) -> Result<DeltaModel<TrainedModel, TrainedModel>, HurdleError> {
    let all = data::covariates(observations)?;
    let present = observations
        .iter()
        .map(|o| if o.present() { 1.0 } else { 0.0 })
        .collect::<Array1<f64>>();
    let presence = fit_model(&all, present.view(), Family::Binomial, presence_spec, options)
        .map_err(|source| HurdleError::Estimation {
            role: "presence",
            source,
        })?;

    let positives = data::positive_observations(observations);
    if positives.is_empty() {
        return Err(HurdleError::NoPositiveObservations);
    }
    let positive_covariates = data::covariates(&positives)?;
    let density = positives.iter().map(|o| o.density).collect::<Array1<f64>>();
    let magnitude = fit_model(
        &positive_covariates,
        density.view(),
        Family::Gamma,
        magnitude_spec,
        options,
    )
    .map_err(|source| HurdleError::Estimation {
        role: "magnitude",
        source,
    })?;

    DeltaModel::new(presence, magnitude)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::data::PredictionSite;
    use crate::gam::model::Prediction;

    /// A model that predicts one constant on the response scale.
    #[derive(Debug)]
    struct Constant {
        family: Family,
        value: f64,
    }

    impl FittedModel for Constant {
        fn family(&self) -> Family {
            self.family
        }

        fn predict(
            &self,
            covariates: &Covariates,
            scale: PredictScale,
            with_standard_errors: bool,
        ) -> Result<Prediction, ModelError> {
            let value = match scale {
                PredictScale::Response => self.value,
                PredictScale::Link => self.family.link().link(self.value),
            };
            Ok(Prediction {
                estimate: Array1::from_elem(covariates.len(), value),
                standard_error: with_standard_errors.then(|| Array1::zeros(covariates.len())),
            })
        }
    }

    #[test]
    fn combiner_multiplies_components() {
        let model = DeltaModel::new(
            Constant { family: Family::Binomial, value: 0.25 },
            Constant { family: Family::Gamma, value: 8.0 },
        )
        .unwrap();
        let sites = [
            PredictionSite { x: 0.0, y: 1.0, depth: 10.0 },
            PredictionSite { x: 2.0, y: 3.0, depth: 20.0 },
        ];
        let preds = model.predict_sites(&sites).unwrap();
        assert_eq!(preds.len(), 2);
        for (p, s) in preds.iter().zip(&sites) {
            assert_eq!((p.x, p.y, p.depth), (s.x, s.y, s.depth));
            assert_eq!(p.binary_prediction, 0.25);
            assert_eq!(p.positive_prediction, 8.0);
            assert_eq!(p.combined_prediction, 2.0);
        }
    }

    #[test]
    fn swapped_roles_are_rejected() {
        let err = DeltaModel::new(
            Constant { family: Family::Gamma, value: 1.0 },
            Constant { family: Family::Gamma, value: 1.0 },
        )
        .unwrap_err();
        assert!(matches!(err, HurdleError::FamilyMismatch { role: "presence", .. }));
    }

    #[test]
    fn all_zero_survey_cannot_fit_magnitude() {
        let rows = [
            Observation { x: 0.0, y: 0.0, depth: 1.0, density: 0.0 },
            Observation { x: 0.0, y: 0.0, depth: 2.0, density: 0.0 },
        ];
        let err = fit_delta_model(
            &rows,
            &ModelSpec::Linear { depth_degree: 0 },
            &ModelSpec::Linear { depth_degree: 0 },
            &FitOptions::default(),
        )
        .unwrap_err();
        // The presence response has no variation, which is caught first.
        assert!(matches!(err, HurdleError::Estimation { role: "presence", .. }));
    }
}
