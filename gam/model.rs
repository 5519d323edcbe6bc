use crate::gam::construction::{ConstructionError, Covariates, DesignBlueprint};
use crate::gam::family::Family;
use ndarray::{Array1, Array2, Zip};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// The scale on which predictions are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictScale {
    /// The natural scale of the response (probability or mean magnitude).
    Response,
    /// The linear predictor `eta`.
    Link,
}

/// Point predictions with optional standard errors on the same scale.
#[derive(Debug, Clone)]
pub struct Prediction {
    pub estimate: Array1<f64>,
    pub standard_error: Option<Array1<f64>>,
}

/// Anything that can produce predictions for a set of covariates.
///
/// The hurdle combiner is written against this trait, so a presence model and a
/// magnitude model need not come from the same engine.
pub trait FittedModel {
    fn family(&self) -> Family;

    fn predict(
        &self,
        covariates: &Covariates,
        scale: PredictScale,
        with_standard_errors: bool,
    ) -> Result<Prediction, ModelError>;
}

/// The top-level, self-contained, trained model artifact.
/// This is the structure that gets saved to and loaded from a file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainedModel {
    pub family: Family,
    /// Everything needed to rebuild the design matrix for new covariates.
    pub blueprint: DesignBlueprint,
    pub coefficients: Array1<f64>,
    /// Bayesian posterior covariance `phi * (X'WX + S_lambda)^-1`.
    pub covariance: Array2<f64>,
    /// Selected smoothing parameters, one per penalty. Empty for unpenalized fits.
    pub lambdas: Vec<f64>,
    /// Dispersion `phi`. Fixed at 1 for the Binomial family; NaN when it could not
    /// be estimated.
    pub scale: f64,
    pub edf: f64,
    pub deviance: f64,
    pub n_obs: usize,
    /// Depth range seen in training. Predictions outside it are refused.
    pub depth_range: (f64, f64),
}

/// Custom error type for model loading, saving, and prediction.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Failed to build the prediction design matrix: {0}")]
    Construction(#[from] ConstructionError),
    #[error("Covariate '{name}' value {value} lies outside the fitted range [{min}, {max}].")]
    CovariateOutOfRange {
        name: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("Model has {found} coefficients but its design has {expected} columns.")]
    CoefficientMismatch { found: usize, expected: usize },
}

impl TrainedModel {
    /// Rejects depths outside the training range. Extrapolating a polynomial in
    /// depth is rarely meaningful, so this is an error rather than a warning.
    fn check_depth_support(&self, covariates: &Covariates) -> Result<(), ModelError> {
        let (min, max) = self.depth_range;
        let tolerance = 1e-9 * (max - min).abs().max(1.0);
        match covariates
            .depth
            .iter()
            .find(|&&d| !(d >= min - tolerance && d <= max + tolerance))
        {
            Some(&value) => Err(ModelError::CovariateOutOfRange {
                name: "depth",
                value,
                min,
                max,
            }),
            None => Ok(()),
        }
    }

    /// Saves the trained model to a file in a human-readable TOML format.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    /// Loads a trained model from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let model = toml::from_str(&toml_string)?;
        Ok(model)
    }
}

impl FittedModel for TrainedModel {
    fn family(&self) -> Family {
        self.family
    }

    /// Rebuilds the design matrix from the stored blueprint, computes `eta = X beta`
    /// and, on request, the link-scale standard errors `sqrt(diag(X Vp X'))`.
    /// Response-scale errors use the delta method: `se(mu) = |d mu / d eta| se(eta)`.
    fn predict(
        &self,
        covariates: &Covariates,
        scale: PredictScale,
        with_standard_errors: bool,
    ) -> Result<Prediction, ModelError> {
        self.check_depth_support(covariates)?;
        let x_new = self.blueprint.design_matrix(covariates)?;
        if x_new.ncols() != self.coefficients.len() {
            return Err(ModelError::CoefficientMismatch {
                found: self.coefficients.len(),
                expected: x_new.ncols(),
            });
        }
        let eta = x_new.dot(&self.coefficients);

        let se_eta = with_standard_errors.then(|| {
            let xv = x_new.dot(&self.covariance);
            (&xv * &x_new).sum_axis(ndarray::Axis(1)).mapv(|v| v.max(0.0).sqrt())
        });

        let link = self.family.link();
        let prediction = match scale {
            PredictScale::Link => Prediction {
                estimate: eta,
                standard_error: se_eta,
            },
            PredictScale::Response => {
                let standard_error = se_eta.map(|se| {
                    let mut out = Array1::zeros(se.len());
                    Zip::from(&mut out)
                        .and(&se)
                        .and(&eta)
                        .for_each(|o, &s, &e| *o = link.mu_eta(e).abs() * s);
                    out
                });
                Prediction {
                    estimate: eta.mapv(|e| link.inverse(e)),
                    standard_error,
                }
            }
        };
        Ok(prediction)
    }
}
