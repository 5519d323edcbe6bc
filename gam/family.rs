//! Response families and their link functions.
//!
//! A hurdle model needs exactly two: a Binomial family with the logit link for
//! presence/absence, and a Gamma family with the log link for positive magnitudes.

use ndarray::{Array1, ArrayView1, Zip};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Defines the link function, connecting the linear predictor to the mean response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkFunction {
    /// Maps probabilities (0, 1) to the real line.
    Logit,
    /// Maps positive means to the real line.
    Log,
}

/// The exponential-family distribution of the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Family {
    /// Bernoulli presence/absence with logit link. Known scale (phi = 1).
    Binomial,
    /// Strictly positive response with constant coefficient of variation, log link.
    /// Scale is estimated.
    Gamma,
}

#[derive(Error, Debug, PartialEq)]
pub enum ResponseError {
    #[error("The response vector is empty; there is nothing to fit.")]
    Empty,
    #[error("Response value {value} at row {row} is not valid for the {family} family.")]
    InvalidValue {
        family: Family,
        row: usize,
        value: f64,
    },
    #[error("All {count} response values are identical ({value}); the model cannot be fitted.")]
    NoVariation { count: usize, value: f64 },
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::Binomial => write!(f, "binomial"),
            Family::Gamma => write!(f, "Gamma"),
        }
    }
}

const MAX_ABS_ETA: f64 = 700.0;

impl LinkFunction {
    pub fn link(self, mu: f64) -> f64 {
        match self {
            LinkFunction::Logit => (mu / (1.0 - mu)).ln(),
            LinkFunction::Log => mu.ln(),
        }
    }

    pub fn inverse(self, eta: f64) -> f64 {
        let eta = eta.clamp(-MAX_ABS_ETA, MAX_ABS_ETA);
        match self {
            LinkFunction::Logit => 1.0 / (1.0 + (-eta).exp()),
            LinkFunction::Log => eta.exp(),
        }
    }

    /// Derivative of the inverse link, `d mu / d eta`.
    pub fn mu_eta(self, eta: f64) -> f64 {
        match self {
            LinkFunction::Logit => {
                let mu = self.inverse(eta);
                mu * (1.0 - mu)
            }
            LinkFunction::Log => self.inverse(eta),
        }
    }
}

impl Family {
    pub fn link(self) -> LinkFunction {
        match self {
            Family::Binomial => LinkFunction::Logit,
            Family::Gamma => LinkFunction::Log,
        }
    }

    /// Whether the dispersion is fixed at one.
    pub fn has_known_scale(self) -> bool {
        matches!(self, Family::Binomial)
    }

    /// Variance function `V(mu)`.
    pub fn variance(self, mu: f64) -> f64 {
        match self {
            Family::Binomial => mu * (1.0 - mu),
            Family::Gamma => mu * mu,
        }
    }

    /// Starting means for P-IRLS.
    pub fn initial_mu(self, y: ArrayView1<f64>) -> Array1<f64> {
        match self {
            Family::Binomial => y.mapv(|v| (v + 0.5) / 2.0),
            Family::Gamma => y.to_owned(),
        }
    }

    /// Checks that the response is non-empty, valid for the family, and varies.
    pub fn validate_response(self, y: ArrayView1<f64>) -> Result<(), ResponseError> {
        let first = *y.first().ok_or(ResponseError::Empty)?;
        for (row, &value) in y.iter().enumerate() {
            let valid = match self {
                Family::Binomial => value == 0.0 || value == 1.0,
                Family::Gamma => value.is_finite() && value > 0.0,
            };
            if !valid {
                return Err(ResponseError::InvalidValue {
                    family: self,
                    row,
                    value,
                });
            }
        }
        if y.iter().all(|&v| v == first) {
            return Err(ResponseError::NoVariation {
                count: y.len(),
                value: first,
            });
        }
        Ok(())
    }

    /// Weighted deviance `sum_i w_i d(y_i, mu_i)`.
    pub fn deviance(self, y: ArrayView1<f64>, mu: ArrayView1<f64>, weights: ArrayView1<f64>) -> f64 {
        const EPS: f64 = 1e-10;
        Zip::from(y)
            .and(mu)
            .and(weights)
            .fold(0.0, |acc, &yi, &mui, &wi| {
                let unit = match self {
                    Family::Binomial => {
                        let mui = mui.clamp(EPS, 1.0 - EPS);
                        let term1 = if yi > 0.0 { yi * (yi / mui).ln() } else { 0.0 };
                        let term2 = if yi < 1.0 {
                            (1.0 - yi) * ((1.0 - yi) / (1.0 - mui)).ln()
                        } else {
                            0.0
                        };
                        2.0 * (term1 + term2)
                    }
                    Family::Gamma => {
                        let mui = mui.max(EPS);
                        2.0 * (-(yi / mui).ln() + (yi - mui) / mui)
                    }
                };
                acc + wi * unit
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn links_invert_each_other() {
        for &mu in &[0.05, 0.3, 0.5, 0.9] {
            let link = LinkFunction::Logit;
            assert_abs_diff_eq!(link.inverse(link.link(mu)), mu, epsilon = 1e-12);
        }
        for &mu in &[0.01, 1.0, 42.0] {
            let link = LinkFunction::Log;
            assert_abs_diff_eq!(link.inverse(link.link(mu)), mu, epsilon = 1e-9);
        }
    }

    #[test]
    fn mu_eta_matches_finite_difference() {
        let h = 1e-6;
        for link in [LinkFunction::Logit, LinkFunction::Log] {
            let eta = 0.7;
            let numeric = (link.inverse(eta + h) - link.inverse(eta - h)) / (2.0 * h);
            assert_abs_diff_eq!(link.mu_eta(eta), numeric, epsilon = 1e-6);
        }
    }

    #[test]
    fn gamma_deviance_is_zero_at_saturation() {
        let y = array![1.0, 2.5, 7.0];
        let w = Array1::ones(3);
        assert_abs_diff_eq!(
            Family::Gamma.deviance(y.view(), y.view(), w.view()),
            0.0,
            epsilon = 1e-12
        );
        let mu = array![2.0, 2.0, 2.0];
        assert!(Family::Gamma.deviance(y.view(), mu.view(), w.view()) > 0.0);
    }

    #[test]
    fn binomial_deviance_for_constant_probability() {
        let y = array![0.0, 1.0];
        let mu = array![0.5, 0.5];
        let w = Array1::ones(2);
        // Each observation contributes -2 ln(0.5).
        assert_abs_diff_eq!(
            Family::Binomial.deviance(y.view(), mu.view(), w.view()),
            4.0 * 2.0_f64.ln(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn response_validation_rejects_bad_inputs() {
        assert_eq!(
            Family::Binomial.validate_response(Array1::<f64>::zeros(0).view()),
            Err(ResponseError::Empty)
        );
        assert!(matches!(
            Family::Binomial.validate_response(array![0.0, 0.5].view()),
            Err(ResponseError::InvalidValue { row: 1, .. })
        ));
        assert!(matches!(
            Family::Gamma.validate_response(array![1.0, 0.0].view()),
            Err(ResponseError::InvalidValue { row: 1, .. })
        ));
        assert!(matches!(
            Family::Binomial.validate_response(array![1.0, 1.0, 1.0].view()),
            Err(ResponseError::NoVariation { count: 3, .. })
        ));
        assert!(Family::Gamma.validate_response(array![1.0, 3.0].view()).is_ok());
    }
}
