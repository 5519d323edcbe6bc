//! Pipeline configuration, stored as TOML.

use crate::gam::basis::BasisConfig;
use crate::gam::construction::ModelSpec;
use crate::gam::estimate::FitOptions;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML config: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize config to TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("No model variants are configured.")]
    NoVariants,
    #[error("Variant name '{0}' is used more than once.")]
    DuplicateVariant(String),
    #[error("Variant name '{0}' must be non-empty and contain only letters, digits, '-' or '_'.")]
    InvalidVariantName(String),
    #[error("Unknown variant '{0}'.")]
    UnknownVariant(String),
    #[error("Invalid setting: {0}")]
    Invalid(String),
}

/// A named pair of model specifications: one for presence, one for magnitude.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantConfig {
    pub name: String,
    pub presence: ModelSpec,
    pub magnitude: ModelSpec,
}

/// Settings of the marginal depth profile and the residual summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    /// Number of evenly spaced depths.
    pub points: usize,
    /// Normal quantile for the pointwise intervals.
    pub z: f64,
    /// Neighbours per residual in the sign-agreement summary.
    pub neighbours: usize,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            points: 100,
            z: 1.96,
            neighbours: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Applied to x and y of both observations and grid before fitting.
    pub coordinate_scale: f64,
    /// Grid sites at or south of this y are dropped. Defaults to the minimum
    /// observed y.
    pub latitude_cutoff: Option<f64>,
    pub fit: FitOptions,
    pub profile: ProfileConfig,
    pub variants: Vec<VariantConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let spatial_basis = BasisConfig {
            num_knots: 6,
            degree: 3,
        };
        Self {
            coordinate_scale: 1.0,
            latitude_cutoff: None,
            fit: FitOptions::default(),
            profile: ProfileConfig::default(),
            variants: vec![
                VariantConfig {
                    name: "glm".to_string(),
                    presence: ModelSpec::Linear { depth_degree: 2 },
                    magnitude: ModelSpec::Linear { depth_degree: 2 },
                },
                VariantConfig {
                    name: "gam".to_string(),
                    presence: ModelSpec::AdditiveSpatial {
                        depth_degree: 2,
                        x_basis: spatial_basis,
                        y_basis: spatial_basis,
                        penalty_order: 2,
                    },
                    magnitude: ModelSpec::AdditiveSpatial {
                        depth_degree: 2,
                        x_basis: spatial_basis,
                        y_basis: spatial_basis,
                        penalty_order: 2,
                    },
                },
            ],
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.coordinate_scale.is_finite() && self.coordinate_scale > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "coordinate_scale must be positive, got {}",
                self.coordinate_scale
            )));
        }
        if self.profile.points < 2 {
            return Err(ConfigError::Invalid("profile.points must be at least 2".to_string()));
        }
        if !(self.profile.z.is_finite() && self.profile.z > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "profile.z must be positive, got {}",
                self.profile.z
            )));
        }
        if self.profile.neighbours == 0 {
            return Err(ConfigError::Invalid("profile.neighbours must be at least 1".to_string()));
        }
        if self.variants.is_empty() {
            return Err(ConfigError::NoVariants);
        }
        let mut seen = HashSet::new();
        for variant in &self.variants {
            let valid_name = !variant.name.is_empty()
                && variant
                    .name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
            if !valid_name {
                return Err(ConfigError::InvalidVariantName(variant.name.clone()));
            }
            if !seen.insert(variant.name.as_str()) {
                return Err(ConfigError::DuplicateVariant(variant.name.clone()));
            }
        }
        Ok(())
    }

    /// The configured variants, or only the named ones in the given order.
    pub fn select_variants(&self, names: &[String]) -> Result<Vec<&VariantConfig>, ConfigError> {
        if names.is_empty() {
            return Ok(self.variants.iter().collect());
        }
        names
            .iter()
            .map(|name| {
                self.variants
                    .iter()
                    .find(|v| &v.name == name)
                    .ok_or_else(|| ConfigError::UnknownVariant(name.clone()))
            })
            .collect()
    }
}
