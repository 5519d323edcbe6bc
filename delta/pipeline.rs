//! # The variant pipeline
//!
//! Every configured variant goes through the same steps: fit both component
//! models, predict the support-filtered grid, compute magnitude residuals, and
//! build the marginal depth profile. Only the pair of `ModelSpec`s differs.

use crate::delta::config::{ConfigError, PipelineConfig, VariantConfig};
use crate::delta::data::{self, DataError, Observation, PredictionSite, Support};
use crate::delta::diagnostics::{self, Residual, ResidualSummary};
use crate::delta::hurdle::{CombinedPrediction, DeltaModel, HurdleError, fit_delta_model};
use crate::delta::output::{self, OutputError, VariantPaths};
use crate::delta::profile::{self, ProfilePoint};
use crate::gam::model::{ModelError, TrainedModel};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Hurdle(#[from] HurdleError),
    #[error("Model artifact error: {0}")]
    Model(#[from] ModelError),
    #[error(transparent)]
    Output(#[from] OutputError),
    #[error("Variant '{variant}': {source}")]
    Variant {
        variant: String,
        source: Box<PipelineError>,
    },
}

/// Rescaled observations and the prediction grid restricted to their support.
#[derive(Debug, Clone)]
pub struct PreparedData {
    pub observations: Vec<Observation>,
    pub grid: Vec<PredictionSite>,
    pub support: Support,
}

/// Validates, rescales and filters in-memory tables.
pub fn prepare(
    mut observations: Vec<Observation>,
    mut grid: Vec<PredictionSite>,
    config: &PipelineConfig,
) -> Result<PreparedData, PipelineError> {
    data::validate_observations(&observations)?;
    data::rescale_coordinates(&mut observations, config.coordinate_scale)?;
    data::rescale_coordinates(&mut grid, config.coordinate_scale)?;
    // The cutoff is configured in the original coordinate units.
    let cutoff = config.latitude_cutoff.map(|c| c * config.coordinate_scale);
    let support = data::observed_support(&observations, cutoff)?;
    let grid = data::filter_to_support(&grid, &support);
    Ok(PreparedData {
        observations,
        grid,
        support,
    })
}

/// Loads both tables from CSV and prepares them.
pub fn load_and_prepare(
    observations_path: &Path,
    grid_path: &Path,
    config: &PipelineConfig,
) -> Result<PreparedData, PipelineError> {
    let observations = data::load_observations(observations_path)?;
    let grid = data::load_prediction_sites(grid_path)?;
    prepare(observations, grid, config)
}

/// Everything one variant produces.
#[derive(Debug, Clone)]
pub struct VariantReport {
    pub name: String,
    pub model: DeltaModel<TrainedModel, TrainedModel>,
    pub predictions: Vec<CombinedPrediction>,
    pub residuals: Vec<Residual>,
    pub residual_summary: ResidualSummary,
    pub profile: Vec<ProfilePoint>,
    pub support: Support,
}

/// Fit, predict, combine, diagnose and profile one variant.
pub fn run_variant(
    data: &PreparedData,
    variant: &VariantConfig,
    config: &PipelineConfig,
) -> Result<VariantReport, PipelineError> {
    log::info!("=== Variant '{}' ===", variant.name);
    let model = fit_delta_model(&data.observations, &variant.presence, &variant.magnitude, &config.fit)?;
    let predictions = model.predict_sites(&data.grid)?;
    let residuals = diagnostics::magnitude_residuals(&model.magnitude, &data.observations)?;
    let residual_summary = diagnostics::summarize_residuals(&residuals, config.profile.neighbours);
    log::info!("Variant '{}' magnitude residuals: {residual_summary}", variant.name);
    let profile = profile::marginal_depth_profile(&model, &data.observations, &data.support, &config.profile)?;
    Ok(VariantReport {
        name: variant.name.clone(),
        model,
        predictions,
        residuals,
        residual_summary,
        profile,
        support: data.support,
    })
}

/// Writes the tables and both model artifacts of a report into `dir`.
pub fn write_report(report: &VariantReport, dir: &Path) -> Result<VariantPaths, PipelineError> {
    let paths = VariantPaths::new(dir, &report.name)?;
    output::write_csv(&paths.predictions, &report.predictions)?;
    output::write_csv(&paths.residuals, &report.residuals)?;
    output::write_csv(&paths.profile, &report.profile)?;
    report.model.presence.save(&paths.presence_model)?;
    report.model.magnitude.save(&paths.magnitude_model)?;
    output::write_toml(&paths.support, &report.support)?;
    Ok(paths)
}

/// Runs each variant in turn, writing its outputs as soon as it finishes. The
/// first failing variant aborts the run.
pub fn run_all(
    data: &PreparedData,
    variants: &[&VariantConfig],
    config: &PipelineConfig,
    dir: &Path,
) -> Result<Vec<VariantReport>, PipelineError> {
    variants
        .iter()
        .map(|variant| {
            let report = run_variant(data, variant, config).and_then(|report| {
                write_report(&report, dir)?;
                Ok(report)
            });
            report.map_err(|source| PipelineError::Variant {
                variant: variant.name.clone(),
                source: Box::new(source),
            })
        })
        .collect()
}

/// Applies two saved component models to the part of a prediction grid that lies
/// inside the support saved with them. `grid` must already be in the fitted
/// coordinate units.
pub fn predict_with_saved_models(
    presence_path: &Path,
    magnitude_path: &Path,
    support_path: &Path,
    grid: &[PredictionSite],
) -> Result<Vec<CombinedPrediction>, PipelineError> {
    let presence = TrainedModel::load(presence_path)?;
    let magnitude = TrainedModel::load(magnitude_path)?;
    let support: Support = output::read_toml(support_path)?;
    let model = DeltaModel::new(presence, magnitude)?;
    let grid = data::filter_to_support(grid, &support);
    Ok(model.predict_sites(&grid)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gam::construction::ModelSpec;

    fn obs(x: f64, y: f64, depth: f64, density: f64) -> Observation {
        Observation { x, y, depth, density }
    }

    #[test]
    fn prepare_rescales_and_filters() {
        let observations = vec![
            obs(1000.0, 2000.0, 10.0, 1.0),
            obs(3000.0, 4000.0, 30.0, 0.0),
            obs(2000.0, 5000.0, 20.0, 2.0),
        ];
        let grid = vec![
            PredictionSite { x: 1000.0, y: 3000.0, depth: 15.0 },
            PredictionSite { x: 1000.0, y: 2000.0, depth: 15.0 },
            PredictionSite { x: 1000.0, y: 3000.0, depth: 25.0 },
        ];
        let config = PipelineConfig {
            coordinate_scale: 1e-3,
            ..PipelineConfig::default()
        };
        let prepared = prepare(observations.clone(), grid.clone(), &config).unwrap();
        assert_eq!(prepared.observations[0].x, 1.0);
        assert_eq!(prepared.support.latitude_cutoff, 2.0);
        // Positive observations span depth 10-20.
        assert_eq!(prepared.grid, vec![PredictionSite { x: 1.0, y: 3.0, depth: 15.0 }]);

        // A configured cutoff is given in the input units and scaled with them.
        let mut grid = grid;
        grid.push(PredictionSite { x: 1000.0, y: 4000.0, depth: 15.0 });
        let config = PipelineConfig {
            latitude_cutoff: Some(3000.0),
            ..config
        };
        let prepared = prepare(observations, grid, &config).unwrap();
        assert_eq!(prepared.support.latitude_cutoff, 3.0);
        assert_eq!(prepared.grid, vec![PredictionSite { x: 1.0, y: 4.0, depth: 15.0 }]);
    }

    #[test]
    fn failing_variant_is_named() {
        let observations = vec![obs(0.0, 0.0, 1.0, 1.0), obs(0.0, 1.0, 2.0, 2.0)];
        let grid = vec![PredictionSite { x: 0.0, y: 0.5, depth: 1.5 }];
        let mut config = PipelineConfig::default();
        config.variants = vec![VariantConfig {
            name: "flat".to_string(),
            presence: ModelSpec::Linear { depth_degree: 0 },
            magnitude: ModelSpec::Linear { depth_degree: 0 },
        }];
        let prepared = prepare(observations, grid, &config).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let variants: Vec<&VariantConfig> = config.variants.iter().collect();
        // Every observation is positive, so presence has no variation.
        let err = run_all(&prepared, &variants, &config, dir.path()).unwrap_err();
        assert!(matches!(&err, PipelineError::Variant { variant, .. } if variant == "flat"));
    }
}
