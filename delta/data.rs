//! # Survey data loading, rescaling and support filtering
//!
//! Observations and prediction sites are read from CSV with a fixed schema
//! (`x,y,depth,density` and `x,y,depth`). Capitalized headers are accepted as
//! aliases. Every row is validated on load: coordinates and depth must be finite,
//! and density must be finite and non-negative.

use crate::gam::construction::{ConstructionError, Covariates};
use itertools::{Itertools, MinMaxResult};
use ndarray::Array1;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// One survey haul.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    #[serde(alias = "X")]
    pub x: f64,
    #[serde(alias = "Y")]
    pub y: f64,
    #[serde(alias = "Depth")]
    pub depth: f64,
    #[serde(alias = "Density")]
    pub density: f64,
}

impl Observation {
    /// Whether the species was caught. Derived from density, never stored.
    pub fn present(&self) -> bool {
        self.density > 0.0
    }
}

/// A location at which the combined model is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PredictionSite {
    #[serde(alias = "X")]
    pub x: f64,
    #[serde(alias = "Y")]
    pub y: f64,
    #[serde(alias = "Depth")]
    pub depth: f64,
}

/// Common access to the spatial and depth covariates of a row.
pub trait Located {
    fn x(&self) -> f64;
    fn y(&self) -> f64;
    fn depth(&self) -> f64;
    fn scale_coordinates(&mut self, factor: f64);
}

impl Located for Observation {
    fn x(&self) -> f64 {
        self.x
    }
    fn y(&self) -> f64 {
        self.y
    }
    fn depth(&self) -> f64 {
        self.depth
    }
    fn scale_coordinates(&mut self, factor: f64) {
        self.x *= factor;
        self.y *= factor;
    }
}

impl Located for PredictionSite {
    fn x(&self) -> f64 {
        self.x
    }
    fn y(&self) -> f64 {
        self.y
    }
    fn depth(&self) -> f64 {
        self.depth
    }
    fn scale_coordinates(&mut self, factor: f64) {
        self.x *= factor;
        self.y *= factor;
    }
}

/// A comprehensive error type for all data loading and validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Failed to open '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Malformed CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("The file '{0}' contains no data rows.")]
    Empty(String),
    #[error("Row {row}: column '{column}' holds the non-finite value {value}.")]
    NonFinite {
        row: usize,
        column: &'static str,
        value: f64,
    },
    #[error("Row {row}: density {value} is negative. Densities must be zero or positive.")]
    NegativeDensity { row: usize, value: f64 },
    #[error("Coordinate scale must be finite and positive, got {0}.")]
    InvalidScale(f64),
    #[error("Could not assemble covariates: {0}")]
    Construction(#[from] ConstructionError),
}

fn read_rows<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, DataError> {
    let file = File::open(path).map_err(|source| DataError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(file);
    let rows = reader.deserialize().collect::<Result<Vec<T>, _>>()?;
    if rows.is_empty() {
        return Err(DataError::Empty(path.display().to_string()));
    }
    Ok(rows)
}

fn check_finite<T: Located>(rows: &[T]) -> Result<(), DataError> {
    for (idx, row) in rows.iter().enumerate() {
        for (column, value) in [("x", row.x()), ("y", row.y()), ("depth", row.depth())] {
            if !value.is_finite() {
                return Err(DataError::NonFinite {
                    row: idx + 1,
                    column,
                    value,
                });
            }
        }
    }
    Ok(())
}

/// Loads and validates the observation table.
pub fn load_observations(path: &Path) -> Result<Vec<Observation>, DataError> {
    let rows: Vec<Observation> = read_rows(path)?;
    validate_observations(&rows)?;
    log::info!(
        "Loaded {} observations from {} ({} with positive density).",
        rows.len(),
        path.display(),
        rows.iter().filter(|o| o.present()).count()
    );
    Ok(rows)
}

/// Loads and validates the prediction grid.
pub fn load_prediction_sites(path: &Path) -> Result<Vec<PredictionSite>, DataError> {
    let rows: Vec<PredictionSite> = read_rows(path)?;
    check_finite(&rows)?;
    log::info!("Loaded {} prediction sites from {}.", rows.len(), path.display());
    Ok(rows)
}

pub fn validate_observations(rows: &[Observation]) -> Result<(), DataError> {
    check_finite(rows)?;
    for (idx, obs) in rows.iter().enumerate() {
        if !obs.density.is_finite() {
            return Err(DataError::NonFinite {
                row: idx + 1,
                column: "density",
                value: obs.density,
            });
        }
        if obs.density < 0.0 {
            return Err(DataError::NegativeDensity {
                row: idx + 1,
                value: obs.density,
            });
        }
    }
    Ok(())
}

/// Multiplies x and y of every row by `factor`. Apply the same factor to
/// observations and prediction sites.
pub fn rescale_coordinates<T: Located>(rows: &mut [T], factor: f64) -> Result<(), DataError> {
    if !(factor.is_finite() && factor > 0.0) {
        return Err(DataError::InvalidScale(factor));
    }
    rows.iter_mut().for_each(|row| row.scale_coordinates(factor));
    Ok(())
}

/// Column-oriented covariates for fitting or prediction.
pub fn covariates<T: Located>(rows: &[T]) -> Result<Covariates, DataError> {
    let x = rows.iter().map(Located::x).collect::<Array1<f64>>();
    let y = rows.iter().map(Located::y).collect::<Array1<f64>>();
    let depth = rows.iter().map(Located::depth).collect::<Array1<f64>>();
    Ok(Covariates::new(x, y, depth)?)
}

/// Observations with positive density, the training set of the magnitude model.
pub fn positive_observations(rows: &[Observation]) -> Vec<Observation> {
    rows.iter().filter(|o| o.present()).copied().collect()
}

/// The covariate region the observations actually cover.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Support {
    pub depth_min: f64,
    pub depth_max: f64,
    /// Sites must lie strictly north of this latitude.
    pub latitude_cutoff: f64,
}

impl Support {
    pub fn contains<T: Located>(&self, site: &T) -> bool {
        site.depth() >= self.depth_min && site.depth() <= self.depth_max && site.y() > self.latitude_cutoff
    }
}

/// Depth range covered by both component models, with the latitude cutoff
/// defaulting to the minimum observed y.
///
/// The magnitude model only sees positive observations, so the depth range is
/// taken from those when any exist. It is never wider than the range of all
/// observations.
pub fn observed_support(rows: &[Observation], latitude_cutoff: Option<f64>) -> Result<Support, DataError> {
    let positives = positive_observations(rows);
    let supporting = if positives.is_empty() { rows } else { &positives[..] };
    let (depth_min, depth_max) = match supporting.iter().map(|o| o.depth).minmax_by(f64::total_cmp) {
        MinMaxResult::NoElements => return Err(DataError::Empty("observations".to_string())),
        MinMaxResult::OneElement(d) => (d, d),
        MinMaxResult::MinMax(lo, hi) => (lo, hi),
    };
    let latitude_cutoff = match latitude_cutoff {
        Some(cutoff) => cutoff,
        None => rows
            .iter()
            .map(|o| o.y)
            .min_by(f64::total_cmp)
            .ok_or_else(|| DataError::Empty("observations".to_string()))?,
    };
    Ok(Support {
        depth_min,
        depth_max,
        latitude_cutoff,
    })
}

/// Keeps only the sites inside the observed support.
pub fn filter_to_support(sites: &[PredictionSite], support: &Support) -> Vec<PredictionSite> {
    let kept: Vec<PredictionSite> = sites.iter().filter(|s| support.contains(*s)).copied().collect();
    log::info!(
        "Support filter kept {} of {} prediction sites (depth [{}, {}], y > {}).",
        kept.len(),
        sites.len(),
        support.depth_min,
        support.depth_max,
        support.latitude_cutoff
    );
    kept
}
