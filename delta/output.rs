//! Tidy CSV tables for predictions, residuals and profiles, plus the small TOML
//! files saved next to the model artifacts.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("Failed to create '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to write CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("Failed to serialize '{path}' to TOML: {source}")]
    TomlSerialize {
        path: String,
        source: toml::ser::Error,
    },
    #[error("Failed to parse TOML file '{path}': {source}")]
    TomlParse {
        path: String,
        source: toml::de::Error,
    },
}

/// Writes one header row followed by one row per record.
pub fn write_csv<T: Serialize>(path: &Path, rows: &[T]) -> Result<(), OutputError> {
    let file = File::create(path).map_err(|source| OutputError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let mut writer = csv::Writer::from_writer(BufWriter::new(file));
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush().map_err(|source| OutputError::Io {
        path: path.display().to_string(),
        source,
    })?;
    log::info!("Wrote {} rows to {}", rows.len(), path.display());
    Ok(())
}

pub fn write_toml<T: Serialize>(path: &Path, value: &T) -> Result<(), OutputError> {
    let text = toml::to_string_pretty(value).map_err(|source| OutputError::TomlSerialize {
        path: path.display().to_string(),
        source,
    })?;
    fs::write(path, text).map_err(|source| OutputError::Io {
        path: path.display().to_string(),
        source,
    })
}

pub fn read_toml<T: DeserializeOwned>(path: &Path) -> Result<T, OutputError> {
    let text = fs::read_to_string(path).map_err(|source| OutputError::Io {
        path: path.display().to_string(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| OutputError::TomlParse {
        path: path.display().to_string(),
        source,
    })
}

/// File names of one variant's artifacts inside the output directory.
#[derive(Debug, Clone)]
pub struct VariantPaths {
    pub predictions: PathBuf,
    pub residuals: PathBuf,
    pub profile: PathBuf,
    pub presence_model: PathBuf,
    pub magnitude_model: PathBuf,
    /// Depth range and latitude cutoff the models were fitted on.
    pub support: PathBuf,
}

impl VariantPaths {
    /// Creates `dir` if needed.
    pub fn new(dir: &Path, variant: &str) -> Result<Self, OutputError> {
        fs::create_dir_all(dir).map_err(|source| OutputError::Io {
            path: dir.display().to_string(),
            source,
        })?;
        let file = |suffix: &str| dir.join(format!("{variant}_{suffix}"));
        Ok(Self {
            predictions: file("predictions.csv"),
            residuals: file("residuals.csv"),
            profile: file("profile.csv"),
            presence_model: file("presence.toml"),
            magnitude_model: file("magnitude.toml"),
            support: file("support.toml"),
        })
    }
}
