use clap::{Parser, Subcommand};
use deltagam::delta::config::PipelineConfig;
use deltagam::delta::data;
use deltagam::delta::output;
use deltagam::delta::pipeline::{self, load_and_prepare};
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(
    name = "deltagam",
    about = "Fit delta-Gamma hurdle models to zero-inflated survey catch data",
    long_about = "Fits a presence/absence model (binomial, logit link) and a positive-magnitude \
                  model (Gamma, log link) as depth GLMs or spatial GAMs, combines them into \
                  expected density over a prediction grid, and writes residual diagnostics \
                  and marginal depth profiles."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit every configured variant and write predictions, diagnostics and models
    #[command(about = "Fit variants end to end (outputs: <variant>_*.csv, <variant>_*.toml)")]
    Fit {
        /// Observation CSV with x,y,depth,density columns
        observations: PathBuf,

        /// Prediction grid CSV with x,y,depth columns
        grid: PathBuf,

        /// Pipeline configuration (TOML). Built-in defaults are used when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Directory for all outputs
        #[arg(long, default_value = "deltagam_out")]
        out_dir: PathBuf,

        /// Run only the named variants (repeatable)
        #[arg(long = "variant", value_name = "NAME")]
        variants: Vec<String>,
    },

    /// Apply two saved component models to a prediction grid
    #[command(about = "Predict combined density from saved models (outputs: CSV)")]
    Predict {
        /// Prediction grid CSV with x,y,depth columns, in the same units as the fit
        grid: PathBuf,

        /// Saved presence model (.toml)
        #[arg(long)]
        presence: PathBuf,

        /// Saved magnitude model (.toml)
        #[arg(long)]
        magnitude: PathBuf,

        /// Support saved with the models (<variant>_support.toml). Grid sites
        /// outside it are dropped.
        #[arg(long)]
        support: PathBuf,

        /// Multiplier applied to grid x and y, matching the fit configuration
        #[arg(long, default_value = "1.0")]
        coordinate_scale: f64,

        #[arg(long, default_value = "predictions.csv")]
        output: PathBuf,
    },

    /// Write the default configuration to a file
    InitConfig {
        #[arg(default_value = "deltagam.toml")]
        path: PathBuf,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Fit {
            observations,
            grid,
            config,
            out_dir,
            variants,
        } => fit_command(observations, grid, config, out_dir, variants),
        Commands::Predict {
            grid,
            presence,
            magnitude,
            support,
            coordinate_scale,
            output,
        } => predict_command(grid, presence, magnitude, support, coordinate_scale, output),
        Commands::InitConfig { path } => init_config_command(path),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn fit_command(
    observations: PathBuf,
    grid: PathBuf,
    config_path: Option<PathBuf>,
    out_dir: PathBuf,
    variant_names: Vec<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = match config_path {
        Some(path) => PipelineConfig::load(&path)?,
        None => PipelineConfig::default(),
    };
    let variants = config.select_variants(&variant_names)?;
    let prepared = load_and_prepare(&observations, &grid, &config)?;
    let reports = pipeline::run_all(&prepared, &variants, &config, &out_dir)?;

    for report in &reports {
        println!(
            "{}: {} grid sites, presence edf {:.2}, magnitude edf {:.2}, residuals {}",
            report.name,
            report.predictions.len(),
            report.model.presence.edf,
            report.model.magnitude.edf,
            report.residual_summary
        );
    }
    println!("Outputs written to {}", out_dir.display());
    Ok(())
}

fn predict_command(
    grid_path: PathBuf,
    presence: PathBuf,
    magnitude: PathBuf,
    support: PathBuf,
    coordinate_scale: f64,
    output_path: PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut grid = data::load_prediction_sites(&grid_path)?;
    data::rescale_coordinates(&mut grid, coordinate_scale)?;
    let predictions = pipeline::predict_with_saved_models(&presence, &magnitude, &support, &grid)?;
    output::write_csv(&output_path, &predictions)?;
    println!("Predictions saved to: {}", output_path.display());
    Ok(())
}

fn init_config_command(path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    PipelineConfig::default().save(&path)?;
    println!("Default configuration written to {}", path.display());
    Ok(())
}
