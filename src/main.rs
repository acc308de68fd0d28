use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use rusty_doas::data::series::ResultSeries;
use rusty_doas::data::{Dataset, FormatCatalog, ImportConfig, ImportSetup};

#[derive(Parser)]
#[command(name = "rusty-doas")]
#[command(about = "Import DOAS fit results from delimited text files", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import the results described by a JSON configuration
    Load {
        /// Path to the import configuration
        config: PathBuf,
        /// Only summarise this species
        #[arg(long)]
        species: Option<String>,
        /// Fit scenario to read the species from (default: its default scenario)
        #[arg(long)]
        fit: Option<String>,
        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the result file formats of a registry
    Schemas {
        /// Registry file (default: built-in registry)
        #[arg(long)]
        registry: Option<PathBuf>,
    },
}

// ---------------------------------------------------------------------------
// JSON summary
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ScenarioSummary {
    fit_id: String,
    spectra: usize,
    fields: Vec<String>,
}

#[derive(Serialize)]
struct SeriesSummary {
    species: String,
    fit_id: String,
    spectra: usize,
    start: Option<String>,
    stop: Option<String>,
    mean: Option<f64>,
    std: Option<f64>,
    median: Option<f64>,
    above_detection_limit: usize,
}

impl From<&ResultSeries> for SeriesSummary {
    fn from(series: &ResultSeries) -> Self {
        SeriesSummary {
            species: series.species().to_string(),
            fit_id: series.fit_id().to_string(),
            spectra: series.len(),
            start: series.start().map(|t| t.to_string()),
            stop: series.stop().map(|t| t.to_string()),
            mean: series.mean(),
            std: series.std(),
            median: series.median(),
            above_detection_limit: series.above_detection_limit().len(),
        }
    }
}

#[derive(Serialize)]
struct LoadSummary {
    base_dir: String,
    format: String,
    start: Option<String>,
    stop: Option<String>,
    scenarios: Vec<ScenarioSummary>,
    series: Vec<SeriesSummary>,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn load_catalog(registry: Option<&Path>) -> Result<FormatCatalog> {
    match registry {
        Some(path) => FormatCatalog::from_path(path)
            .with_context(|| format!("Failed to read format registry {}", path.display())),
        None => Ok(FormatCatalog::builtin()),
    }
}

fn load_setup(config_path: &Path) -> Result<ImportSetup> {
    let text = std::fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read {}", config_path.display()))?;
    let config = ImportConfig::from_json(&text)
        .with_context(|| format!("Invalid import configuration {}", config_path.display()))?;
    let catalog = load_catalog(config.registry.as_deref())?;
    ImportSetup::from_config(config, &catalog).context("Failed to build import setup")
}

fn run_load(config: &Path, species: Option<&str>, fit: Option<&str>, json: bool) -> Result<()> {
    let setup = load_setup(config)?;
    let dataset = Dataset::load(setup)
        .with_context(|| format!("Import described by {} failed", config.display()))?;
    log::info!("import finished: {} fit scenarios", dataset.raw_results().len());

    let species_ids: Vec<String> = match species {
        Some(id) => vec![id.to_string()],
        None => dataset.setup().species().keys().cloned().collect(),
    };
    let mut series = Vec::new();
    for species_id in &species_ids {
        match dataset.get_series(species_id, fit, None, None) {
            Some(s) => series.push(SeriesSummary::from(&s)),
            None if species.is_some() => {
                bail!("No results for species '{species_id}' in {}", config.display())
            }
            None => log::warn!("no results for species '{species_id}'"),
        }
    }

    if json {
        let span = dataset.time_span();
        let summary = LoadSummary {
            base_dir: dataset.setup().base_dir().display().to_string(),
            format: dataset.setup().schema().name.clone(),
            start: span.map(|w| w.start.to_string()),
            stop: span.map(|w| w.stop.to_string()),
            scenarios: dataset
                .raw_results()
                .iter()
                .map(|(fit_id, table)| ScenarioSummary {
                    fit_id: fit_id.clone(),
                    spectra: table.len(),
                    fields: table.field_names().map(str::to_string).collect(),
                })
                .collect(),
            series,
        };
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("{dataset}");
    for s in &series {
        println!(
            "{} ({}): {} spectra, mean {}, std {}",
            s.species,
            s.fit_id,
            s.spectra,
            fmt_stat(s.mean),
            fmt_stat(s.std)
        );
    }
    Ok(())
}

fn fmt_stat(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{v:.4e}"))
}

fn run_schemas(registry: Option<&Path>) -> Result<()> {
    let catalog = load_catalog(registry)?;
    for name in catalog.list_schema_names() {
        match catalog.get_schema(&name) {
            Ok(schema) => println!(
                "{name}: *.{} delimited by {:?}, {} metadata columns",
                schema.file_type,
                schema.delimiter,
                schema.meta_columns.len()
            ),
            Err(e) => log::error!("{e}"),
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Load {
            config,
            species,
            fit,
            json,
        } => run_load(&config, species.as_deref(), fit.as_deref(), json),
        Commands::Schemas { registry } => run_schemas(registry.as_deref()),
    }
}
