//! koten-ocr - OCR for vertically-written historical documents
//!
//! Reads a page image, runs detection, recognition and reading-order
//! reconstruction, and prints the requested outputs.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use koten_ocr::config::{self, AppConfig};
use koten_ocr::pipeline::{JobConfig, OutputFormat};
use koten_ocr::vision::models::ModelManifest;
use koten_ocr::vision::{ColumnDirection, ModelManager, ModelType, OnnxModelProvider, ReadingMode};
use koten_ocr::TaskQueue;

/// koten-ocr - OCR for vertically-written historical text
#[derive(Parser, Debug)]
#[command(name = "koten-ocr")]
#[command(about = "Recognize text in photographed pages of vertical historical documents")]
struct Args {
    /// Page image to recognize
    image: Option<PathBuf>,

    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding det.onnx, rec.onnx and dict.txt
    #[arg(long)]
    models_dir: Option<PathBuf>,

    /// Output format: txt, json or xml (repeatable)
    #[arg(short, long = "format")]
    formats: Vec<OutputFormat>,

    /// Reading mode: vertical or horizontal
    #[arg(long)]
    direction: Option<ReadingMode>,

    /// Column order: rtl or ltr
    #[arg(long)]
    columns: Option<ColumnDirection>,

    /// Estimate reading direction from the page
    #[arg(long)]
    auto_direction: bool,

    /// Report which model files are present and exit
    #[arg(long)]
    check_models: bool,

    /// Record SHA-256 digests of the current model files in the manifest and exit
    #[arg(long)]
    pin_models: bool,

    /// Write the default configuration to this path and exit
    #[arg(long, value_name = "PATH")]
    write_default_config: Option<PathBuf>,
}

fn main() -> Result<()> {
    // Initialize logging; stdout is reserved for OCR output
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();

    if let Some(path) = &args.write_default_config {
        config::save_config(&AppConfig::default(), path)?;
        info!("Wrote default configuration to {:?}", path);
        return Ok(());
    }

    let mut config = load_or_default_config(args.config.as_deref())?;
    if let Some(dir) = &args.models_dir {
        config.models.models_dir = Some(dir.clone());
    }

    let manager = ModelManager::new(&config.models)?;

    if args.check_models {
        print_model_status(&manager);
        return Ok(());
    }

    if args.pin_models {
        pin_models(&manager)?;
        return Ok(());
    }

    let Some(image_path) = &args.image else {
        bail!("No input image given (see --help)");
    };

    if !manager.are_models_ready() {
        print_model_status(&manager);
        bail!("Model files missing from {:?}", manager.models_dir());
    }

    let image = image::open(image_path)
        .with_context(|| format!("Failed to open image {:?}", image_path))?
        .to_rgb8();
    info!("Loaded {:?} ({}x{})", image_path, image.width(), image.height());

    let job = JobConfig {
        output_formats: (!args.formats.is_empty()).then(|| args.formats.clone()),
        reading_mode: args.direction,
        column_direction: args.columns,
        auto_direction: args.auto_direction.then_some(true),
    };
    let formats = job.formats(&config.output);

    let provider = OnnxModelProvider::new(manager, config.models.clone());
    let queue = TaskQueue::new(Arc::new(provider), config)?;
    let ticket = queue.submit(image, job)?;

    let result = ticket.wait_with_progress(|update| {
        debug!("[{:>3.0}%] {}: {}", update.progress * 100.0, update.stage, update.message);
    })?;

    for issue in &result.issues {
        warn!("Reading order check: {}", issue);
    }
    info!(
        "{} of {} regions recognized in {} ms",
        result.successful_recognitions, result.total_regions, result.processing_time_ms
    );

    for format in formats {
        if let Some(output) = result.output(format) {
            println!("{}", output);
        }
    }

    Ok(())
}

/// Load the given config file, the default one if it exists, or defaults
fn load_or_default_config(path: Option<&Path>) -> Result<AppConfig> {
    if let Some(path) = path {
        let config = config::load_config(path)?;
        info!("Loaded configuration from {:?}", path);
        return Ok(config);
    }

    if let Ok(default_path) = config::default_config_path() {
        if default_path.exists() {
            let config = config::load_config(&default_path)?;
            info!("Loaded configuration from {:?}", default_path);
            return Ok(config);
        }
    }

    info!("Using default configuration");
    Ok(AppConfig::default())
}

fn print_model_status(manager: &ModelManager) {
    println!("Models in {:?}:", manager.models_dir());
    for (model_type, available, size) in manager.get_model_status() {
        let status = match (available, size) {
            (true, Some(bytes)) => format!("ok ({} bytes)", bytes),
            (true, None) => "ok".to_string(),
            (false, _) => "missing".to_string(),
        };
        println!("  {:<22} {:<10} {}", model_type.display_name(), model_type.filename(), status);
    }
}

fn pin_models(manager: &ModelManager) -> Result<()> {
    let mut pinned = 0;
    for model_type in ModelType::ALL {
        if !manager.is_model_available(model_type) {
            warn!("{} not found; skipping", model_type.filename());
            continue;
        }
        let digest = manager.pin_model(model_type)?;
        println!("{}  {}", digest, model_type.filename());
        pinned += 1;
    }

    let manifest: ModelManifest = manager.load_manifest()?;
    info!("Pinned {} models (manifest version {})", pinned, manifest.version);
    Ok(())
}
