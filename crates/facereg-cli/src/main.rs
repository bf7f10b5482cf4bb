mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use facereg_core::{
    CascadeDetector, FaceDetector, IdentityRegistry, LbphModel, LbphParams, MultiFacePolicy,
    RecognitionService, SampleBuilder,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "facereg", about = "LBPH face enrollment and recognition")]
struct Cli {
    /// Corpus directory (overrides FACEREG_CORPUS_DIR)
    #[arg(long, global = true)]
    corpus: Option<PathBuf>,
    /// Model file (overrides FACEREG_MODEL_PATH)
    #[arg(long, global = true)]
    model: Option<PathBuf>,
    /// Cascade definition (overrides FACEREG_CASCADE_PATH)
    #[arg(long, global = true)]
    cascade: Option<PathBuf>,
    /// Match threshold; lower distances are closer (overrides FACEREG_THRESHOLD)
    #[arg(long, global = true)]
    threshold: Option<f64>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model from the corpus and save it
    Train {
        /// What to do with images holding several faces: skip or keep
        #[arg(long)]
        multi_face: Option<MultiFacePolicy>,
    },
    /// Recognize the face in an image
    Recognize {
        /// Image to recognize
        image: PathBuf,
    },
    /// List identities found in the corpus
    Identities,
    /// Print detected face boxes for an image
    Detect {
        /// Image to scan
        image: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = Config::from_env();
    if let Some(corpus) = cli.corpus {
        config.corpus_dir = corpus;
    }
    if let Some(model) = cli.model {
        config.model_path = model;
    }
    if let Some(cascade) = cli.cascade {
        config.cascade_path = cascade;
    }
    if let Some(threshold) = cli.threshold {
        config.threshold = threshold;
    }

    match cli.command {
        Commands::Train { multi_face } => {
            if let Some(policy) = multi_face {
                config.multi_face = policy;
            }
            train(&config)?;
        }
        Commands::Recognize { image } => recognize(&config, image)?,
        Commands::Identities => {
            let registry = load_registry(&config)?;
            println!("{}", serde_json::to_string_pretty(&registry)?);
        }
        Commands::Detect { image } => {
            let detector = load_detector(&config)?;
            let gray = image::open(&image)
                .with_context(|| format!("failed to open {}", image.display()))?
                .to_luma8();
            let faces = detector.detect(&gray);
            println!("{}", serde_json::to_string(&faces)?);
        }
    }

    Ok(())
}

fn train(config: &Config) -> Result<()> {
    let detector = load_detector(config)?;
    let set = SampleBuilder::new(&detector)
        .with_filter(config.extensions.clone())
        .with_policy(config.multi_face)
        .build(&config.corpus_dir)
        .with_context(|| format!("failed to build samples from {}", config.corpus_dir.display()))?;

    let model = LbphModel::train(&set.samples, LbphParams::default()).context("training failed")?;
    model
        .save(&config.model_path)
        .with_context(|| format!("failed to save model to {}", config.model_path.display()))?;

    println!(
        "trained on {} samples, {} identities -> {}",
        model.sample_count(),
        set.distinct_labels(),
        config.model_path.display()
    );
    Ok(())
}

fn recognize(config: &Config, image: PathBuf) -> Result<()> {
    let detector = load_detector(config)?;
    let model = LbphModel::load(&config.model_path).context("failed to load model")?;
    let registry = IdentityRegistry::from_corpus_or_empty(&config.corpus_dir, &config.extensions)
        .with_context(|| format!("failed to read corpus {}", config.corpus_dir.display()))?;

    let service = RecognitionService::new(detector, model, registry).with_threshold(config.threshold);
    let result = service.recognize_path(&image);
    println!("{}", result.to_json());
    Ok(())
}

fn load_detector(config: &Config) -> Result<CascadeDetector> {
    CascadeDetector::load(&config.cascade_path, config.detector_params())
        .context("failed to load face detector")
}

fn load_registry(config: &Config) -> Result<IdentityRegistry> {
    IdentityRegistry::from_corpus(&config.corpus_dir, &config.extensions)
        .with_context(|| format!("failed to read corpus {}", config.corpus_dir.display()))
}
