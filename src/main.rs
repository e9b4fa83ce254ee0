use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use idsnap::{config, Enrollment, FaceDetector, FaceFile, MatchingEngine, Recognition};
use log::{info, warn};

#[derive(Parser)]
#[command(name = "idsnap")]
#[command(version, about = "Identify people by matching face embeddings against an enrolled gallery")]
struct Cli {
    /// Config file (defaults to the installed config path)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a new identity from detector output
    Enroll {
        /// Name to store with the face
        #[arg(short, long)]
        label: String,
        /// JSON file with the detected faces
        #[arg(short, long)]
        faces: PathBuf,
    },
    /// Identify the face in detector output
    Recognize {
        /// JSON file with the detected faces
        #[arg(short, long)]
        faces: PathBuf,
        /// Also list the K nearest identities
        #[arg(short, long)]
        top: Option<usize>,
    },
    /// List enrolled identities
    List,
    /// Load the gallery snapshot and report its state
    Check,
    /// Open config file in editor
    Config,
}

fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .format_timestamp(None)
        .parse_default_env()
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.as_deref();
    // `config` skips validation so a broken file can still be edited.
    let load = || config::load_config(config_path);

    match cli.command {
        Commands::Enroll { label, faces } => enroll(&load()?, &label, &faces),
        Commands::Recognize { faces, top } => recognize(&load()?, &faces, top),
        Commands::List => list(&load()?),
        Commands::Check => check(&load()?),
        Commands::Config => open_config(config_path),
    }
}

fn open_engine(cfg: &config::Config) -> Result<MatchingEngine> {
    MatchingEngine::open(cfg)
        .with_context(|| format!("loading gallery from {}", cfg.snapshot.display()))
}

fn enroll(cfg: &config::Config, label: &str, faces: &Path) -> Result<()> {
    let engine = open_engine(cfg)?;
    info!("Enrolling {:?} from {}", label, faces.display());

    match engine.enroll_image(label, &mut FaceFile, faces)? {
        Enrollment::Enrolled { position } => {
            info!("✓ {} enrolled at position {}", label.trim(), position);
            Ok(())
        }
        Enrollment::InvalidLabel => anyhow::bail!("Label must not be blank"),
        Enrollment::NoFaceDetected => {
            anyhow::bail!("No face detected in {}", faces.display())
        }
        Enrollment::InvalidEmbedding(e) => anyhow::bail!("Unusable embedding: {}", e),
        Enrollment::PersistenceFailed { position, error } => {
            warn!("Identity held in memory at position {} only", position);
            Err(error).with_context(|| {
                format!("saving gallery to {}", cfg.snapshot.display())
            })
        }
    }
}

fn recognize(cfg: &config::Config, faces: &Path, top: Option<usize>) -> Result<()> {
    let engine = open_engine(cfg)?;
    let detected = FaceFile.detect(faces)?;

    match engine.recognize_faces(&detected)? {
        Recognition::Match {
            label, similarity, ..
        } => println!("{label}\t{similarity:.4}"),
        Recognition::Unknown { best } => match best {
            Some(s) => println!("UNKNOWN\t{s:.4}"),
            None => println!("UNKNOWN"),
        },
        Recognition::NoFaceDetected => println!("NO_FACE_DETECTED"),
        Recognition::InvalidEmbedding(e) => anyhow::bail!("Unusable embedding: {}", e),
    }

    if let (Some(k), Some(face)) = (top, cfg.face_policy.select(&detected)) {
        for c in engine.candidates(&face.embedding, k)? {
            println!("  #{}\t{}\t{:.4}", c.position, c.label, c.similarity);
        }
    }
    Ok(())
}

fn list(cfg: &config::Config) -> Result<()> {
    let engine = open_engine(cfg)?;
    for record in engine.records() {
        println!("{}\t{}", record.position, record.label);
    }
    Ok(())
}

fn check(cfg: &config::Config) -> Result<()> {
    let engine = open_engine(cfg)?;
    let snapshot = engine.snapshot();
    if !snapshot.exists() {
        warn!("No snapshot at {}", snapshot.path().display());
    }
    info!(
        "✓ {} identities, dimension {}, threshold {:.3}",
        engine.len(),
        engine.dimension(),
        engine.threshold()
    );
    Ok(())
}

fn open_config(path: Option<&Path>) -> Result<()> {
    let config_path = path.unwrap_or(&config::CONFIG_PATH);
    let editor = env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());

    if !config_path.exists() {
        config::save_config(&config::Config::default(), Some(config_path))
            .context("Failed to write default config")?;
    }

    info!("Opening config file: {:?}", config_path);

    let status = std::process::Command::new(editor)
        .arg(config_path)
        .status()
        .context("Failed to open editor")?;

    if !status.success() {
        anyhow::bail!("Editor exited with non-zero status");
    }

    Ok(())
}
