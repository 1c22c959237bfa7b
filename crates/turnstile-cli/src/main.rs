use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use turnstile_core::model_spec::{self, ModelSpec};
use turnstile_core::{
    AccessAction, AccessConfig, AccessControl, AccessError, AccessOutcome, EnrollOutcome,
    FusionConfig, LivenessFusion, ModelCache, OnnxFaceLocator,
};
use turnstile_store::SqliteStore;

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "turnstile", about = "Face access control with anti-spoof liveness")]
struct Cli {
    /// Model directory (overrides TURNSTILE_MODEL_DIR)
    #[arg(long, global = true)]
    model_dir: Option<PathBuf>,
    /// Database path (overrides TURNSTILE_DB_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the liveness check on one image
    Check {
        #[arg(short, long)]
        image: PathBuf,
    },
    /// Enroll a new user from one image
    Register {
        #[arg(short, long)]
        username: String,
        #[arg(short, long)]
        image: PathBuf,
    },
    /// Check a user in
    Login {
        #[arg(short, long)]
        image: PathBuf,
    },
    /// Check a user out
    Logout {
        #[arg(short, long)]
        image: PathBuf,
    },
    /// List enrolled users as JSON
    Users,
    /// List access events as JSON, newest first
    Logs,
    /// Write a user's enrollment image to a file
    UserImage {
        #[arg(long)]
        id: i64,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Show the anti-spoof ensemble
    Models,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().with_overrides(cli.model_dir, cli.db);

    match cli.command {
        Commands::Check { image } => {
            let access = build_access(&config)?;
            let bytes = read_image(&image).await?;
            match access.check_liveness(&bytes).await {
                Ok(verdict) if verdict.is_live() => {
                    println!("Real Face. Score: {:.2}", verdict.confidence);
                    Ok(ExitCode::SUCCESS)
                }
                Ok(verdict) => {
                    println!("Fake Face. Score: {:.2}", verdict.confidence);
                    Ok(ExitCode::FAILURE)
                }
                Err(e) => rejected(e),
            }
        }
        Commands::Register { username, image } => {
            let access = build_access(&config)?;
            let bytes = read_image(&image).await?;
            match access.enroll(&username, &bytes).await {
                Ok(EnrollOutcome::Enrolled { id, identity }) => {
                    println!("Registered {identity} (id {id})");
                    Ok(ExitCode::SUCCESS)
                }
                Ok(EnrollOutcome::NoFaceDetected) => {
                    println!("No face detected");
                    Ok(ExitCode::FAILURE)
                }
                Err(e) => rejected(e),
            }
        }
        Commands::Login { image } => pass(&config, &image, AccessAction::In).await,
        Commands::Logout { image } => pass(&config, &image, AccessAction::Out).await,
        Commands::Users => {
            let store = open_store(&config)?;
            println!("{}", serde_json::to_string_pretty(&store.list_users()?)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Logs => {
            let store = open_store(&config)?;
            println!("{}", serde_json::to_string_pretty(&store.list_events()?)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::UserImage { id, output } => {
            let store = open_store(&config)?;
            match store.user_image(id)? {
                Some(jpeg) => {
                    tokio::fs::write(&output, jpeg)
                        .await
                        .with_context(|| format!("writing {}", output.display()))?;
                    println!("Wrote {}", output.display());
                    Ok(ExitCode::SUCCESS)
                }
                None => {
                    println!("No image stored for user {id}");
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Commands::Models => {
            let specs = load_specs(&config)?;
            println!("{}", serde_json::to_string_pretty(&specs)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn pass(config: &Config, image: &Path, action: AccessAction) -> Result<ExitCode> {
    let access = build_access(config)?;
    let bytes = read_image(image).await?;
    let outcome = match access.pass(&bytes, action).await {
        Ok(outcome) => outcome,
        Err(e) => return rejected(e),
    };

    match outcome {
        AccessOutcome::Granted { identity, action: AccessAction::In } => {
            println!("Welcome back, {identity}!");
        }
        AccessOutcome::Granted { identity, action: AccessAction::Out } => {
            println!("Goodbye, {identity}!");
        }
        AccessOutcome::SpoofRejected(verdict) => {
            println!("Spoof detected. Score: {:.2}", verdict.confidence);
            return Ok(ExitCode::FAILURE);
        }
        AccessOutcome::NoFaceDetected => {
            println!("No face detected");
            return Ok(ExitCode::FAILURE);
        }
        AccessOutcome::UnknownIdentity => {
            println!("Unknown user");
            return Ok(ExitCode::FAILURE);
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Input problems are reported and exit 1; everything else propagates.
fn rejected(e: AccessError) -> Result<ExitCode> {
    match e {
        AccessError::InputRejected(_) | AccessError::Frame(_) | AccessError::NoFaceDetected => {
            println!("Rejected: {e}");
            Ok(ExitCode::FAILURE)
        }
        other => Err(other.into()),
    }
}

async fn read_image(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("reading image {}", path.display()))
}

fn open_store(config: &Config) -> Result<SqliteStore> {
    SqliteStore::open(config.db_path())
        .with_context(|| format!("opening database {}", config.db_path().display()))
}

/// Explicit ensemble if configured, otherwise the directory listed once.
fn load_specs(config: &Config) -> Result<Vec<ModelSpec>> {
    match &config.spoof_models {
        Some(names) => names
            .iter()
            .map(|name| ModelSpec::parse(name).with_context(|| format!("model name {name}")))
            .collect(),
        None => {
            let dir = config.spoof_model_dir();
            model_spec::discover(&dir)
                .with_context(|| format!("listing anti-spoof models in {}", dir.display()))
        }
    }
}

fn build_access(config: &Config) -> Result<AccessControl> {
    let specs = load_specs(config)?;
    let cache = ModelCache::load_all(&config.spoof_model_dir(), &specs)
        .context("loading anti-spoof models")?;
    let fusion = LivenessFusion::from_cache(
        &specs,
        &cache,
        FusionConfig {
            check_image: config.check_image,
            confidence_divisor: config.confidence_divisor,
            model_timeout: config.model_timeout,
        },
    )?;
    tracing::info!(models = fusion.members().len(), "anti-spoof ensemble ready");

    let locator = OnnxFaceLocator::load(
        &config.detector_model_path(),
        &config.recognizer_model_path(),
    )
    .context("loading face models")?;
    let store = Arc::new(open_store(config)?);

    Ok(AccessControl::new(
        Arc::new(locator),
        fusion,
        store.clone(),
        store,
        AccessConfig {
            tolerance: config.match_tolerance,
            conform_aspect: config.conform_aspect,
            concurrent: config.parallel_models,
        },
    ))
}
