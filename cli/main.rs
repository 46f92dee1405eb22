#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use serde_json::Value;
use std::fs;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process;

use diarisk::config::{ConfigOverrides, DEFAULT_MODEL_PATH, ServeConfig};
use diarisk::inference::{BATCH_FIELD, Predictor};
use diarisk::model::{TrainedModel, load_handle};
use diarisk::server;

#[derive(Args)]
pub struct ServeArgs {
    /// Optional TOML config file (model_path, host, port, max_batch_size)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Path to the scoring artifact (.toml); overrides the config file
    #[arg(long, value_name = "FILE")]
    pub model: Option<PathBuf>,

    /// Address to bind; overrides the config file
    #[arg(long)]
    pub host: Option<IpAddr>,

    /// Port to bind; overrides the config file
    #[arg(long)]
    pub port: Option<u16>,

    /// Reject batch requests with more records than this
    #[arg(long, value_name = "N")]
    pub max_batch_size: Option<usize>,
}

#[derive(Args)]
pub struct PredictArgs {
    /// JSON file holding one patient record or a {"patients": [...]} batch
    pub input: PathBuf,

    /// Path to the scoring artifact (.toml)
    #[arg(long, default_value = DEFAULT_MODEL_PATH)]
    pub model: PathBuf,
}

#[derive(Args)]
pub struct InspectArgs {
    /// Path to the scoring artifact (.toml)
    #[arg(long, default_value = DEFAULT_MODEL_PATH)]
    pub model: PathBuf,
}

#[derive(Parser)]
#[command(
    name = "diarisk",
    about = "Diabetes-risk scoring service",
    long_about = "Serves a pre-trained diabetes-risk classifier over HTTP and scores \
                 patient records from the command line."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP prediction service
    #[command(about = "Serve /predict and /predict/batch over HTTP")]
    Serve(ServeArgs),

    /// Score a JSON file and print the response
    #[command(about = "Score a JSON file of patient records (prints JSON)")]
    Predict(PredictArgs),

    /// Load and validate a scoring artifact
    #[command(about = "Validate a scoring artifact and print its summary")]
    Inspect(InspectArgs),

    /// Display version and build information
    #[command(about = "Display version and build information")]
    Version,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { command } = Cli::parse();

    let result = match command {
        Some(Commands::Serve(args)) => serve(args),
        Some(Commands::Predict(args)) => predict(args),
        Some(Commands::Inspect(args)) => inspect(args),
        Some(Commands::Version) => {
            print_version_info();
            Ok(())
        }
        None => {
            Cli::command().print_help().expect("print help");
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = ServeConfig::resolve(
        args.config.as_deref(),
        ConfigOverrides {
            model_path: args.model,
            host: args.host,
            port: args.port,
            max_batch_size: args.max_batch_size,
        },
    )?;

    // The model must be in memory before the listener exists.
    log::info!("Loading model from: {}", config.model_path.display());
    let handle = load_handle(&config.model_path)?;
    log::info!("Model loaded: {}", handle.summary());
    match config.max_batch_size {
        Some(max) => log::info!("Batch requests capped at {max} records"),
        None => log::info!("Batch requests are unbounded"),
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(server::serve(Predictor::new(handle), &config))?;
    Ok(())
}

fn predict(args: PredictArgs) -> Result<(), Box<dyn std::error::Error>> {
    let handle = load_handle(&args.model)?;
    let predictor = Predictor::new(handle);

    let text = fs::read_to_string(&args.input)?;
    let payload: Value = serde_json::from_str(&text)?;

    // Only a list under `patients` makes a batch; a single record may carry any extra key.
    let response = if payload.get(BATCH_FIELD).and_then(Value::as_array).is_some() {
        let batch = predictor.predict_batch_json(&payload)?;
        log::info!("Scored {} records", batch.predictions.len());
        serde_json::to_string_pretty(&batch)?
    } else {
        serde_json::to_string_pretty(&predictor.predict_json(&payload)?)?
    };
    println!("{response}");
    Ok(())
}

fn inspect(args: InspectArgs) -> Result<(), Box<dyn std::error::Error>> {
    let model = TrainedModel::load(&args.model)?;
    println!("Model: {}", args.model.display());
    if let Some(description) = &model.description {
        println!("Description: {description}");
    }
    println!("Booster: {}", model.summary());
    println!("Feature order:");
    for (i, name) in model.feature_names.iter().enumerate() {
        println!("  {:>2}  {name}", i);
    }
    Ok(())
}

/// Format seconds into a human-readable duration like "2.4 hours ago"
fn format_duration_ago(seconds: u64) -> String {
    const MINUTE: u64 = 60;
    const HOUR: u64 = 60 * MINUTE;
    const DAY: u64 = 24 * HOUR;

    if seconds < MINUTE {
        format!("{} seconds ago", seconds)
    } else if seconds < HOUR {
        format!("{:.1} minutes ago", seconds as f64 / MINUTE as f64)
    } else if seconds < DAY {
        format!("{:.1} hours ago", seconds as f64 / HOUR as f64)
    } else {
        format!("{:.1} days ago", seconds as f64 / DAY as f64)
    }
}

fn print_version_info() {
    let version = env!("CARGO_PKG_VERSION");
    let build_timestamp: u64 = env!("DIARISK_BUILD_TIMESTAMP").parse().unwrap_or(0);

    println!("diarisk {}", version);
    println!("API version: {}", server::API_VERSION);

    if build_timestamp > 0 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        if now > build_timestamp {
            println!("Built: {}", format_duration_ago(now - build_timestamp));
        } else {
            println!("Built: just now");
        }
    }
}
