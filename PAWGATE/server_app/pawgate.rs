use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pawgate_learning::{ClassifierModel, Preprocessor};
use pawgate_serving::PrototypeDetector;
use pawgate_server::{
    bootstrap::{build, model_paths, pipeline, Services},
    config::PawgateConfig,
    logging, serve,
};
use serde_json::json;
use shared_event_bus::{EventRecord, EventSubscriber};
use tokio::sync::broadcast::{error::RecvError, Receiver};

#[derive(Parser, Debug)]
#[command(name = "pawgate", version, about = "Cat/dog classifier service")]
struct Cli {
    /// Configuration file; defaults to ./pawgate.toml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Starts the HTTP API.
    Serve {
        /// Overrides `server.bind_address`.
        #[arg(long)]
        bind: Option<String>,
    },
    /// Trains a fresh model on a class-partitioned directory and promotes it.
    Train {
        #[arg(long)]
        data: PathBuf,
        /// Held-out directory evaluated after promotion.
        #[arg(long)]
        test: Option<PathBuf>,
        #[arg(long)]
        epochs: Option<usize>,
    },
    /// Evaluates the active model and writes the metrics file.
    Evaluate {
        #[arg(long)]
        data: PathBuf,
    },
    /// Builds the gatekeeper vocabulary from `<data>/<label>/*` example images.
    BuildDetector {
        #[arg(long)]
        data: PathBuf,
        /// Defaults to `gatekeeper.detector_path`.
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long, default_value_t = PrototypeDetector::DEFAULT_TEMPERATURE)]
        temperature: f32,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Err(err) = logging::init(logging::DEFAULT_FILTER) {
        eprintln!("logging disabled: {err}");
    }
    let mut config = PawgateConfig::load_or_default(cli.config.as_deref())
        .context("loading configuration")?;
    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind_address = bind;
            }
            handle_serve(&config)
        }
        Commands::Train { data, test, epochs } => {
            if let Some(epochs) = epochs {
                config.training.epochs = epochs;
                config.validate()?;
            }
            handle_train(&config, &data, test)
        }
        Commands::Evaluate { data } => handle_evaluate(&config, &data),
        Commands::BuildDetector {
            data,
            out,
            temperature,
        } => {
            let out = out.unwrap_or_else(|| config.gatekeeper.detector_path.clone());
            handle_build_detector(config.preprocessing.preprocessor(), &data, &out, temperature)
        }
    }
}

fn handle_serve(config: &PawgateConfig) -> Result<()> {
    let Services { state, events } = build(config)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting tokio runtime")?;
    runtime.block_on(async move {
        tokio::spawn(trace_events(events.subscribe().await?));
        serve(Arc::new(state), &config.server, shutdown_signal()).await
    })
}

async fn trace_events(mut feed: Receiver<EventRecord>) {
    loop {
        match feed.recv().await {
            Ok(event) => tracing::info!(
                source = %event.source,
                event_type = %event.event_type,
                payload = %event.payload,
                "lifecycle event"
            ),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event feed lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

fn handle_train(config: &PawgateConfig, data: &Path, test: Option<PathBuf>) -> Result<()> {
    anyhow::ensure!(data.is_dir(), "training directory {} not found", data.display());
    let paths = model_paths(config);
    let report = pipeline(config).run(data, &paths, test.as_deref())?;
    let best = report.training.best();
    let summary = json!({
        "model_path": report.model_path,
        "epochs": report.training.epochs.len(),
        "best_val_accuracy": best.map(|b| b.val_accuracy),
        "best_val_loss": best.map(|b| b.val_loss),
        "metrics": report.metrics,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn handle_evaluate(config: &PawgateConfig, data: &Path) -> Result<()> {
    let paths = model_paths(config);
    let active = paths.active();
    let model = ClassifierModel::load(&active)
        .with_context(|| format!("loading active model {}", active.display()))?;
    let metrics = pipeline(config)
        .evaluate(&model, data)
        .with_context(|| format!("evaluating on {}", data.display()))?;
    metrics.save(paths.metrics()).context("writing metrics")?;
    tracing::info!(accuracy = metrics.accuracy, samples = metrics.samples, "evaluation complete");
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    Ok(())
}

fn handle_build_detector(
    input: Preprocessor,
    data: &Path,
    out: &Path,
    temperature: f32,
) -> Result<()> {
    let detector = PrototypeDetector::from_directory(data, input, temperature)
        .with_context(|| format!("reading detector examples from {}", data.display()))?;
    detector.save(out)?;
    tracing::info!(labels = detector.len(), path = %out.display(), "detector vocabulary written");
    Ok(())
}
