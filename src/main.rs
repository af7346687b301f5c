use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use label_client_lib::config::{AppConfig, SinkKind, LOCAL_CONFIG_PATH, SYSTEM_CONFIG_PATH};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Labels images found under a folder and forwards the predictions.
#[derive(Parser, Debug)]
#[command(name = "label-client")]
#[command(version)]
struct Args {
    /// Local configuration file, read over the system one
    #[arg(short, long, env = "LABEL_CLIENT_CONFIG", default_value = LOCAL_CONFIG_PATH)]
    config: PathBuf,

    /// Folder to scan and watch
    #[arg(short, long, env = "LABEL_CLIENT_ROOT")]
    root_dir: Option<PathBuf>,

    /// ONNX model file
    #[arg(long, env = "LABEL_CLIENT_GRAPH")]
    graph: Option<PathBuf>,

    /// Label file, one class per line or an id2label JSON
    #[arg(long, env = "LABEL_CLIENT_LABELS")]
    labels: Option<PathBuf>,

    /// Where predictions are sent
    #[arg(long, value_enum, env = "LABEL_CLIENT_SINK")]
    sink: Option<SinkKind>,

    /// Scan once and exit instead of watching for new files
    #[arg(long)]
    no_watch: bool,
}

impl Args {
    fn apply(self, config: &mut AppConfig) {
        if let Some(root) = self.root_dir {
            config.discovery.root = root;
        }
        if let Some(graph) = self.graph {
            config.model.graph = graph;
        }
        if let Some(labels) = self.labels {
            config.model.labels = labels;
        }
        if let Some(sink) = self.sink {
            config.sink = sink;
        }
        if self.no_watch {
            config.discovery.watch = false;
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "label_client=info,label_client_lib=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = AppConfig::load(Path::new(SYSTEM_CONFIG_PATH), &args.config)
        .with_context(|| format!("Failed to load configuration from {}", args.config.display()))?;
    args.apply(&mut config);

    info!(
        root = %config.discovery.root.display(),
        sink = ?config.sink,
        watch = config.discovery.watch,
        "starting label client"
    );

    label_client_lib::run(config).context("Label client stopped")?;
    Ok(())
}
