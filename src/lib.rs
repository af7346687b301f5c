pub mod config;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod services;

use config::AppConfig;
use error::AppError;
use pipeline::{LabelPipeline, PipelineOptions};
use services::classifier::model_manager::OnnxLabeler;
use services::dispatch;
use std::time::Duration;

/// Loads the model, connects the configured sink, scans the root and then
/// keeps watching it. Returns only if startup fails.
pub fn run(config: AppConfig) -> Result<(), AppError> {
    let labeler = OnnxLabeler::load(&config.model)?;
    let dispatcher = dispatch::from_config(&config)?;

    let pipeline = LabelPipeline::new(
        PipelineOptions::from_config(&config),
        Box::new(labeler),
        dispatcher,
    )?;
    pipeline.start()?;

    if !config.discovery.watch {
        pipeline.shutdown();
        tracing::info!(
            image = ?pipeline.image_stats(),
            network = ?pipeline.network_stats(),
            "scan finished"
        );
        return Ok(());
    }

    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}
