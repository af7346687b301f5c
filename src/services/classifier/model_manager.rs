use crate::config::ModelConfig;
use crate::error::AppError;
use crate::services::classifier::inference::{self, Preprocess};
use crate::services::classifier::Labeler;
use crate::models::classify_types::Prediction;
use ort::session::Session;
use std::path::Path;

pub type OnnxSession = Session;

const MAX_LABEL_ID: usize = 1 << 20;

/// An ONNX classifier with its label table, ready to label images.
pub struct OnnxLabeler {
    model: OnnxSession,
    labels: Vec<String>,
    preprocess: Preprocess,
    input_layer: Option<String>,
    output_layer: Option<String>,
    top_k: usize,
    apply_softmax: bool,
}

impl OnnxLabeler {
    pub fn load(config: &ModelConfig) -> Result<Self, AppError> {
        let labels = load_labels(&config.labels)?;
        tracing::info!(
            graph = %config.graph.display(),
            labels = labels.len(),
            "loading model"
        );
        let model = load_session(&config.graph)?;

        Ok(Self {
            model,
            labels,
            preprocess: Preprocess {
                width: config.input_width,
                height: config.input_height,
                mean: config.input_mean,
                std: config.input_std,
            },
            input_layer: config.input_layer.clone(),
            output_layer: config.output_layer.clone(),
            top_k: config.top_k,
            apply_softmax: config.apply_softmax,
        })
    }
}

impl Labeler for OnnxLabeler {
    fn process(&mut self, image: &Path) -> Result<Vec<Prediction>, AppError> {
        let tensor = inference::preprocess_image(image, &self.preprocess)?;
        let scores = inference::run_model(
            &mut self.model,
            tensor,
            self.input_layer.as_deref(),
            self.output_layer.as_deref(),
        )?;
        let scores = if self.apply_softmax {
            inference::softmax(&scores)
        } else {
            scores
        };
        Ok(inference::top_labels(&scores, &self.labels, self.top_k))
    }
}

pub(crate) fn load_session(graph: &Path) -> Result<Session, AppError> {
    let _ = ort::init().with_name("label-client").commit();

    let session = Session::builder()
        .map_err(|e| AppError::Inference(format!("Failed to create session builder: {}", e)))?
        .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)
        .map_err(|e| AppError::Inference(format!("Failed to set optimization level: {}", e)))?
        .with_intra_threads(4)
        .map_err(|e| AppError::Inference(format!("Failed to set intra threads: {}", e)))?
        .commit_from_file(graph)
        .map_err(|e| {
            AppError::Inference(format!("Failed to load ONNX model {}: {}", graph.display(), e))
        })?;

    Ok(session)
}

/// Reads the label table. A `.json` file is read as a model config with an
/// `id2label` object; anything else as one label per line.
pub fn load_labels(path: &Path) -> Result<Vec<String>, AppError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        AppError::Config(format!("Failed to read labels file {}: {}", path.display(), e))
    })?;

    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if is_json {
        parse_id2label(&content)
    } else {
        Ok(content
            .lines()
            .map(|line| line.trim_end_matches('\r').to_string())
            .filter(|line| !line.is_empty())
            .collect())
    }
}

fn parse_id2label(content: &str) -> Result<Vec<String>, AppError> {
    let config: serde_json::Value = serde_json::from_str(content)?;

    let id2label = config["id2label"]
        .as_object()
        .ok_or_else(|| AppError::Config("Config missing id2label field".to_string()))?;

    let mut entries: Vec<(usize, String)> = Vec::with_capacity(id2label.len());
    for (k, v) in id2label {
        let idx = k
            .parse::<usize>()
            .ok()
            .filter(|idx| *idx < MAX_LABEL_ID)
            .ok_or_else(|| AppError::Config(format!("Invalid label index '{}'", k)))?;
        let label = v.as_str().unwrap_or("unknown").to_string();
        entries.push((idx, label));
    }

    // Each label sits at its own id; ids missing from a sparse table keep
    // the same fallback name `top_labels` uses past the end.
    let len = entries.iter().map(|(idx, _)| idx + 1).max().unwrap_or(0);
    let mut labels: Vec<String> = (0..len).map(|idx| format!("class_{}", idx)).collect();
    for (idx, label) in entries {
        labels[idx] = label;
    }
    Ok(labels)
}
