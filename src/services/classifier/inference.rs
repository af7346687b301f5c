use crate::error::AppError;
use crate::models::classify_types::Prediction;
use crate::services::classifier::model_manager::OnnxSession;
use image::ImageReader;
use ndarray::Array4;
use ort::value::Value;
use std::path::Path;

/// Input geometry and normalization expected by the graph.
/// Each channel value becomes `(pixel - mean) / std`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Preprocess {
    pub width: u32,
    pub height: u32,
    pub mean: f32,
    pub std: f32,
}

impl Default for Preprocess {
    fn default() -> Self {
        Self {
            width: 299,
            height: 299,
            mean: 0.0,
            std: 255.0,
        }
    }
}

pub fn preprocess_image(path: &Path, params: &Preprocess) -> Result<Array4<f32>, AppError> {
    let img = ImageReader::open(path)?
        .with_guessed_format()?
        .decode()?;
    let resized = img.resize_exact(
        params.width,
        params.height,
        image::imageops::FilterType::Triangle,
    );
    Ok(to_nchw(&resized.to_rgb8(), params))
}

/// Lays an RGB image out as a `1 x 3 x H x W` tensor.
pub fn to_nchw(rgb: &image::RgbImage, params: &Preprocess) -> Array4<f32> {
    let (w, h) = rgb.dimensions();
    let std = if params.std == 0.0 { 1.0 } else { params.std };
    Array4::from_shape_fn((1, 3, h as usize, w as usize), |(_, c, y, x)| {
        let value = rgb.get_pixel(x as u32, y as u32)[c] as f32;
        (value - params.mean) / std
    })
}

/// Runs the graph and returns the flattened scores of the selected output.
pub fn run_model(
    model: &mut OnnxSession,
    input: Array4<f32>,
    input_layer: Option<&str>,
    output_layer: Option<&str>,
) -> Result<Vec<f32>, AppError> {
    let input_name = match input_layer {
        Some(name) => name.to_string(),
        None => model
            .inputs()
            .first()
            .map(|input| input.name().to_string())
            .ok_or_else(|| AppError::Inference("Model declares no inputs".to_string()))?,
    };
    let output_name = match output_layer {
        Some(name) => name.to_string(),
        None => model
            .outputs()
            .first()
            .map(|output| output.name().to_string())
            .ok_or_else(|| AppError::Inference("Model declares no outputs".to_string()))?,
    };

    let input_tensor = Value::from_array(input)
        .map_err(|e| AppError::Inference(format!("Failed to create tensor value: {}", e)))?;

    let outputs = model
        .run(ort::inputs![input_name.as_str() => input_tensor])
        .map_err(|e| AppError::Inference(format!("Inference failed: {}", e)))?;

    let output_value = outputs
        .get(output_name.as_str())
        .ok_or_else(|| AppError::Inference(format!("Model has no output named {}", output_name)))?;

    let (_, data) = output_value
        .try_extract_tensor::<f32>()
        .map_err(|e| AppError::Inference(format!("Failed to extract output tensor: {}", e)))?;

    Ok(data.to_vec())
}

pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let exp_sum: f32 = logits.iter().map(|&x| (x - max_logit).exp()).sum();
    logits
        .iter()
        .map(|&x| (x - max_logit).exp() / exp_sum)
        .collect()
}

/// The `top_k` highest scores, best first, named from `labels`.
pub fn top_labels(scores: &[f32], labels: &[String], top_k: usize) -> Vec<Prediction> {
    let mut indexed: Vec<(usize, f32)> = scores.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let top_k = top_k.min(indexed.len());
    indexed[..top_k]
        .iter()
        .map(|&(idx, confidence)| Prediction {
            class_name: labels
                .get(idx)
                .cloned()
                .unwrap_or_else(|| format!("class_{}", idx)),
            confidence,
        })
        .collect()
}
