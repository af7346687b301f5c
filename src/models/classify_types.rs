use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct Prediction {
    pub class_name: String,
    pub confidence: f32,
}

/// Handle for a registered sink client. Allocated by the client registry and
/// passed by value through the pipeline.
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Inference output for one image, handed from an image worker to a
/// network worker. Predictions keep the labeler's order; position `i`
/// pairs label `i` with score `i`.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct LabelResult {
    pub client: ClientId,
    pub image: PathBuf,
    predictions: Vec<Prediction>,
}

impl LabelResult {
    /// Labels and scores stay aligned because each prediction carries both.
    pub fn new(client: ClientId, image: PathBuf, predictions: Vec<Prediction>) -> Self {
        Self {
            client,
            image,
            predictions,
        }
    }

    pub fn predictions(&self) -> &[Prediction] {
        &self.predictions
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.predictions.iter().map(|p| p.class_name.as_str())
    }

    pub fn scores(&self) -> impl Iterator<Item = f32> + '_ {
        self.predictions.iter().map(|p| p.confidence)
    }

    pub fn len(&self) -> usize {
        self.predictions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predictions.is_empty()
    }

    /// The image path as sent on the wire.
    pub fn image_str(&self) -> String {
        self.image.to_string_lossy().to_string()
    }
}
