pub mod inference;
pub mod model_manager;

use crate::error::AppError;
use crate::models::classify_types::Prediction;
use std::path::Path;

/// Maps an image to ranked predictions.
///
/// Implementations are called from image workers only. A pool with more than
/// one worker shares one labeler behind a mutex, so `process` never runs
/// concurrently with itself.
pub trait Labeler: Send {
    fn process(&mut self, image: &Path) -> Result<Vec<Prediction>, AppError>;
}

impl<F> Labeler for F
where
    F: FnMut(&Path) -> Result<Vec<Prediction>, AppError> + Send,
{
    fn process(&mut self, image: &Path) -> Result<Vec<Prediction>, AppError> {
        self(image)
    }
}
