pub mod batch;
pub mod oneshot;

#[derive(Debug, thiserror::Error)]
pub enum StandaloneError {
    #[error(transparent)]
    Model(#[from] vision_relay_common::engine::InferenceError),
    #[error("failed to read image {0}: {1}")]
    Decode(String, image::ImageError),
    #[error("failed to write {0}: {1}")]
    Write(String, std::io::Error),
    #[error("failed to save overlay {0}: {1}")]
    Overlay(String, image::ImageError),
    #[error("failed to list {0}: {1}")]
    ListDir(String, std::io::Error),
    #[error("failed to spawn {0} thread: {1}")]
    Spawn(&'static str, std::io::Error),
}
