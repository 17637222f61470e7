//! Error types for the engine.

use thiserror::Error;

/// Errors that can occur while constructing or rendering a scene.
///
/// Construction-time errors abort scene creation; per-frame errors abort
/// the frame and leave the scene valid for the next one.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Required data missing or inconsistent in the scene description.
    #[error("malformed scene: {0}")]
    MalformedScene(String),

    /// A surface's generated polyhedron exceeds the hard caps.
    #[error("bbox geometry limits exceeded in surface: {0}")]
    LimitExceeded(String),

    /// The scene's allocation budget is exhausted.
    #[error("scene allocation limit exhausted at {0} nodes")]
    AllocExhausted(usize),

    /// No registered backend supports the requested SIMD target.
    #[error("unsupported target: {0}")]
    UnsupportedTarget(String),

    /// A worker reported an error; the frame was aborted.
    #[error("worker failure: {0}")]
    WorkerFailure(String),

    /// Texture load or saved-frame write failed.
    #[error("image i/o failed: {0}")]
    Io(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
