#![warn(missing_docs)]

//! Scene graph, update pipeline and frame orchestration for the lumen
//! ray tracer.
//!
//! A [`Scene`] owns an animatable object tree (arrays, cameras, lights,
//! and six analytic surface variants), a framebuffer, and a worker pool.
//! Each frame runs a two-phase update — a sequential pass composing
//! transforms and rebuilding constructive-subtraction clipper lists,
//! then a parallel pass recomputing per-surface bounds and backend
//! records — followed by tile-sorted packet tracing.
//!
//! # Example
//!
//! ```ignore
//! use lumen_engine::{Scene, SceneOptions};
//!
//! let scene = Scene::new(&desc, 800, 480, SceneOptions::default())?;
//! scene.render(0)?;
//! scene.save_frame(0)?;
//! ```

pub mod error;
pub mod frame;
pub mod object;
pub mod registry;
pub mod scene;
pub mod surface;
pub mod threads;
pub mod tiling;

pub use error::{EngineError, Result};
pub use lumen_tracer::Fsaa;
pub use object::{OPT_ADJUST, OPT_ALL, OPT_FSCALE, OPT_TARRAY, OPT_UPDATE, OPT_VARRAY};
pub use scene::{CameraAction, Scene, SceneOptions};
pub use threads::{RayonPool, ThreadPool};
