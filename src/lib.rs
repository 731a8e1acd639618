//! Registry and dispatch layer for single cell preprocessing pipelines,
//! with a native in-memory backend.

#[macro_use]
pub mod utils;

pub mod core;
pub mod pipeline;
pub mod single_cell;

pub use crate::core::data::anndata::{AnnData, AnnotatedData, Annotations, Column};
pub use crate::core::errors::ProcessingError;
pub use crate::pipeline::backend::{NativeBackend, NativeConfig, PreprocessingBackend, QcMetricsArgs};
pub use crate::pipeline::errors::{CoercionError, PipelineError};
pub use crate::pipeline::instance::{ModuleInstance, ModuleKind, ModuleParams};
pub use crate::pipeline::params::ParamMap;
pub use crate::pipeline::registry::{available_modules, find_module, ModuleGroup, ModuleSpec};
pub use crate::pipeline::runner::{Pipeline, PipelineStep};
