//! Module registry and dispatch of pipeline steps
//!
//! A pipeline step is a module descriptor plus a loosely-typed parameter
//! map. The parameters are validated into typed structs before the
//! operation is handed to a `PreprocessingBackend`.

pub mod backend;
pub mod errors;
pub mod instance;
pub mod params;
pub mod registry;
pub mod runner;
