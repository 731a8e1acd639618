//! Core data structures and numerical building blocks shared by the single
//! cell methods

pub mod base;
pub mod data;
pub mod errors;
pub mod graph;
