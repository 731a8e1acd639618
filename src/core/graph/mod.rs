//! Neighbour search

pub mod knn;
