//! Shared message shapes and configuration for every pipeline stage.

pub mod model;
