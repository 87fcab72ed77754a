//! HTTP API: job submission, status, continuation trigger and dead-letter
//! operations over the cubeflow engine.

pub mod app;
pub mod middleware;
