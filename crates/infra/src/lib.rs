//! Infrastructure layer: activity store, Redis channels, engine components,
//! external collaborators, workers and configuration.

pub mod activity_store;
pub mod channels;
pub mod collaborators;
pub mod config;
pub mod engine;
pub mod workers;

#[cfg(test)]
mod faults;
#[cfg(test)]
mod integration_tests;
