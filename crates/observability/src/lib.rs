//! Process-wide tracing setup shared by the cubeflow binaries.

pub mod logging;

pub use logging::{LogFormat, init_with};

/// Install the global subscriber: JSON lines, filter from `RUST_LOG`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    logging::init_with(LogFormat::Json, logging::DEFAULT_FILTER);
}
