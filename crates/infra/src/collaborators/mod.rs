//! External collaborators of the engine: the raster compute backend and the
//! scene catalog. Both are injected as traits.

pub mod catalog;
pub mod compute;

pub use catalog::{CatalogError, CatalogStore, InMemoryCatalog, JobSpec};
pub use compute::{ComputeError, RasterCompute, StaticRasterCompute};
