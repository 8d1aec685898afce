pub mod patch;

#[cfg(feature = "metrics")]
pub mod metrics;

pub(crate) mod colors;

mod error;

pub use error::*;

/// Name of the kubernetes resource manager.
pub(crate) const MANAGER_NAME: &str = "lapse-operator";
