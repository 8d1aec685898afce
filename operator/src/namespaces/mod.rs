mod reconcile;
mod tracker;

pub use reconcile::{OptInLabel, run};
pub use tracker::{NamespaceEvent, NamespaceEventKind, NamespaceTracker};
