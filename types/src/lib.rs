mod annotations;
mod duration;

pub use annotations::*;
pub use duration::*;
