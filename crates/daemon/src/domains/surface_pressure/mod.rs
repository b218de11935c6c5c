mod noaa;
mod summary;

pub use noaa::*;
pub use summary::*;
