mod field;
mod noaa;
mod vector;

pub use field::*;
pub use noaa::*;
pub use vector::*;
