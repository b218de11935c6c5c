mod directory;
mod reader;
mod swath;

pub use directory::*;
pub use reader::*;
pub use swath::*;
