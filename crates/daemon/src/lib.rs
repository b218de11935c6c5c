mod domains;
mod error;
mod features;
mod geo;
mod pipeline;
#[cfg(feature = "s3")]
mod s3_storage;
mod store;
mod utils;

pub use domains::*;
pub use error::*;
pub use features::*;
pub use geo::*;
pub use pipeline::*;
#[cfg(feature = "s3")]
pub use s3_storage::*;
pub use store::*;
pub use utils::*;
