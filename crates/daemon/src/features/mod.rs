mod fallback;
mod predictor;
mod prepare;

pub use fallback::*;
pub use predictor::*;
pub use prepare::*;
