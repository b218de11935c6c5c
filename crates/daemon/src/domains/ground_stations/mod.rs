mod expander;
mod openaq;

pub use expander::*;
pub use openaq::*;
