mod openweather;

pub use openweather::*;
