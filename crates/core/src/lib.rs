//! air-fusion core library
//!
//! Shared pieces used by the fusion daemon:
//! - Configuration discovery and TOML loading (XDG-compliant)
//! - Filesystem helpers, including atomic file replacement for the store
//! - Application-wide defaults

mod config;
pub mod fs;

pub use config::{find_config_file, load_config, ConfigError, ConfigSource};
pub use fs::{ensure_dir_exists, replace_file, sibling_temp_path};

/// Application name used for XDG paths
pub const APP_NAME: &str = "air-fusion";

/// Default time between fusion cycles (1 hour)
pub const DEFAULT_FETCH_INTERVAL: u64 = 3600;

/// Default timeout applied to every external call, in seconds
pub const DEFAULT_REQUEST_TIMEOUT: u64 = 30;

/// Largest radius the OpenAQ locations endpoint accepts in one request
pub const DEFAULT_MAX_QUERY_RADIUS_M: f64 = 25_000.0;

/// Default target when nothing is configured (New York City)
pub const DEFAULT_LATITUDE: f64 = 40.7128;
pub const DEFAULT_LONGITUDE: f64 = -74.0060;
