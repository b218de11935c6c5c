use std::{
    env,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use air_fusion_core::{
    find_config_file, load_config, ConfigSource, DEFAULT_FETCH_INTERVAL, DEFAULT_LATITUDE,
    DEFAULT_LONGITUDE, DEFAULT_MAX_QUERY_RADIUS_M, DEFAULT_REQUEST_TIMEOUT,
};
use anyhow::{anyhow, Error};
use clap::Parser;
use reqwest::Client;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::de::DeserializeOwned;
use slog::{debug, o, warn, Drain, Level, Logger};
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::{Coordinate, FetchTarget, QualityPolicy, WindFieldConfig, CALLS_PER_SOURCE};

#[derive(Parser, Clone, Debug, serde::Deserialize, Default)]
#[command(
    author,
    version,
    about = "air-fusion - fetches air quality sources and fuses them into one time series"
)]
pub struct Cli {
    /// Path to config file (TOML format)
    /// Searched in order: this flag, $AIR_FUSION_CONFIG, ./fusion.toml,
    /// $XDG_CONFIG_HOME/air-fusion/fusion.toml, /etc/air-fusion/fusion.toml
    #[arg(short, long)]
    #[serde(skip)]
    pub config: Option<String>,

    /// Log level: trace, debug, info, warn, error
    #[arg(short, long, env = "AIR_FUSION_LEVEL")]
    pub level: Option<String>,

    /// Directory holding the table, the wind field and other outputs
    #[arg(short, long, env = "AIR_FUSION_DATA_DIR")]
    pub data_dir: Option<String>,

    /// File name of the fused time-series table inside the data dir
    #[arg(long, env = "AIR_FUSION_STORE_FILE")]
    pub store_file: Option<String>,

    /// Seconds between fusion cycles
    #[arg(short, long, env = "AIR_FUSION_SLEEP_INTERVAL")]
    pub sleep_interval: Option<u64>,

    /// Rate limiter refill, tokens per second
    #[arg(long, env = "AIR_FUSION_REFILL_RATE")]
    pub refill_rate: Option<f64>,

    /// Rate limiter token capacity
    #[arg(long, env = "AIR_FUSION_TOKEN_CAPACITY")]
    pub token_capacity: Option<usize>,

    /// HTTP User-Agent header (weather.gov rejects requests without one)
    #[arg(short, long, env = "AIR_FUSION_USER_AGENT")]
    pub user_agent: Option<String>,

    /// Target latitude
    #[arg(long, env = "AIR_FUSION_LATITUDE", allow_hyphen_values = true)]
    pub latitude: Option<f64>,

    /// Target longitude
    #[arg(long, env = "AIR_FUSION_LONGITUDE", allow_hyphen_values = true)]
    pub longitude: Option<f64>,

    /// Ground station search radius in meters
    #[arg(long, env = "AIR_FUSION_RADIUS_M")]
    pub radius_m: Option<f64>,

    /// Largest radius the ground station API accepts per request
    #[arg(long, env = "AIR_FUSION_MAX_RADIUS_M")]
    pub max_radius_m: Option<f64>,

    /// Timeout for each external call, seconds
    #[arg(long, env = "AIR_FUSION_REQUEST_TIMEOUT")]
    pub request_timeout: Option<u64>,

    /// Budget for one source's whole fetch, seconds; defaults to several request timeouts
    #[arg(long, env = "AIR_FUSION_SOURCE_TIMEOUT")]
    pub source_timeout: Option<u64>,

    /// Deadline for a whole fetch cycle, seconds
    #[arg(long, env = "AIR_FUSION_CYCLE_DEADLINE")]
    pub cycle_deadline: Option<u64>,

    /// Most ground stations queried for latest values
    #[arg(long, env = "AIR_FUSION_MAX_STATIONS")]
    pub max_stations: Option<usize>,

    #[arg(long, env = "AIR_FUSION_OPENAQ_API_KEY")]
    pub openaq_api_key: Option<String>,

    #[arg(long, env = "AIR_FUSION_OPENWEATHER_API_KEY")]
    pub openweather_api_key: Option<String>,

    /// Directory of TEMPO L2 NetCDF files
    #[arg(long, env = "AIR_FUSION_TEMPO_DIR")]
    pub tempo_dir: Option<String>,

    /// Archival CSV used for fallback parameter means
    #[arg(long, env = "AIR_FUSION_HISTORICAL_CSV")]
    pub historical_csv: Option<String>,

    /// JSON file with the prediction model coefficients
    #[arg(long, env = "AIR_FUSION_MODEL_PATH")]
    pub model_path: Option<String>,

    /// Cells per side of the wind grid
    #[arg(long, env = "AIR_FUSION_WIND_GRID_SIZE")]
    pub wind_grid_size: Option<usize>,

    /// Multiplicative jitter applied to model-derived wind, 0.2 = ±20%
    #[arg(long, env = "AIR_FUSION_WIND_JITTER")]
    pub wind_jitter: Option<f64>,

    /// Fixed seed for the wind field, random when unset
    #[arg(long, env = "AIR_FUSION_WIND_SEED")]
    pub wind_seed: Option<u64>,

    /// Hours of surface observations to look back
    #[arg(long, env = "AIR_FUSION_HOURS_BACK")]
    pub hours_back: Option<u32>,

    /// Hours of forecast to look ahead
    #[arg(long, env = "AIR_FUSION_HOURS_FORWARD")]
    pub hours_forward: Option<u32>,

    /// Accepted surface observation quality flags, comma separated
    #[arg(long, env = "AIR_FUSION_QUALITY_FLAGS", value_delimiter = ',')]
    pub quality_flags: Option<Vec<String>>,

    /// S3 bucket the table is uploaded to after each commit (needs the `s3` feature)
    #[arg(long, env = "AIR_FUSION_S3_BUCKET")]
    pub s3_bucket: Option<String>,

    /// Custom S3 endpoint (MinIO, R2, ...)
    #[arg(long, env = "AIR_FUSION_S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,
}

impl Cli {
    pub fn data_dir(&self) -> String {
        self.data_dir
            .clone()
            .unwrap_or_else(|| "./data".to_string())
    }

    pub fn store_path(&self) -> PathBuf {
        let file = self
            .store_file
            .clone()
            .unwrap_or_else(|| "air_quality.parquet".to_string());
        PathBuf::from(self.data_dir()).join(file)
    }

    pub fn wind_field_path(&self) -> PathBuf {
        PathBuf::from(self.data_dir()).join("wind_field.json")
    }

    pub fn sleep_interval(&self) -> u64 {
        self.sleep_interval.unwrap_or(DEFAULT_FETCH_INTERVAL)
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate.unwrap_or(1.0)
    }

    pub fn token_capacity(&self) -> usize {
        self.token_capacity.unwrap_or(5)
    }

    pub fn user_agent(&self) -> String {
        self.user_agent
            .clone()
            .unwrap_or_else(|| format!("air-fusion/{}", env!("CARGO_PKG_VERSION")))
    }

    pub fn center(&self) -> Coordinate {
        Coordinate::new(
            self.latitude.unwrap_or(DEFAULT_LATITUDE),
            self.longitude.unwrap_or(DEFAULT_LONGITUDE),
        )
    }

    pub fn radius_m(&self) -> f64 {
        self.radius_m.unwrap_or(50_000.0)
    }

    pub fn max_radius_m(&self) -> f64 {
        self.max_radius_m.unwrap_or(DEFAULT_MAX_QUERY_RADIUS_M)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT))
    }

    pub fn source_timeout(&self) -> Duration {
        self.source_timeout
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.request_timeout() * CALLS_PER_SOURCE)
    }

    pub fn max_stations(&self) -> usize {
        self.max_stations.unwrap_or(25)
    }

    pub fn prediction_path(&self) -> PathBuf {
        PathBuf::from(self.data_dir()).join("prediction.json")
    }

    pub fn cycle_deadline(&self) -> Duration {
        Duration::from_secs(self.cycle_deadline.unwrap_or(120))
    }

    pub fn hours_back(&self) -> u32 {
        self.hours_back.unwrap_or(24)
    }

    pub fn hours_forward(&self) -> u32 {
        self.hours_forward.unwrap_or(24)
    }

    pub fn target(&self) -> FetchTarget {
        FetchTarget {
            center: self.center(),
            radius_m: self.radius_m(),
            hours_back: self.hours_back(),
            hours_forward: self.hours_forward(),
        }
    }

    pub fn wind_field_config(&self) -> WindFieldConfig {
        let defaults = WindFieldConfig::default();
        WindFieldConfig {
            grid_size: self.wind_grid_size.unwrap_or(defaults.grid_size),
            jitter: self.wind_jitter.unwrap_or(defaults.jitter),
            seed: self.wind_seed,
        }
    }

    pub fn quality_policy(&self) -> QualityPolicy {
        match &self.quality_flags {
            Some(flags) if !flags.is_empty() => QualityPolicy {
                accepted: flags.iter().map(|f| f.trim().to_string()).collect(),
            },
            _ => QualityPolicy::default(),
        }
    }

    /// Values given here win; anything unset falls back to `file`
    pub fn merge(self, file: Cli) -> Cli {
        Cli {
            config: self.config,
            level: self.level.or(file.level),
            data_dir: self.data_dir.or(file.data_dir),
            store_file: self.store_file.or(file.store_file),
            sleep_interval: self.sleep_interval.or(file.sleep_interval),
            refill_rate: self.refill_rate.or(file.refill_rate),
            token_capacity: self.token_capacity.or(file.token_capacity),
            user_agent: self.user_agent.or(file.user_agent),
            latitude: self.latitude.or(file.latitude),
            longitude: self.longitude.or(file.longitude),
            radius_m: self.radius_m.or(file.radius_m),
            max_radius_m: self.max_radius_m.or(file.max_radius_m),
            request_timeout: self.request_timeout.or(file.request_timeout),
            source_timeout: self.source_timeout.or(file.source_timeout),
            cycle_deadline: self.cycle_deadline.or(file.cycle_deadline),
            max_stations: self.max_stations.or(file.max_stations),
            openaq_api_key: self.openaq_api_key.or(file.openaq_api_key),
            openweather_api_key: self.openweather_api_key.or(file.openweather_api_key),
            tempo_dir: self.tempo_dir.or(file.tempo_dir),
            historical_csv: self.historical_csv.or(file.historical_csv),
            model_path: self.model_path.or(file.model_path),
            wind_grid_size: self.wind_grid_size.or(file.wind_grid_size),
            wind_jitter: self.wind_jitter.or(file.wind_jitter),
            wind_seed: self.wind_seed.or(file.wind_seed),
            hours_back: self.hours_back.or(file.hours_back),
            hours_forward: self.hours_forward.or(file.hours_forward),
            quality_flags: self.quality_flags.or(file.quality_flags),
            s3_bucket: self.s3_bucket.or(file.s3_bucket),
            s3_endpoint: self.s3_endpoint.or(file.s3_endpoint),
        }
    }
}

/// Load configuration from CLI args, config file, and environment
pub fn get_config_info() -> Cli {
    let cli_args = Cli::parse();

    let source = if let Some(ref path) = cli_args.config {
        ConfigSource::Explicit(path.into())
    } else {
        find_config_file("AIR_FUSION_CONFIG", "fusion.toml")
    };

    let file_config: Cli = match load_config(&source) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ignoring config file {}: {}", source, e);
            Cli::default()
        }
    };

    // env vars are already folded into cli_args by clap
    cli_args.merge(file_config)
}

pub fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::Trace,
        "debug" => Level::Debug,
        "info" => Level::Info,
        "warn" => Level::Warning,
        "error" => Level::Error,
        _ => Level::Info,
    }
}

pub fn setup_logger(cli: &Cli) -> Logger {
    let log_level = match cli.level.as_ref() {
        Some(level) => parse_level(level),
        None => parse_level(&env::var("RUST_LOG").unwrap_or_default()),
    };

    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let drain = drain.filter_level(log_level).fuse();
    slog::Logger::root(drain, o!("version" => env!("CARGO_PKG_VERSION")))
}

/// Token bucket shared by every outbound request
pub struct RateLimiter {
    capacity: usize,
    tokens: f64,
    last_refill: Instant,
    refill_rate: f64,
}

impl RateLimiter {
    pub fn new(capacity: usize, refill_rate: f64) -> Self {
        RateLimiter {
            capacity,
            tokens: capacity as f64,
            last_refill: Instant::now(),
            refill_rate,
        }
    }

    fn refill_tokens(&mut self) {
        let now = Instant::now();
        let elapsed_time = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed_time * self.refill_rate).min(self.capacity as f64);
        self.last_refill = now;
    }

    /// Take `tokens`, sleeping until they refill. Gives up after three waits.
    pub async fn acquire(&mut self, tokens: f64) -> bool {
        let mut retries = 0;

        loop {
            self.refill_tokens();

            if tokens <= self.tokens {
                self.tokens -= tokens;
                return true;
            }
            if retries >= 3 || self.refill_rate <= 0.0 {
                return false;
            }
            retries += 1;
            let wait = (tokens - self.tokens) / self.refill_rate;
            sleep(Duration::from_secs_f64(wait)).await;
        }
    }
}

/// JSON over HTTP with retries, rate limiting and a per-request timeout
pub struct HttpFetcher {
    logger: Logger,
    client: ClientWithMiddleware,
    rate_limiter: Arc<Mutex<RateLimiter>>,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(
        logger: Logger,
        user_agent: &str,
        rate_limiter: Arc<Mutex<RateLimiter>>,
        timeout: Duration,
    ) -> Result<HttpFetcher, Error> {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let client = ClientBuilder::new(Client::builder().user_agent(user_agent).build()?)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();
        Ok(Self {
            logger,
            client,
            rate_limiter,
            timeout,
        })
    }

    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
        headers: &[(&str, String)],
    ) -> Result<T, Error> {
        {
            let mut limiter = self.rate_limiter.lock().await;
            if !limiter.acquire(1.0).await {
                return Err(anyhow!("rate limit exceeded after retries"));
            }
        }

        debug!(self.logger, "requesting: {}", url);
        let mut request = self.client.get(url).query(query).timeout(self.timeout);
        for (name, value) in headers {
            request = request.header(*name, value.as_str());
        }
        let response = request
            .send()
            .await
            .map_err(|e| anyhow!("error sending request to {}: {}", url, e))?;

        let status = response.status();
        if !status.is_success() {
            warn!(self.logger, "{} returned {}", url, status);
            return Err(anyhow!("{} returned status {}", url, status));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| anyhow!("error parsing body of {}: {}", url, e))
    }
}
