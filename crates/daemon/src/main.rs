use air_fusion::{
    get_config_info, setup_logger, AtmosphericInputs, Cli, FeaturePreparer, FusionPipeline,
    GroundStationService, HistoricalFallback, HttpFetcher, LinearModel, NoaaClient,
    NoaaWindSource, ObservationSource, OpenAqClient, OpenWeatherClient, Predictor, RateLimiter,
    SurfacePressureService, TimeSeriesStore, WindFieldSynthesizer,
};
use air_fusion_core::ensure_dir_exists;
use anyhow::anyhow;
use slog::{debug, error, info, warn, Logger};
use std::{path::Path, sync::Arc, time::Duration};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = get_config_info();
    let logger = setup_logger(&cli);

    let target = cli.target();
    info!(logger, "air-fusion starting...");
    info!(logger, "  Target: {} radius {} m", target.center, target.radius_m);
    info!(logger, "  Data dir: {}", cli.data_dir());
    info!(logger, "  Fetch interval: {} seconds", cli.sleep_interval());

    if !ensure_dir_exists(cli.data_dir()) {
        return Err(anyhow!("cannot create data dir {}", cli.data_dir()));
    }

    let rate_limiter = Arc::new(Mutex::new(RateLimiter::new(
        cli.token_capacity(),
        cli.refill_rate(),
    )));
    let fetcher = Arc::new(HttpFetcher::new(
        logger.clone(),
        &cli.user_agent(),
        rate_limiter,
        cli.request_timeout(),
    )?);

    let pipeline = build_pipeline(&cli, fetcher, &logger);
    let predictor = build_predictor(&cli, &logger);

    let shutdown = CancellationToken::new();
    let ctrl_c_token = shutdown.clone();
    let ctrl_c_logger = logger.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(ctrl_c_logger, "shutdown requested");
            ctrl_c_token.cancel();
        }
    });

    run_cycles(cli, logger, pipeline, predictor, shutdown).await;
    Ok(())
}

fn build_sources(cli: &Cli, fetcher: Arc<HttpFetcher>, logger: &Logger) -> Vec<Arc<dyn ObservationSource>> {
    let mut sources: Vec<Arc<dyn ObservationSource>> = Vec::new();

    match cli.openaq_api_key.clone() {
        Some(key) => {
            let client = OpenAqClient::new(Arc::clone(&fetcher), key);
            sources.push(Arc::new(
                GroundStationService::new(
                    Arc::new(client),
                    cli.max_radius_m(),
                    cli.request_timeout(),
                    logger.new(slog::o!("source" => "openaq")),
                )
                .with_max_stations(cli.max_stations()),
            ));
        }
        None => warn!(logger, "no OpenAQ API key, ground stations disabled"),
    }

    match cli.openweather_api_key.clone() {
        Some(key) => sources.push(Arc::new(OpenWeatherClient::new(
            Arc::clone(&fetcher),
            key,
            logger.new(slog::o!("source" => "openweather")),
        ))),
        None => warn!(logger, "no OpenWeatherMap API key, forecasts disabled"),
    }

    if let Some(dir) = cli.tempo_dir.clone() {
        add_satellite_source(&mut sources, dir, logger);
    }

    let noaa = Arc::new(NoaaClient::new(fetcher));
    sources.push(Arc::new(SurfacePressureService::new(
        noaa,
        logger.new(slog::o!("source" => "noaa")),
    )));
    sources
}

#[cfg(feature = "netcdf")]
fn add_satellite_source(sources: &mut Vec<Arc<dyn ObservationSource>>, dir: String, logger: &Logger) {
    use air_fusion::{NetCdfSwathReader, SwathDirectory};

    sources.push(Arc::new(SwathDirectory::new(
        dir,
        Arc::new(NetCdfSwathReader::default()),
        logger.new(slog::o!("source" => "tempo")),
    )));
}

#[cfg(not(feature = "netcdf"))]
fn add_satellite_source(_: &mut Vec<Arc<dyn ObservationSource>>, dir: String, logger: &Logger) {
    warn!(
        logger,
        "satellite dir {} ignored, built without the netcdf feature", dir
    );
}

fn build_pipeline(cli: &Cli, fetcher: Arc<HttpFetcher>, logger: &Logger) -> FusionPipeline {
    let wind_model = Arc::new(NoaaWindSource::new(Arc::new(NoaaClient::new(Arc::clone(
        &fetcher,
    )))));
    let sources = build_sources(cli, fetcher, logger);
    info!(logger, "{} sources configured", sources.len());

    let store = Arc::new(TimeSeriesStore::new(cli.store_path(), logger.clone()));
    FusionPipeline::new(sources, store, logger.clone())
        .with_quality_policy(cli.quality_policy())
        .with_timeouts(cli.source_timeout(), cli.cycle_deadline())
        .with_wind_field(
            WindFieldSynthesizer::new(cli.wind_field_config(), logger.clone()),
            cli.wind_field_path(),
        )
        .with_wind_model(wind_model)
}

fn build_predictor(cli: &Cli, logger: &Logger) -> Option<Predictor> {
    let model_path = cli.model_path.as_ref()?;
    let model = match LinearModel::load(Path::new(model_path)) {
        Ok(model) => model,
        Err(e) => {
            error!(logger, "prediction disabled: {}", e);
            return None;
        }
    };

    let fallback = match cli.historical_csv.as_ref() {
        Some(path) => match HistoricalFallback::from_csv(Path::new(path)) {
            Ok(fallback) => {
                info!(logger, "loaded {} historical rows for fallback", fallback.rows());
                Some(Arc::new(fallback))
            }
            Err(e) => {
                warn!(logger, "no historical fallback: {}", e);
                None
            }
        },
        None => None,
    };

    Some(Predictor::new(
        FeaturePreparer::new(fallback, logger.clone()),
        Arc::new(model),
        logger.clone(),
    ))
}

async fn run_cycles(
    cli: Cli,
    logger: Logger,
    pipeline: FusionPipeline,
    predictor: Option<Predictor>,
    shutdown: CancellationToken,
) {
    let sleep_between_cycles = cli.sleep_interval();
    info!(
        logger,
        "Wait time between cycles: {} seconds", sleep_between_cycles
    );

    #[cfg(feature = "s3")]
    let s3 = match cli.s3_bucket.clone() {
        Some(bucket) => {
            match air_fusion::S3Storage::new(bucket, cli.s3_endpoint.clone(), logger.clone()).await
            {
                Ok(s3) => Some(s3),
                Err(e) => {
                    error!(logger, "S3 upload disabled: {}", e);
                    None
                }
            }
        }
        None => None,
    };

    let target = cli.target();
    let mut cycle_interval = interval(Duration::from_secs(sleep_between_cycles));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!(logger, "stopping");
                break;
            }
            _ = cycle_interval.tick() => {
                let report = match pipeline.run_cycle(&target).await {
                    Ok(report) => report,
                    Err(err) => {
                        error!(logger, "cycle failed: {}", err);
                        continue;
                    }
                };
                info!(
                    logger,
                    "cycle done: {}/{} sources, {} records committed, table holds {}",
                    report.sources.iter().filter(|s| s.succeeded()).count(),
                    report.sources.len(),
                    report.commit.incoming,
                    report.commit.total_rows
                );

                if let Some(predictor) = &predictor {
                    let inputs = AtmosphericInputs::from_records(
                        &report.records,
                        target.center,
                        OffsetDateTime::now_utc(),
                    );
                    match predictor.predict(&inputs) {
                        Ok(prediction) => {
                            let path = cli.prediction_path();
                            match prediction.write_json(&path) {
                                Ok(()) => debug!(logger, "prediction saved to {}", path.display()),
                                Err(e) => warn!(logger, "prediction not saved to {}: {}", path.display(), e),
                            }
                        }
                        Err(e) => warn!(logger, "no prediction this cycle: {}", e),
                    }
                }

                #[cfg(feature = "s3")]
                if let Some(s3) = &s3 {
                    let today = OffsetDateTime::now_utc().date();
                    if let Err(e) = s3.upload_table(pipeline.store().path(), today).await {
                        error!(logger, "table upload failed: {}", e);
                    }
                }
            }
        }
    }
}
