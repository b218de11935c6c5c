use std::{path::PathBuf, sync::Arc, time::Duration};

use slog::{debug, error, info, warn, Logger};
use time::OffsetDateTime;
use tokio::{
    sync::mpsc,
    task::JoinSet,
    time::{sleep_until, timeout, Instant},
};

use crate::{
    destination_point, normalize_batch, BoundingBox, CanonicalRecord, CommitSummary, FetchTarget,
    FusionError, ModelWindPoint, ObservationSource, Parameter, QualityPolicy, RawObservation,
    SourceKind, TimeSeriesStore, WindFieldSynthesizer, WindModelSource, WindProvenance, WriteMode,
};

/// How one source fared in a cycle
#[derive(Debug, Clone, PartialEq)]
pub struct SourceOutcome {
    pub kind: SourceKind,
    pub observations: usize,
    pub error: Option<String>,
}

impl SourceOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub sources: Vec<SourceOutcome>,
    /// Records that passed normalization and the quality policy, as committed
    pub records: Vec<CanonicalRecord>,
    pub skipped_inputs: usize,
    pub dropped_values: usize,
    pub rejected_by_quality: usize,
    pub commit: CommitSummary,
    pub wind_field: Option<WindProvenance>,
}

struct WindOutput {
    synthesizer: WindFieldSynthesizer,
    path: PathBuf,
    model_source: Option<Arc<dyn WindModelSource>>,
}

type FetchResult = (usize, SourceKind, Result<Vec<RawObservation>, String>);

/// Dependent calls a source may chain in one fetch; its budget is this many call timeouts
pub const CALLS_PER_SOURCE: u32 = 4;

/// One fetch, normalize and commit pass over every configured source
pub struct FusionPipeline {
    sources: Vec<Arc<dyn ObservationSource>>,
    store: Arc<TimeSeriesStore>,
    quality: QualityPolicy,
    per_source_timeout: Duration,
    cycle_deadline: Duration,
    write_mode: WriteMode,
    wind: Option<WindOutput>,
    logger: Logger,
}

impl FusionPipeline {
    pub fn new(
        sources: Vec<Arc<dyn ObservationSource>>,
        store: Arc<TimeSeriesStore>,
        logger: Logger,
    ) -> Self {
        Self {
            sources,
            store,
            quality: QualityPolicy::default(),
            per_source_timeout: Duration::from_secs(air_fusion_core::DEFAULT_REQUEST_TIMEOUT)
                * CALLS_PER_SOURCE,
            cycle_deadline: Duration::from_secs(120),
            write_mode: WriteMode::AppendMerge,
            wind: None,
            logger,
        }
    }

    pub fn with_quality_policy(mut self, quality: QualityPolicy) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_timeouts(mut self, per_source: Duration, cycle_deadline: Duration) -> Self {
        self.per_source_timeout = per_source;
        self.cycle_deadline = cycle_deadline;
        self
    }

    pub fn with_write_mode(mut self, write_mode: WriteMode) -> Self {
        self.write_mode = write_mode;
        self
    }

    pub fn with_wind_field(mut self, synthesizer: WindFieldSynthesizer, path: PathBuf) -> Self {
        self.wind = Some(WindOutput {
            synthesizer,
            path,
            model_source: None,
        });
        self
    }

    /// Extra model wind consulted when building the field; needs `with_wind_field` first
    pub fn with_wind_model(mut self, source: Arc<dyn WindModelSource>) -> Self {
        if let Some(wind) = self.wind.as_mut() {
            wind.model_source = Some(source);
        }
        self
    }

    pub fn store(&self) -> &Arc<TimeSeriesStore> {
        &self.store
    }

    /// Fetch every source concurrently and collect what arrives before the deadline.
    ///
    /// Results flow through a channel to this single collector. Sources that
    /// fail, time out or are still running at the deadline contribute nothing.
    async fn gather(&self, target: &FetchTarget) -> (Vec<SourceOutcome>, Vec<RawObservation>) {
        let deadline = Instant::now() + self.cycle_deadline;
        let (tx, mut rx) = mpsc::channel::<FetchResult>(self.sources.len().max(1));
        let mut set = JoinSet::new();

        for (index, source) in self.sources.iter().enumerate() {
            let source = Arc::clone(source);
            let tx = tx.clone();
            let target = *target;
            let per_source_timeout = self.per_source_timeout;
            set.spawn(async move {
                let kind = source.kind();
                let result = match timeout(per_source_timeout, source.fetch(&target)).await {
                    Ok(Ok(observations)) => Ok(observations),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(format!("timed out after {:?}", per_source_timeout)),
                };
                // collector may already be gone at the deadline
                let _ = tx.send((index, kind, result)).await;
            });
        }
        drop(tx);

        let mut arrived: Vec<Option<(SourceKind, Result<Vec<RawObservation>, String>)>> =
            (0..self.sources.len()).map(|_| None).collect();
        let cutoff = sleep_until(deadline);
        tokio::pin!(cutoff);
        loop {
            tokio::select! {
                message = rx.recv() => match message {
                    Some((index, kind, result)) => arrived[index] = Some((kind, result)),
                    None => break,
                },
                _ = &mut cutoff => {
                    warn!(self.logger, "cycle deadline of {:?} reached, abandoning unfinished sources", self.cycle_deadline);
                    set.abort_all();
                    break;
                }
            }
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                if !e.is_cancelled() {
                    error!(self.logger, "source task ended abnormally: {}", e);
                }
            }
        }

        let mut outcomes = Vec::with_capacity(self.sources.len());
        let mut observations = Vec::new();
        for (source, slot) in self.sources.iter().zip(arrived) {
            let outcome = match slot {
                Some((kind, Ok(mut batch))) => {
                    info!(self.logger, "{}: {} observations", kind, batch.len());
                    let outcome = SourceOutcome {
                        kind,
                        observations: batch.len(),
                        error: None,
                    };
                    observations.append(&mut batch);
                    outcome
                }
                Some((kind, Err(reason))) => {
                    warn!(self.logger, "{} unavailable: {}", kind, reason);
                    SourceOutcome {
                        kind,
                        observations: 0,
                        error: Some(reason),
                    }
                }
                None => {
                    let kind = source.kind();
                    warn!(self.logger, "{} did not finish before the deadline", kind);
                    SourceOutcome {
                        kind,
                        observations: 0,
                        error: Some("cycle deadline exceeded".to_string()),
                    }
                }
            };
            outcomes.push(outcome);
        }
        (outcomes, observations)
    }

    pub async fn run_cycle(&self, target: &FetchTarget) -> Result<CycleReport, FusionError> {
        let (sources, observations) = self.gather(target).await;
        if !sources.iter().any(SourceOutcome::succeeded) {
            let failure = FusionError::AllSourcesFailed {
                attempted: sources.len(),
            };
            error!(self.logger, "{}", failure);
            return Err(failure);
        }

        let normalized = normalize_batch(observations.iter(), &self.logger);
        let (records, rejected_by_quality) = self.quality.apply(normalized.records);
        if rejected_by_quality > 0 {
            info!(
                self.logger,
                "quality policy rejected {} records", rejected_by_quality
            );
        }

        let commit = self.store.commit(records.clone(), self.write_mode).await?;

        let wind_field = match &self.wind {
            Some(wind) => self.write_wind_field(wind, target, &records).await,
            None => None,
        };

        Ok(CycleReport {
            sources,
            records,
            skipped_inputs: normalized.skipped,
            dropped_values: normalized.dropped_values,
            rejected_by_quality,
            commit,
            wind_field,
        })
    }

    async fn write_wind_field(
        &self,
        wind: &WindOutput,
        target: &FetchTarget,
        records: &[CanonicalRecord],
    ) -> Option<WindProvenance> {
        let mut points: Vec<ModelWindPoint> = Vec::new();
        if let Some(source) = &wind.model_source {
            match timeout(self.per_source_timeout, source.model_points(target)).await {
                Ok(Ok(mut model)) => points.append(&mut model),
                Ok(Err(e)) => warn!(self.logger, "model wind unavailable: {}", e),
                Err(_) => warn!(self.logger, "model wind timed out"),
            }
        }

        // forecast steps nearest to now come first so they win ties
        let now = OffsetDateTime::now_utc();
        let mut wind_rows: Vec<&CanonicalRecord> = records
            .iter()
            .filter(|r| r.parameter == Parameter::Wind)
            .collect();
        wind_rows.sort_by_key(|r| (r.timestamp - now).abs());
        points.extend(wind_rows.into_iter().filter_map(ModelWindPoint::from_record));

        let bbox = target_bounds(target);
        let field = match wind.synthesizer.synthesize(bbox, &points) {
            Ok(field) => field,
            Err(e) => {
                warn!(self.logger, "wind field skipped: {}", e);
                return None;
            }
        };
        if let Err(e) = field.write_json(&wind.path) {
            warn!(self.logger, "wind field not saved: {}", e);
            return None;
        }
        debug!(
            self.logger,
            "wrote {} wind vectors to {}",
            field.vectors.len(),
            wind.path.display()
        );
        Some(field.provenance)
    }
}

/// Box enclosing the query disc
pub fn target_bounds(target: &FetchTarget) -> BoundingBox {
    let corners = [0.0, 90.0, 180.0, 270.0]
        .into_iter()
        .map(|bearing| destination_point(target.center, bearing, target.radius_m));
    BoundingBox::from_points(corners).unwrap_or_else(|| BoundingBox::around(target.center, 0.5))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Coordinate, ForecastEntry, MockObservationSource, WeatherContext};
    use slog::{o, Discard};
    use time::macros::datetime;

    fn logger() -> Logger {
        Logger::root(Discard, o!())
    }

    fn failing(kind: SourceKind) -> Arc<dyn ObservationSource> {
        let mut source = MockObservationSource::new();
        source.expect_kind().return_const(kind);
        source
            .expect_fetch()
            .returning(|_| Err(anyhow::anyhow!("HTTP 503")));
        Arc::new(source)
    }

    fn forecast_source() -> Arc<dyn ObservationSource> {
        let mut source = MockObservationSource::new();
        source.expect_kind().return_const(SourceKind::Forecast);
        source.expect_fetch().returning(|target| {
            Ok(vec![RawObservation::ForecastPoint(ForecastEntry {
                location_name: "OpenWeatherMap Forecast".to_string(),
                coordinate: target.center,
                timestamp: Some(datetime!(2024-08-12 12:00 UTC)),
                category_index: Some(2),
                components: vec![("o3".to_string(), Some(68.66))],
                unit: "μg/m³".to_string(),
                weather: WeatherContext {
                    wind_speed: Some(4.1),
                    wind_direction: Some(200.0),
                    ..WeatherContext::default()
                },
            })])
        });
        Arc::new(source)
    }

    fn store(dir: &tempfile::TempDir) -> Arc<TimeSeriesStore> {
        Arc::new(TimeSeriesStore::new(
            dir.path().join("air_quality.parquet"),
            logger(),
        ))
    }

    fn target() -> FetchTarget {
        FetchTarget::new(Coordinate::new(40.7128, -74.0060), 50_000.0)
    }

    #[tokio::test]
    async fn one_failed_source_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = FusionPipeline::new(
            vec![failing(SourceKind::GroundStations), forecast_source()],
            store(&dir),
            logger(),
        );
        let report = pipeline.run_cycle(&target()).await.unwrap();

        assert_eq!(report.sources.len(), 2);
        assert!(!report.sources[0].succeeded());
        assert!(report.sources[1].succeeded());
        // o3 plus the wind row
        assert_eq!(report.records.len(), 2);
        assert_eq!(report.commit.total_rows, 2);
        assert_eq!(report.wind_field, None);
    }

    #[tokio::test]
    async fn every_source_failing_is_total_failure() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = FusionPipeline::new(
            vec![
                failing(SourceKind::GroundStations),
                failing(SourceKind::Satellite),
            ],
            store(&dir),
            logger(),
        );
        let result = pipeline.run_cycle(&target()).await;
        assert!(matches!(
            result,
            Err(FusionError::AllSourcesFailed { attempted: 2 })
        ));
        assert!(!dir.path().join("air_quality.parquet").exists());
    }

    #[tokio::test]
    async fn wind_field_is_model_derived_from_forecast() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wind_field.json");
        let synthesizer = WindFieldSynthesizer::new(
            crate::WindFieldConfig {
                grid_size: 3,
                jitter: 0.0,
                seed: Some(1),
            },
            logger(),
        );
        let pipeline = FusionPipeline::new(vec![forecast_source()], store(&dir), logger())
            .with_wind_field(synthesizer, path.clone());

        let report = pipeline.run_cycle(&target()).await.unwrap();
        assert_eq!(report.wind_field, Some(WindProvenance::ModelDerived));
        assert!(path.exists());
    }

    #[test]
    fn bounds_enclose_the_disc() {
        let bbox = target_bounds(&target());
        assert!(bbox.contains(Coordinate::new(41.1, -74.006)));
        assert!(bbox.contains(Coordinate::new(40.7128, -73.5)));
        assert!(!bbox.contains(Coordinate::new(41.2, -74.006)));
    }
}
