use std::sync::Arc;

use anyhow::{anyhow, Error};
use async_trait::async_trait;
use serde::Deserialize;
use slog::{debug, info, warn, Logger};
use time::{format_description::well_known::Rfc3339, Duration, OffsetDateTime};
use tokio::task::JoinSet;

use crate::{
    Coordinate, FetchTarget, HttpFetcher, ObservationSource, PressureSummary, Provenance,
    RawObservation, SourceKind, SurfacePressureReading,
};

pub const NOAA_BASE_URL: &str = "https://api.weather.gov";

/// weather.gov unit codes look like `wmoUnit:Pa`
pub fn strip_unit_code(code: &str) -> String {
    code.rsplit(':').next().unwrap_or(code).to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GridPoint {
    pub grid_id: Option<String>,
    pub grid_x: Option<i64>,
    pub grid_y: Option<i64>,
    pub forecast_grid_data: Option<String>,
    pub forecast_hourly: Option<String>,
    pub observation_stations: Option<String>,
}

impl GridPoint {
    pub fn label(&self) -> String {
        format!(
            "{} ({}, {})",
            self.grid_id.as_deref().unwrap_or("?"),
            self.grid_x.unwrap_or_default(),
            self.grid_y.unwrap_or_default()
        )
    }
}

#[derive(Debug, Deserialize)]
struct Properties<T> {
    properties: T,
}

#[derive(Debug, Deserialize)]
struct FeatureCollection<T> {
    #[serde(default = "Vec::new")]
    features: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StationProperties {
    station_identifier: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GridData {
    pressure: Option<GridSeries>,
}

#[derive(Debug, Deserialize)]
struct GridSeries {
    uom: Option<String>,
    #[serde(default)]
    values: Vec<GridValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GridValue {
    valid_time: String,
    value: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    #[serde(default)]
    coordinates: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct ObservationFeature {
    geometry: Option<Geometry>,
    properties: ObservationProperties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObservationProperties {
    timestamp: Option<String>,
    barometric_pressure: Option<Measurement>,
    sea_level_pressure: Option<Measurement>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Measurement {
    unit_code: Option<String>,
    value: Option<f64>,
    quality_control: Option<String>,
}

/// `2024-08-12T10:00:00+00:00/PT1H` -> start instant
fn parse_valid_time(valid_time: &str) -> Option<OffsetDateTime> {
    let start = valid_time.split('/').next()?;
    OffsetDateTime::parse(start, &Rfc3339).ok()
}

fn forecast_readings(
    grid: &GridPoint,
    coordinate: Coordinate,
    data: GridData,
    from: OffsetDateTime,
    until: OffsetDateTime,
) -> Vec<SurfacePressureReading> {
    let Some(series) = data.pressure else {
        return Vec::new();
    };
    let unit = strip_unit_code(series.uom.as_deref().unwrap_or("Pa"));
    let label = grid.label();
    let mut readings: Vec<SurfacePressureReading> = series
        .values
        .into_iter()
        .filter_map(|v| {
            let timestamp = parse_valid_time(&v.valid_time)?;
            let pressure = v.value?;
            (from <= timestamp && timestamp <= until).then(|| SurfacePressureReading {
                station_id: label.clone(),
                coordinate,
                timestamp: Some(timestamp),
                pressure: Some(pressure),
                unit: unit.clone(),
                provenance: Provenance::Forecast,
                quality_flag: None,
            })
        })
        .collect();
    readings.sort_by_key(|r| r.timestamp);
    readings
}

fn observation_readings(
    station_id: &str,
    fallback: Coordinate,
    features: Vec<ObservationFeature>,
) -> Vec<SurfacePressureReading> {
    let mut readings: Vec<SurfacePressureReading> = features
        .into_iter()
        .filter_map(|feature| {
            let coordinate = match feature.geometry.as_ref().map(|g| g.coordinates.as_slice()) {
                Some([lon, lat, ..]) => Coordinate::new(*lat, *lon),
                _ => fallback,
            };
            let props = feature.properties;
            let timestamp = props
                .timestamp
                .as_deref()
                .and_then(|t| OffsetDateTime::parse(t, &Rfc3339).ok());
            // station pressure first, sea level when the station did not report one
            let measurement = match props.barometric_pressure {
                Some(m) if m.value.is_some() => m,
                _ => props.sea_level_pressure.filter(|m| m.value.is_some())?,
            };
            Some(SurfacePressureReading {
                station_id: station_id.to_string(),
                coordinate,
                timestamp,
                pressure: measurement.value,
                unit: strip_unit_code(measurement.unit_code.as_deref().unwrap_or("Pa")),
                provenance: Provenance::Observation,
                quality_flag: measurement.quality_control,
            })
        })
        .collect();
    readings.sort_by_key(|r| r.timestamp);
    readings
}

fn format_query_time(t: OffsetDateTime) -> Result<String, Error> {
    Ok(t.replace_nanosecond(0)?.format(&Rfc3339)?)
}

/// weather.gov client: grid point lookup, station observations and the forecast grid
pub struct NoaaClient {
    fetcher: Arc<HttpFetcher>,
    base_url: String,
}

impl NoaaClient {
    pub fn new(fetcher: Arc<HttpFetcher>) -> Self {
        Self {
            fetcher,
            base_url: NOAA_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn headers() -> [(&'static str, String); 1] {
        [("Accept", "application/geo+json".to_string())]
    }

    pub async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, Error> {
        self.fetcher.fetch_json(url, query, &Self::headers()).await
    }

    pub async fn points(&self, coordinate: Coordinate) -> Result<GridPoint, Error> {
        let url = format!(
            "{}/points/{:.4},{:.4}",
            self.base_url, coordinate.latitude, coordinate.longitude
        );
        let point: Properties<GridPoint> = self.get_json(&url, &[]).await?;
        Ok(point.properties)
    }

    pub async fn stations(&self, grid: &GridPoint, limit: usize) -> Result<Vec<String>, Error> {
        let url = grid
            .observation_stations
            .as_deref()
            .ok_or_else(|| anyhow!("grid point has no observation stations link"))?;
        let stations: FeatureCollection<Properties<StationProperties>> =
            self.get_json(url, &[]).await?;
        Ok(stations
            .features
            .into_iter()
            .filter_map(|f| f.properties.station_identifier)
            .take(limit)
            .collect())
    }

    pub async fn forecast_pressure(
        &self,
        grid: &GridPoint,
        coordinate: Coordinate,
        from: OffsetDateTime,
        until: OffsetDateTime,
    ) -> Result<Vec<SurfacePressureReading>, Error> {
        let url = grid
            .forecast_grid_data
            .as_deref()
            .ok_or_else(|| anyhow!("grid point has no forecast grid link"))?;
        let data: Properties<GridData> = self.get_json(url, &[]).await?;
        Ok(forecast_readings(grid, coordinate, data.properties, from, until))
    }

    pub async fn observations(
        &self,
        station_id: &str,
        fallback: Coordinate,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<SurfacePressureReading>, Error> {
        let url = format!("{}/stations/{}/observations", self.base_url, station_id);
        let query = [
            ("start", format_query_time(start)?),
            ("end", format_query_time(end)?),
        ];
        let features: FeatureCollection<ObservationFeature> = self.get_json(&url, &query).await?;
        Ok(observation_readings(station_id, fallback, features.features))
    }
}

/// The weather.gov calls surface pressure needs
#[async_trait]
pub trait PressureSource: Send + Sync {
    async fn points(&self, coordinate: Coordinate) -> Result<GridPoint, Error>;

    async fn stations(&self, grid: &GridPoint, limit: usize) -> Result<Vec<String>, Error>;

    async fn forecast_pressure(
        &self,
        grid: &GridPoint,
        coordinate: Coordinate,
        from: OffsetDateTime,
        until: OffsetDateTime,
    ) -> Result<Vec<SurfacePressureReading>, Error>;

    async fn observations(
        &self,
        station_id: &str,
        fallback: Coordinate,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<SurfacePressureReading>, Error>;
}

#[async_trait]
impl PressureSource for NoaaClient {
    async fn points(&self, coordinate: Coordinate) -> Result<GridPoint, Error> {
        NoaaClient::points(self, coordinate).await
    }

    async fn stations(&self, grid: &GridPoint, limit: usize) -> Result<Vec<String>, Error> {
        NoaaClient::stations(self, grid, limit).await
    }

    async fn forecast_pressure(
        &self,
        grid: &GridPoint,
        coordinate: Coordinate,
        from: OffsetDateTime,
        until: OffsetDateTime,
    ) -> Result<Vec<SurfacePressureReading>, Error> {
        NoaaClient::forecast_pressure(self, grid, coordinate, from, until).await
    }

    async fn observations(
        &self,
        station_id: &str,
        fallback: Coordinate,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<SurfacePressureReading>, Error> {
        NoaaClient::observations(self, station_id, fallback, start, end).await
    }
}

/// Observed and forecast surface pressure around the target
pub struct SurfacePressureService {
    source: Arc<dyn PressureSource>,
    max_stations: usize,
    logger: Logger,
}

impl SurfacePressureService {
    pub fn new(source: Arc<dyn PressureSource>, logger: Logger) -> Self {
        Self {
            source,
            max_stations: 3,
            logger,
        }
    }

    /// Recent observations from the stations nearest the grid point, fetched together
    async fn observed(
        &self,
        grid: &GridPoint,
        center: Coordinate,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Vec<SurfacePressureReading> {
        let stations = match self.source.stations(grid, self.max_stations).await {
            Ok(stations) => stations,
            Err(e) => {
                warn!(self.logger, "no observation stations: {}", e);
                return Vec::new();
            }
        };

        let mut set = JoinSet::new();
        for (index, station) in stations.into_iter().enumerate() {
            let source = Arc::clone(&self.source);
            set.spawn(async move {
                let result = source.observations(&station, center, start, end).await;
                (index, station, result)
            });
        }

        let mut per_station = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, _, Ok(obs))) => per_station.push((index, obs)),
                Ok((_, station, Err(e))) => warn!(self.logger, "station {}: {}", station, e),
                Err(e) => warn!(self.logger, "observation task ended abnormally: {}", e),
            }
        }
        // keep the nearest-first station order
        per_station.sort_by_key(|(index, _)| *index);
        per_station.into_iter().flat_map(|(_, obs)| obs).collect()
    }
}

#[async_trait]
impl ObservationSource for SurfacePressureService {
    fn kind(&self) -> SourceKind {
        SourceKind::SurfacePressure
    }

    async fn fetch(&self, target: &FetchTarget) -> Result<Vec<RawObservation>, Error> {
        let now = OffsetDateTime::now_utc();
        let start = now - Duration::hours(target.hours_back as i64);
        let until = now + Duration::hours(target.hours_forward as i64);

        let grid = self.source.points(target.center).await?;
        debug!(self.logger, "NOAA grid point {}", grid.label());

        // observations only need to reach slightly past now
        let obs_end = now + Duration::hours(1);
        let (mut readings, forecast) = tokio::join!(
            self.observed(&grid, target.center, start, obs_end),
            self.source
                .forecast_pressure(&grid, target.center, now, until)
        );
        match forecast {
            Ok(mut forecast) => readings.append(&mut forecast),
            Err(e) => warn!(self.logger, "forecast pressure unavailable: {}", e),
        }

        if let Some(summary) = PressureSummary::from_readings(&readings) {
            info!(
                self.logger,
                "pressure: {} observations, {} forecast points, {:.2}-{:.2} hPa (avg {:.2})",
                summary.observation_points,
                summary.forecast_points,
                summary.min_hpa,
                summary.max_hpa,
                summary.avg_hpa
            );
        }

        Ok(readings
            .into_iter()
            .map(RawObservation::SurfaceObservation)
            .collect())
    }
}
