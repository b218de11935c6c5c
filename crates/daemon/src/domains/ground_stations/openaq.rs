use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Error;
use async_trait::async_trait;
use serde::Deserialize;
use slog::{info, warn, Logger};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::{task::JoinSet, time::timeout};

use crate::{
    fetch_expanded, Coordinate, FetchTarget, GroundStationReading, HttpFetcher, ObservationSource,
    RawObservation, SensorReading, SourceKind,
};

pub const OPENAQ_BASE_URL: &str = "https://api.openaq.org/v3";

/// Most results one locations request returns
const PAGE_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct SensorMeta {
    pub id: i64,
    pub parameter: String,
    pub unit: String,
}

/// A monitoring location as listed by a radius search
#[derive(Debug, Clone, PartialEq)]
pub struct StationSummary {
    pub id: i64,
    pub name: String,
    pub coordinate: Coordinate,
    pub sensors: Vec<SensorMeta>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GroundStationSource: Send + Sync {
    /// Stations within `radius_m` of `center`; the server caps the radius
    async fn locations(
        &self,
        center: Coordinate,
        radius_m: f64,
    ) -> Result<Vec<StationSummary>, Error>;

    /// Most recent value of every sensor on the station
    async fn latest(&self, station: &StationSummary) -> Result<GroundStationReading, Error>;
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct ApiCoordinates {
    latitude: Option<f64>,
    longitude: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ApiParameter {
    name: String,
    #[serde(default)]
    units: String,
}

#[derive(Debug, Deserialize)]
struct ApiSensor {
    id: i64,
    parameter: ApiParameter,
}

#[derive(Debug, Deserialize)]
struct ApiLocation {
    id: i64,
    #[serde(default)]
    name: Option<String>,
    coordinates: Option<ApiCoordinates>,
    #[serde(default)]
    sensors: Vec<ApiSensor>,
}

#[derive(Debug, Deserialize)]
struct ApiDatetime {
    utc: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiLatest {
    datetime: Option<ApiDatetime>,
    value: Option<f64>,
    sensors_id: i64,
}

impl ApiLocation {
    fn into_summary(self) -> Option<StationSummary> {
        let coordinates = self.coordinates?;
        let coordinate = Coordinate::new(coordinates.latitude?, coordinates.longitude?);
        Some(StationSummary {
            id: self.id,
            name: self.name.unwrap_or_default(),
            coordinate,
            sensors: self
                .sensors
                .into_iter()
                .map(|s| SensorMeta {
                    id: s.id,
                    parameter: s.parameter.name,
                    unit: s.parameter.units,
                })
                .collect(),
        })
    }
}

fn parse_utc(datetime: Option<ApiDatetime>) -> Option<OffsetDateTime> {
    datetime
        .and_then(|d| d.utc)
        .and_then(|s| OffsetDateTime::parse(&s, &Rfc3339).ok())
}

/// Join latest values to the station's sensor list by sensor id
fn reading_from_latest(station: &StationSummary, latest: Vec<ApiLatest>) -> GroundStationReading {
    let by_sensor: HashMap<i64, &SensorMeta> =
        station.sensors.iter().map(|s| (s.id, s)).collect();

    let mut last_updated: Option<OffsetDateTime> = None;
    let mut sensors = Vec::with_capacity(latest.len());
    for entry in latest {
        let Some(meta) = by_sensor.get(&entry.sensors_id) else {
            continue;
        };
        let observed_at = parse_utc(entry.datetime);
        if let Some(t) = observed_at {
            last_updated = Some(last_updated.map_or(t, |current| current.max(t)));
        }
        sensors.push(SensorReading {
            parameter: meta.parameter.clone(),
            value: entry.value,
            unit: meta.unit.clone(),
            observed_at,
        });
    }

    GroundStationReading {
        station_id: station.id,
        name: station.name.clone(),
        coordinate: Some(station.coordinate),
        last_updated,
        sensors,
    }
}

pub struct OpenAqClient {
    fetcher: Arc<HttpFetcher>,
    api_key: String,
    base_url: String,
}

impl OpenAqClient {
    pub fn new(fetcher: Arc<HttpFetcher>, api_key: String) -> Self {
        Self::with_base_url(fetcher, api_key, OPENAQ_BASE_URL)
    }

    pub fn with_base_url(fetcher: Arc<HttpFetcher>, api_key: String, base_url: &str) -> Self {
        Self {
            fetcher,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn headers(&self) -> [(&'static str, String); 1] {
        [("X-API-Key", self.api_key.clone())]
    }
}

#[async_trait]
impl GroundStationSource for OpenAqClient {
    async fn locations(
        &self,
        center: Coordinate,
        radius_m: f64,
    ) -> Result<Vec<StationSummary>, Error> {
        let url = format!("{}/locations", self.base_url);
        let query = [
            (
                "coordinates",
                format!("{},{}", center.latitude, center.longitude),
            ),
            ("radius", format!("{}", radius_m.round() as i64)),
            ("limit", PAGE_LIMIT.to_string()),
        ];
        let page: Page<ApiLocation> = self
            .fetcher
            .fetch_json(&url, &query, &self.headers())
            .await?;
        Ok(page
            .results
            .into_iter()
            .filter_map(ApiLocation::into_summary)
            .collect())
    }

    async fn latest(&self, station: &StationSummary) -> Result<GroundStationReading, Error> {
        let url = format!("{}/locations/{}/latest", self.base_url, station.id);
        let page: Page<ApiLatest> = self.fetcher.fetch_json(&url, &[], &self.headers()).await?;
        Ok(reading_from_latest(station, page.results))
    }
}

/// Ground stations around the target, with the radius split to what the API allows
pub struct GroundStationService {
    source: Arc<dyn GroundStationSource>,
    max_radius_m: f64,
    max_stations: usize,
    per_call_timeout: Duration,
    logger: Logger,
}

impl GroundStationService {
    pub fn new(
        source: Arc<dyn GroundStationSource>,
        max_radius_m: f64,
        per_call_timeout: Duration,
        logger: Logger,
    ) -> Self {
        Self {
            source,
            max_radius_m,
            max_stations: 25,
            per_call_timeout,
            logger,
        }
    }

    pub fn with_max_stations(mut self, max_stations: usize) -> Self {
        self.max_stations = max_stations;
        self
    }
}

#[async_trait]
impl ObservationSource for GroundStationService {
    fn kind(&self) -> SourceKind {
        SourceKind::GroundStations
    }

    async fn fetch(&self, target: &FetchTarget) -> Result<Vec<RawObservation>, Error> {
        let mut nearby = fetch_expanded(
            Arc::clone(&self.source),
            target.center,
            target.radius_m,
            self.max_radius_m,
            self.per_call_timeout,
            &self.logger,
        )
        .await?;
        nearby.truncate(self.max_stations);
        let attempted = nearby.len();
        info!(self.logger, "fetching latest values for {} stations", attempted);

        let mut set = JoinSet::new();
        for hit in nearby {
            let source = Arc::clone(&self.source);
            let per_call_timeout = self.per_call_timeout;
            set.spawn(async move {
                let id = hit.station.id;
                match timeout(per_call_timeout, source.latest(&hit.station)).await {
                    Ok(result) => (id, result),
                    Err(_) => (id, Err(anyhow::anyhow!("timed out"))),
                }
            });
        }

        let mut readings = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(reading))) => readings.push(reading),
                Ok((id, Err(e))) => warn!(self.logger, "station {}: {}", id, e),
                Err(e) => warn!(self.logger, "latest task ended abnormally: {}", e),
            }
        }
        if attempted > 0 && readings.is_empty() {
            return Err(anyhow::anyhow!(
                "none of {} stations returned latest values",
                attempted
            ));
        }
        readings.sort_by_key(|r| r.station_id);

        Ok(readings
            .into_iter()
            .map(RawObservation::GroundStation)
            .collect())
    }
}
