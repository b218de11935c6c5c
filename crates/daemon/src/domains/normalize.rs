use slog::{debug, warn, Logger};
use time::{OffsetDateTime, UtcOffset};

use crate::{
    CanonicalRecord, ForecastEntry, GroundStationReading, Parameter, Provenance, RawObservation,
    SatellitePixel, SourceTag, SurfacePressureReading, WeatherContext,
};

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum NormalizeError {
    #[error("{0} input has no timestamp")]
    MissingTimestamp(&'static str),
    #[error("{0} input has no usable coordinate")]
    MissingCoordinate(&'static str),
    #[error("{0} input has no finite value")]
    MissingValue(&'static str),
}

#[derive(Debug, Default)]
pub struct NormalizeOutcome {
    pub records: Vec<CanonicalRecord>,
    /// Inputs rejected as a whole
    pub skipped: usize,
    /// Individual parameter values dropped from otherwise valid inputs
    pub dropped_values: usize,
}

/// Convert one raw observation into canonical records.
///
/// Timestamps are shifted to UTC. Units are carried through untouched.
pub fn normalize(raw: &RawObservation) -> Result<Vec<CanonicalRecord>, NormalizeError> {
    let mut dropped = 0;
    normalize_counted(raw, &mut dropped)
}

pub fn normalize_batch<'a>(
    raws: impl IntoIterator<Item = &'a RawObservation>,
    logger: &Logger,
) -> NormalizeOutcome {
    let mut outcome = NormalizeOutcome::default();
    for raw in raws {
        match normalize_counted(raw, &mut outcome.dropped_values) {
            Ok(mut records) => outcome.records.append(&mut records),
            Err(e) => {
                warn!(logger, "skipping input: {}", e);
                outcome.skipped += 1;
            }
        }
    }
    debug!(
        logger,
        "normalized {} records, skipped {} inputs, dropped {} values",
        outcome.records.len(),
        outcome.skipped,
        outcome.dropped_values
    );
    outcome
}

fn normalize_counted(
    raw: &RawObservation,
    dropped: &mut usize,
) -> Result<Vec<CanonicalRecord>, NormalizeError> {
    match raw {
        RawObservation::GroundStation(reading) => from_ground_station(reading, dropped),
        RawObservation::SatellitePixel(pixel) => from_satellite_pixel(pixel).map(|r| vec![r]),
        RawObservation::ForecastPoint(entry) => from_forecast(entry, dropped),
        RawObservation::SurfaceObservation(reading) => {
            from_surface_pressure(reading).map(|r| vec![r])
        }
    }
}

fn to_utc(timestamp: OffsetDateTime) -> OffsetDateTime {
    timestamp.to_offset(UtcOffset::UTC)
}

fn from_ground_station(
    reading: &GroundStationReading,
    dropped: &mut usize,
) -> Result<Vec<CanonicalRecord>, NormalizeError> {
    let coordinate = reading
        .coordinate
        .filter(|c| c.is_finite())
        .ok_or(NormalizeError::MissingCoordinate("ground station"))?;

    let location_name = if reading.name.trim().is_empty() {
        format!("station {}", reading.station_id)
    } else {
        reading.name.clone()
    };

    let any_timestamp = reading.last_updated.is_some()
        || reading.sensors.iter().any(|s| s.observed_at.is_some());
    if !any_timestamp && !reading.sensors.is_empty() {
        return Err(NormalizeError::MissingTimestamp("ground station"));
    }

    let mut records = Vec::with_capacity(reading.sensors.len());
    for sensor in &reading.sensors {
        let Some(timestamp) = sensor.observed_at.or(reading.last_updated) else {
            *dropped += 1;
            continue;
        };
        let (Ok(parameter), Some(value)) = (
            sensor.parameter.parse::<Parameter>(),
            sensor.value.filter(|v| v.is_finite()),
        ) else {
            *dropped += 1;
            continue;
        };
        records.push(CanonicalRecord {
            timestamp: to_utc(timestamp),
            source: SourceTag::OpenAq,
            location_name: location_name.clone(),
            latitude: coordinate.latitude,
            longitude: coordinate.longitude,
            parameter,
            value,
            unit: sensor.unit.clone(),
            provenance: Provenance::Observation,
            category_index: None,
            weather: WeatherContext::default(),
            quality_flag: None,
        });
    }

    Ok(records)
}

fn from_satellite_pixel(pixel: &SatellitePixel) -> Result<CanonicalRecord, NormalizeError> {
    let timestamp = pixel
        .scan_time
        .ok_or(NormalizeError::MissingTimestamp("satellite pixel"))?;
    if !pixel.coordinate.is_finite() {
        return Err(NormalizeError::MissingCoordinate("satellite pixel"));
    }
    if !pixel.value.is_finite() {
        return Err(NormalizeError::MissingValue("satellite pixel"));
    }
    Ok(CanonicalRecord {
        timestamp: to_utc(timestamp),
        source: SourceTag::Tempo,
        location_name: pixel.file_name.clone(),
        latitude: pixel.coordinate.latitude,
        longitude: pixel.coordinate.longitude,
        parameter: pixel.species,
        value: pixel.value,
        unit: pixel.unit.clone(),
        provenance: Provenance::Observation,
        category_index: None,
        weather: WeatherContext::default(),
        quality_flag: None,
    })
}

fn from_forecast(
    entry: &ForecastEntry,
    dropped: &mut usize,
) -> Result<Vec<CanonicalRecord>, NormalizeError> {
    let timestamp = entry
        .timestamp
        .map(to_utc)
        .ok_or(NormalizeError::MissingTimestamp("forecast"))?;
    if !entry.coordinate.is_finite() {
        return Err(NormalizeError::MissingCoordinate("forecast"));
    }

    let base = CanonicalRecord {
        timestamp,
        source: SourceTag::OpenWeatherForecast,
        location_name: entry.location_name.clone(),
        latitude: entry.coordinate.latitude,
        longitude: entry.coordinate.longitude,
        parameter: Parameter::Wind,
        value: 0.0,
        unit: entry.unit.clone(),
        provenance: Provenance::Forecast,
        category_index: entry.category_index,
        weather: entry.weather,
        quality_flag: None,
    };

    let mut records = Vec::with_capacity(entry.components.len() + 1);
    for (name, value) in &entry.components {
        let (Ok(parameter), Some(value)) = (
            name.parse::<Parameter>(),
            value.filter(|v| v.is_finite()),
        ) else {
            *dropped += 1;
            continue;
        };
        records.push(CanonicalRecord {
            parameter,
            value,
            ..base.clone()
        });
    }

    // the forecast's own wind reading, kept so the wind field can be rebuilt from the table
    if let (Some(speed), Some(_)) = (
        entry.weather.wind_speed.filter(|s| s.is_finite()),
        entry.weather.wind_direction.filter(|d| d.is_finite()),
    ) {
        records.push(CanonicalRecord {
            value: speed,
            unit: "m/s".to_string(),
            ..base
        });
    }

    Ok(records)
}

fn from_surface_pressure(
    reading: &SurfacePressureReading,
) -> Result<CanonicalRecord, NormalizeError> {
    let timestamp = reading
        .timestamp
        .ok_or(NormalizeError::MissingTimestamp("surface pressure"))?;
    let value = reading
        .pressure
        .filter(|p| p.is_finite())
        .ok_or(NormalizeError::MissingValue("surface pressure"))?;
    if !reading.coordinate.is_finite() {
        return Err(NormalizeError::MissingCoordinate("surface pressure"));
    }
    let source = match reading.provenance {
        Provenance::Observation => SourceTag::NoaaObservation,
        Provenance::Forecast => SourceTag::NoaaForecast,
    };
    Ok(CanonicalRecord {
        timestamp: to_utc(timestamp),
        source,
        location_name: reading.station_id.clone(),
        latitude: reading.coordinate.latitude,
        longitude: reading.coordinate.longitude,
        parameter: Parameter::Pressure,
        value,
        unit: reading.unit.clone(),
        provenance: reading.provenance,
        category_index: None,
        weather: WeatherContext::default(),
        quality_flag: reading.quality_flag.clone(),
    })
}

/// Which surface observation quality flags a caller accepts.
///
/// Records without a flag (forecast rows, other sources) always pass.
#[derive(Debug, Clone, PartialEq)]
pub struct QualityPolicy {
    pub accepted: Vec<String>,
}

impl Default for QualityPolicy {
    fn default() -> Self {
        Self {
            accepted: vec!["V".to_string(), "C".to_string(), "S".to_string()],
        }
    }
}

impl QualityPolicy {
    pub fn accepts(&self, record: &CanonicalRecord) -> bool {
        match &record.quality_flag {
            None => true,
            Some(flag) => self.accepted.iter().any(|a| a == flag),
        }
    }

    /// Split off the records this policy accepts, returning how many were rejected
    pub fn apply(&self, records: Vec<CanonicalRecord>) -> (Vec<CanonicalRecord>, usize) {
        let before = records.len();
        let kept: Vec<_> = records.into_iter().filter(|r| self.accepts(r)).collect();
        let rejected = before - kept.len();
        (kept, rejected)
    }
}
