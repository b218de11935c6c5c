use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::Coordinate;

/// Closed vocabulary of measured quantities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Parameter {
    No2,
    O3,
    So2,
    Co,
    Pm25,
    Pm10,
    Nh3,
    Pressure,
    Wind,
}

impl Parameter {
    pub const ALL: [Parameter; 9] = [
        Parameter::No2,
        Parameter::O3,
        Parameter::So2,
        Parameter::Co,
        Parameter::Pm25,
        Parameter::Pm10,
        Parameter::Nh3,
        Parameter::Pressure,
        Parameter::Wind,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Parameter::No2 => "NO2",
            Parameter::O3 => "O3",
            Parameter::So2 => "SO2",
            Parameter::Co => "CO",
            Parameter::Pm25 => "PM2.5",
            Parameter::Pm10 => "PM10",
            Parameter::Nh3 => "NH3",
            Parameter::Pressure => "pressure",
            Parameter::Wind => "wind",
        }
    }
}

impl std::fmt::Display for Parameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
#[error("unknown parameter: {0}")]
pub struct UnknownParameter(pub String);

impl FromStr for Parameter {
    type Err = UnknownParameter;

    /// Accepts the spellings the upstream APIs use (`pm25`, `pm2_5`, `PM2.5`, ...)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let folded: String = s
            .chars()
            .filter(|c| !matches!(c, '.' | '_' | ' ' | '-'))
            .collect::<String>()
            .to_ascii_lowercase();
        match folded.as_str() {
            "no2" => Ok(Parameter::No2),
            "o3" => Ok(Parameter::O3),
            "so2" => Ok(Parameter::So2),
            "co" => Ok(Parameter::Co),
            "pm25" => Ok(Parameter::Pm25),
            "pm10" => Ok(Parameter::Pm10),
            "nh3" => Ok(Parameter::Nh3),
            "pressure" => Ok(Parameter::Pressure),
            "wind" => Ok(Parameter::Wind),
            _ => Err(UnknownParameter(s.to_string())),
        }
    }
}

/// Which upstream a record came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceTag {
    OpenAq,
    Tempo,
    OpenWeatherForecast,
    NoaaObservation,
    NoaaForecast,
}

impl SourceTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTag::OpenAq => "openaq",
            SourceTag::Tempo => "tempo",
            SourceTag::OpenWeatherForecast => "openweather_forecast",
            SourceTag::NoaaObservation => "noaa_observation",
            SourceTag::NoaaForecast => "noaa_forecast",
        }
    }
}

impl std::fmt::Display for SourceTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openaq" => Ok(SourceTag::OpenAq),
            "tempo" => Ok(SourceTag::Tempo),
            "openweather_forecast" => Ok(SourceTag::OpenWeatherForecast),
            "noaa_observation" => Ok(SourceTag::NoaaObservation),
            "noaa_forecast" => Ok(SourceTag::NoaaForecast),
            other => Err(format!("unknown source tag: {}", other)),
        }
    }
}

/// Measured value vs. model output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Provenance {
    Observation,
    Forecast,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Observation => "observation",
            Provenance::Forecast => "forecast",
        }
    }
}

impl FromStr for Provenance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "observation" => Ok(Provenance::Observation),
            "forecast" => Ok(Provenance::Forecast),
            other => Err(format!("unknown provenance: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WeatherContext {
    /// degrees Celsius
    pub temperature: Option<f64>,
    /// percent
    pub humidity: Option<f64>,
    /// m/s
    pub wind_speed: Option<f64>,
    /// degrees clockwise from north
    pub wind_direction: Option<f64>,
    /// hPa
    pub pressure: Option<f64>,
}

impl WeatherContext {
    pub fn is_empty(&self) -> bool {
        *self == WeatherContext::default()
    }
}

/// The unified row every source is converted into. Never mutated after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRecord {
    pub timestamp: OffsetDateTime,
    pub source: SourceTag,
    pub location_name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub parameter: Parameter,
    pub value: f64,
    pub unit: String,
    pub provenance: Provenance,
    /// Categorical severity, e.g. the 1-5 AQI class
    pub category_index: Option<i64>,
    pub weather: WeatherContext,
    pub quality_flag: Option<String>,
}

/// Natural key used for deduplication
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub unix_nanos: i128,
    pub source: SourceTag,
    pub location_name: String,
    pub lat_micro: i64,
    pub lon_micro: i64,
    pub parameter: Parameter,
}

impl CanonicalRecord {
    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }

    pub fn key(&self) -> RecordKey {
        RecordKey {
            unix_nanos: self.timestamp.unix_timestamp_nanos(),
            source: self.source,
            location_name: self.location_name.clone(),
            lat_micro: (self.latitude * 1e6).round() as i64,
            lon_micro: (self.longitude * 1e6).round() as i64,
            parameter: self.parameter,
        }
    }
}

/// One sensor on a ground station
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    pub parameter: String,
    pub value: Option<f64>,
    pub unit: String,
    /// When the sensor reports its own time it wins over the station's
    pub observed_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroundStationReading {
    pub station_id: i64,
    pub name: String,
    pub coordinate: Option<Coordinate>,
    pub last_updated: Option<OffsetDateTime>,
    pub sensors: Vec<SensorReading>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SatellitePixel {
    pub file_name: String,
    pub species: Parameter,
    pub value: f64,
    pub unit: String,
    pub coordinate: Coordinate,
    pub scan_time: Option<OffsetDateTime>,
    pub grid_index: (usize, usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForecastEntry {
    pub location_name: String,
    pub coordinate: Coordinate,
    pub timestamp: Option<OffsetDateTime>,
    pub category_index: Option<i64>,
    pub components: Vec<(String, Option<f64>)>,
    pub unit: String,
    pub weather: WeatherContext,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SurfacePressureReading {
    /// Station identifier for observations, grid point label for forecasts
    pub station_id: String,
    pub coordinate: Coordinate,
    pub timestamp: Option<OffsetDateTime>,
    pub pressure: Option<f64>,
    pub unit: String,
    pub provenance: Provenance,
    pub quality_flag: Option<String>,
}

/// Raw, source-specific input to the normalizer
#[derive(Debug, Clone, PartialEq)]
pub enum RawObservation {
    GroundStation(GroundStationReading),
    SatellitePixel(SatellitePixel),
    ForecastPoint(ForecastEntry),
    SurfaceObservation(SurfacePressureReading),
}
