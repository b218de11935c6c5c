use std::{f64::consts::PI, sync::Arc};

use serde::Serialize;
use slog::{debug, warn, Logger};
use time::{Duration, OffsetDateTime};

use crate::{
    to_pascals, CanonicalRecord, Coordinate, FusionError, HistoricalFallback, Parameter,
    Provenance, SourceTag,
};

/// Model input columns, in the order the model was trained on
pub const FEATURE_NAMES: [&str; 12] = [
    "PS",
    "TS",
    "CLDPRS",
    "Q250",
    "lon",
    "lat",
    "hour",
    "dayofyear",
    "sin_hour",
    "cos_hour",
    "sin_doy",
    "cos_doy",
];

const KELVIN_OFFSET: f64 = 273.15;

/// Atmospheric inputs that come from live data or the historical fallback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AtmosphericParameter {
    SurfacePressure,
    SurfaceTemperature,
    CloudTopPressure,
    SpecificHumidity,
}

impl AtmosphericParameter {
    pub const ALL: [AtmosphericParameter; 4] = [
        AtmosphericParameter::SurfacePressure,
        AtmosphericParameter::SurfaceTemperature,
        AtmosphericParameter::CloudTopPressure,
        AtmosphericParameter::SpecificHumidity,
    ];

    /// Column name in the archival dataset and the feature vector
    pub fn column(&self) -> &'static str {
        match self {
            AtmosphericParameter::SurfacePressure => "PS",
            AtmosphericParameter::SurfaceTemperature => "TS",
            AtmosphericParameter::CloudTopPressure => "CLDPRS",
            AtmosphericParameter::SpecificHumidity => "Q250",
        }
    }
}

impl std::fmt::Display for AtmosphericParameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.column())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    /// Tag a single input from how much its source is trusted (0..=1) and how old it is
    pub fn assess(reliability: f64, age: Duration) -> Self {
        let age = age.abs();
        if reliability >= 0.8 && age <= Duration::hours(3) {
            Confidence::High
        } else if reliability >= 0.5 && age <= Duration::hours(24) {
            Confidence::Medium
        } else {
            Confidence::Low
        }
    }

    /// High when at least 70% of the tags are high, medium from 40%
    pub fn aggregate(tags: &[Confidence]) -> Self {
        if tags.is_empty() {
            return Confidence::Low;
        }
        let high = tags.iter().filter(|t| **t == Confidence::High).count();
        let ratio = high as f64 / tags.len() as f64;
        if ratio >= 0.7 {
            Confidence::High
        } else if ratio >= 0.4 {
            Confidence::Medium
        } else {
            Confidence::Low
        }
    }
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Confidence::High => "high",
            Confidence::Medium => "medium",
            Confidence::Low => "low",
        };
        f.write_str(name)
    }
}

/// How far each upstream is trusted when scoring confidence
pub fn source_reliability(source: SourceTag) -> f64 {
    match source {
        SourceTag::NoaaObservation => 0.9,
        SourceTag::OpenAq => 0.85,
        SourceTag::Tempo => 0.8,
        SourceTag::NoaaForecast => 0.7,
        SourceTag::OpenWeatherForecast => 0.6,
    }
}

pub fn cyclic_features(hour: f64, day_of_year: f64) -> [f64; 4] {
    let h = 2.0 * PI * hour / 24.0;
    let d = 2.0 * PI * day_of_year / 365.0;
    [h.sin(), h.cos(), d.sin(), d.cos()]
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FeatureVector(pub [f64; 12]);

impl FeatureVector {
    pub fn build(
        atmospheric: [f64; 4],
        location: Coordinate,
        timestamp: OffsetDateTime,
    ) -> Self {
        let utc = timestamp.to_offset(time::UtcOffset::UTC);
        let hour = utc.hour() as f64;
        let day_of_year = utc.ordinal() as f64;
        let [sin_hour, cos_hour, sin_doy, cos_doy] = cyclic_features(hour, day_of_year);
        let [ps, ts, cldprs, q250] = atmospheric;
        Self([
            ps,
            ts,
            cldprs,
            q250,
            location.longitude,
            location.latitude,
            hour,
            day_of_year,
            sin_hour,
            cos_hour,
            sin_doy,
            cos_doy,
        ])
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        FEATURE_NAMES
            .iter()
            .position(|n| *n == name)
            .map(|i| self.0[i])
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }
}

/// A live value for one atmospheric parameter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterInput {
    pub value: f64,
    pub confidence: Confidence,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AtmosphericInputs {
    pub location: Coordinate,
    pub timestamp: OffsetDateTime,
    pub surface_pressure: Option<ParameterInput>,
    pub surface_temperature: Option<ParameterInput>,
    pub cloud_top_pressure: Option<ParameterInput>,
    pub specific_humidity: Option<ParameterInput>,
}

impl AtmosphericInputs {
    pub fn new(location: Coordinate, timestamp: OffsetDateTime) -> Self {
        Self {
            location,
            timestamp,
            surface_pressure: None,
            surface_temperature: None,
            cloud_top_pressure: None,
            specific_humidity: None,
        }
    }

    pub fn get(&self, param: AtmosphericParameter) -> Option<ParameterInput> {
        match param {
            AtmosphericParameter::SurfacePressure => self.surface_pressure,
            AtmosphericParameter::SurfaceTemperature => self.surface_temperature,
            AtmosphericParameter::CloudTopPressure => self.cloud_top_pressure,
            AtmosphericParameter::SpecificHumidity => self.specific_humidity,
        }
    }

    pub fn set(&mut self, param: AtmosphericParameter, input: ParameterInput) {
        let slot = match param {
            AtmosphericParameter::SurfacePressure => &mut self.surface_pressure,
            AtmosphericParameter::SurfaceTemperature => &mut self.surface_temperature,
            AtmosphericParameter::CloudTopPressure => &mut self.cloud_top_pressure,
            AtmosphericParameter::SpecificHumidity => &mut self.specific_humidity,
        };
        *slot = Some(input);
    }

    /// Live inputs from fused records, each taken from the row closest in time to `timestamp`.
    ///
    /// Surface pressure comes from pressure rows (converted to Pa), surface
    /// temperature from forecast weather context (°C converted to K). Cloud-top
    /// pressure and upper-level humidity have no live source.
    pub fn from_records(
        records: &[CanonicalRecord],
        location: Coordinate,
        timestamp: OffsetDateTime,
    ) -> Self {
        let mut inputs = Self::new(location, timestamp);
        let age = |r: &CanonicalRecord| (timestamp - r.timestamp).abs();

        let pressure = records
            .iter()
            .filter(|r| r.parameter == Parameter::Pressure)
            .filter_map(|r| to_pascals(r.value, &r.unit).map(|pa| (r, pa)))
            .min_by_key(|(r, _)| (age(*r), r.provenance != Provenance::Observation));
        if let Some((record, pa)) = pressure {
            inputs.surface_pressure = Some(ParameterInput {
                value: pa,
                confidence: Confidence::assess(source_reliability(record.source), age(record)),
            });
        }

        let temperature = records
            .iter()
            .filter_map(|r| r.weather.temperature.map(|t| (r, t)))
            .filter(|(_, t)| t.is_finite())
            .min_by_key(|(r, _)| age(*r));
        if let Some((record, celsius)) = temperature {
            inputs.surface_temperature = Some(ParameterInput {
                value: celsius + KELVIN_OFFSET,
                confidence: Confidence::assess(source_reliability(record.source), age(record)),
            });
        }

        inputs
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreparedFeatures {
    pub vector: FeatureVector,
    pub confidence: Confidence,
    /// Parameters filled from the historical fallback
    pub substituted: Vec<AtmosphericParameter>,
}

pub struct FeaturePreparer {
    fallback: Option<Arc<HistoricalFallback>>,
    logger: Logger,
}

impl FeaturePreparer {
    pub fn new(fallback: Option<Arc<HistoricalFallback>>, logger: Logger) -> Self {
        Self { fallback, logger }
    }

    /// Assemble the model input, substituting historical means for missing parameters.
    ///
    /// Substituted parameters count as low confidence. Fails when no
    /// parameter is live at all, or when one is missing and there is no
    /// fallback for it.
    pub fn prepare(&self, inputs: &AtmosphericInputs) -> Result<PreparedFeatures, FusionError> {
        if AtmosphericParameter::ALL
            .iter()
            .all(|p| inputs.get(*p).is_none())
        {
            return Err(FusionError::AllParametersUnavailable);
        }

        let mut values = [0.0; 4];
        let mut tags = Vec::with_capacity(4);
        let mut substituted = Vec::new();
        for (slot, param) in AtmosphericParameter::ALL.iter().enumerate() {
            match inputs.get(*param) {
                Some(input) if input.value.is_finite() => {
                    values[slot] = input.value;
                    tags.push(input.confidence);
                }
                _ => {
                    let value = self
                        .fallback
                        .as_ref()
                        .and_then(|f| f.value(*param))
                        .ok_or_else(|| FusionError::MissingFallback(param.to_string()))?;
                    warn!(self.logger, "{} unavailable, using historical mean {}", param, value);
                    values[slot] = value;
                    tags.push(Confidence::Low);
                    substituted.push(*param);
                }
            }
        }

        let vector = FeatureVector::build(values, inputs.location, inputs.timestamp);
        let confidence = Confidence::aggregate(&tags);
        debug!(self.logger, "features prepared: {:?} ({})", vector.0, confidence);
        Ok(PreparedFeatures {
            vector,
            confidence,
            substituted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WeatherContext;
    use slog::{o, Discard};
    use time::macros::datetime;

    fn preparer(fallback: Option<HistoricalFallback>) -> FeaturePreparer {
        FeaturePreparer::new(fallback.map(Arc::new), Logger::root(Discard, o!()))
    }

    fn merra_means() -> HistoricalFallback {
        HistoricalFallback::from_means([
            (AtmosphericParameter::SurfacePressure, 101_500.0),
            (AtmosphericParameter::SurfaceTemperature, 289.15),
            (AtmosphericParameter::CloudTopPressure, 30_000.0),
            (AtmosphericParameter::SpecificHumidity, 0.0000045),
        ])
    }

    fn high(value: f64) -> ParameterInput {
        ParameterInput {
            value,
            confidence: Confidence::High,
        }
    }

    fn encoded(hour: f64) -> [f64; 2] {
        let [s, c, _, _] = cyclic_features(hour, 1.0);
        [s, c]
    }

    fn distance(a: [f64; 2], b: [f64; 2]) -> f64 {
        ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)).sqrt()
    }

    #[test]
    fn midnight_wraps_around() {
        let late = distance(encoded(23.0), encoded(0.0));
        let noon = distance(encoded(0.0), encoded(12.0));
        assert!(late < noon);
    }

    #[test]
    fn feature_order_is_fixed() {
        let vector = FeatureVector::build(
            [101_500.0, 289.15, 30_000.0, 0.0000045],
            Coordinate::new(40.5, -73.75),
            datetime!(2024-02-01 06:00 UTC),
        );
        assert_eq!(vector.get("PS"), Some(101_500.0));
        assert_eq!(vector.get("lon"), Some(-73.75));
        assert_eq!(vector.get("lat"), Some(40.5));
        assert_eq!(vector.get("hour"), Some(6.0));
        assert_eq!(vector.get("dayofyear"), Some(32.0));
        assert!((vector.get("sin_hour").unwrap() - 1.0).abs() < 1e-12);
        assert!(vector.get("cos_hour").unwrap().abs() < 1e-12);
        assert_eq!(vector.get("TOX"), None);
    }

    #[test]
    fn local_time_is_encoded_as_utc() {
        let vector = FeatureVector::build(
            [0.0; 4],
            Coordinate::new(40.7, -74.0),
            datetime!(2024-08-12 22:00 -4),
        );
        assert_eq!(vector.get("hour"), Some(2.0));
        assert_eq!(vector.get("dayofyear"), Some(226.0));
    }

    #[test]
    fn confidence_thresholds() {
        use Confidence::*;
        assert_eq!(Confidence::aggregate(&[High, High, High, Low]), High);
        assert_eq!(Confidence::aggregate(&[High, High, Low, Low]), Medium);
        assert_eq!(Confidence::aggregate(&[High, Medium, Low, Low]), Low);
        assert_eq!(Confidence::aggregate(&[]), Low);
        assert_eq!(Confidence::assess(0.9, Duration::minutes(30)), High);
        assert_eq!(Confidence::assess(0.9, Duration::hours(-2)), High);
        assert_eq!(Confidence::assess(0.6, Duration::hours(1)), Medium);
        assert_eq!(Confidence::assess(0.9, Duration::hours(48)), Low);
    }

    #[test]
    fn missing_parameters_use_fallback() {
        let mut inputs = AtmosphericInputs::new(
            Coordinate::new(40.7128, -74.0060),
            datetime!(2024-08-12 15:00 UTC),
        );
        inputs.set(AtmosphericParameter::SurfacePressure, high(101_320.0));
        inputs.set(AtmosphericParameter::SurfaceTemperature, high(300.0));

        let prepared = preparer(Some(merra_means())).prepare(&inputs).unwrap();
        assert_eq!(prepared.vector.get("PS"), Some(101_320.0));
        assert_eq!(prepared.vector.get("CLDPRS"), Some(30_000.0));
        assert_eq!(
            prepared.substituted,
            vec![
                AtmosphericParameter::CloudTopPressure,
                AtmosphericParameter::SpecificHumidity
            ]
        );
        // two of four high
        assert_eq!(prepared.confidence, Confidence::Medium);
    }

    #[test]
    fn missing_parameter_without_fallback_fails() {
        let mut inputs = AtmosphericInputs::new(
            Coordinate::new(40.7128, -74.0060),
            datetime!(2024-08-12 15:00 UTC),
        );
        inputs.set(AtmosphericParameter::SurfacePressure, high(101_320.0));
        let result = preparer(None).prepare(&inputs);
        assert!(matches!(result, Err(FusionError::MissingFallback(p)) if p == "TS"));
    }

    #[test]
    fn nothing_live_is_a_hard_failure() {
        let inputs = AtmosphericInputs::new(
            Coordinate::new(40.7128, -74.0060),
            datetime!(2024-08-12 15:00 UTC),
        );
        let result = preparer(Some(merra_means())).prepare(&inputs);
        assert!(matches!(result, Err(FusionError::AllParametersUnavailable)));
    }

    #[test]
    fn inputs_from_fused_records() {
        let now = datetime!(2024-08-12 15:00 UTC);
        let base = CanonicalRecord {
            timestamp: now,
            source: SourceTag::NoaaObservation,
            location_name: "KNYC".to_string(),
            latitude: 40.78,
            longitude: -73.97,
            parameter: Parameter::Pressure,
            value: 101_420.0,
            unit: "Pa".to_string(),
            provenance: Provenance::Observation,
            category_index: None,
            weather: WeatherContext::default(),
            quality_flag: Some("V".to_string()),
        };
        let stale = CanonicalRecord {
            timestamp: datetime!(2024-08-12 03:00 UTC),
            value: 1000.0,
            unit: "hPa".to_string(),
            ..base.clone()
        };
        let forecast = CanonicalRecord {
            timestamp: datetime!(2024-08-12 16:00 UTC),
            source: SourceTag::OpenWeatherForecast,
            location_name: "OpenWeatherMap Forecast".to_string(),
            parameter: Parameter::O3,
            value: 68.0,
            unit: "μg/m³".to_string(),
            provenance: Provenance::Forecast,
            weather: WeatherContext {
                temperature: Some(26.85),
                ..WeatherContext::default()
            },
            quality_flag: None,
            ..base.clone()
        };

        let inputs = AtmosphericInputs::from_records(
            &[stale, forecast, base],
            Coordinate::new(40.7128, -74.0060),
            now,
        );
        let ps = inputs.surface_pressure.unwrap();
        assert_eq!(ps.value, 101_420.0);
        assert_eq!(ps.confidence, Confidence::High);
        let ts = inputs.surface_temperature.unwrap();
        assert!((ts.value - 300.0).abs() < 1e-9);
        assert_eq!(ts.confidence, Confidence::Medium);
        assert!(inputs.cloud_top_pressure.is_none());
    }
}
