use std::sync::Arc;

use anyhow::{anyhow, Error};
use async_trait::async_trait;
use serde::Deserialize;
use time::{format_description::well_known::Rfc3339, Duration, OffsetDateTime};

use crate::{FetchTarget, ModelWindPoint, NoaaClient};

const MPH_TO_MS: f64 = 0.44704;

const CARDINALS: [&str; 16] = [
    "N", "NNE", "NE", "ENE", "E", "ESE", "SE", "SSE", "S", "SSW", "SW", "WSW", "W", "WNW", "NW",
    "NNW",
];

/// 16-point compass label to degrees clockwise from north
pub fn cardinal_to_degrees(cardinal: &str) -> Option<f64> {
    let upper = cardinal.trim().to_ascii_uppercase();
    CARDINALS
        .iter()
        .position(|c| *c == upper)
        .map(|i| i as f64 * 22.5)
}

/// `"7 mph"` or `"5 to 10 mph"` (averaged) in m/s
pub fn parse_wind_speed(text: &str) -> Option<f64> {
    let numbers: Vec<f64> = text
        .split_whitespace()
        .filter_map(|part| part.parse::<f64>().ok())
        .collect();
    if numbers.is_empty() {
        return None;
    }
    let mph = numbers.iter().sum::<f64>() / numbers.len() as f64;
    let factor = if text.contains("km/h") {
        1000.0 / 3600.0
    } else {
        MPH_TO_MS
    };
    Some(mph * factor)
}

/// Wind estimates at the target from an upstream model
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WindModelSource: Send + Sync {
    async fn model_points(&self, target: &FetchTarget) -> Result<Vec<ModelWindPoint>, Error>;
}

#[derive(Debug, Deserialize)]
struct Hourly {
    properties: HourlyProperties,
}

#[derive(Debug, Deserialize)]
struct HourlyProperties {
    #[serde(default)]
    periods: Vec<Period>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Period {
    start_time: Option<String>,
    wind_speed: Option<String>,
    wind_direction: Option<String>,
}

impl Period {
    fn start(&self) -> Option<OffsetDateTime> {
        OffsetDateTime::parse(self.start_time.as_deref()?, &Rfc3339).ok()
    }
}

/// The period covering `now`, or the first one after it
fn current_period(periods: &[Period], now: OffsetDateTime) -> Option<&Period> {
    periods
        .iter()
        .find(|p| p.start().map_or(false, |t| t + Duration::hours(1) > now))
}

/// Current wind at the target from the NOAA hourly forecast
pub struct NoaaWindSource {
    client: Arc<NoaaClient>,
}

impl NoaaWindSource {
    pub fn new(client: Arc<NoaaClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WindModelSource for NoaaWindSource {
    async fn model_points(&self, target: &FetchTarget) -> Result<Vec<ModelWindPoint>, Error> {
        let grid = self.client.points(target.center).await?;
        let url = grid
            .forecast_hourly
            .as_deref()
            .ok_or_else(|| anyhow!("grid point {} has no hourly forecast", grid.label()))?;
        let hourly: Hourly = self.client.get_json(url, &[]).await?;

        let Some(period) = current_period(&hourly.properties.periods, OffsetDateTime::now_utc())
        else {
            return Ok(Vec::new());
        };
        let speed = period.wind_speed.as_deref().and_then(parse_wind_speed);
        let direction = period.wind_direction.as_deref().and_then(cardinal_to_degrees);
        Ok(match (speed, direction) {
            (Some(speed), Some(direction)) => vec![ModelWindPoint {
                coordinate: target.center,
                speed,
                direction,
            }],
            _ => Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn cardinal_points() {
        assert_eq!(cardinal_to_degrees("N"), Some(0.0));
        assert_eq!(cardinal_to_degrees("ene"), Some(67.5));
        assert_eq!(cardinal_to_degrees("SW"), Some(225.0));
        assert_eq!(cardinal_to_degrees("NNW"), Some(337.5));
        assert_eq!(cardinal_to_degrees("calm"), None);
    }

    #[test]
    fn wind_speed_text() {
        assert!((parse_wind_speed("7 mph").unwrap() - 3.129_28).abs() < 1e-9);
        assert!((parse_wind_speed("5 to 10 mph").unwrap() - 7.5 * 0.44704).abs() < 1e-9);
        assert_eq!(parse_wind_speed("mph"), None);
    }

    #[test]
    fn picks_period_covering_now() {
        let json = r#"{"properties": {"periods": [
            {"startTime": "2024-08-12T08:00:00-04:00", "windSpeed": "3 mph", "windDirection": "N"},
            {"startTime": "2024-08-12T09:00:00-04:00", "windSpeed": "5 to 10 mph", "windDirection": "SW"},
            {"startTime": "2024-08-12T10:00:00-04:00", "windSpeed": "12 mph", "windDirection": "W"}
        ]}}"#;
        let hourly: Hourly = serde_json::from_str(json).unwrap();
        let now = datetime!(2024-08-12 13:30 UTC);
        let period = current_period(&hourly.properties.periods, now).unwrap();
        assert_eq!(period.wind_direction.as_deref(), Some("SW"));
    }
}
