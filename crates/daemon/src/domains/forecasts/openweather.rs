use std::{collections::HashMap, future::Future, sync::Arc};

use anyhow::Error;
use async_trait::async_trait;
use serde::Deserialize;
use slog::{debug, warn, Logger};
use time::{Duration, OffsetDateTime};

use crate::{
    Coordinate, FetchTarget, ForecastEntry, HttpFetcher, ObservationSource, RawObservation,
    SourceKind, WeatherContext,
};

pub const OPENWEATHER_BASE_URL: &str = "https://api.openweathermap.org/data/2.5";

pub const FORECAST_LOCATION_NAME: &str = "OpenWeatherMap Forecast";

/// Pollutants reported by the air pollution forecast, in column order
const COMPONENTS: [&str; 7] = ["co", "no2", "o3", "so2", "pm2_5", "pm10", "nh3"];

#[derive(Debug, Deserialize)]
struct PollutionResponse {
    #[serde(default)]
    list: Vec<PollutionItem>,
}

#[derive(Debug, Deserialize)]
struct PollutionItem {
    dt: i64,
    main: Option<AqiMain>,
    #[serde(default)]
    components: HashMap<String, Option<f64>>,
}

#[derive(Debug, Deserialize)]
struct AqiMain {
    aqi: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WeatherResponse {
    #[serde(default)]
    list: Vec<WeatherItem>,
}

#[derive(Debug, Deserialize)]
struct WeatherItem {
    dt: i64,
    main: Option<WeatherMain>,
    wind: Option<WeatherWind>,
}

#[derive(Debug, Deserialize)]
struct WeatherMain {
    temp: Option<f64>,
    humidity: Option<f64>,
    pressure: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct WeatherWind {
    speed: Option<f64>,
    deg: Option<f64>,
}

impl WeatherItem {
    fn context(&self) -> WeatherContext {
        WeatherContext {
            temperature: self.main.as_ref().and_then(|m| m.temp),
            humidity: self.main.as_ref().and_then(|m| m.humidity),
            wind_speed: self.wind.as_ref().and_then(|w| w.speed),
            wind_direction: self.wind.as_ref().and_then(|w| w.deg),
            pressure: self.main.as_ref().and_then(|m| m.pressure),
        }
    }
}

/// One entry per pollution forecast step, with the weather step of the same `dt` attached
fn join_forecasts(
    coordinate: Coordinate,
    pollution: PollutionResponse,
    weather: WeatherResponse,
) -> Vec<ForecastEntry> {
    let weather_by_dt: HashMap<i64, WeatherContext> = weather
        .list
        .iter()
        .map(|item| (item.dt, item.context()))
        .collect();

    pollution
        .list
        .into_iter()
        .map(|mut item| ForecastEntry {
            location_name: FORECAST_LOCATION_NAME.to_string(),
            coordinate,
            timestamp: OffsetDateTime::from_unix_timestamp(item.dt).ok(),
            category_index: item.main.and_then(|m| m.aqi),
            components: COMPONENTS
                .iter()
                .map(|name| (name.to_string(), item.components.remove(*name).flatten()))
                .collect(),
            unit: "μg/m³".to_string(),
            weather: weather_by_dt.get(&item.dt).copied().unwrap_or_default(),
        })
        .collect()
}

/// Runs both forecast requests at once.
/// Weather context is optional, so only a pollution failure is an error.
async fn fetch_both<P, W>(
    pollution: P,
    weather: W,
    logger: &Logger,
) -> Result<(PollutionResponse, WeatherResponse), Error>
where
    P: Future<Output = Result<PollutionResponse, Error>>,
    W: Future<Output = Result<WeatherResponse, Error>>,
{
    let (pollution, weather) = tokio::join!(pollution, weather);
    let weather = match weather {
        Ok(weather) => weather,
        Err(e) => {
            warn!(logger, "weather forecast unavailable: {}", e);
            WeatherResponse { list: Vec::new() }
        }
    };
    Ok((pollution?, weather))
}

pub struct OpenWeatherClient {
    fetcher: Arc<HttpFetcher>,
    api_key: String,
    base_url: String,
    logger: Logger,
}

impl OpenWeatherClient {
    pub fn new(fetcher: Arc<HttpFetcher>, api_key: String, logger: Logger) -> Self {
        Self {
            fetcher,
            api_key,
            base_url: OPENWEATHER_BASE_URL.to_string(),
            logger,
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub async fn forecast(&self, coordinate: Coordinate) -> Result<Vec<ForecastEntry>, Error> {
        let location = [
            ("lat", coordinate.latitude.to_string()),
            ("lon", coordinate.longitude.to_string()),
            ("appid", self.api_key.clone()),
        ];
        let pollution_url = format!("{}/air_pollution/forecast", self.base_url);
        let weather_url = format!("{}/forecast", self.base_url);
        let mut weather_query = location.to_vec();
        weather_query.push(("units", "metric".to_string()));

        let (pollution, weather) = fetch_both(
            self.fetcher.fetch_json(&pollution_url, &location, &[]),
            self.fetcher.fetch_json(&weather_url, &weather_query, &[]),
            &self.logger,
        )
        .await?;
        Ok(join_forecasts(coordinate, pollution, weather))
    }
}

#[async_trait]
impl ObservationSource for OpenWeatherClient {
    fn kind(&self) -> SourceKind {
        SourceKind::Forecast
    }

    async fn fetch(&self, target: &FetchTarget) -> Result<Vec<RawObservation>, Error> {
        let horizon = OffsetDateTime::now_utc() + Duration::hours(target.hours_forward as i64);
        let entries = self.forecast(target.center).await?;
        let total = entries.len();
        let kept: Vec<RawObservation> = entries
            .into_iter()
            .filter(|e| e.timestamp.map_or(true, |t| t <= horizon))
            .map(RawObservation::ForecastPoint)
            .collect();
        debug!(
            self.logger,
            "forecast: kept {} of {} steps within {} hours",
            kept.len(),
            total,
            target.hours_forward
        );
        Ok(kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::{o, Discard};
    use time::macros::datetime;

    const POLLUTION: &str = r#"{
        "coord": {"lon": -74.006, "lat": 40.7128},
        "list": [
            {"main": {"aqi": 2}, "components": {"co": 201.94, "no": 0.02, "no2": 0.77, "o3": 68.66, "so2": 0.64, "pm2_5": 0.5, "pm10": 0.54, "nh3": 0.12}, "dt": 1723464000},
            {"main": {"aqi": 3}, "components": {"co": 210.0, "o3": 90.1}, "dt": 1723467600}
        ]
    }"#;

    const WEATHER: &str = r#"{
        "list": [
            {"dt": 1723464000, "main": {"temp": 27.3, "humidity": 61, "pressure": 1014}, "wind": {"speed": 4.1, "deg": 200}}
        ],
        "city": {"name": "New York"}
    }"#;

    #[test]
    fn joins_weather_on_timestamp() {
        let pollution: PollutionResponse = serde_json::from_str(POLLUTION).unwrap();
        let weather: WeatherResponse = serde_json::from_str(WEATHER).unwrap();
        let entries = join_forecasts(Coordinate::new(40.7128, -74.006), pollution, weather);

        assert_eq!(entries.len(), 2);
        let first = &entries[0];
        assert_eq!(first.timestamp, Some(datetime!(2024-08-12 12:00 UTC)));
        assert_eq!(first.category_index, Some(2));
        assert_eq!(first.components.len(), 7);
        assert_eq!(first.components[2], ("o3".to_string(), Some(68.66)));
        assert_eq!(first.weather.wind_direction, Some(200.0));
        assert_eq!(first.weather.pressure, Some(1014.0));

        // no weather step at this dt, and missing components stay missing
        let second = &entries[1];
        assert!(second.weather.is_empty());
        assert_eq!(second.components[1], ("no2".to_string(), None));
    }

    async fn after<T>(ms: u64, value: Result<T, Error>) -> Result<T, Error> {
        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
        value
    }

    #[tokio::test]
    async fn pollution_and_weather_run_together() {
        let logger = Logger::root(Discard, o!());
        let started = std::time::Instant::now();
        let (pollution, weather) = fetch_both(
            after(200, Ok(serde_json::from_str(POLLUTION).unwrap())),
            after(200, Ok(serde_json::from_str(WEATHER).unwrap())),
            &logger,
        )
        .await
        .unwrap();
        assert!(started.elapsed() < std::time::Duration::from_millis(350));
        assert_eq!(pollution.list.len(), 2);
        assert_eq!(weather.list.len(), 1);
    }

    #[tokio::test]
    async fn weather_failure_keeps_pollution() {
        let logger = Logger::root(Discard, o!());
        let (pollution, weather) = fetch_both(
            after(0, Ok(serde_json::from_str(POLLUTION).unwrap())),
            after::<WeatherResponse>(0, Err(anyhow::anyhow!("HTTP 401"))),
            &logger,
        )
        .await
        .unwrap();
        assert_eq!(pollution.list.len(), 2);
        assert!(weather.list.is_empty());

        let failed = fetch_both(
            after::<PollutionResponse>(0, Err(anyhow::anyhow!("HTTP 429"))),
            after(0, Ok(serde_json::from_str(WEATHER).unwrap())),
            &logger,
        )
        .await;
        assert!(failed.is_err());
    }
}
