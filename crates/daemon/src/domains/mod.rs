mod forecasts;
mod ground_stations;
mod normalize;
mod records;
mod satellite;
mod surface_pressure;
mod wind;

pub use forecasts::*;
pub use ground_stations::*;
pub use normalize::*;
pub use records::*;
pub use satellite::*;
pub use surface_pressure::*;
pub use wind::*;

use async_trait::async_trait;

use crate::Coordinate;

/// The independent upstreams fetched each cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    GroundStations,
    Satellite,
    Forecast,
    SurfacePressure,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SourceKind::GroundStations => "ground stations",
            SourceKind::Satellite => "satellite",
            SourceKind::Forecast => "forecast",
            SourceKind::SurfacePressure => "surface pressure",
        };
        f.write_str(name)
    }
}

/// What one fetch cycle asks every source for
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FetchTarget {
    pub center: Coordinate,
    pub radius_m: f64,
    pub hours_back: u32,
    pub hours_forward: u32,
}

impl FetchTarget {
    pub fn new(center: Coordinate, radius_m: f64) -> Self {
        Self {
            center,
            radius_m,
            hours_back: 24,
            hours_forward: 24,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObservationSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    async fn fetch(&self, target: &FetchTarget) -> Result<Vec<RawObservation>, anyhow::Error>;
}
