use std::{fs::File, io::BufWriter, path::Path};

use air_fusion_core::{replace_file, sibling_temp_path};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use slog::{debug, Logger};

use crate::{
    decompose, squared_planar_distance, BoundingBox, CanonicalRecord, Coordinate, WindProvenance,
    WindVector,
};

#[derive(thiserror::Error, Debug)]
pub enum WindFieldError {
    #[error("invalid bounding box {0:?}")]
    InvalidBounds(BoundingBox),
    #[error("wind jitter must be a finite fraction, got {0}")]
    InvalidJitter(f64),
    #[error("failed to write wind field: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode wind field: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindFieldConfig {
    /// Points per axis
    pub grid_size: usize,
    /// Relative perturbation applied to model-derived components
    pub jitter: f64,
    pub seed: Option<u64>,
}

impl Default for WindFieldConfig {
    fn default() -> Self {
        Self {
            grid_size: 12,
            jitter: 0.2,
            seed: None,
        }
    }
}

/// A wind estimate at one location, from a forecast model or the NOAA hourly feed
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelWindPoint {
    pub coordinate: Coordinate,
    /// m/s
    pub speed: f64,
    /// degrees, meteorological convention
    pub direction: f64,
}

impl ModelWindPoint {
    pub fn from_record(record: &CanonicalRecord) -> Option<Self> {
        let speed = record.weather.wind_speed?;
        let direction = record.weather.wind_direction?;
        let point = Self {
            coordinate: record.coordinate(),
            speed,
            direction,
        };
        (speed.is_finite() && direction.is_finite() && point.coordinate.is_finite())
            .then_some(point)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindField {
    pub bbox: BoundingBox,
    pub provenance: WindProvenance,
    pub vectors: Vec<WindVector>,
}

impl WindField {
    pub fn write_json(&self, path: &Path) -> Result<(), WindFieldError> {
        let temp = sibling_temp_path(path);
        {
            let file = File::create(&temp)?;
            serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        }
        replace_file(&temp, path)?;
        Ok(())
    }
}

pub struct WindFieldSynthesizer {
    config: WindFieldConfig,
    logger: Logger,
}

impl WindFieldSynthesizer {
    pub fn new(config: WindFieldConfig, logger: Logger) -> Self {
        Self { config, logger }
    }

    fn rng(&self) -> StdRng {
        match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    fn grid(&self, bbox: &BoundingBox) -> Vec<Coordinate> {
        let n = self.config.grid_size.max(1);
        let step = |low: f64, high: f64, i: usize| {
            if n == 1 {
                (low + high) / 2.0
            } else {
                low + (high - low) * i as f64 / (n - 1) as f64
            }
        };
        let mut points = Vec::with_capacity(n * n);
        for i in 0..n {
            for j in 0..n {
                points.push(Coordinate::new(
                    step(bbox.south, bbox.north, i),
                    step(bbox.west, bbox.east, j),
                ));
            }
        }
        points
    }

    /// Wind vectors on a regular grid over `bbox`.
    ///
    /// With model points every grid point copies its nearest model wind and
    /// scales u and v independently by a factor in `[1 - jitter, 1 + jitter]`.
    /// Without any, a prevailing westerly is simulated and the field is
    /// marked synthesized.
    pub fn synthesize(
        &self,
        bbox: BoundingBox,
        model_points: &[ModelWindPoint],
    ) -> Result<WindField, WindFieldError> {
        if !bbox.is_valid() {
            return Err(WindFieldError::InvalidBounds(bbox));
        }
        if !self.config.jitter.is_finite() {
            return Err(WindFieldError::InvalidJitter(self.config.jitter));
        }
        let mut rng = self.rng();
        let grid = self.grid(&bbox);

        let usable: Vec<(Coordinate, (f64, f64))> = model_points
            .iter()
            .filter(|p| p.coordinate.is_finite() && p.speed.is_finite() && p.direction.is_finite())
            .map(|p| (p.coordinate, decompose(p.speed, p.direction)))
            .collect();

        if usable.is_empty() {
            debug!(self.logger, "no model wind, synthesizing {} points", grid.len());
            let vectors = grid
                .into_iter()
                .map(|c| {
                    let u = rng.gen_range(1.0..=14.0);
                    let v = rng.gen_range(-6.0..=6.0);
                    WindVector::from_components(
                        c.latitude,
                        c.longitude,
                        u,
                        v,
                        WindProvenance::Synthesized,
                    )
                })
                .collect();
            return Ok(WindField {
                bbox,
                provenance: WindProvenance::Synthesized,
                vectors,
            });
        }

        let jitter = self.config.jitter.clamp(0.0, 1.0);
        let vectors = grid
            .into_iter()
            .map(|c| {
                let mut nearest = &usable[0];
                let mut best = squared_planar_distance(c, nearest.0);
                for candidate in &usable[1..] {
                    let d = squared_planar_distance(c, candidate.0);
                    if d < best {
                        best = d;
                        nearest = candidate;
                    }
                }
                let (u, v) = nearest.1;
                let u = u * rng.gen_range(1.0 - jitter..=1.0 + jitter);
                let v = v * rng.gen_range(1.0 - jitter..=1.0 + jitter);
                WindVector::from_components(
                    c.latitude,
                    c.longitude,
                    u,
                    v,
                    WindProvenance::ModelDerived,
                )
            })
            .collect();
        debug!(
            self.logger,
            "wind field from {} model points", usable.len()
        );
        Ok(WindField {
            bbox,
            provenance: WindProvenance::ModelDerived,
            vectors,
        })
    }
}
