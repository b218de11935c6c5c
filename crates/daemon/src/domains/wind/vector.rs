use serde::{Deserialize, Serialize};

/// Split a meteorological wind (speed, compass bearing) into east/north components
pub fn decompose(speed: f64, direction_deg: f64) -> (f64, f64) {
    let rad = direction_deg.to_radians();
    (speed * rad.sin(), speed * rad.cos())
}

/// Inverse of [`decompose`]; the direction is normalized into [0, 360)
pub fn compose(u: f64, v: f64) -> (f64, f64) {
    let speed = u.hypot(v);
    let mut direction = u.atan2(v).to_degrees().rem_euclid(360.0);
    if direction >= 360.0 {
        direction = 0.0;
    }
    (speed, direction)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindProvenance {
    ModelDerived,
    Synthesized,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindVector {
    pub latitude: f64,
    pub longitude: f64,
    pub u: f64,
    pub v: f64,
    pub speed: f64,
    pub direction: f64,
    pub provenance: WindProvenance,
}

impl WindVector {
    pub fn from_components(
        latitude: f64,
        longitude: f64,
        u: f64,
        v: f64,
        provenance: WindProvenance,
    ) -> Self {
        let (speed, direction) = compose(u, v);
        Self {
            latitude,
            longitude,
            u,
            v,
            speed,
            direction,
            provenance,
        }
    }
}
