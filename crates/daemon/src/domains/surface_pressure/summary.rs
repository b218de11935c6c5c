use crate::{Provenance, SurfacePressureReading};

/// Convert a pressure value to pascals; `None` for units we do not know
pub fn to_pascals(value: f64, unit: &str) -> Option<f64> {
    match unit.trim() {
        "Pa" | "pa" => Some(value),
        "hPa" | "hpa" | "mb" | "mbar" => Some(value * 100.0),
        "kPa" | "kpa" => Some(value * 1000.0),
        "inHg" | "inhg" => Some(value * 3386.389),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PressureSummary {
    pub total: usize,
    pub observation_points: usize,
    pub forecast_points: usize,
    pub min_hpa: f64,
    pub max_hpa: f64,
    pub avg_hpa: f64,
    pub range_hpa: f64,
}

impl PressureSummary {
    /// `None` when no reading carries a convertible value
    pub fn from_readings(readings: &[SurfacePressureReading]) -> Option<Self> {
        let values: Vec<(Provenance, f64)> = readings
            .iter()
            .filter_map(|r| {
                let pa = to_pascals(r.pressure?, &r.unit)?;
                pa.is_finite().then_some((r.provenance, pa / 100.0))
            })
            .collect();
        if values.is_empty() {
            return None;
        }

        let hpa = values.iter().map(|(_, v)| *v);
        let min_hpa = hpa.clone().fold(f64::INFINITY, f64::min);
        let max_hpa = hpa.clone().fold(f64::NEG_INFINITY, f64::max);
        let avg_hpa = hpa.sum::<f64>() / values.len() as f64;
        let observation_points = values
            .iter()
            .filter(|(p, _)| *p == Provenance::Observation)
            .count();

        Some(Self {
            total: values.len(),
            observation_points,
            forecast_points: values.len() - observation_points,
            min_hpa,
            max_hpa,
            avg_hpa,
            range_hpa: max_hpa - min_hpa,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Coordinate;

    fn reading(pressure: Option<f64>, unit: &str, provenance: Provenance) -> SurfacePressureReading {
        SurfacePressureReading {
            station_id: "KNYC".to_string(),
            coordinate: Coordinate::new(40.78, -73.97),
            timestamp: None,
            pressure,
            unit: unit.to_string(),
            provenance,
            quality_flag: None,
        }
    }

    #[test]
    fn converts_known_units() {
        assert_eq!(to_pascals(1013.25, "hPa"), Some(101_325.0));
        assert_eq!(to_pascals(101_325.0, "Pa"), Some(101_325.0));
        assert!((to_pascals(29.92, "inHg").unwrap() - 101_320.76).abs() < 0.1);
        assert_eq!(to_pascals(1.0, "psi"), None);
    }

    #[test]
    fn summary_in_hectopascals() {
        let readings = vec![
            reading(Some(101_200.0), "Pa", Provenance::Observation),
            reading(Some(1015.0), "hPa", Provenance::Forecast),
            reading(Some(101_300.0), "Pa", Provenance::Observation),
            reading(None, "Pa", Provenance::Observation),
            reading(Some(30.0), "furlongs", Provenance::Forecast),
        ];
        let summary = PressureSummary::from_readings(&readings).unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.observation_points, 2);
        assert_eq!(summary.forecast_points, 1);
        assert!((summary.min_hpa - 1012.0).abs() < 1e-9);
        assert!((summary.max_hpa - 1015.0).abs() < 1e-9);
        assert!((summary.range_hpa - 3.0).abs() < 1e-9);
        assert!((summary.avg_hpa - 1013.333_333).abs() < 1e-5);
    }

    #[test]
    fn empty_summary() {
        assert!(PressureSummary::from_readings(&[]).is_none());
    }
}
