use serde::{Deserialize, Serialize};

/// Mean Earth radius in meters (spherical approximation)
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.latitude.is_finite() && self.longitude.is_finite()
    }
}

impl std::fmt::Display for Coordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.4}, {:.4})", self.latitude, self.longitude)
    }
}

/// Squared Euclidean distance on raw degrees.
///
/// This is NOT a ground distance: it ignores meridian convergence and is never
/// square-rooted. It is monotonic enough in true distance over sub-continental
/// extents to rank candidates, which is all the nearest-pixel search needs.
pub fn squared_planar_distance(a: Coordinate, b: Coordinate) -> f64 {
    let d_lat = a.latitude - b.latitude;
    let d_lon = a.longitude - b.longitude;
    d_lat * d_lat + d_lon * d_lon
}

/// Great-circle distance in meters (haversine formula)
pub fn haversine_distance(a: Coordinate, b: Coordinate) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let delta_lat = (b.latitude - a.latitude).to_radians();
    let delta_lon = (b.longitude - a.longitude).to_radians();

    let h = (delta_lat / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().min(1.0).asin();

    EARTH_RADIUS_M * c
}

/// Point reached by travelling `distance_m` from `origin` along `bearing_deg`
/// (clockwise from north) on a spherical Earth.
pub fn destination_point(origin: Coordinate, bearing_deg: f64, distance_m: f64) -> Coordinate {
    let lat = origin.latitude.to_radians();
    let lon = origin.longitude.to_radians();
    let bearing = bearing_deg.to_radians();
    let angular = distance_m / EARTH_RADIUS_M;

    let lat2 = (lat.sin() * angular.cos() + lat.cos() * angular.sin() * bearing.cos()).asin();
    let lon2 = lon
        + (bearing.sin() * angular.sin() * lat.cos()).atan2(angular.cos() - lat.sin() * lat2.sin());

    // keep longitude in [-180, 180)
    let lon2 = (lon2.to_degrees() + 540.0).rem_euclid(360.0) - 180.0;
    Coordinate::new(lat2.to_degrees(), lon2)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
}

impl BoundingBox {
    pub fn new(north: f64, south: f64, east: f64, west: f64) -> Self {
        Self {
            north,
            south,
            east,
            west,
        }
    }

    /// Smallest box holding every finite point, `None` if there are none
    pub fn from_points(points: impl IntoIterator<Item = Coordinate>) -> Option<Self> {
        let mut bounds: Option<BoundingBox> = None;
        for point in points.into_iter().filter(Coordinate::is_finite) {
            let b = bounds.get_or_insert(BoundingBox::new(
                point.latitude,
                point.latitude,
                point.longitude,
                point.longitude,
            ));
            b.north = b.north.max(point.latitude);
            b.south = b.south.min(point.latitude);
            b.east = b.east.max(point.longitude);
            b.west = b.west.min(point.longitude);
        }
        bounds
    }

    /// Box of `margin_deg` degrees around a single point
    pub fn around(center: Coordinate, margin_deg: f64) -> Self {
        Self::new(
            center.latitude + margin_deg,
            center.latitude - margin_deg,
            center.longitude + margin_deg,
            center.longitude - margin_deg,
        )
    }

    pub fn contains(&self, point: Coordinate) -> bool {
        point.latitude <= self.north
            && point.latitude >= self.south
            && point.longitude <= self.east
            && point.longitude >= self.west
    }

    pub fn expand(&self, margin_deg: f64) -> Self {
        Self::new(
            self.north + margin_deg,
            self.south - margin_deg,
            self.east + margin_deg,
            self.west - margin_deg,
        )
    }

    pub fn is_valid(&self) -> bool {
        [self.north, self.south, self.east, self.west]
            .iter()
            .all(|v| v.is_finite())
            && self.north >= self.south
            && self.east >= self.west
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NYC: Coordinate = Coordinate {
        latitude: 40.7128,
        longitude: -74.0060,
    };

    #[test]
    fn test_haversine_distance() {
        let london = Coordinate::new(51.5074, -0.1278);
        let paris = Coordinate::new(48.8566, 2.3522);
        let distance_km = haversine_distance(london, paris) / 1000.0;
        assert!((distance_km - 343.5).abs() < 5.0, "got {distance_km}");
    }

    #[test]
    fn test_haversine_distance_same_point() {
        assert!(haversine_distance(NYC, NYC).abs() < 1e-9);
    }

    #[test]
    fn planar_distance_orders_like_ground_distance_locally() {
        let near = Coordinate::new(40.72, -74.00);
        let far = Coordinate::new(40.90, -73.70);
        assert!(squared_planar_distance(NYC, near) < squared_planar_distance(NYC, far));
        assert!(haversine_distance(NYC, near) < haversine_distance(NYC, far));
    }

    #[test]
    fn destination_point_travels_requested_distance() {
        for bearing in [0.0, 45.0, 90.0, 180.0, 270.0, 333.0] {
            let dest = destination_point(NYC, bearing, 50_000.0);
            let back = haversine_distance(NYC, dest);
            assert!((back - 50_000.0).abs() < 1.0, "bearing {bearing}: {back}");
        }
    }

    #[test]
    fn destination_point_north_increases_latitude() {
        let dest = destination_point(NYC, 0.0, 10_000.0);
        assert!(dest.latitude > NYC.latitude);
        assert!((dest.longitude - NYC.longitude).abs() < 1e-9);
    }

    #[test]
    fn bounding_box_from_points_skips_nan() {
        let bbox = BoundingBox::from_points([
            Coordinate::new(40.5, -74.3),
            Coordinate::new(f64::NAN, 0.0),
            Coordinate::new(40.9, -73.7),
        ])
        .unwrap();
        assert_eq!(bbox, BoundingBox::new(40.9, 40.5, -73.7, -74.3));
        assert!(bbox.contains(NYC));
        assert!(!bbox.contains(Coordinate::new(34.05, -118.24)));
    }

    #[test]
    fn bounding_box_of_nothing_is_none() {
        assert!(BoundingBox::from_points(Vec::new()).is_none());
    }
}
