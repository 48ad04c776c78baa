//! Geographic primitives
//!
//! Great-circle math on WGS84 coordinates plus the corridor geometry used
//! to pre-position cached copies along a recipient's path.

mod corridor;

pub use corridor::Corridor;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Mean Earth radius in metres
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Debug, Error, PartialEq)]
pub enum GeoError {
    #[error("Latitude out of range: {0}")]
    InvalidLatitude(f64),

    #[error("Longitude out of range: {0}")]
    InvalidLongitude(f64),
}

/// A point on the Earth's surface in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinate {
    pub const fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Reject NaN and out-of-range components
    pub fn validate(&self) -> Result<(), GeoError> {
        if !self.lat.is_finite() || !(-90.0..=90.0).contains(&self.lat) {
            return Err(GeoError::InvalidLatitude(self.lat));
        }
        if !self.lon.is_finite() || !(-180.0..=180.0).contains(&self.lon) {
            return Err(GeoError::InvalidLongitude(self.lon));
        }
        Ok(())
    }

    /// Longitude difference `other - self`, wrapped into [-180, 180)
    pub fn lon_delta_to(&self, other: &Coordinate) -> f64 {
        (other.lon - self.lon + 540.0).rem_euclid(360.0) - 180.0
    }

    /// Haversine distance in metres
    pub fn distance_to(&self, other: &Coordinate) -> f64 {
        let phi1 = self.lat.to_radians();
        let phi2 = other.lat.to_radians();
        let d_phi = (other.lat - self.lat).to_radians();
        let d_lambda = (other.lon - self.lon).to_radians();

        let a = (d_phi / 2.0).sin().powi(2)
            + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

        EARTH_RADIUS_M * c
    }

    /// Initial bearing towards `other`, degrees clockwise from north
    pub fn bearing_to(&self, other: &Coordinate) -> f64 {
        let phi1 = self.lat.to_radians();
        let phi2 = other.lat.to_radians();
        let d_lambda = (other.lon - self.lon).to_radians();

        let y = d_lambda.sin() * phi2.cos();
        let x = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * d_lambda.cos();

        (y.atan2(x).to_degrees() + 360.0) % 360.0
    }

    /// Point reached after travelling `distance_m` along `bearing_deg`
    pub fn destination(&self, bearing_deg: f64, distance_m: f64) -> Coordinate {
        let delta = distance_m / EARTH_RADIUS_M;
        let theta = bearing_deg.to_radians();
        let phi1 = self.lat.to_radians();
        let lambda1 = self.lon.to_radians();

        let phi2 = (phi1.sin() * delta.cos() + phi1.cos() * delta.sin() * theta.cos()).asin();
        let lambda2 = lambda1
            + (theta.sin() * delta.sin() * phi1.cos()).atan2(delta.cos() - phi1.sin() * phi2.sin());

        let lon = (lambda2.to_degrees() + 540.0) % 360.0 - 180.0;
        Coordinate::new(phi2.to_degrees(), lon)
    }
}

/// Axis-aligned lat/lon box used to prefilter proximity queries
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    /// Smallest box containing every point within `radius_m` of `center`
    pub fn around(center: &Coordinate, radius_m: f64) -> Self {
        let lat_delta = (radius_m / EARTH_RADIUS_M).to_degrees();
        let cos_lat = center.lat.to_radians().cos().abs();

        // Near the poles every longitude is within reach
        let lon_delta = if cos_lat < 1e-6 {
            180.0
        } else {
            (lat_delta / cos_lat).min(180.0)
        };

        // a box spilling over the antimeridian covers every longitude
        let (min_lon, max_lon) = if center.lon - lon_delta < -180.0 || center.lon + lon_delta > 180.0 {
            (-180.0, 180.0)
        } else {
            (center.lon - lon_delta, center.lon + lon_delta)
        };

        Self {
            min_lat: (center.lat - lat_delta).max(-90.0),
            max_lat: (center.lat + lat_delta).min(90.0),
            min_lon,
            max_lon,
        }
    }

    /// Grow the box to include another box
    pub fn union(&self, other: &BoundingBox) -> Self {
        Self {
            min_lat: self.min_lat.min(other.min_lat),
            max_lat: self.max_lat.max(other.max_lat),
            min_lon: self.min_lon.min(other.min_lon),
            max_lon: self.max_lon.max(other.max_lon),
        }
    }

    pub fn contains(&self, point: &Coordinate) -> bool {
        (self.min_lat..=self.max_lat).contains(&point.lat)
            && (self.min_lon..=self.max_lon).contains(&point.lon)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_known_pair() {
        // Paris to London, roughly 344 km
        let paris = Coordinate::new(48.8566, 2.3522);
        let london = Coordinate::new(51.5074, -0.1278);
        let d = paris.distance_to(&london);
        assert!((d - 343_500.0).abs() < 2_000.0, "distance was {d}");
    }

    #[test]
    fn test_distance_is_zero_for_same_point() {
        let p = Coordinate::new(10.0, 20.0);
        assert!(p.distance_to(&p) < 1e-6);
    }

    #[test]
    fn test_destination_roundtrips_distance_and_bearing() {
        let origin = Coordinate::new(40.0, -74.0);
        let dest = origin.destination(90.0, 1_000.0);

        assert!((origin.distance_to(&dest) - 1_000.0).abs() < 1.0);
        assert!((origin.bearing_to(&dest) - 90.0).abs() < 0.5);
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        assert!(Coordinate::new(91.0, 0.0).validate().is_err());
        assert!(Coordinate::new(0.0, -181.0).validate().is_err());
        assert!(Coordinate::new(f64::NAN, 0.0).validate().is_err());
        assert!(Coordinate::new(-33.9, 151.2).validate().is_ok());
    }

    #[test]
    fn test_bounding_box_contains_radius() {
        let center = Coordinate::new(37.77, -122.42);
        let bbox = BoundingBox::around(&center, 2_000.0);

        for bearing in [0.0, 45.0, 90.0, 180.0, 270.0] {
            let edge = center.destination(bearing, 1_999.0);
            assert!(bbox.contains(&edge), "bearing {bearing} fell outside");
        }
        assert!(!bbox.contains(&center.destination(0.0, 5_000.0)));
    }

    #[test]
    fn test_bounding_box_across_antimeridian() {
        let east = Coordinate::new(-16.5, 179.99);
        let west = Coordinate::new(-16.5, -179.99);
        assert!(east.distance_to(&west) < 2_500.0);

        let bbox = BoundingBox::around(&east, 5_000.0);
        assert!(bbox.contains(&west));
        assert!(BoundingBox::around(&west, 5_000.0).contains(&east));

        // away from the antimeridian the box stays tight
        let inland = BoundingBox::around(&Coordinate::new(-16.5, 178.0), 5_000.0);
        assert!(!inland.contains(&west));
    }

    #[test]
    fn test_lon_delta_wraps() {
        let east = Coordinate::new(0.0, 179.5);
        let west = Coordinate::new(0.0, -179.5);
        assert!((east.lon_delta_to(&west) - 1.0).abs() < 1e-9);
        assert!((west.lon_delta_to(&east) + 1.0).abs() < 1e-9);
        assert!((Coordinate::new(0.0, 10.0).lon_delta_to(&Coordinate::new(0.0, 30.0)) - 20.0).abs() < 1e-9);
    }
}
