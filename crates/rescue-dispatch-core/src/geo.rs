//! Straight-line geo estimation.
//!
//! Distances are great-circle (haversine) over a spherical earth; ETAs assume a
//! constant average speed. Road routing is deliberately not modelled.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Mean earth radius in meters.
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Meters per degree of latitude (approximate, used only for local offsets).
const METERS_PER_DEGREE: f64 = 111_320.0;

/// Coordinate validation errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeoError {
    #[error("Latitude out of range: {0}")]
    InvalidLatitude(f64),

    #[error("Longitude out of range: {0}")]
    InvalidLongitude(f64),
}

/// A WGS84 coordinate in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    /// Create a validated coordinate.
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, GeoError> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(GeoError::InvalidLatitude(latitude));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(GeoError::InvalidLongitude(longitude));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    /// Re-check a coordinate that may have been deserialized without validation.
    pub fn validated(self) -> Result<Self, GeoError> {
        Self::new(self.latitude, self.longitude)
    }
}

/// Great-circle distance between two coordinates in meters.
#[must_use]
pub fn distance_meters(a: &Coordinate, b: &Coordinate) -> f64 {
    if a == b {
        return 0.0;
    }

    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let delta_lat = (b.latitude - a.latitude).to_radians();
    let delta_lon = (b.longitude - a.longitude).to_radians();

    let h = (delta_lat / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * (delta_lon / 2.0).sin().powi(2);
    // Clamp guards asin against rounding just above 1.0 for antipodal points.
    let c = 2.0 * h.sqrt().min(1.0).asin();

    EARTH_RADIUS_METERS * c
}

/// Travel time in milliseconds for a known distance at `speed_kmh`.
///
/// Returns `f64::INFINITY` when the speed is not positive, so unreachable
/// candidates sort last instead of failing.
#[must_use]
pub fn eta_for_distance(distance_meters: f64, speed_kmh: f64) -> f64 {
    if speed_kmh.is_nan() || speed_kmh <= 0.0 {
        return f64::INFINITY;
    }
    let meters_per_second = speed_kmh * 1000.0 / 3600.0;
    distance_meters / meters_per_second * 1000.0
}

/// Estimated time of arrival in milliseconds from `origin` to `destination`.
#[must_use]
pub fn eta_millis(origin: &Coordinate, destination: &Coordinate, speed_kmh: f64) -> f64 {
    eta_for_distance(distance_meters(origin, destination), speed_kmh)
}

/// Deterministic pseudo-location for something that has no real geocode.
///
/// The point lies within `radius_meters` of `anchor`, at a bearing and distance
/// derived from the SHA-256 of `seed`. The same seed always yields the same point.
#[must_use]
pub fn estimated_coordinate(seed: &str, anchor: &Coordinate, radius_meters: f64) -> Coordinate {
    let digest = Sha256::digest(seed.as_bytes());
    let bearing_bits = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    let distance_bits = u32::from_be_bytes([digest[4], digest[5], digest[6], digest[7]]);

    let bearing = f64::from(bearing_bits) / f64::from(u32::MAX) * std::f64::consts::TAU;
    // sqrt keeps points uniformly spread over the disc rather than bunched at the centre
    let distance = (f64::from(distance_bits) / f64::from(u32::MAX)).sqrt() * radius_meters.max(0.0);

    let delta_lat = distance * bearing.cos() / METERS_PER_DEGREE;
    let lon_scale = (METERS_PER_DEGREE * anchor.latitude.to_radians().cos()).max(1.0);
    let delta_lon = distance * bearing.sin() / lon_scale;

    Coordinate {
        latitude: (anchor.latitude + delta_lat).clamp(-90.0, 90.0),
        longitude: wrap_longitude(anchor.longitude + delta_lon),
    }
}

fn wrap_longitude(lon: f64) -> f64 {
    if (-180.0..=180.0).contains(&lon) {
        lon
    } else {
        (lon + 540.0).rem_euclid(360.0) - 180.0
    }
}
