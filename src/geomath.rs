//! Great-circle distances, local planar projection and bounding boxes.
//!
//! All geographic points use `geo::Point` with `x = longitude` and
//! `y = latitude`, in degrees.

use geo::{Distance, Haversine, Point};

use crate::QUERY_PADDING_METERS;

/// Meters per degree of latitude (and of longitude at the equator).
pub const LAT_METERS_PER_DEGREE: f64 = 111_320.0;

// Floor for the cosine longitude scale, avoids blowups near the poles.
const MIN_LON_SCALE: f64 = 0.2;

/// Great-circle distance between two geographic points, in meters.
pub fn haversine_meters(a: Point<f64>, b: Point<f64>) -> f64 {
    Haversine.distance(a, b)
}

/// Meters per degree of longitude at the given latitude.
pub fn meters_per_lon_degree(latitude: f64) -> f64 {
    LAT_METERS_PER_DEGREE * latitude.to_radians().cos().max(MIN_LON_SCALE)
}

/// Geographic bounding box in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub south: f64,
    pub west: f64,
    pub north: f64,
    pub east: f64,
}

/// Bounding box around `center` covering `radius_meters` of walking range,
/// expanded by the query padding margin so polygons are not clipped at the
/// network fetch boundary.
pub fn bounding_box(center: Point<f64>, radius_meters: f64) -> BoundingBox {
    let radius = radius_meters + QUERY_PADDING_METERS;
    let lat_delta = radius / LAT_METERS_PER_DEGREE;
    let lon_delta = radius / meters_per_lon_degree(center.y());

    BoundingBox {
        south: center.y() - lat_delta,
        west: center.x() - lon_delta,
        north: center.y() + lat_delta,
        east: center.x() + lon_delta,
    }
}

/// Planar meter coordinates centered on a reference point.
///
/// Hull fitting runs in this local frame to avoid longitude distortion;
/// accurate to well under a meter at walkshed scale.
#[derive(Debug, Clone, Copy)]
pub struct LocalProjection {
    center_lat: f64,
    center_lon: f64,
    meters_per_lon: f64,
}

impl LocalProjection {
    pub fn new(center: Point<f64>) -> Self {
        Self {
            center_lat: center.y(),
            center_lon: center.x(),
            meters_per_lon: meters_per_lon_degree(center.y()),
        }
    }

    pub fn to_local(&self, point: Point<f64>) -> [f64; 2] {
        [
            (point.x() - self.center_lon) * self.meters_per_lon,
            (point.y() - self.center_lat) * LAT_METERS_PER_DEGREE,
        ]
    }

    pub fn from_local(&self, local: [f64; 2]) -> Point<f64> {
        Point::new(
            self.center_lon + local[0] / self.meters_per_lon,
            self.center_lat + local[1] / LAT_METERS_PER_DEGREE,
        )
    }
}
