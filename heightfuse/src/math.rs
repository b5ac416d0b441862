//! Geodesy helpers.
//!
//! Distances are great-circle (haversine) distances on a sphere with
//! the same mean radius [geo] uses, so a distance computed here agrees
//! with `geo::HaversineDistance`.
//!
//! [geo]: https://github.com/georust/geo

use geo::{HaversineDistance, Point};

/// Mean earth radius in meters.
pub const MEAN_EARTH_RADIUS: f64 = 6_371_008.8;

/// Great-circle distance between `a` and `b` in meters.
pub fn distance_m(a: Point<f64>, b: Point<f64>) -> f64 {
    a.haversine_distance(&b)
}

/// Degrees of latitude spanned by `meters` along a meridian.
///
/// Since a great-circle distance is never shorter than the meridian
/// distance between the two latitudes, two points further apart in
/// latitude than this are also further apart than `meters`.
pub fn meters_to_lat_deg(meters: f64) -> f64 {
    (meters / MEAN_EARTH_RADIUS).to_degrees()
}

/// Meters spanned by `degrees` of latitude along a meridian.
pub fn lat_deg_to_meters(degrees: f64) -> f64 {
    degrees.to_radians() * MEAN_EARTH_RADIUS
}

/// Shortest great-circle distance in meters from a point at `lat` to a
/// meridian `dlon` degrees of longitude away.
///
/// Shorter than the distance along the parallel, the more so the
/// further from the equator.
pub fn meridian_distance_m(lat: f64, dlon: f64) -> f64 {
    let dlon = dlon.abs().min(90.0).to_radians();
    (lat.to_radians().cos() * dlon.sin()).asin() * MEAN_EARTH_RADIUS
}

/// Wraps a longitude (or longitude difference) into `[-180, 180)`.
pub fn wrap_lon(lon: f64) -> f64 {
    (lon + 180.0).rem_euclid(360.0) - 180.0
}

/// Weighted running mean of locations.
///
/// Longitudes are accumulated as offsets from the first location so
/// that points straddling the antimeridian average to a point next to
/// them instead of one on the far side of the planet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Centroid {
    anchor_lon: f64,
    weight: f64,
    lat_sum: f64,
    dlon_sum: f64,
}

impl Centroid {
    pub fn new(point: Point<f64>, weight: f64) -> Self {
        Self {
            anchor_lon: point.x(),
            weight,
            lat_sum: point.y() * weight,
            dlon_sum: 0.0,
        }
    }

    /// Returns the centroid which would result from adding `point`.
    #[must_use]
    pub fn with(&self, point: Point<f64>, weight: f64) -> Self {
        Self {
            anchor_lon: self.anchor_lon,
            weight: self.weight + weight,
            lat_sum: self.lat_sum + point.y() * weight,
            dlon_sum: self.dlon_sum + wrap_lon(point.x() - self.anchor_lon) * weight,
        }
    }

    pub fn point(&self) -> Point<f64> {
        let lat = self.lat_sum / self.weight;
        let lon = wrap_lon(self.anchor_lon + self.dlon_sum / self.weight);
        Point::new(lon, lat)
    }
}
