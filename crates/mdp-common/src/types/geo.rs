//! Geographic helpers

use crate::error::{MdpError, Result};
use serde::{Deserialize, Serialize};

/// Mean Earth radius used for great-circle distances
pub const EARTH_RADIUS_KM: f64 = 6371.0088;

/// Axis-aligned query region in decimal degrees
///
/// Regions crossing the antimeridian are not supported; split them into two
/// sources instead.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub west: f64,
    pub east: f64,
    pub south: f64,
    pub north: f64,
}

impl BoundingBox {
    pub fn new(west: f64, east: f64, south: f64, north: f64) -> Self {
        Self {
            west,
            east,
            south,
            north,
        }
    }

    /// The whole globe
    pub fn world() -> Self {
        Self::new(-180.0, 180.0, -90.0, 90.0)
    }

    pub fn validate(&self) -> Result<()> {
        if !(-180.0..=180.0).contains(&self.west) || !(-180.0..=180.0).contains(&self.east) {
            return Err(MdpError::InvalidBoundingBox(format!(
                "longitudes must be within [-180, 180], got west={} east={}",
                self.west, self.east
            )));
        }
        if !(-90.0..=90.0).contains(&self.south) || !(-90.0..=90.0).contains(&self.north) {
            return Err(MdpError::InvalidBoundingBox(format!(
                "latitudes must be within [-90, 90], got south={} north={}",
                self.south, self.north
            )));
        }
        if self.west >= self.east {
            return Err(MdpError::InvalidBoundingBox(format!(
                "west ({}) must be less than east ({})",
                self.west, self.east
            )));
        }
        if self.south >= self.north {
            return Err(MdpError::InvalidBoundingBox(format!(
                "south ({}) must be less than north ({})",
                self.south, self.north
            )));
        }
        Ok(())
    }

    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        (self.south..=self.north).contains(&latitude) && (self.west..=self.east).contains(&longitude)
    }

    /// Closed ring of `[lon, lat]` corners, counter-clockwise from south-west
    pub fn ring(&self) -> [[f64; 2]; 5] {
        [
            [self.west, self.south],
            [self.east, self.south],
            [self.east, self.north],
            [self.west, self.north],
            [self.west, self.south],
        ]
    }

    /// Well-known-text polygon, as accepted by OBIS-style `geometry` parameters
    pub fn to_wkt(&self) -> String {
        let points: Vec<String> = self
            .ring()
            .iter()
            .map(|[lon, lat]| format!("{} {}", lon, lat))
            .collect();
        format!("POLYGON(({}))", points.join(","))
    }
}

/// Great-circle distance between two points in kilometres
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let a = a.clamp(0.0, 1.0);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_bbox_validation() {
        assert!(BoundingBox::new(-150.0, -120.0, 20.0, 50.0).validate().is_ok());
        assert!(BoundingBox::world().validate().is_ok());
        assert!(BoundingBox::new(-120.0, -150.0, 20.0, 50.0).validate().is_err());
        assert!(BoundingBox::new(-150.0, -120.0, 50.0, 20.0).validate().is_err());
        assert!(BoundingBox::new(-190.0, -120.0, 20.0, 50.0).validate().is_err());
        assert!(BoundingBox::new(-150.0, -120.0, 20.0, 95.0).validate().is_err());
    }

    #[test]
    fn test_bbox_wkt_includes_all_corners() {
        let bbox = BoundingBox::new(-150.0, -120.0, 20.0, 50.0);
        let wkt = bbox.to_wkt();
        assert_eq!(
            wkt,
            "POLYGON((-150 20,-120 20,-120 50,-150 50,-150 20))"
        );
    }

    #[test]
    fn test_bbox_contains() {
        let bbox = BoundingBox::new(-150.0, -120.0, 20.0, 50.0);
        assert!(bbox.contains(30.5, -140.2));
        assert!(!bbox.contains(10.0, -140.2));
    }

    #[test]
    fn test_haversine_known_distance() {
        // One degree of latitude is roughly 111.2 km
        let d = haversine_km(0.0, 0.0, 1.0, 0.0);
        assert!((d - 111.19).abs() < 0.1, "got {}", d);
        assert!(haversine_km(45.0, -120.0, 45.0, -120.0).abs() < 1e-9);
    }

    proptest::proptest! {
        #[test]
        fn haversine_is_symmetric_and_bounded(
            lat1 in -90.0f64..=90.0, lon1 in -180.0f64..=180.0,
            lat2 in -90.0f64..=90.0, lon2 in -180.0f64..=180.0
        ) {
            let d = haversine_km(lat1, lon1, lat2, lon2);
            proptest::prop_assert!(d >= 0.0);
            proptest::prop_assert!(d <= std::f64::consts::PI * EARTH_RADIUS_KM + 1e-6);
            proptest::prop_assert!((d - haversine_km(lat2, lon2, lat1, lon1)).abs() < 1e-6);
        }
    }
}
