//! Bathymetric depth bounds

use crate::config::{DepthRegion, ValidationConfig};

/// Maximum plausible depth at a location
pub trait DepthBounds: Send + Sync {
    /// Deepest plausible depth in meters, `None` when unknown
    fn max_depth_m(&self, latitude: f64, longitude: f64) -> Option<f64>;
}

/// Global ocean maximum refined by configured regional boxes
///
/// The first region containing the point wins.
#[derive(Debug, Clone)]
pub struct RegionalDepthBounds {
    global_max_m: f64,
    regions: Vec<DepthRegion>,
}

impl RegionalDepthBounds {
    pub fn new(global_max_m: f64, regions: Vec<DepthRegion>) -> Self {
        Self {
            global_max_m,
            regions,
        }
    }

    pub fn from_config(config: &ValidationConfig) -> Self {
        Self::new(config.max_ocean_depth_m, config.depth_regions.clone())
    }
}

impl DepthBounds for RegionalDepthBounds {
    fn max_depth_m(&self, latitude: f64, longitude: f64) -> Option<f64> {
        let bound = self
            .regions
            .iter()
            .find(|region| region.bbox.contains(latitude, longitude))
            .map_or(self.global_max_m, |region| region.max_depth_m);
        Some(bound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdp_common::types::BoundingBox;

    #[test]
    fn test_region_overrides_global() {
        let bounds = RegionalDepthBounds::new(
            11_034.0,
            vec![DepthRegion {
                name: "north-sea".to_string(),
                bbox: BoundingBox::new(-4.0, 9.0, 51.0, 61.0),
                max_depth_m: 725.0,
            }],
        );
        assert_eq!(bounds.max_depth_m(56.0, 3.0), Some(725.0));
        assert_eq!(bounds.max_depth_m(30.0, -140.0), Some(11_034.0));
    }
}
