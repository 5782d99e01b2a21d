//! Slippy-map tile addressing and the XYZ ↔ TMS row flip.
//! All coordinate math uses f64 for precision.

use crate::error::{AtlasError, Result};

/// Deepest zoom the tile store will address.
pub const MAX_ZOOM: u32 = 30;

/// A tile in the XYZ (zoom/x/y, row 0 at the north edge) addressing scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileAddr {
    pub zoom: u32,
    pub x: u32,
    pub y: u32,
}

impl TileAddr {
    pub fn new(zoom: u32, x: u32, y: u32) -> Self {
        Self { zoom, x, y }
    }

    /// Reject zooms beyond [`MAX_ZOOM`] and columns/rows outside `0..2^z`.
    pub fn validate(&self) -> Result<()> {
        if self.zoom > MAX_ZOOM {
            return Err(AtlasError::invalid(format!("zoom {} exceeds {MAX_ZOOM}", self.zoom)));
        }
        let n = 1u64 << self.zoom;
        if u64::from(self.x) >= n || u64::from(self.y) >= n {
            return Err(AtlasError::invalid(format!(
                "tile {}/{}/{} is outside the {n}x{n} grid",
                self.zoom, self.x, self.y
            )));
        }
        Ok(())
    }

    /// Row in the TMS scheme used by MBTiles (row 0 at the south edge):
    /// `2^z - 1 - y`. The flip is its own inverse.
    pub fn tms_row(&self) -> u32 {
        ((1u64 << self.zoom) - 1 - u64::from(self.y)) as u32
    }

    /// Returns the (min_lat, min_lon, max_lat, max_lon) bounding box for this tile.
    pub fn bounds(&self) -> (f64, f64, f64, f64) {
        let n = (1u64 << self.zoom) as f64;
        let lon_min = (self.x as f64 / n) * 360.0 - 180.0;
        let lon_max = ((self.x + 1) as f64 / n) * 360.0 - 180.0;
        let lat_max = (std::f64::consts::PI * (1.0 - 2.0 * self.y as f64 / n)).sinh().atan().to_degrees();
        let lat_min = (std::f64::consts::PI * (1.0 - 2.0 * (self.y + 1) as f64 / n)).sinh().atan().to_degrees();
        (lat_min, lon_min, lat_max, lon_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tms_flip_roundtrips_every_row() {
        for zoom in 0..=12u32 {
            let n = 1u32 << zoom;
            for y in [0, n / 3, n / 2, n - 1] {
                let addr = TileAddr::new(zoom, 0, y);
                let back = TileAddr::new(zoom, 0, TileAddr::new(zoom, 0, addr.tms_row()).tms_row());
                assert_eq!(back, addr, "zoom {zoom} row {y}");
            }
        }
        assert_eq!(TileAddr::new(0, 0, 0).tms_row(), 0);
        assert_eq!(TileAddr::new(3, 2, 1).tms_row(), 6);
    }

    #[test]
    fn validate_rejects_out_of_grid_addresses() {
        assert!(TileAddr::new(2, 3, 3).validate().is_ok());
        assert!(TileAddr::new(2, 4, 0).validate().is_err());
        assert!(TileAddr::new(2, 0, 4).validate().is_err());
        assert!(TileAddr::new(31, 0, 0).validate().is_err());
    }

    #[test]
    fn bounds_cover_the_expected_quadrant() {
        let (lat_min, lon_min, lat_max, lon_max) = TileAddr::new(1, 1, 1).bounds();
        assert_eq!((lon_min, lon_max), (0.0, 180.0));
        assert!(lat_min < -85.0 && lat_max.abs() < 1e-9);

        // Neighbouring tiles share edges.
        let (_, _, north, _) = TileAddr::new(10, 600, 501).bounds();
        let (south, _, _, _) = TileAddr::new(10, 600, 500).bounds();
        assert_eq!(north, south);
    }
}
