use serde::{Deserialize, Serialize};
use std::fmt;

/// Addressing of a tile in a quadtree-like scheme, packed into a single
/// 64-bit value as `(x:u16, y:u16, z:u16)`.
///
/// Grounded on `original_source/libs/model/include/mapget/model/tileid.h`
/// and `src/tileid.cpp`: construction, accessors and the WGS84 grid math
/// are a direct port of that file's bit layout and `fromWgs84` formula.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TileId(u64);

impl TileId {
    #[must_use]
    pub fn new(x: u16, y: u16, z: u16) -> Self {
        Self(((x as u64) << 32) | ((y as u64) << 16) | (z as u64))
    }

    #[must_use]
    pub fn from_value(value: u64) -> Self {
        Self(value)
    }

    #[must_use]
    pub fn value(&self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn x(&self) -> u16 {
        (self.0 >> 32) as u16
    }

    #[must_use]
    pub fn y(&self) -> u16 {
        ((self.0 >> 16) & 0xFFFF) as u16
    }

    #[must_use]
    pub fn z(&self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    /// Number of columns in the grid at this tile's zoom level: `2^(z+1)`.
    #[must_use]
    pub fn num_cols(&self) -> u32 {
        num_cols(self.z())
    }

    /// Number of rows in the grid at this tile's zoom level: `2^z`.
    #[must_use]
    pub fn num_rows(&self) -> u32 {
        num_rows(self.z())
    }

    /// Build a `TileId` from a WGS84 longitude/latitude at the given zoom
    /// level. Longitude is normalized into `[0, 360)` before gridding;
    /// latitudes beyond the poles are reflected back into range.
    #[must_use]
    pub fn from_wgs84(longitude: f64, latitude: f64, zoom_level: u16) -> Self {
        let mut longitude = longitude.rem_euclid(360.0) + 180.0;
        if longitude >= 360.0 {
            longitude -= 360.0;
        }

        let num_cols = num_cols(zoom_level) as i64;
        let num_rows = num_rows(zoom_level) as i64;

        let mut x = ((longitude / 360.0) * num_cols as f64) as i64;
        let mut y = (((90.0 - latitude) / 180.0) * num_rows as f64) as i64;

        x = x.rem_euclid(num_cols);
        y %= num_rows * 2;
        y = y.abs();

        if y >= num_rows {
            y = num_rows - (y - num_rows) - 1;
        }

        Self::new(x as u16, y as u16, zoom_level)
    }

    /// The WGS84 (longitude, latitude) of this tile's center point, the
    /// round-trip partner of `from_wgs84`.
    #[must_use]
    pub fn center(&self) -> (f64, f64) {
        let num_cols = self.num_cols() as f64;
        let num_rows = self.num_rows() as f64;
        let longitude = ((self.x() as f64 + 0.5) / num_cols) * 360.0 - 180.0;
        let latitude = 90.0 - ((self.y() as f64 + 0.5) / num_rows) * 180.0;
        (longitude, latitude)
    }

    /// Side length in degrees of a tile at this zoom level: `180 / 2^z`.
    #[must_use]
    pub fn side_length_degrees(&self) -> f64 {
        180.0 / (1u64 << self.z()) as f64
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        format!("{:016x}", self.0)
    }
}

fn num_cols(zoom_level: u16) -> u32 {
    1u32 << (zoom_level + 1)
}

fn num_rows(zoom_level: u16) -> u32 {
    1u32 << zoom_level
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z(), self.x(), self.y())
    }
}

impl From<u64> for TileId {
    fn from(value: u64) -> Self {
        Self::from_value(value)
    }
}

impl From<TileId> for u64 {
    fn from(id: TileId) -> Self {
        id.value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_and_unpacks_components() {
        let id = TileId::new(12, 34, 9);
        assert_eq!(id.x(), 12);
        assert_eq!(id.y(), 34);
        assert_eq!(id.z(), 9);
    }

    #[test]
    fn grid_dimensions_follow_zoom() {
        let id = TileId::new(0, 0, 3);
        assert_eq!(id.num_cols(), 16);
        assert_eq!(id.num_rows(), 8);
    }

    #[test]
    fn round_trips_through_center_for_many_tiles() {
        for z in 0..8u16 {
            let num_cols = num_cols(z);
            let num_rows = num_rows(z);
            for x in 0..num_cols {
                for y in 0..num_rows {
                    let id = TileId::new(x as u16, y as u16, z);
                    let (lon, lat) = id.center();
                    let back = TileId::from_wgs84(lon, lat, z);
                    assert_eq!(id, back, "z={z} x={x} y={y} lon={lon} lat={lat}");
                }
            }
        }
    }

    #[test]
    fn normalizes_longitude_wraparound() {
        let a = TileId::from_wgs84(370.0, 10.0, 4);
        let b = TileId::from_wgs84(10.0, 10.0, 4);
        assert_eq!(a, b);
    }

    #[test]
    fn reflects_latitude_beyond_north_pole() {
        // Values beyond the pole should not panic and should stay in-grid.
        let id = TileId::from_wgs84(0.0, 95.0, 4);
        assert!(id.y() < id.num_rows() as u16);
    }
}
