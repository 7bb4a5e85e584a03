use crate::error::{Error, Result};
use crate::model::pool::NodeAddress;
use crate::model::string_pool::StringId;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GeometryType {
    Points,
    Line,
    Polygon,
    Mesh,
}

/// A single WGS84 + elevation point.
pub type Point3 = (f64, f64, f64);

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A geometry's own vertex storage: a double-precision anchor plus `f32`
/// deltas, the quantization scheme from §4.3.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PointBufferRow {
    pub offset: Option<Point3>,
    pub deltas: Vec<(f32, f32, f32)>,
}

impl PointBufferRow {
    pub fn append(&mut self, p: Point3) {
        match self.offset {
            None => self.offset = Some(p),
            Some(o) => self.deltas.push((
                (p.0 - o.0) as f32,
                (p.1 - o.1) as f32,
                (p.2 - o.2) as f32,
            )),
        }
    }

    #[must_use]
    pub fn num_points(&self) -> usize {
        if self.offset.is_some() {
            self.deltas.len() + 1
        } else {
            0
        }
    }

    #[must_use]
    pub fn point_at(&self, i: usize) -> Option<Point3> {
        let offset = self.offset?;
        if i == 0 {
            return Some(offset);
        }
        let d = self.deltas.get(i - 1)?;
        Some((offset.0 + d.0 as f64, offset.1 + d.1 as f64, offset.2 + d.2 as f64))
    }

    pub fn points(&self) -> impl Iterator<Item = Point3> + '_ {
        (0..self.num_points()).map(move |i| self.point_at(i).unwrap())
    }
}

fn haversine_m(a: Point3, b: Point3) -> f64 {
    let (lon1, lat1) = (a.0.to_radians(), a.1.to_radians());
    let (lon2, lat2) = (b.0.to_radians(), b.1.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

/// Either a directly owned vertex buffer, or a view into another geometry's
/// buffer: `(baseAddress, offset, size, typeOverride)`. Views resolve
/// transitively, so `resolved_base` walks the chain.
#[derive(Clone, Debug, PartialEq)]
pub struct GeometryView {
    pub base: NodeAddress,
    pub offset: usize,
    pub size: usize,
    pub type_override: Option<GeometryType>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GeometryRow {
    pub geometry_type: GeometryType,
    pub buffer: Option<PointBufferRow>,
    pub view: Option<GeometryView>,
    /// Address of a `PolygonRow` when this is a ring-structured polygon
    /// (as opposed to a flat-buffer owned geometry or a view).
    pub polygon: Option<NodeAddress>,
    pub name: Option<StringId>,
    pub source_data: Option<NodeAddress>,
}

impl GeometryRow {
    #[must_use]
    pub fn owned(geometry_type: GeometryType) -> Self {
        Self {
            geometry_type,
            buffer: Some(PointBufferRow::default()),
            view: None,
            polygon: None,
            name: None,
            source_data: None,
        }
    }

    #[must_use]
    pub fn view(base: NodeAddress, offset: usize, size: usize, type_override: Option<GeometryType>) -> Self {
        Self {
            geometry_type: type_override.unwrap_or(GeometryType::Line),
            buffer: None,
            view: Some(GeometryView {
                base,
                offset,
                size,
                type_override,
            }),
            polygon: None,
            name: None,
            source_data: None,
        }
    }

    /// A polygon backed by a `PolygonRow` of rings, each with its own
    /// point buffer and stored orientation.
    #[must_use]
    pub fn polygon(polygon: NodeAddress) -> Self {
        Self {
            geometry_type: GeometryType::Polygon,
            buffer: None,
            view: None,
            polygon: Some(polygon),
            name: None,
            source_data: None,
        }
    }

    pub fn append(&mut self, p: Point3) -> Result<()> {
        match &mut self.buffer {
            Some(buf) => {
                buf.append(p);
                Ok(())
            }
            None => Err(Error::Contract("cannot append to a geometry view or ring-structured polygon".to_string())),
        }
    }
}

/// Signed area of a ring via the shoelace formula over `(lon, lat)`;
/// positive for CCW, negative for CW.
#[must_use]
pub fn ring_signed_area(points: &[Point3]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut area = 0.0;
    for w in points.windows(2) {
        area += w[0].0 * w[1].1 - w[1].0 * w[0].1;
    }
    let (first, last) = (points[0], *points.last().unwrap());
    area += last.0 * first.1 - first.0 * last.1;
    area / 2.0
}

/// Repeats the first point as the last if the ring isn't already closed,
/// without mutating stored data (§4.3: "open rings are auto-closed on
/// iteration, without mutation").
pub fn close_ring(points: &mut Vec<Point3>) {
    if let (Some(&first), Some(&last)) = (points.first(), points.last()) {
        if first != last {
            points.push(first);
        }
    }
}

/// A `Geometry` handle: a typed variant over `{Points, Line, Polygon, Mesh}`
/// resolved from the pool, exposing the length/substring operations from
/// §4.3. Resolution of views is performed by `TileFeatureLayer::resolve_geometry`.
#[derive(Clone, Debug, PartialEq)]
pub struct Geometry {
    pub geometry_type: GeometryType,
    pub points: Vec<Point3>,
    /// Populated only for ring-structured polygons: one entry per ring,
    /// outer ring first, each already auto-closed and (for the outer
    /// ring) reoriented to CCW. Empty for every other geometry type.
    pub rings: Vec<Vec<Point3>>,
    pub name: Option<String>,
}

impl Geometry {
    /// Great-circle sum over consecutive points.
    #[must_use]
    pub fn length(&self) -> f64 {
        self.points.windows(2).map(|w| haversine_m(w[0], w[1])).sum()
    }

    /// Projects `start`/`end` (as positions) onto the closest segment and
    /// returns the interior-preserving substring between them. With `end`
    /// absent, returns the single projected point.
    #[must_use]
    pub fn points_from_position_bound(&self, start: Point3, end: Option<Point3>) -> Vec<Point3> {
        let start_idx = self.closest_segment_index(start);
        let Some(end) = end else {
            return vec![self.project_onto_segment(start_idx, start)];
        };
        let end_idx = self.closest_segment_index(end);
        let (lo, hi) = if start_idx <= end_idx {
            (start_idx, end_idx)
        } else {
            (end_idx, start_idx)
        };
        let mut out = vec![self.project_onto_segment(lo, start)];
        for p in &self.points[lo + 1..=hi] {
            out.push(*p);
        }
        out.push(self.project_onto_segment(hi, end));
        out
    }

    /// Arc-length based substring with linear interpolation, clamped via
    /// linear approximation (error bounded by ~1 cm per km near the
    /// equator, per §4.3).
    #[must_use]
    pub fn points_from_length_bound(&self, start_m: f64, end_m: Option<f64>) -> Vec<Point3> {
        let end_m = end_m.unwrap_or(start_m);
        let (lo, hi) = if start_m <= end_m { (start_m, end_m) } else { (end_m, start_m) };
        let mut out = Vec::new();
        let mut acc = 0.0;
        out.push(self.point_at_length(lo));
        for w in self.points.windows(2) {
            let seg_len = haversine_m(w[0], w[1]);
            if acc + seg_len > lo && acc + seg_len < hi {
                out.push(w[1]);
            }
            acc += seg_len;
        }
        out.push(self.point_at_length(hi));
        out
    }

    /// `pos` is a fixed-point fraction over `2^bits - 1` of the total
    /// length across `geoms`.
    #[must_use]
    pub fn percentage_position_from_geometries(geoms: &[Geometry], lengths: &[f64], bits: u32, pos: u64) -> Option<Point3> {
        let total: f64 = lengths.iter().sum();
        if total <= 0.0 {
            return None;
        }
        let max = (1u64 << bits) - 1;
        let fraction = pos as f64 / max as f64;
        let mut target = fraction * total;
        let last = geoms.len().saturating_sub(1);
        for (i, (geom, len)) in geoms.iter().zip(lengths.iter()).enumerate() {
            if target <= *len || i == last {
                return Some(geom.point_at_length(target));
            }
            target -= len;
        }
        None
    }

    fn point_at_length(&self, target_m: f64) -> Point3 {
        if self.points.is_empty() {
            return (0.0, 0.0, 0.0);
        }
        if target_m <= 0.0 {
            return self.points[0];
        }
        let mut acc = 0.0;
        for w in self.points.windows(2) {
            let seg_len = haversine_m(w[0], w[1]);
            if acc + seg_len >= target_m {
                let t = if seg_len > 0.0 { (target_m - acc) / seg_len } else { 0.0 };
                return lerp(w[0], w[1], t);
            }
            acc += seg_len;
        }
        *self.points.last().unwrap()
    }

    fn closest_segment_index(&self, p: Point3) -> usize {
        let mut best = 0;
        let mut best_dist = f64::MAX;
        for (i, w) in self.points.windows(2).enumerate() {
            let d = point_to_segment_distance(p, w[0], w[1]);
            if d < best_dist {
                best_dist = d;
                best = i;
            }
        }
        best
    }

    fn project_onto_segment(&self, idx: usize, p: Point3) -> Point3 {
        if self.points.len() < idx + 2 {
            return p;
        }
        let (a, b) = (self.points[idx], self.points[idx + 1]);
        let t = projection_fraction(p, a, b);
        lerp(a, b, t.clamp(0.0, 1.0))
    }
}

fn lerp(a: Point3, b: Point3, t: f64) -> Point3 {
    (a.0 + (b.0 - a.0) * t, a.1 + (b.1 - a.1) * t, a.2 + (b.2 - a.2) * t)
}

fn projection_fraction(p: Point3, a: Point3, b: Point3) -> f64 {
    let abx = b.0 - a.0;
    let aby = b.1 - a.1;
    let apx = p.0 - a.0;
    let apy = p.1 - a.1;
    let denom = abx * abx + aby * aby;
    if denom == 0.0 {
        0.0
    } else {
        (apx * abx + apy * aby) / denom
    }
}

fn point_to_segment_distance(p: Point3, a: Point3, b: Point3) -> f64 {
    let t = projection_fraction(p, a, b).clamp(0.0, 1.0);
    let proj = lerp(a, b, t);
    haversine_m(p, proj)
}

/// An ordered collection of one or more `Geometry` nodes belonging to a
/// feature.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GeometryCollectionRow(pub Vec<NodeAddress>);

#[derive(Clone, Debug)]
pub struct GeometryCollection {
    pub geometries: Vec<Geometry>,
}

impl GeometryCollection {
    /// True if any contained geometry has a point within the axis-aligned
    /// box `(west, south, east, north)`. Grounds the `geo() within
    /// bbox(...)` predicate used by `model::query`.
    #[must_use]
    pub fn within_bbox(&self, west: f64, south: f64, east: f64, north: f64) -> bool {
        let in_box = |p: &Point3| p.0 >= west && p.0 <= east && p.1 >= south && p.1 <= north;
        self.geometries.iter().any(|g| {
            g.points.iter().any(in_box) || g.rings.iter().any(|ring| ring.iter().any(in_box))
        })
    }
}

/// An auto-closed, possibly-reoriented ring of points backing a polygon.
#[derive(Clone, Debug, PartialEq)]
pub struct LinearRingRow {
    pub buffer: NodeAddress,
    pub stored_clockwise: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PolygonRow {
    pub rings: Vec<NodeAddress>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_buffer_quantizes_deltas_from_anchor() {
        let mut buf = PointBufferRow::default();
        buf.append((41.0, 10.0, 0.0));
        buf.append((43.0, 11.0, 0.0));
        assert_eq!(buf.point_at(0), Some((41.0, 10.0, 0.0)));
        let (lon, lat, _) = buf.point_at(1).unwrap();
        assert!((lon - 43.0).abs() < 1e-5);
        assert!((lat - 11.0).abs() < 1e-5);
    }

    #[test]
    fn bbox_containment_scenario_1() {
        let geom = Geometry {
            geometry_type: GeometryType::Line,
            points: vec![(41.0, 10.0, 0.0), (43.0, 11.0, 0.0)],
            rings: Vec::new(),
            name: None,
        };
        let collection = GeometryCollection { geometries: vec![geom] };
        assert!(collection.within_bbox(40.0, 9.0, 45.0, 12.0));
        assert!(!collection.within_bbox(0.0, 0.0, 1.0, 1.0));
    }
}
