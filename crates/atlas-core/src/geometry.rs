//! Polygon set algebra for site boundaries.
//!
//! [`GeometryEngine`] is the seam between the boundary engine and whatever
//! computes unions and differences. [`GeoEngine`] satisfies it in-process with
//! the `geo` crate.
//!
//! Areas are reported in km² on the WGS84 authalic sphere, with every edge
//! taken as a straight segment in lon/lat. That is the same edge model the
//! boolean ops use, so merging parts or dropping collinear vertices leaves
//! the total unchanged. Bounding boxes stay planar, in degrees.
//!
//! Every result is snapped to a 1e-9° grid and put in a canonical vertex and
//! part order, so feeding a result back through an operation that does not
//! change its shape reproduces it exactly.

use std::cmp::Ordering;
use std::panic::{catch_unwind, AssertUnwindSafe};

use geo::algorithm::orient::{Direction, Orient};
use geo::{Area, BooleanOps, Coord, LineString, MapCoords, MultiPolygon, Polygon};
use geojson::{Geometry, Value};

use crate::bbox::BoundingBox;
use crate::error::{AtlasError, Result};

/// Parts smaller than this (square degrees) are slivers left over by the
/// boolean ops and are dropped during normalization.
const SLIVER_AREA_DEG2: f64 = 1e-12;

/// Output coordinates are multiples of `1 / GRID_PER_DEGREE` degrees.
const GRID_PER_DEGREE: f64 = 1e9;

/// An operand is treated as already covered when the part of it lying
/// outside the other geometry is at most this fraction of its own area.
const COVERED_FRACTION: f64 = 1e-6;

/// Radius of the sphere with the same surface area as the WGS84 ellipsoid.
const AUTHALIC_RADIUS_KM: f64 = 6_371.007_180_9;

// ── Boundary ──────────────────────────────────────────────────────────────────

/// Canonical result of every engine operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Boundary {
    /// Oriented parts: exteriors counter-clockwise, holes clockwise.
    pub polygons: MultiPolygon<f64>,
    pub area_km2: f64,
}

impl Boundary {
    /// GeoJSON `Polygon` for a single part, `MultiPolygon` otherwise.
    pub fn to_geojson(&self) -> Geometry {
        Geometry::new(value_from_polygons(&self.polygons))
    }

    pub fn bounding_box(&self) -> Option<BoundingBox> {
        BoundingBox::of_value(&value_from_polygons(&self.polygons))
    }

    pub fn part_count(&self) -> usize {
        self.polygons.0.len()
    }
}

// ── Engine contract ───────────────────────────────────────────────────────────

/// Set-algebra primitives over polygonal geometry. Implementations must be
/// stateless with respect to their arguments.
pub trait GeometryEngine: Send + Sync {
    fn union(&self, a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> Result<Boundary>;

    /// `a` minus `b`. Fails with `Geometry` if nothing would remain.
    fn difference(&self, a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> Result<Boundary>;

    /// Merge every part into one boundary.
    fn dissolve(&self, parts: &[&MultiPolygon<f64>]) -> Result<Boundary>;

    fn area_km2(&self, g: &MultiPolygon<f64>) -> f64;

    /// Engine name for logging.
    fn name(&self) -> &str;
}

/// Pure-Rust engine backed by `geo`'s boolean operations.
#[derive(Debug, Default, Clone, Copy)]
pub struct GeoEngine;

impl GeoEngine {
    pub fn new() -> Self {
        Self
    }

    fn normalize(&self, raw: MultiPolygon<f64>, op: &str) -> Result<Boundary> {
        let mut parts: Vec<Polygon<f64>> = raw
            .into_iter()
            .filter_map(snap_polygon)
            .filter(|p| p.unsigned_area() > SLIVER_AREA_DEG2)
            .map(|p| canonical_rings(p.orient(Direction::Default)))
            .collect();
        if parts.is_empty() {
            return Err(AtlasError::geometry(format!("{op} produced an empty geometry")));
        }
        parts.sort_by(|a, b| cmp_coord(&a.exterior().0[0], &b.exterior().0[0]));
        let polygons = MultiPolygon::new(parts);
        let area_km2 = spherical_area_km2(&polygons);
        Ok(Boundary { polygons, area_km2 })
    }

    /// True if `b` adds nothing measurable to `a`.
    fn covers(&self, a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> Result<bool> {
        let own = b.unsigned_area();
        if own <= SLIVER_AREA_DEG2 {
            return Ok(true);
        }
        let outside = guarded("union", || b.difference(a))?;
        Ok(outside.unsigned_area() <= own * COVERED_FRACTION)
    }
}

/// Boolean ops can panic on pathological input; surface that as a
/// `Geometry` error instead of unwinding through the caller.
fn guarded(op: &str, f: impl FnOnce() -> MultiPolygon<f64>) -> Result<MultiPolygon<f64>> {
    catch_unwind(AssertUnwindSafe(f))
        .map_err(|_| AtlasError::geometry(format!("{op} failed on degenerate input")))
}

impl GeometryEngine for GeoEngine {
    fn union(&self, a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> Result<Boundary> {
        let (a, b) = (&snapped(a), &snapped(b));
        // Re-running the boolean op on an already absorbed operand would
        // shift vertices by the op's rounding, so keep `a` as it is.
        if self.covers(a, b)? {
            return self.normalize(a.clone(), "union");
        }
        let raw = guarded("union", || a.union(b))?;
        self.normalize(raw, "union")
    }

    fn difference(&self, a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> Result<Boundary> {
        let (a, b) = (&snapped(a), &snapped(b));
        let raw = guarded("difference", || a.difference(b))?;
        self.normalize(raw, "difference")
    }

    fn dissolve(&self, parts: &[&MultiPolygon<f64>]) -> Result<Boundary> {
        if parts.is_empty() {
            return Err(AtlasError::invalid("dissolve needs at least one geometry"));
        }
        // Pairwise reduction keeps operand sizes balanced.
        let mut layer: Vec<MultiPolygon<f64>> = parts.iter().map(|p| snapped(p)).collect();
        while layer.len() > 1 {
            let mut next = Vec::with_capacity(layer.len().div_ceil(2));
            let mut it = layer.into_iter();
            while let Some(a) = it.next() {
                match it.next() {
                    Some(b) => next.push(guarded("dissolve", || a.union(&b))?),
                    None => next.push(a),
                }
            }
            layer = next;
        }
        let merged = layer.pop().unwrap_or_else(|| MultiPolygon::new(vec![]));
        self.normalize(merged, "dissolve")
    }

    fn area_km2(&self, g: &MultiPolygon<f64>) -> f64 {
        spherical_area_km2(g)
    }

    fn name(&self) -> &str {
        "geo"
    }
}

// ── Canonical form ────────────────────────────────────────────────────────────

fn snap(v: f64) -> f64 {
    (v * GRID_PER_DEGREE).round() / GRID_PER_DEGREE
}

/// Operands go onto the grid too, so edges shared by neighbouring
/// catchments still coincide after an earlier result was snapped.
fn snapped(g: &MultiPolygon<f64>) -> MultiPolygon<f64> {
    g.map_coords(|c| Coord { x: snap(c.x), y: snap(c.y) })
}

/// Snap a closed ring and drop the repeats snapping creates. `None` if
/// fewer than three distinct positions survive.
fn snap_ring(ring: &LineString<f64>) -> Option<LineString<f64>> {
    let mut coords: Vec<Coord<f64>> = ring.coords().map(|c| Coord { x: snap(c.x), y: snap(c.y) }).collect();
    coords.dedup();
    if coords.len() > 1 && coords.first() == coords.last() {
        coords.pop();
    }
    if coords.len() < 3 {
        return None;
    }
    Some(LineString::new(coords))
}

fn snap_polygon(p: Polygon<f64>) -> Option<Polygon<f64>> {
    let exterior = snap_ring(p.exterior())?;
    let interiors = p.interiors().iter().filter_map(snap_ring).collect();
    // `Polygon::new` closes the rings again.
    Some(Polygon::new(exterior, interiors))
}

fn cmp_coord(a: &Coord<f64>, b: &Coord<f64>) -> Ordering {
    a.x.total_cmp(&b.x).then(a.y.total_cmp(&b.y))
}

/// Start every ring at its smallest vertex and order the holes.
fn canonical_rings(p: Polygon<f64>) -> Polygon<f64> {
    let (exterior, interiors) = p.into_inner();
    let mut interiors: Vec<LineString<f64>> = interiors.into_iter().map(rotate_to_min).collect();
    interiors.sort_by(|a, b| cmp_coord(&a.0[0], &b.0[0]));
    Polygon::new(rotate_to_min(exterior), interiors)
}

fn rotate_to_min(ring: LineString<f64>) -> LineString<f64> {
    let mut coords = ring.0;
    if coords.len() > 1 && coords.first() == coords.last() {
        coords.pop();
    }
    let start = coords
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| cmp_coord(a, b))
        .map_or(0, |(i, _)| i);
    coords.rotate_left(start);
    if let Some(first) = coords.first().copied() {
        coords.push(first);
    }
    LineString::new(coords)
}

// ── Area ──────────────────────────────────────────────────────────────────────

/// Area in km² on the authalic sphere, holes subtracted. Winding order does
/// not matter.
pub fn spherical_area_km2(g: &MultiPolygon<f64>) -> f64 {
    g.iter()
        .map(|p| {
            let holes: f64 = p.interiors().iter().map(ring_area_km2).sum();
            (ring_area_km2(p.exterior()) - holes).max(0.0)
        })
        .sum()
}

/// For an edge straight in lon/lat, `∫ sin φ dλ` has the closed form
/// `Δλ · sin φm · sinc(Δφ / 2)`; summing it around the ring gives the
/// enclosed area over R².
fn ring_area_km2(ring: &LineString<f64>) -> f64 {
    let sum: f64 = ring
        .lines()
        .map(|l| {
            let (lam1, phi1) = (l.start.x.to_radians(), l.start.y.to_radians());
            let (lam2, phi2) = (l.end.x.to_radians(), l.end.y.to_radians());
            let half = (phi2 - phi1) / 2.0;
            let sinc = if half.abs() < 1e-15 { 1.0 } else { half.sin() / half };
            (lam2 - lam1) * ((phi1 + phi2) / 2.0).sin() * sinc
        })
        .sum();
    sum.abs() * AUTHALIC_RADIUS_KM * AUTHALIC_RADIUS_KM
}

// ── GeoJSON conversion ────────────────────────────────────────────────────────

/// Collect every polygon of a GeoJSON value. Polygons, multipolygons and
/// collections of those are accepted.
pub fn polygons_from_value(value: &Value) -> Result<MultiPolygon<f64>> {
    let mut out = Vec::new();
    collect_polygons(value, &mut out)?;
    Ok(MultiPolygon::new(out))
}

fn collect_polygons(value: &Value, out: &mut Vec<Polygon<f64>>) -> Result<()> {
    match value {
        Value::Polygon(rings) => out.push(polygon_from_rings(rings)?),
        Value::MultiPolygon(polys) => {
            for rings in polys {
                out.push(polygon_from_rings(rings)?);
            }
        }
        Value::GeometryCollection(geoms) => {
            for g in geoms {
                collect_polygons(&g.value, out)?;
            }
        }
        other => {
            return Err(AtlasError::invalid(format!(
                "expected polygonal geometry, got {}",
                value_kind(other)
            )))
        }
    }
    Ok(())
}

fn polygon_from_rings(rings: &[Vec<Vec<f64>>]) -> Result<Polygon<f64>> {
    let mut rings = rings.iter().map(|r| ring_from_positions(r));
    let exterior = rings
        .next()
        .ok_or_else(|| AtlasError::invalid("polygon has no rings"))??;
    let interiors = rings.collect::<Result<Vec<_>>>()?;
    Ok(Polygon::new(exterior, interiors))
}

fn ring_from_positions(positions: &[Vec<f64>]) -> Result<LineString<f64>> {
    let coords = positions
        .iter()
        .map(|p| match p.as_slice() {
            [x, y, ..] if x.is_finite() && y.is_finite() => Ok(Coord { x: *x, y: *y }),
            _ => Err(AtlasError::invalid(format!("bad position {p:?}"))),
        })
        .collect::<Result<Vec<_>>>()?;
    if coords.len() < 3 {
        return Err(AtlasError::invalid(format!(
            "ring needs at least 3 positions, got {}",
            coords.len()
        )));
    }
    Ok(LineString::new(coords))
}

/// Single part → `Polygon`, otherwise `MultiPolygon`.
pub fn value_from_polygons(mp: &MultiPolygon<f64>) -> Value {
    let mut polys: Vec<Vec<Vec<Vec<f64>>>> = mp.iter().map(rings_of).collect();
    if polys.len() == 1 {
        Value::Polygon(polys.remove(0))
    } else {
        Value::MultiPolygon(polys)
    }
}

fn rings_of(p: &Polygon<f64>) -> Vec<Vec<Vec<f64>>> {
    std::iter::once(p.exterior())
        .chain(p.interiors())
        .map(|ring| ring.coords().map(|c| vec![c.x, c.y]).collect())
        .collect()
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Point(_) => "Point",
        Value::MultiPoint(_) => "MultiPoint",
        Value::LineString(_) => "LineString",
        Value::MultiLineString(_) => "MultiLineString",
        Value::Polygon(_) => "Polygon",
        Value::MultiPolygon(_) => "MultiPolygon",
        Value::GeometryCollection(_) => "GeometryCollection",
    }
}
