//! Planar bounding boxes in degrees and the GeoJSON coordinate visitor.
//!
//! Every coordinate walk in the crate goes through [`for_each_coord`] /
//! [`map_coords`], which dispatch once on the GeoJSON value tag and recurse
//! into nested geometries.

use geojson::Value;
use serde::{Deserialize, Serialize};

use crate::error::{AtlasError, Result};

/// Axis-aligned envelope in lon/lat degrees, persisted as four floats.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self { min_x, min_y, max_x, max_y }
    }

    /// Parse `"minx,miny,maxx,maxy"` as sent by a map viewport.
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        if parts.len() != 4 {
            return Err(AtlasError::invalid(format!(
                "bbox must have 4 comma-separated values, got {}",
                parts.len()
            )));
        }
        let mut v = [0.0f64; 4];
        for (slot, part) in v.iter_mut().zip(&parts) {
            *slot = part
                .parse()
                .map_err(|_| AtlasError::invalid(format!("bbox value {part:?} is not a number")))?;
        }
        let bbox = Self::new(v[0], v[1], v[2], v[3]);
        bbox.validate()?;
        Ok(bbox)
    }

    /// Reject NaN/infinite corners and inverted boxes.
    pub fn validate(&self) -> Result<()> {
        let corners = [self.min_x, self.min_y, self.max_x, self.max_y];
        if corners.iter().any(|c| !c.is_finite()) {
            return Err(AtlasError::invalid("bbox values must be finite"));
        }
        if self.min_x > self.max_x || self.min_y > self.max_y {
            return Err(AtlasError::invalid(format!(
                "bbox is inverted: [{}, {}, {}, {}]",
                self.min_x, self.min_y, self.max_x, self.max_y
            )));
        }
        Ok(())
    }

    /// Smallest box enclosing every coordinate of `value`, or `None` when the
    /// geometry has no coordinates at all.
    pub fn of_value(value: &Value) -> Option<Self> {
        let mut acc: Option<Self> = None;
        for_each_coord(value, &mut |x, y| {
            acc = Some(match acc {
                None => Self::new(x, y, x, y),
                Some(b) => b.expand(x, y),
            });
        });
        acc
    }

    fn expand(self, x: f64, y: f64) -> Self {
        Self {
            min_x: self.min_x.min(x),
            min_y: self.min_y.min(y),
            max_x: self.max_x.max(x),
            max_y: self.max_y.max(y),
        }
    }

    /// Envelope test, touching edges count as intersecting.
    pub fn intersects(&self, other: &Self) -> bool {
        self.min_x <= other.max_x
            && self.max_x >= other.min_x
            && self.min_y <= other.max_y
            && self.max_y >= other.min_y
    }

}

// ── Coordinate visitor ────────────────────────────────────────────────────────

/// Call `f(x, y)` for every position in `value`, recursing through
/// geometry collections. Positions with fewer than two ordinates are skipped.
pub fn for_each_coord(value: &Value, f: &mut impl FnMut(f64, f64)) {
    let mut visit = |pos: &Vec<f64>| {
        if pos.len() >= 2 {
            f(pos[0], pos[1]);
        }
    };
    match value {
        Value::Point(p) => visit(p),
        Value::MultiPoint(ps) | Value::LineString(ps) => ps.iter().for_each(visit),
        Value::MultiLineString(lines) | Value::Polygon(lines) => {
            lines.iter().flatten().for_each(visit)
        }
        Value::MultiPolygon(polys) => polys.iter().flatten().flatten().for_each(visit),
        Value::GeometryCollection(geoms) => {
            for g in geoms {
                for_each_coord(&g.value, f);
            }
        }
    }
}

/// Rewrite every position of `value` in place with `f(x, y) -> (x', y')`.
/// Extra ordinates (elevation, measure) are preserved.
pub fn map_coords(value: &mut Value, f: &mut impl FnMut(f64, f64) -> (f64, f64)) {
    let mut visit = |pos: &mut Vec<f64>| {
        if pos.len() >= 2 {
            let (x, y) = f(pos[0], pos[1]);
            pos[0] = x;
            pos[1] = y;
        }
    };
    match value {
        Value::Point(p) => visit(p),
        Value::MultiPoint(ps) | Value::LineString(ps) => ps.iter_mut().for_each(visit),
        Value::MultiLineString(lines) | Value::Polygon(lines) => {
            lines.iter_mut().flatten().for_each(visit)
        }
        Value::MultiPolygon(polys) => polys.iter_mut().flatten().flatten().for_each(visit),
        Value::GeometryCollection(geoms) => {
            for g in geoms {
                map_coords(&mut g.value, f);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geojson::Geometry;

    #[test]
    fn parse_accepts_whitespace_and_rejects_garbage() {
        let b = BoundingBox::parse(" 10.5, -3 ,20,4.25").unwrap();
        assert_eq!(b, BoundingBox::new(10.5, -3.0, 20.0, 4.25));

        assert!(matches!(BoundingBox::parse("1,2,3"), Err(AtlasError::InvalidInput(_))));
        assert!(matches!(BoundingBox::parse("1,2,x,4"), Err(AtlasError::InvalidInput(_))));
        assert!(matches!(BoundingBox::parse("5,0,1,1"), Err(AtlasError::InvalidInput(_))));
        assert!(matches!(BoundingBox::parse("0,0,NaN,1"), Err(AtlasError::InvalidInput(_))));
    }

    #[test]
    fn visitor_reaches_every_geometry_kind() {
        let collection = Value::GeometryCollection(vec![
            Geometry::new(Value::Point(vec![-5.0, 2.0])),
            Geometry::new(Value::LineString(vec![vec![0.0, 0.0], vec![3.0, -7.0]])),
            Geometry::new(Value::MultiPolygon(vec![vec![vec![
                vec![10.0, 10.0],
                vec![12.0, 10.0],
                vec![12.0, 11.0],
                vec![10.0, 10.0],
            ]]])),
            Geometry::new(Value::GeometryCollection(vec![Geometry::new(Value::Point(vec![
                1.0, 30.0, 500.0,
            ]))])),
        ]);

        let bbox = BoundingBox::of_value(&collection).unwrap();
        assert_eq!(bbox, BoundingBox::new(-5.0, -7.0, 12.0, 30.0));
    }

    #[test]
    fn empty_geometry_has_no_bbox() {
        assert!(BoundingBox::of_value(&Value::MultiPolygon(vec![])).is_none());
        assert!(BoundingBox::of_value(&Value::GeometryCollection(vec![])).is_none());
    }

    #[test]
    fn map_coords_keeps_extra_ordinates() {
        let mut v = Value::LineString(vec![vec![1.0, 2.0, 99.0], vec![3.0, 4.0]]);
        map_coords(&mut v, &mut |x, y| (x + 10.0, y * 2.0));
        assert_eq!(v, Value::LineString(vec![vec![11.0, 4.0, 99.0], vec![13.0, 8.0]]));
    }

    #[test]
    fn envelope_intersection_counts_touching_edges() {
        let a = BoundingBox::new(0.0, 0.0, 1.0, 1.0);
        assert!(a.intersects(&BoundingBox::new(1.0, 1.0, 2.0, 2.0)));
        assert!(!a.intersects(&BoundingBox::new(1.01, 0.0, 2.0, 1.0)));
    }
}
