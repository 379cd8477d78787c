// Polygon predicates used to resolve which nucleus a dot falls in.
//
// Polygons are rings of vertices in either winding order. A ring may or may
// not repeat its first vertex at the end (GeoJSON rings do); the closing edge
// is implied either way, and a repeated vertex only adds a zero-length edge.

use geo::{Coord, LineString};
use itertools::Itertools;

/// Ray casting parity test. A horizontal ray is cast from `point` towards +x
/// and the polygon edges it crosses are counted; an odd count means inside.
///
/// Boundary convention: an edge counts when `min(y1, y2) < y <= max(y1, y2)`
/// and the point lies on or left of the edge. Horizontal edges never count.
/// For an axis-aligned rectangle this puts the top and right edges inside and
/// the bottom and left edges outside.
pub fn contains_point(ring: &LineString<f64>, point: Coord<f64>) -> bool {
    let Coord { x, y } = point;
    let mut inside = false;

    for (a, b) in ring.0.iter().circular_tuple_windows() {
        let (x1, y1) = (a.x, a.y);
        let (x2, y2) = (b.x, b.y);

        if y1 == y2 {
            continue;
        }

        if y > y1.min(y2) && y <= y1.max(y2) && x <= x1.max(x2) {
            let x_intercept = (y - y1) * (x2 - x1) / (y2 - y1) + x1;
            if x1 == x2 || x <= x_intercept {
                inside = !inside;
            }
        }
    }

    inside
}

// Centroid and signed area from the shoelace formula. The sign follows the
// winding order (counter-clockwise is positive).
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PolygonMoments {
    pub centroid: Coord<f64>,
    pub signed_area: f64,
}

impl PolygonMoments {
    pub fn area(&self) -> f64 {
        self.signed_area.abs()
    }
}

/// Returns `None` when the signed area is zero (collinear or repeated
/// vertices) or not finite, since the centroid is undefined there.
pub fn polygon_moments(ring: &LineString<f64>) -> Option<PolygonMoments> {
    let mut cross_sum = 0.0;
    let mut cx = 0.0;
    let mut cy = 0.0;

    for (a, b) in ring.0.iter().circular_tuple_windows() {
        let cross = a.x * b.y - b.x * a.y;
        cross_sum += cross;
        cx += (a.x + b.x) * cross;
        cy += (a.y + b.y) * cross;
    }

    let signed_area = 0.5 * cross_sum;
    if signed_area == 0.0 || !signed_area.is_finite() {
        return None;
    }

    Some(PolygonMoments {
        centroid: Coord {
            x: cx / (6.0 * signed_area),
            y: cy / (6.0 * signed_area),
        },
        signed_area,
    })
}
