//! Per-tile clipping, simplification and quantization in Web Mercator meters

use super::TilePoint;

use geo::{
    Area, BooleanOps, BoundingRect, Coord, LineString, MultiPolygon, Polygon, Rect, Simplify,
    SimplifyVwPreserve,
};

/// Cohen-Sutherland outcode of a coordinate against a rectangle
fn outcode(c: Coord<f64>, rect: Rect<f64>) -> u8 {
    let min = rect.min();
    let max = rect.max();
    let mut code = 0u8;
    if c.x < min.x {
        code |= 1;
    } // left
    if c.x > max.x {
        code |= 2;
    } // right
    if c.y < min.y {
        code |= 4;
    } // bottom
    if c.y > max.y {
        code |= 8;
    } // top
    code
}

/// Clip the segment `a -> b` to `rect` (Liang-Barsky). Returns the visible part, if any.
pub fn clip_segment(
    a: Coord<f64>,
    b: Coord<f64>,
    rect: Rect<f64>,
) -> Option<(Coord<f64>, Coord<f64>)> {
    let code_a = outcode(a, rect);
    let code_b = outcode(b, rect);

    // Both points inside
    if code_a == 0 && code_b == 0 {
        return Some((a, b));
    }
    // Both points in the same outside region
    if code_a & code_b != 0 {
        return None;
    }

    let d = b - a;
    let min = rect.min();
    let max = rect.max();
    let mut t0 = 0.0f64;
    let mut t1 = 1.0f64;
    for (p, q) in [
        (-d.x, a.x - min.x),
        (d.x, max.x - a.x),
        (-d.y, a.y - min.y),
        (d.y, max.y - a.y),
    ] {
        if p == 0.0 {
            if q < 0.0 {
                return None;
            }
            continue;
        }
        let r = q / p;
        if p < 0.0 {
            t0 = t0.max(r);
        } else {
            t1 = t1.min(r);
        }
        if t0 > t1 {
            return None;
        }
    }

    let start = if code_a == 0 { a } else { a + d * t0 };
    let end = if code_b == 0 { b } else { a + d * t1 };
    Some((start, end))
}

/// Clip a polyline to `rect`, returning one run per visible stretch.
/// A line that leaves and re-enters the rectangle yields several runs.
pub fn clip_line_runs(coords: &[Coord<f64>], rect: Rect<f64>) -> Vec<Vec<Coord<f64>>> {
    let mut runs: Vec<Vec<Coord<f64>>> = Vec::new();
    let mut current: Vec<Coord<f64>> = Vec::new();

    for pair in coords.windows(2) {
        match clip_segment(pair[0], pair[1], rect) {
            Some((start, end)) => {
                if current.last() != Some(&start) {
                    if current.len() >= 2 {
                        runs.push(std::mem::take(&mut current));
                    }
                    current.clear();
                    current.push(start);
                }
                current.push(end);
                // Leaving the rectangle ends the run
                if end != pair[1] {
                    runs.push(std::mem::take(&mut current));
                }
            }
            None => {
                if current.len() >= 2 {
                    runs.push(std::mem::take(&mut current));
                }
                current.clear();
            }
        }
    }
    if current.len() >= 2 {
        runs.push(current);
    }
    runs.retain(|run| run.len() >= 2);
    runs
}

fn rect_contains_rect(outer: Rect<f64>, inner: Rect<f64>) -> bool {
    inner.min().x >= outer.min().x
        && inner.min().y >= outer.min().y
        && inner.max().x <= outer.max().x
        && inner.max().y <= outer.max().y
}

/// Intersect a polygon with `rect`, skipping the boolean operation when it lies inside
pub fn clip_polygon(polygon: &Polygon<f64>, rect: Rect<f64>) -> Vec<Polygon<f64>> {
    let Some(bounds) = polygon.bounding_rect() else {
        return Vec::new();
    };
    if rect_contains_rect(rect, bounds) {
        return vec![polygon.clone()];
    }
    if bounds.max().x < rect.min().x
        || bounds.min().x > rect.max().x
        || bounds.max().y < rect.min().y
        || bounds.min().y > rect.max().y
    {
        return Vec::new();
    }
    let clipped: MultiPolygon<f64> = polygon.intersection(&rect.to_polygon());
    clipped
        .0
        .into_iter()
        .filter(|p| p.unsigned_area() > 0.0)
        .collect()
}

/// Douglas-Peucker simplification of a line. `None` means the simplified line would
/// collapse to a point and the input has to be kept.
pub fn simplify_line(coords: &[Coord<f64>], tolerance: f64) -> Option<Vec<Coord<f64>>> {
    if tolerance <= 0.0 || coords.len() <= 2 {
        return Some(coords.to_vec());
    }
    let simplified = LineString::new(coords.to_vec()).simplify(tolerance);
    let distinct = simplified.0.windows(2).any(|p| p[0] != p[1]);
    distinct.then_some(simplified.0)
}

/// Topology-preserving Visvalingam simplification of a polygon. `None` means the exterior
/// would degenerate and the input has to be kept.
pub fn simplify_polygon(polygon: &Polygon<f64>, tolerance: f64) -> Option<Polygon<f64>> {
    if tolerance <= 0.0 {
        return Some(polygon.clone());
    }
    // Visvalingam works on triangle areas
    let simplified = polygon.simplify_vw_preserve(tolerance * tolerance);
    if simplified.exterior().0.len() < 4 || simplified.unsigned_area() <= 0.0 {
        return None;
    }
    let interiors: Vec<LineString<f64>> = simplified
        .interiors()
        .iter()
        .filter(|ring| ring.0.len() >= 4)
        .cloned()
        .collect();
    Some(Polygon::new(simplified.exterior().clone(), interiors))
}

/// Mercator coordinate to tile-local units (y down)
#[inline]
pub fn quantize(c: Coord<f64>, tile: Rect<f64>, extent: u32) -> TilePoint {
    let scale = extent as f64 / tile.width();
    [
        ((c.x - tile.min().x) * scale).round() as i32,
        ((tile.max().y - c.y) * scale).round() as i32,
    ]
}

/// Quantize a line, dropping repeated points. `None` if fewer than two distinct points remain.
pub fn quantize_line(
    coords: &[Coord<f64>],
    tile: Rect<f64>,
    extent: u32,
) -> Option<Vec<TilePoint>> {
    let mut out: Vec<TilePoint> = Vec::with_capacity(coords.len());
    for c in coords {
        let p = quantize(*c, tile, extent);
        if out.last() != Some(&p) {
            out.push(p);
        }
    }
    (out.len() >= 2).then_some(out)
}

fn ring_area_twice(ring: &[TilePoint]) -> i64 {
    ring.windows(2)
        .map(|w| w[0][0] as i64 * w[1][1] as i64 - w[1][0] as i64 * w[0][1] as i64)
        .sum()
}

/// Quantize a closed ring. `None` if it collapses to zero area.
fn quantize_ring(ring: &LineString<f64>, tile: Rect<f64>, extent: u32) -> Option<Vec<TilePoint>> {
    let mut out = quantize_line(&ring.0, tile, extent)?;
    if out.first() != out.last() {
        out.push(out[0]);
    }
    (out.len() >= 4 && ring_area_twice(&out) != 0).then_some(out)
}

/// Quantize a polygon. `None` if the exterior collapses; collapsed holes are dropped.
pub fn quantize_polygon(
    polygon: &Polygon<f64>,
    tile: Rect<f64>,
    extent: u32,
) -> Option<Vec<Vec<TilePoint>>> {
    let mut rings = vec![quantize_ring(polygon.exterior(), tile, extent)?];
    rings.extend(
        polygon
            .interiors()
            .iter()
            .filter_map(|ring| quantize_ring(ring, tile, extent)),
    );
    Some(rings)
}
