//! Noding: split polylines at every intersection, self-intersection and near-touch
//!
//! Runs on projected coordinates in meters. Segments are indexed in an R-tree with envelopes
//! grown by the snap tolerance; candidate pairs are tested in parallel and the resulting split
//! events are sorted before pieces are cut, so the output only depends on the input.

use geo::algorithm::line_intersection::{LineIntersection, line_intersection};
use geo::{Coord, Line};
use rayon::prelude::*;
use rstar::{AABB, RTree, RTreeObject};
use smallvec::SmallVec;

/// Parameters closer than this to a segment end are treated as that vertex
const VERTEX_EPSILON: f64 = 1e-9;

/// A maximal piece of one input polyline with no interior intersection
#[derive(Debug, Clone, PartialEq)]
pub struct Piece {
    pub polyline: usize,
    pub coords: Vec<Coord<f64>>,
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    polyline: usize,
    /// Index of the first vertex in the polyline
    vertex: usize,
    line: Line<f64>,
}

struct SegmentBox {
    index: usize,
    env: AABB<[f64; 2]>,
}

impl RTreeObject for SegmentBox {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.env
    }
}

fn envelope(line: &Line<f64>, pad: f64) -> AABB<[f64; 2]> {
    AABB::from_corners(
        [
            line.start.x.min(line.end.x) - pad,
            line.start.y.min(line.end.y) - pad,
        ],
        [
            line.start.x.max(line.end.x) + pad,
            line.start.y.max(line.end.y) + pad,
        ],
    )
}

/// Split position on a segment
#[derive(Debug, Clone, Copy)]
struct Event {
    segment: usize,
    t: f64,
    point: Coord<f64>,
}

fn parameter(line: &Line<f64>, point: Coord<f64>) -> f64 {
    let d = line.delta();
    let len2 = d.x * d.x + d.y * d.y;
    if len2 == 0.0 {
        return 0.0;
    }
    (((point.x - line.start.x) * d.x + (point.y - line.start.y) * d.y) / len2).clamp(0.0, 1.0)
}

fn point_at(line: &Line<f64>, t: f64) -> Coord<f64> {
    line.start + line.delta() * t
}

fn distance(a: Coord<f64>, b: Coord<f64>) -> f64 {
    (a.x - b.x).hypot(a.y - b.y)
}

/// Remove consecutive duplicate vertices
fn dedup(coords: &[Coord<f64>]) -> Vec<Coord<f64>> {
    let mut out: Vec<Coord<f64>> = Vec::with_capacity(coords.len());
    for c in coords {
        if out.last() != Some(c) {
            out.push(*c);
        }
    }
    out
}

/// Split events for the pair (k, j), k < j
fn pair_events(segments: &[Segment], k: usize, j: usize, tolerance: f64, out: &mut Vec<Event>) {
    let a = segments[k];
    let b = segments[j];

    // Consecutive segments of one polyline always share a vertex. Only a collinear
    // overlap (the line doubling back on itself) needs splitting there.
    let consecutive = a.polyline == b.polyline && b.vertex == a.vertex + 1;

    match line_intersection(a.line, b.line) {
        Some(LineIntersection::SinglePoint { intersection, .. }) => {
            if !consecutive {
                out.push(Event {
                    segment: k,
                    t: parameter(&a.line, intersection),
                    point: intersection,
                });
                out.push(Event {
                    segment: j,
                    t: parameter(&b.line, intersection),
                    point: intersection,
                });
            }
            return;
        }
        Some(LineIntersection::Collinear { intersection }) => {
            for point in [intersection.start, intersection.end] {
                out.push(Event {
                    segment: k,
                    t: parameter(&a.line, point),
                    point,
                });
                out.push(Event {
                    segment: j,
                    t: parameter(&b.line, point),
                    point,
                });
            }
            return;
        }
        None => {}
    }

    if consecutive {
        return;
    }

    // No exact intersection: endpoints within tolerance of the other segment are near-touches
    for (from, onto, from_index, onto_index) in [(&a, &b, k, j), (&b, &a, j, k)] {
        for (endpoint, t_self) in [(from.line.start, 0.0), (from.line.end, 1.0)] {
            let t = parameter(&onto.line, endpoint);
            let foot = point_at(&onto.line, t);
            if distance(foot, endpoint) <= tolerance {
                out.push(Event {
                    segment: onto_index,
                    t,
                    point: foot,
                });
                out.push(Event {
                    segment: from_index,
                    t: t_self,
                    point: endpoint,
                });
            }
        }
    }
}

/// Split polylines (in meters) into pieces that only touch at their ends.
///
/// Returns the pieces in polyline order, then along each polyline, together with the number
/// of split events found.
pub fn node_polylines(polylines: &[Vec<Coord<f64>>], tolerance: f64) -> (Vec<Piece>, usize) {
    #[cfg(feature = "profiling")]
    profiling::scope!("graph::node_polylines");

    let polylines: Vec<Vec<Coord<f64>>> = polylines.iter().map(|p| dedup(p)).collect();

    let segments: Vec<Segment> = polylines
        .iter()
        .enumerate()
        .flat_map(|(polyline, coords)| {
            coords.windows(2).enumerate().map(move |(vertex, pair)| Segment {
                polyline,
                vertex,
                line: Line::new(pair[0], pair[1]),
            })
        })
        .collect();

    let tree = RTree::bulk_load(
        segments
            .iter()
            .enumerate()
            .map(|(index, segment)| SegmentBox {
                index,
                env: envelope(&segment.line, tolerance),
            })
            .collect(),
    );

    let mut events: Vec<Event> = (0..segments.len())
        .into_par_iter()
        .flat_map_iter(|k| {
            let mut found = Vec::new();
            let query = envelope(&segments[k].line, tolerance);
            for candidate in tree.locate_in_envelope_intersecting(&query) {
                if candidate.index > k {
                    pair_events(&segments, k, candidate.index, tolerance, &mut found);
                }
            }
            found
        })
        .collect();

    events.sort_by(|a, b| {
        a.segment
            .cmp(&b.segment)
            .then(a.t.total_cmp(&b.t))
            .then(a.point.x.total_cmp(&b.point.x))
            .then(a.point.y.total_cmp(&b.point.y))
    });
    let event_count = events.len();

    // Group split positions per polyline as (vertex, t, point), t in [0, 1)
    // Most polylines are split a handful of times at most
    let mut splits: Vec<SmallVec<[(usize, f64, Coord<f64>); 4]>> =
        vec![SmallVec::new(); polylines.len()];
    for event in &events {
        let segment = segments[event.segment];
        let position = if event.t >= 1.0 - VERTEX_EPSILON {
            (segment.vertex + 1, 0.0, segment.line.end)
        } else if event.t <= VERTEX_EPSILON {
            (segment.vertex, 0.0, segment.line.start)
        } else {
            (segment.vertex, event.t, event.point)
        };
        splits[segment.polyline].push(position);
    }

    let mut pieces = Vec::new();
    for (polyline, coords) in polylines.iter().enumerate() {
        if coords.len() < 2 {
            continue;
        }
        let positions = &mut splits[polyline];
        positions.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.total_cmp(&b.1)));
        positions.dedup_by(|a, b| a.0 == b.0 && (a.1 - b.1).abs() <= VERTEX_EPSILON);

        let mut next = positions.iter().peekable();
        let mut current = vec![coords[0]];
        let mut flush = |current: &mut Vec<Coord<f64>>, start: Coord<f64>| {
            if current.len() >= 2 {
                pieces.push(Piece {
                    polyline,
                    coords: std::mem::replace(current, vec![start]),
                });
            } else {
                *current = vec![start];
            }
        };

        for vertex in 0..coords.len() - 1 {
            while let Some(&&(v, t, point)) = next.peek() {
                if v != vertex {
                    break;
                }
                next.next();
                if t == 0.0 {
                    if vertex > 0 {
                        flush(&mut current, coords[vertex]);
                    }
                } else {
                    if current.last() != Some(&point) {
                        current.push(point);
                    }
                    flush(&mut current, point);
                }
            }
            if current.last() != Some(&coords[vertex + 1]) {
                current.push(coords[vertex + 1]);
            }
        }
        if current.len() >= 2 {
            pieces.push(Piece {
                polyline,
                coords: current,
            });
        }
    }

    tracing::debug!(
        "Noded {} polylines ({} segments, {} split events) into {} pieces",
        polylines.len(),
        segments.len(),
        event_count,
        pieces.len()
    );

    (pieces, event_count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(x: f64, y: f64) -> Coord<f64> {
        Coord { x, y }
    }

    #[test]
    fn test_single_line_is_one_piece() {
        let (pieces, _) = node_polylines(&[vec![c(0.0, 0.0), c(50.0, 0.0), c(100.0, 10.0)]], 0.5);
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].coords.len(), 3);
    }

    #[test]
    fn test_cross_splits_both_lines() {
        let lines = vec![
            vec![c(-100.0, 0.0), c(100.0, 0.0)],
            vec![c(0.0, -100.0), c(0.0, 100.0)],
        ];
        let (pieces, _) = node_polylines(&lines, 0.5);
        assert_eq!(pieces.len(), 4);
        for piece in &pieces {
            assert!(piece.coords.iter().any(|p| distance(*p, c(0.0, 0.0)) < 1e-9));
        }
    }

    #[test]
    fn test_self_intersection_splits() {
        // A figure that crosses itself at (5, 5)
        let line = vec![c(0.0, 0.0), c(10.0, 10.0), c(10.0, 0.0), c(0.0, 10.0)];
        let (pieces, _) = node_polylines(&[line], 0.1);
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[0].coords.len(), 2);
        assert!(distance(pieces[0].coords[1], c(5.0, 5.0)) < 1e-9);
        // The middle piece is the loop through (10, 10) and (10, 0)
        assert_eq!(pieces[1].coords.len(), 4);
        assert!(distance(pieces[2].coords[0], c(5.0, 5.0)) < 1e-9);
        assert_eq!(pieces[2].coords[1], c(0.0, 10.0));
    }

    #[test]
    fn test_near_touch_within_tolerance() {
        // A spur ending 0.3 m short of the main line
        let lines = vec![
            vec![c(0.0, 0.0), c(100.0, 0.0)],
            vec![c(50.0, 0.3), c(50.0, 80.0)],
        ];
        let (pieces, _) = node_polylines(&lines, 0.5);
        assert_eq!(pieces.len(), 3);
        assert!(pieces.iter().any(|p| p.coords.last() == Some(&c(50.0, 0.0))));

        let (far, _) = node_polylines(&lines, 0.1);
        assert_eq!(far.len(), 2);
    }

    #[test]
    fn test_shared_vertex_between_lines() {
        let lines = vec![
            vec![c(0.0, 0.0), c(10.0, 10.0), c(20.0, 0.0)],
            vec![c(0.0, 20.0), c(10.0, 10.0), c(20.0, 20.0)],
        ];
        let (pieces, _) = node_polylines(&lines, 0.5);
        assert_eq!(pieces.len(), 4);
    }

    #[test]
    fn test_deterministic_output() {
        let lines = vec![
            vec![c(0.0, 0.0), c(100.0, 100.0)],
            vec![c(0.0, 100.0), c(100.0, 0.0)],
            vec![c(50.0, 0.0), c(50.0, 100.0)],
        ];
        let (first, _) = node_polylines(&lines, 0.5);
        let (second, _) = node_polylines(&lines, 0.5);
        assert_eq!(first, second);
    }
}
