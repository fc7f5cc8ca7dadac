//! Boundary extraction and hull fitting over the reachability frontier.
//!
//! Every graph node inside the walk budget contributes a boundary point, and
//! every edge that crosses the budget contributes the exact cutoff point
//! interpolated along it. The collected frontier is reprojected into local
//! planar meters and fitted with a concave hull, falling back to a convex
//! hull when the concave fit degenerates.

use geo::concave_hull::ConcaveHullOptions;
use geo::{ConcaveHull, ConvexHull, LineString, MultiPoint, Point};
use hashbrown::HashSet;
use petgraph::visit::EdgeRef;

use crate::geomath::LocalProjection;
use crate::model::streets::{SeedMatch, WalkGraph};
use crate::routing::bounded_shortest_distances;
use crate::{CONCAVE_HULL_CONCAVITY, MIN_EFFECTIVE_WALK_METERS};

// Dedup precision: ~1 cm in degrees and in local meters respectively.
const GEO_KEY_SCALE: f64 = 1e7;
const LOCAL_KEY_SCALE: f64 = 1e2;

/// One hull attempt together with its quality signal. More contributing
/// boundary points means a more trustworthy outline.
#[derive(Debug, Clone)]
pub struct PolygonAttempt {
    pub polygon: Option<Vec<Point<f64>>>,
    pub boundary_point_count: usize,
}

impl PolygonAttempt {
    fn empty() -> Self {
        Self {
            polygon: None,
            boundary_point_count: 0,
        }
    }
}

/// Runs the bounded shortest-path search from the given seeds and fits a
/// polygon around everything reachable within `distance_meters` of the stop
/// at `center`. The stop itself is always part of the boundary so a sparse
/// frontier still anchors at the stop.
pub fn build_polygon_from_seeds(
    graph: &WalkGraph,
    center: Point<f64>,
    distance_meters: f64,
    seeds: &[SeedMatch],
) -> PolygonAttempt {
    let usable: Vec<SeedMatch> = seeds
        .iter()
        .copied()
        .filter(|seed| distance_meters - seed.distance_meters >= MIN_EFFECTIVE_WALK_METERS)
        .collect();
    if usable.is_empty() {
        return PolygonAttempt::empty();
    }

    let distances = bounded_shortest_distances(graph, &usable, distance_meters);
    let mut seen = HashSet::new();
    let mut boundary = collect_boundary_points(graph, &distances, distance_meters, &mut seen);
    push_unique(&mut boundary, &mut seen, center);

    PolygonAttempt {
        boundary_point_count: boundary.len(),
        polygon: fit_hull(&boundary, center),
    }
}

fn geo_key(point: Point<f64>) -> (i64, i64) {
    (
        (point.y() * GEO_KEY_SCALE).round() as i64,
        (point.x() * GEO_KEY_SCALE).round() as i64,
    )
}

fn push_unique(points: &mut Vec<Point<f64>>, seen: &mut HashSet<(i64, i64)>, point: Point<f64>) {
    if seen.insert(geo_key(point)) {
        points.push(point);
    }
}

fn interpolate(a: Point<f64>, b: Point<f64>, t: f64) -> Point<f64> {
    let t = t.clamp(0.0, 1.0);
    Point::new(a.x() + (b.x() - a.x()) * t, a.y() + (b.y() - a.y()) * t)
}

/// Boundary points of the reachable frontier: reachable edge endpoints plus
/// the exact cutoff point on every edge that leaves the budget.
fn collect_boundary_points(
    graph: &WalkGraph,
    distances: &[f64],
    max_distance: f64,
    seen: &mut HashSet<(i64, i64)>,
) -> Vec<Point<f64>> {
    let mut points = Vec::new();

    for edge in graph.graph.edge_references() {
        let (u, v) = (edge.source(), edge.target());
        let (du, dv) = (distances[u.index()], distances[v.index()]);
        let u_reachable = du <= max_distance;
        let v_reachable = dv <= max_distance;
        if !u_reachable && !v_reachable {
            continue;
        }

        let pu = graph.node_point(u);
        let pv = graph.node_point(v);
        let length = edge.weight().length;

        if u_reachable {
            push_unique(&mut points, seen, pu);
            let remaining = max_distance - du;
            if remaining > 0.0 && remaining < length {
                push_unique(&mut points, seen, interpolate(pu, pv, remaining / length));
            }
        }
        if v_reachable {
            push_unique(&mut points, seen, pv);
            let remaining = max_distance - dv;
            if remaining > 0.0 && remaining < length {
                push_unique(&mut points, seen, interpolate(pv, pu, remaining / length));
            }
        }
    }

    points
}

fn fit_hull(boundary: &[Point<f64>], center: Point<f64>) -> Option<Vec<Point<f64>>> {
    let projection = LocalProjection::new(center);

    let mut seen = HashSet::new();
    let local_points: Vec<Point<f64>> = boundary
        .iter()
        .map(|point| projection.to_local(*point))
        .filter(|[x, y]| {
            seen.insert((
                (x * LOCAL_KEY_SCALE).round() as i64,
                (y * LOCAL_KEY_SCALE).round() as i64,
            ))
        })
        .map(|[x, y]| Point::new(x, y))
        .collect();

    if local_points.len() < 3 {
        return None;
    }

    let multi: MultiPoint<f64> = local_points.into_iter().collect();

    let concave = open_ring(
        multi
            .concave_hull_with_options(ConcaveHullOptions {
                concavity: CONCAVE_HULL_CONCAVITY,
                length_threshold: 0.0,
            })
            .exterior(),
    );
    if concave.len() >= 3 {
        return Some(reproject(&concave, &projection));
    }

    let convex = open_ring(multi.convex_hull().exterior());
    if convex.len() >= 3 {
        return Some(reproject(&convex, &projection));
    }
    None
}

/// Exterior ring without the duplicated closing vertex.
fn open_ring(exterior: &LineString<f64>) -> Vec<Point<f64>> {
    let mut ring: Vec<Point<f64>> = exterior.points().collect();
    if ring.len() >= 2 && ring.first() == ring.last() {
        ring.pop();
    }
    ring
}

fn reproject(ring: &[Point<f64>], projection: &LocalProjection) -> Vec<Point<f64>> {
    ring.iter()
        .map(|point| projection.from_local([point.x(), point.y()]))
        .collect()
}
