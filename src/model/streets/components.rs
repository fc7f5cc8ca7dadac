//! Street network components - nodes and edges.

use geo::Point;

/// Street graph node.
#[derive(Debug, Clone)]
pub struct StreetNode {
    /// OSM ID of the node
    pub id: i64,
    /// Node coordinates
    pub geometry: Point<f64>,
}

/// Street graph edge (footpath segment).
#[derive(Debug, Clone)]
pub struct StreetEdge {
    /// Geodesic length in meters, strictly positive and finite.
    pub length: f64,
}

impl StreetEdge {
    pub fn length_meters(&self) -> f64 {
        self.length
    }
}
