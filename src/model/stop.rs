use geo::Point;

use crate::StopId;

/// Transit stop record as supplied by the host application.
///
/// `kind` selects the per-type walking radius in the overlay settings;
/// custom stops are user-created and behave like any other stop here.
#[derive(Debug, Clone, PartialEq)]
pub struct Stop {
    pub id: StopId,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    pub kind: String,
    pub is_custom: bool,
}

impl Stop {
    pub fn location(&self) -> Point<f64> {
        Point::new(self.lon, self.lat)
    }
}
