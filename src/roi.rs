//! Region-of-interest containment tests.
//!
//! A rule may restrict itself to a sub-area of the frame. A disabled region
//! always reports containment so that the rule has no spatial restriction.

use serde::{Deserialize, Serialize};

use crate::model::{BoundingBox, Point};

/// Shape of a region of interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoiShape {
    /// Axis-aligned box given by two opposite corners.
    Rectangle,
    /// Ordered vertex list, implicitly closed.
    Polygon,
}

/// A region of interest attached to a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Roi {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(rename = "type", alias = "shape")]
    pub shape: RoiShape,

    pub points: Vec<Point>,
}

fn default_enabled() -> bool {
    true
}

impl Roi {
    pub fn rectangle(a: Point, b: Point) -> Self {
        Self {
            enabled: true,
            shape: RoiShape::Rectangle,
            points: vec![a, b],
        }
    }

    pub fn polygon(points: Vec<Point>) -> Self {
        Self {
            enabled: true,
            shape: RoiShape::Polygon,
            points,
        }
    }

    /// Point-in-region test. Rectangle bounds are inclusive.
    pub fn contains(&self, point: Point) -> bool {
        if !self.enabled {
            return true;
        }

        match self.shape {
            RoiShape::Rectangle => match self.points.as_slice() {
                [a, b, ..] => {
                    let (min_x, max_x) = (a.x.min(b.x), a.x.max(b.x));
                    let (min_y, max_y) = (a.y.min(b.y), a.y.max(b.y));
                    (min_x..=max_x).contains(&point.x) && (min_y..=max_y).contains(&point.y)
                }
                _ => false,
            },
            RoiShape::Polygon => point_in_polygon(point, &self.points),
        }
    }

    /// Containment of the box's centroid (not full coverage).
    pub fn contains_bbox(&self, bbox: &BoundingBox) -> bool {
        self.contains(bbox.center())
    }

    /// Shape-level validation used when a rule document is loaded.
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.points.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
            return Err("roi points must be finite".to_string());
        }
        match self.shape {
            RoiShape::Rectangle if self.points.len() != 2 => Err(format!(
                "rectangle roi needs exactly 2 points, got {}",
                self.points.len()
            )),
            RoiShape::Polygon if self.points.len() < 3 => Err(format!(
                "polygon roi needs at least 3 points, got {}",
                self.points.len()
            )),
            _ => Ok(()),
        }
    }
}

/// Even-odd ray casting against an implicitly closed vertex list.
fn point_in_polygon(point: Point, vertices: &[Point]) -> bool {
    if vertices.len() < 3 {
        return false;
    }

    let mut inside = false;
    let mut prev = vertices[vertices.len() - 1];

    for &curr in vertices {
        // Horizontal edges can never be crossed by the horizontal ray and
        // would divide by zero below.
        if prev.y != curr.y
            && point.y > prev.y.min(curr.y)
            && point.y <= prev.y.max(curr.y)
            && point.x <= prev.x.max(curr.x)
        {
            let x_cross = (point.y - prev.y) * (curr.x - prev.x) / (curr.y - prev.y) + prev.x;
            if prev.x == curr.x || point.x <= x_cross {
                inside = !inside;
            }
        }
        prev = curr;
    }

    inside
}
