//! Operator point selection for the rectification quadrilateral

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::display::Letterbox;

/// Number of points that define the rectification quadrilateral
pub const QUAD_POINTS: usize = 4;

/// A point in source-image pixel coordinates
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn as_f64(&self) -> (f64, f64) {
        (self.x as f64, self.y as f64)
    }
}

/// Ordered set of up to four clicked points.
///
/// Points are kept in click order, which is also the winding order used for
/// rectification (top-left, top-right, bottom-right, bottom-left). Adding a
/// point to a full set wipes the set first rather than sliding a window.
#[derive(Debug, Clone, Default)]
pub struct PointSelector {
    points: Vec<Point>,
}

impl PointSelector {
    pub fn new() -> Self {
        Self {
            points: Vec::with_capacity(QUAD_POINTS),
        }
    }

    /// Append a point, clearing the set first if it already holds four
    pub fn add(&mut self, point: Point) {
        if self.is_complete() {
            self.points.clear();
        }
        self.points.push(point);
    }

    /// Handle a click inside the raw display region.
    ///
    /// A full set is cleared before the click is mapped, so a click in the
    /// letterbox margin still resets a completed quadrilateral.
    pub fn select_at(
        &mut self,
        x: i32,
        y: i32,
        layout: &Letterbox,
        image_size: (u32, u32),
    ) -> Option<Point> {
        if self.is_complete() {
            self.points.clear();
        }

        let Some(point) = layout.to_image(x, y, image_size) else {
            debug!("Click at ({}, {}) is outside the displayed image", x, y);
            return None;
        };

        self.add(point);
        info!("Point {}: ({}, {})", self.points.len(), point.x, point.y);
        if let Some(quad) = self.quad() {
            info!("Selected 4 points: {:?}", quad);
        }
        Some(point)
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn is_complete(&self) -> bool {
        self.points.len() >= QUAD_POINTS
    }

    /// The four points in click order, once all of them are present
    pub fn quad(&self) -> Option<[Point; QUAD_POINTS]> {
        self.points.as_slice().try_into().ok()
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }
}
