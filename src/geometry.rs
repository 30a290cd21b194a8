//! Source-frame geometry and the numeric policy for admin-supplied rectangles
//!
//! All rectangles are stored in source-pixel integer units. Admin surfaces
//! work in display space and may submit fractional or out-of-bounds values;
//! [`normalize_rect`] is the single place where those are rounded
//! (half-to-even), clipped against the current stream geometry, and rejected
//! when degenerate.

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Source frame dimensions in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamGeometry {
    pub width: u32,
    pub height: u32,
}

impl StreamGeometry {
    /// Create a geometry, rejecting zero dimensions.
    pub fn new(width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(AppError::BadInput(format!(
                "stream geometry must be positive, got {}x{}",
                width, height
            )));
        }
        Ok(Self { width, height })
    }
}

impl std::fmt::Display for StreamGeometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Axis-aligned sub-rectangle of the source frame, in source-pixel units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rectangle {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rectangle {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Whether two rectangles have identical output dimensions.
    ///
    /// Same-dimension region changes are offset-only retargets on the live
    /// cropper; different dimensions force a track replacement.
    pub fn same_dimensions(&self, other: &Rectangle) -> bool {
        self.width == other.width && self.height == other.height
    }

    /// Clip this rectangle against a frame of the given dimensions.
    /// The result may have zero area.
    pub fn clipped(&self, width: u32, height: u32) -> Rectangle {
        let x = self.x.min(width);
        let y = self.y.min(height);
        Rectangle {
            x,
            y,
            width: self.width.min(width - x),
            height: self.height.min(height - y),
        }
    }
}

impl std::fmt::Display for Rectangle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}x{}+{}+{}",
            self.width, self.height, self.x, self.y
        )
    }
}

/// Rectangle as submitted by an admin: possibly fractional, possibly out of
/// the source bounds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Round a wire coordinate half-to-even and clamp it into `[0, u32::MAX]`.
fn round_coord(value: f64) -> u32 {
    let rounded = value.round_ties_even();
    if rounded.is_nan() || rounded <= 0.0 {
        0
    } else if rounded >= u32::MAX as f64 {
        u32::MAX
    } else {
        rounded as u32
    }
}

/// Normalize an admin-supplied rectangle for storage.
///
/// Coordinates are rounded half-to-even and clamped to non-negative values;
/// when a stream geometry is known the rectangle is clipped to it. A
/// rectangle whose area is zero after clipping is rejected.
pub fn normalize_rect(raw: RawRect, geometry: Option<StreamGeometry>) -> Result<Rectangle> {
    let mut rect = Rectangle {
        x: round_coord(raw.x),
        y: round_coord(raw.y),
        width: round_coord(raw.width),
        height: round_coord(raw.height),
    };

    if let Some(geometry) = geometry {
        rect = rect.clipped(geometry.width, geometry.height);
    }

    if rect.area() == 0 {
        return Err(AppError::BadInput(format!(
            "region {:?} has zero area after normalization",
            raw
        )));
    }

    Ok(rect)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GEOMETRY: StreamGeometry = StreamGeometry {
        width: 1920,
        height: 1080,
    };

    fn raw(x: f64, y: f64, width: f64, height: f64) -> RawRect {
        RawRect {
            x,
            y,
            width,
            height,
        }
    }

    #[test]
    fn test_geometry_rejects_zero_dimensions() {
        assert!(StreamGeometry::new(0, 1080).is_err());
        assert!(StreamGeometry::new(1920, 0).is_err());
        assert!(StreamGeometry::new(1920, 1080).is_ok());
    }

    #[test]
    fn test_normalize_integral_rect() {
        let rect = normalize_rect(raw(0.0, 0.0, 640.0, 360.0), Some(GEOMETRY)).unwrap();
        assert_eq!(rect, Rectangle::new(0, 0, 640, 360));
    }

    #[test]
    fn test_normalize_rounds_half_to_even() {
        // 0.5 rounds to 0, 1.5 rounds to 2, 2.5 rounds to 2
        let rect = normalize_rect(raw(0.5, 1.5, 640.5, 361.5), Some(GEOMETRY)).unwrap();
        assert_eq!(rect.x, 0);
        assert_eq!(rect.y, 2);
        assert_eq!(rect.width, 640);
        assert_eq!(rect.height, 362);
    }

    #[test]
    fn test_normalize_clips_overhang() {
        // x + width > sourceWidth: clipped, accepted
        let rect = normalize_rect(raw(1800.0, 0.0, 640.0, 360.0), Some(GEOMETRY)).unwrap();
        assert_eq!(rect, Rectangle::new(1800, 0, 120, 360));
    }

    #[test]
    fn test_normalize_clamps_negative_origin() {
        let rect = normalize_rect(raw(-40.0, -10.0, 640.0, 360.0), Some(GEOMETRY)).unwrap();
        assert_eq!(rect, Rectangle::new(0, 0, 640, 360));
    }

    #[test]
    fn test_normalize_rejects_zero_area() {
        assert!(matches!(
            normalize_rect(raw(0.0, 0.0, 0.0, 360.0), Some(GEOMETRY)),
            Err(AppError::BadInput(_))
        ));
    }

    #[test]
    fn test_normalize_rejects_fully_clipped_rect() {
        // Entirely outside the source: zero area post-clipping
        assert!(matches!(
            normalize_rect(raw(2000.0, 0.0, 100.0, 100.0), Some(GEOMETRY)),
            Err(AppError::BadInput(_))
        ));
    }

    #[test]
    fn test_normalize_without_geometry_keeps_bounds() {
        // No broadcaster yet: stored as-is after rounding
        let rect = normalize_rect(raw(100.0, 200.0, 4000.0, 3000.0), None).unwrap();
        assert_eq!(rect, Rectangle::new(100, 200, 4000, 3000));
    }

    #[test]
    fn test_same_dimensions() {
        let a = Rectangle::new(0, 0, 640, 360);
        let b = Rectangle::new(100, 200, 640, 360);
        let c = Rectangle::new(0, 0, 800, 600);
        assert!(a.same_dimensions(&b));
        assert!(!a.same_dimensions(&c));
    }

    #[test]
    fn test_round_trip_normalization_is_idempotent() {
        let rect = normalize_rect(raw(100.4, 200.6, 639.5, 360.0), Some(GEOMETRY)).unwrap();
        let again = normalize_rect(
            raw(
                rect.x as f64,
                rect.y as f64,
                rect.width as f64,
                rect.height as f64,
            ),
            Some(GEOMETRY),
        )
        .unwrap();
        assert_eq!(rect, again);
    }
}
