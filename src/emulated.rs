//! Synthetic camera for running without hardware
//!
//! Renders a dim gradient with a bright tilted target plate and a drifting
//! beam spot, so the selection and rectification can be exercised end to end.
//! Gain scales brightness the way a sensor's analogue gain would.

use image::{Rgb, RgbImage};
use std::time::Duration;

use crate::camera_controls::{check_range, GainControl, GainError};
use crate::capture::{CaptureError, FrameSource};

/// Gain range reported by the emulated sensor
pub const EMULATED_GAIN_RANGE: (i64, i64) = (0, 1023);

pub struct SyntheticCamera {
    width: u32,
    height: u32,
    gain: i64,
    frame_index: u64,
}

impl SyntheticCamera {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            gain: EMULATED_GAIN_RANGE.0,
            frame_index: 0,
        }
    }

    fn render(&self) -> RgbImage {
        let (w, h) = (self.width as f64, self.height as f64);
        let scale = 1.0 + self.gain as f64 / EMULATED_GAIN_RANGE.1 as f64;

        // spot drifts along a slow ellipse
        let t = self.frame_index as f64 * 0.05;
        let spot = (w * (0.5 + 0.15 * t.cos()), h * (0.5 + 0.1 * t.sin()));
        let sigma2 = (w.min(h) * 0.06).powi(2);

        // plate corners, slightly keystoned
        let plate = [
            (w * 0.22, h * 0.20),
            (w * 0.80, h * 0.26),
            (w * 0.76, h * 0.82),
            (w * 0.18, h * 0.74),
        ];

        RgbImage::from_fn(self.width, self.height, |x, y| {
            let (fx, fy) = (x as f64, y as f64);
            let mut value = 20.0 + 30.0 * fx / w + 20.0 * fy / h;
            if inside_convex(&plate, fx, fy) {
                value += 60.0;
            }
            let d2 = (fx - spot.0).powi(2) + (fy - spot.1).powi(2);
            let beam = 160.0 * (-d2 / (2.0 * sigma2)).exp();

            let level = |v: f64| (v * scale).round().clamp(0.0, 255.0) as u8;
            Rgb([level(value + beam), level(value + beam * 0.8), level(value)])
        })
    }
}

/// Point-in-polygon for a convex quad with clockwise (image space) winding
fn inside_convex(quad: &[(f64, f64); 4], x: f64, y: f64) -> bool {
    (0..4).all(|i| {
        let (ax, ay) = quad[i];
        let (bx, by) = quad[(i + 1) % 4];
        (bx - ax) * (y - ay) - (by - ay) * (x - ax) >= 0.0
    })
}

impl FrameSource for SyntheticCamera {
    fn poll_frame(&mut self, _timeout: Duration) -> Result<RgbImage, CaptureError> {
        let frame = self.render();
        self.frame_index += 1;
        Ok(frame)
    }
}

impl GainControl for SyntheticCamera {
    fn gain_range(&self) -> (i64, i64) {
        EMULATED_GAIN_RANGE
    }

    fn set_gain(&mut self, value: i64) -> Result<(), GainError> {
        check_range(value, EMULATED_GAIN_RANGE)?;
        self.gain = value;
        Ok(())
    }

    fn gain(&self) -> Result<i64, GainError> {
        Ok(self.gain)
    }
}
