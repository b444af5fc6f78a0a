//! Perspective rectification of the selected quadrilateral
//!
//! This module implements the perspective (homography) transformation that
//! maps the operator's four clicked points onto a fixed-size rectangle and
//! resamples the camera frame into it.

use image::{Rgb, RgbImage};
use nalgebra::{Matrix3, SMatrix, SVector, Vector3};
use rayon::prelude::*;
use tracing::debug;

use crate::config::Size;
use crate::points::{Point, QUAD_POINTS};

/// Perspective transformation matrix (3x3 homography)
#[derive(Debug, Clone, PartialEq)]
pub struct Homography {
    matrix: Matrix3<f64>,
}

impl Homography {
    /// Compute the homography taking each `src` point onto the matching `dst` point.
    ///
    /// Uses the Direct Linear Transform with `h33` fixed to 1. A singular
    /// system (collinear or repeated points) gives the zero matrix.
    pub fn from_correspondences(
        src: [(f64, f64); QUAD_POINTS],
        dst: [(f64, f64); QUAD_POINTS],
    ) -> Self {
        // For each correspondence (x,y) -> (x',y'):
        //   x*h1 + y*h2 + h3 - x'*x*h7 - x'*y*h8 = x'
        //   x*h4 + y*h5 + h6 - y'*x*h7 - y'*y*h8 = y'
        let mut a = SMatrix::<f64, 8, 8>::zeros();
        let mut b = SVector::<f64, 8>::zeros();

        for (i, (&(x, y), &(xp, yp))) in src.iter().zip(dst.iter()).enumerate() {
            let r = i * 2;

            a[(r, 0)] = x;
            a[(r, 1)] = y;
            a[(r, 2)] = 1.0;
            a[(r, 6)] = -xp * x;
            a[(r, 7)] = -xp * y;
            b[r] = xp;

            a[(r + 1, 3)] = x;
            a[(r + 1, 4)] = y;
            a[(r + 1, 5)] = 1.0;
            a[(r + 1, 6)] = -yp * x;
            a[(r + 1, 7)] = -yp * y;
            b[r + 1] = yp;
        }

        let matrix = match a.lu().solve(&b) {
            Some(h) if h.iter().all(|v| v.is_finite()) => {
                Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], 1.0)
            }
            _ => {
                debug!("Degenerate point set, homography is singular");
                Matrix3::zeros()
            }
        };

        Self { matrix }
    }

    /// Transform a point; `None` when it maps to infinity
    #[inline]
    pub fn map(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let v = self.matrix * Vector3::new(x, y, 1.0);
        if v.z.abs() < 1e-12 {
            return None;
        }
        Some((v.x / v.z, v.y / v.z))
    }

    pub fn inverse(&self) -> Option<Homography> {
        self.matrix
            .try_inverse()
            .map(|matrix| Homography { matrix })
    }
}

/// Destination corners of the rectangle, in top-left, top-right,
/// bottom-right, bottom-left order
pub fn destination_corners(size: Size) -> [(f64, f64); QUAD_POINTS] {
    let (w, h) = (size.width as f64, size.height as f64);
    [(0.0, 0.0), (w, 0.0), (w, h), (0.0, h)]
}

/// Rectifies a clicked quadrilateral into a rectangle of fixed size
#[derive(Debug, Clone, Copy)]
pub struct Rectifier {
    size: Size,
}

impl Rectifier {
    pub fn new(size: Size) -> Self {
        Self { size }
    }

    pub fn size(&self) -> Size {
        self.size
    }

    /// Homography from the clicked points (in click order) to the output rectangle
    pub fn homography(&self, points: &[Point; QUAD_POINTS]) -> Homography {
        let src = points.map(|p| p.as_f64());
        Homography::from_correspondences(src, destination_corners(self.size))
    }

    pub fn rectify(&self, frame: &RgbImage, points: &[Point; QUAD_POINTS]) -> RgbImage {
        warp_perspective(frame, &self.homography(points), self.size)
    }
}

/// Resample `src` through `homography` into a new image of `size`.
///
/// Each output pixel is mapped back with the inverse transform and sampled
/// bilinearly; pre-images outside the source read as black.
pub fn warp_perspective(src: &RgbImage, homography: &Homography, size: Size) -> RgbImage {
    let mut out = RgbImage::new(size.width, size.height);
    let stride = size.width as usize * 3;
    if stride == 0 || size.height == 0 {
        return out;
    }

    let Some(inverse) = homography.inverse() else {
        debug!("Homography is not invertible, output left black");
        return out;
    };

    let data: &mut [u8] = &mut out;
    data.par_chunks_mut(stride).enumerate().for_each(|(dst_y, row)| {
        for (dst_x, px) in row.chunks_exact_mut(3).enumerate() {
            if let Some((sx, sy)) = inverse.map(dst_x as f64, dst_y as f64) {
                let Rgb(value) = bilinear_sample(src, sx, sy);
                px.copy_from_slice(&value);
            }
        }
    });

    out
}

/// Bilinear interpolation with a black border
#[inline]
fn bilinear_sample(src: &RgbImage, x: f64, y: f64) -> Rgb<u8> {
    let (width, height) = (src.width() as i64, src.height() as i64);
    let outside = x <= -1.0 || y <= -1.0 || x >= width as f64 || y >= height as f64;
    if !x.is_finite() || !y.is_finite() || outside {
        return Rgb([0, 0, 0]);
    }

    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let fx = x - x0 as f64;
    let fy = y - y0 as f64;

    let fetch = |px: i64, py: i64| -> [f64; 3] {
        if px < 0 || py < 0 || px >= width || py >= height {
            return [0.0; 3];
        }
        let Rgb(p) = *src.get_pixel(px as u32, py as u32);
        [p[0] as f64, p[1] as f64, p[2] as f64]
    };

    let p00 = fetch(x0, y0);
    let p10 = fetch(x0 + 1, y0);
    let p01 = fetch(x0, y0 + 1);
    let p11 = fetch(x0 + 1, y0 + 1);

    let mut result = [0u8; 3];
    for c in 0..3 {
        let value = p00[c] * (1.0 - fx) * (1.0 - fy)
            + p10[c] * fx * (1.0 - fy)
            + p01[c] * (1.0 - fx) * fy
            + p11[c] * fx * fy;
        result[c] = value.round().clamp(0.0, 255.0) as u8;
    }

    Rgb(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad(points: [(i32, i32); 4]) -> [Point; 4] {
        points.map(|(x, y)| Point::new(x, y))
    }

    /// Red channel follows x, green follows y
    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| Rgb([x as u8, y as u8, 128]))
    }

    #[test]
    fn test_identity_transform() {
        let pts = [(0.0, 0.0), (100.0, 0.0), (100.0, 100.0), (0.0, 100.0)];
        let h = Homography::from_correspondences(pts, pts);

        let (x, y) = h.map(50.0, 50.0).unwrap();
        assert!((x - 50.0).abs() < 1e-9);
        assert!((y - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_convex_quads_hit_destination_corners() {
        let rectifier = Rectifier::new(Size::new(300, 200));
        let dst = destination_corners(rectifier.size());

        for points in [
            quad([(10, 10), (110, 10), (110, 60), (10, 60)]),
            quad([(35, 20), (400, 55), (380, 300), (12, 260)]),
            quad([(200, 100), (260, 90), (290, 180), (180, 170)]),
        ] {
            let h = rectifier.homography(&points);
            for (p, &(ex, ey)) in points.iter().zip(dst.iter()) {
                let (x, y) = h.map(p.x as f64, p.y as f64).unwrap();
                assert!((x - ex).abs() < 1e-6, "x {} != {}", x, ex);
                assert!((y - ey).abs() < 1e-6, "y {} != {}", y, ey);
            }
        }
    }

    #[test]
    fn test_rectify_axis_aligned_region() {
        let frame = gradient(160, 100);
        let points = quad([(10, 10), (110, 10), (110, 60), (10, 60)]);
        let out = Rectifier::new(Size::new(300, 200)).rectify(&frame, &points);

        assert_eq!(out.dimensions(), (300, 200));
        // the region is stretched 3x horizontally and 4x vertically
        assert_eq!(*out.get_pixel(0, 0), Rgb([10, 10, 128]));
        assert_eq!(*out.get_pixel(299, 0), Rgb([110, 10, 128]));
        assert_eq!(*out.get_pixel(0, 199), Rgb([10, 60, 128]));
        assert_eq!(*out.get_pixel(299, 199), Rgb([110, 60, 128]));
        assert_eq!(*out.get_pixel(150, 100), Rgb([60, 35, 128]));
    }

    #[test]
    fn test_click_order_controls_orientation() {
        let frame = gradient(160, 100);
        // clicked right-to-left: output is mirrored horizontally
        let points = quad([(110, 10), (10, 10), (10, 60), (110, 60)]);
        let out = Rectifier::new(Size::new(300, 200)).rectify(&frame, &points);

        assert_eq!(out.get_pixel(0, 0).0[0], 110);
        assert_eq!(out.get_pixel(299, 0).0[0], 10);
    }

    #[test]
    fn test_outside_source_is_black() {
        let frame = RgbImage::from_pixel(50, 50, Rgb([200, 200, 200]));
        // quad extends past the right edge of the frame
        let points = quad([(0, 0), (100, 0), (100, 50), (0, 50)]);
        let out = Rectifier::new(Size::new(100, 50)).rectify(&frame, &points);

        assert_eq!(*out.get_pixel(10, 10), Rgb([200, 200, 200]));
        assert_eq!(*out.get_pixel(90, 10), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_degenerate_points_do_not_panic() {
        let frame = gradient(64, 64);
        let points = quad([(10, 10), (10, 10), (10, 10), (10, 10)]);
        let out = Rectifier::new(Size::new(30, 20)).rectify(&frame, &points);
        assert_eq!(out.dimensions(), (30, 20));
    }

    #[test]
    fn test_zero_matrix_has_no_inverse() {
        let h = Homography {
            matrix: Matrix3::zeros(),
        };
        assert!(h.inverse().is_none());
        assert!(h.map(1.0, 1.0).is_none());

        let out = warp_perspective(&gradient(8, 8), &h, Size::new(4, 4));
        assert!(out.pixels().all(|p| *p == Rgb([0, 0, 0])));
    }

    #[test]
    fn test_empty_output_size() {
        let frame = gradient(8, 8);
        let points = quad([(0, 0), (7, 0), (7, 7), (0, 7)]);
        let out = Rectifier::new(Size::new(0, 0)).rectify(&frame, &points);
        assert_eq!(out.dimensions(), (0, 0));
    }
}
