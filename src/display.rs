//! Frame annotation, display fitting and the preview display sink
//!
//! Every image the operator sees goes through the same path: an optional
//! annotation pass, a downscale into the target region (aspect preserved,
//! never upscaled), then a hand-off to a [`DisplaySink`]. The production sink
//! is [`PreviewStore`], which JPEG-encodes each region for the web UI.

use anyhow::Result;
use arc_swap::ArcSwap;
use image::imageops::{self, FilterType};
use image::{ImageBuffer, ImageOutputFormat, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_line_segment_mut};
use serde::Serialize;
use std::io::Cursor;
use std::sync::Arc;
use tracing::warn;

use crate::config::Size;
use crate::points::Point;

/// Colour of the selection outline
const OUTLINE: Rgb<u8> = Rgb([0, 255, 0]);

/// The display areas of the operator UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayRegion {
    /// Live feed with the selection outline
    Raw,
    /// Live rectified region
    Rectified,
    /// Still captured from the rectified feed
    Captured,
}

impl DisplayRegion {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisplayRegion::Raw => "raw",
            DisplayRegion::Rectified => "rectified",
            DisplayRegion::Captured => "captured",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "raw" => Some(DisplayRegion::Raw),
            "rectified" => Some(DisplayRegion::Rectified),
            "captured" => Some(DisplayRegion::Captured),
            _ => None,
        }
    }
}

/// Receives rendered images for a display region
pub trait DisplaySink {
    fn show(&mut self, region: DisplayRegion, image: &RgbImage);
}

/// Placement of a scaled image inside a display area
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Letterbox {
    /// Scaled image width
    pub width: u32,
    /// Scaled image height
    pub height: u32,
    /// Left margin inside the area
    pub offset_x: u32,
    /// Top margin inside the area
    pub offset_y: u32,
}

impl Letterbox {
    /// Fit an image of `image` size into `area`, shrinking only when it does not fit
    pub fn fit(image: (u32, u32), area: Size) -> Self {
        let (width, height) = image;
        let (new_width, new_height) = if width > area.width || height > area.height {
            let aspect = width as f64 / height.max(1) as f64;
            if width as f64 / area.width.max(1) as f64 > height as f64 / area.height.max(1) as f64 {
                (area.width, (area.width as f64 / aspect) as u32)
            } else {
                ((area.height as f64 * aspect) as u32, area.height)
            }
        } else {
            (width, height)
        };

        let new_width = new_width.max(1).min(area.width.max(1));
        let new_height = new_height.max(1).min(area.height.max(1));

        Self {
            width: new_width,
            height: new_height,
            offset_x: area.width.saturating_sub(new_width) / 2,
            offset_y: area.height.saturating_sub(new_height) / 2,
        }
    }

    /// Map area coordinates back to source-image coordinates.
    /// Returns `None` for positions in the margins.
    pub fn to_image(&self, x: i32, y: i32, image: (u32, u32)) -> Option<Point> {
        let rel_x = x as i64 - self.offset_x as i64;
        let rel_y = y as i64 - self.offset_y as i64;
        if rel_x < 0 || rel_y < 0 || rel_x >= self.width as i64 || rel_y >= self.height as i64 {
            return None;
        }

        let img_x = rel_x * image.0 as i64 / self.width as i64;
        let img_y = rel_y * image.1 as i64 / self.height as i64;
        Some(Point::new(img_x as i32, img_y as i32))
    }
}

/// Downscale an image to fit `area`, keeping its aspect ratio
pub fn resize_keep_aspect(image: &RgbImage, area: Size) -> RgbImage {
    let layout = Letterbox::fit(image.dimensions(), area);
    if (layout.width, layout.height) == image.dimensions() {
        return image.clone();
    }
    imageops::resize(image, layout.width, layout.height, FilterType::Triangle)
}

/// Draw the closed outline through the selected points on a copy of `frame`
pub fn annotate(frame: &RgbImage, points: &[Point]) -> RgbImage {
    let mut out = frame.clone();
    match points {
        [] => {}
        [p] => draw_filled_circle_mut(&mut out, (p.x, p.y), 1, OUTLINE),
        _ => {
            for (i, from) in points.iter().enumerate() {
                let to = points[(i + 1) % points.len()];
                draw_thick_segment(&mut out, *from, to);
            }
        }
    }
    out
}

/// Two pixel wide segment, drawn as adjacent one pixel lines
fn draw_thick_segment(image: &mut RgbImage, from: Point, to: Point) {
    let (dx, dy) = ((to.x - from.x).abs(), (to.y - from.y).abs());
    let (ox, oy) = if dx >= dy { (0.0, 1.0) } else { (1.0, 0.0) };
    for k in 0..2 {
        let k = k as f32;
        draw_line_segment_mut(
            image,
            (from.x as f32 + ox * k, from.y as f32 + oy * k),
            (to.x as f32 + ox * k, to.y as f32 + oy * k),
            OUTLINE,
        );
    }
}

/// Encode RGB data to JPEG
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut jpeg_data = Vec::new();
    let mut cursor = Cursor::new(&mut jpeg_data);
    image.write_to(&mut cursor, ImageOutputFormat::Jpeg(quality))?;
    Ok(jpeg_data)
}

/// Latest JPEG-encoded image per display region, shared with the web server
pub struct PreviewStore {
    raw: ArcSwap<Vec<u8>>,
    rectified: ArcSwap<Vec<u8>>,
    captured: ArcSwap<Vec<u8>>,
    quality: u8,
}

impl PreviewStore {
    pub fn new(quality: u8) -> Self {
        Self {
            raw: ArcSwap::from_pointee(Vec::new()),
            rectified: ArcSwap::from_pointee(Vec::new()),
            captured: ArcSwap::from_pointee(Vec::new()),
            quality,
        }
    }

    fn slot(&self, region: DisplayRegion) -> &ArcSwap<Vec<u8>> {
        match region {
            DisplayRegion::Raw => &self.raw,
            DisplayRegion::Rectified => &self.rectified,
            DisplayRegion::Captured => &self.captured,
        }
    }

    /// Latest encoded frame for a region; empty until the first frame is shown
    pub fn get(&self, region: DisplayRegion) -> Arc<Vec<u8>> {
        self.slot(region).load_full()
    }

    pub fn publish(&self, region: DisplayRegion, image: &RgbImage) {
        match encode_jpeg(image, self.quality) {
            Ok(jpeg) => self.slot(region).store(Arc::new(jpeg)),
            Err(e) => warn!("Failed to encode {} preview: {}", region.as_str(), e),
        }
    }
}

impl DisplaySink for Arc<PreviewStore> {
    fn show(&mut self, region: DisplayRegion, image: &RgbImage) {
        self.publish(region, image);
    }
}

/// Build an RGB image from a packed buffer, as delivered by capture adapters
pub fn rgb_from_raw(width: u32, height: u32, data: Vec<u8>) -> Option<RgbImage> {
    ImageBuffer::<Rgb<u8>, _>::from_raw(width, height, data)
}
