//! Video capture from V4L2 devices
//!
//! Frames are grabbed on a dedicated thread and handed to the event loop
//! through a single-slot mailbox: a newer frame replaces an unclaimed older
//! one, so a slow consumer always sees the most recent image ("latest only").
//! Supported pixel formats are MJPEG, YUYV, RGB24 and BGR24; everything is
//! converted to RGB before it leaves this module.
//!
//! Performance notes:
//! - turbojpeg (libjpeg-turbo with SIMD) decodes MJPEG, jpeg-decoder is the fallback
//! - Integer-only YUYV to RGB conversion

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::camera_controls::{GainControl, GainError, V4lGain};
use crate::config::VideoConfig;
use crate::display::rgb_from_raw;

thread_local! {
    static JPEG_DECOMPRESSOR: std::cell::RefCell<Option<turbojpeg::Decompressor>> =
        std::cell::RefCell::new(turbojpeg::Decompressor::new().ok());
}

/// Supported pixel formats in order of preference
const PREFERRED_FORMATS: &[&[u8; 4]] = &[
    b"MJPG", // Motion JPEG - compressed, enables high FPS over USB
    b"YUYV", // YUV 4:2:2 - uncompressed
    b"RGB3", // RGB24
    b"BGR3", // BGR24
];

/// Number of mmap buffers queued with the driver
const STREAM_BUFFERS: u32 = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CaptureError {
    /// No usable frame this time round; the next poll may succeed
    #[error("frame unavailable")]
    Unavailable,
    #[error("no frame within {0:?}")]
    Timeout(Duration),
    #[error("camera disconnected: {0}")]
    Disconnected(String),
}

/// Source of raw colour frames
pub trait FrameSource {
    /// Wait up to `timeout` for the newest frame
    fn poll_frame(&mut self, timeout: Duration) -> Result<RgbImage, CaptureError>;
}

/// A frame source that also exposes gain
pub trait Camera: FrameSource + GainControl + Send {}

impl<T: FrameSource + GainControl + Send> Camera for T {}

/// Single-slot mailbox between the grab thread and the consumer
#[derive(Default)]
struct Mailbox {
    state: Mutex<MailboxState>,
    ready: Condvar,
}

#[derive(Default)]
struct MailboxState {
    frame: Option<RgbImage>,
    /// Frames replaced before anyone claimed them
    skipped: u64,
    /// The last grab produced nothing usable
    unavailable: bool,
    /// The grab thread has stopped for good
    failure: Option<String>,
}

impl Mailbox {
    fn put(&self, frame: RgbImage) {
        let mut state = self.state.lock();
        if state.frame.replace(frame).is_some() {
            state.skipped += 1;
        }
        state.unavailable = false;
        self.ready.notify_one();
    }

    fn mark_unavailable(&self) {
        let mut state = self.state.lock();
        if state.frame.is_none() {
            state.unavailable = true;
            self.ready.notify_one();
        }
    }

    fn fail(&self, reason: String) {
        let mut state = self.state.lock();
        state.failure = Some(reason);
        self.ready.notify_all();
    }

    fn take(&self, timeout: Duration) -> Result<RgbImage, CaptureError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(frame) = state.frame.take() {
                return Ok(frame);
            }
            if let Some(reason) = &state.failure {
                return Err(CaptureError::Disconnected(reason.clone()));
            }
            if state.unavailable {
                state.unavailable = false;
                return Err(CaptureError::Unavailable);
            }
            if self.ready.wait_until(&mut state, deadline).timed_out() {
                return match state.frame.take() {
                    Some(frame) => Ok(frame),
                    None => Err(CaptureError::Timeout(timeout)),
                };
            }
        }
    }

    fn skipped(&self) -> u64 {
        self.state.lock().skipped
    }
}

/// Input pixel layout negotiated with the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputLayout {
    Mjpeg,
    Yuyv,
    Rgb,
    Bgr,
}

impl InputLayout {
    fn from_fourcc(fourcc: &[u8; 4]) -> Self {
        match fourcc {
            b"MJPG" => InputLayout::Mjpeg,
            b"YUYV" => InputLayout::Yuyv,
            b"BGR3" => InputLayout::Bgr,
            _ => InputLayout::Rgb,
        }
    }
}

/// Camera backed by a V4L2 capture device
pub struct V4lCamera {
    mailbox: Arc<Mailbox>,
    stop: Arc<AtomicBool>,
    grabber: Option<JoinHandle<()>>,
    gain: V4lGain,
    width: u32,
    height: u32,
}

impl V4lCamera {
    /// Open the device and start grabbing
    pub fn open(video: &VideoConfig) -> Result<Self> {
        info!("=== Opening capture device {} ===", video.device);
        info!("Requested resolution: {}x{} @ {} fps", video.width, video.height, video.fps);

        let mailbox = Arc::new(Mailbox::default());
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        let grabber = {
            let video = video.clone();
            let mailbox = mailbox.clone();
            let stop = stop.clone();
            std::thread::Builder::new()
                .name("v4l-grab".to_string())
                .spawn(move || grab_loop(&video, &mailbox, &stop, ready_tx))
                .context("Failed to spawn grab thread")?
        };

        let (width, height) = ready_rx
            .recv()
            .context("Grab thread exited during setup")?
            .map_err(|e| anyhow!(e))?;

        let gain = match V4lGain::discover(&video.device) {
            Ok(gain) => gain,
            Err(e) => {
                warn!("Failed to query gain control: {:#}", e);
                V4lGain::unsupported(&video.device)
            }
        };

        Ok(Self {
            mailbox,
            stop,
            grabber: Some(grabber),
            gain,
            width,
            height,
        })
    }

    pub fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl FrameSource for V4lCamera {
    fn poll_frame(&mut self, timeout: Duration) -> Result<RgbImage, CaptureError> {
        self.mailbox.take(timeout)
    }
}

impl GainControl for V4lCamera {
    fn gain_range(&self) -> (i64, i64) {
        self.gain.gain_range()
    }

    fn set_gain(&mut self, value: i64) -> Result<(), GainError> {
        self.gain.set_gain(value)
    }

    fn gain(&self) -> Result<i64, GainError> {
        self.gain.gain()
    }
}

impl Drop for V4lCamera {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.grabber.take() {
            if handle.join().is_err() {
                warn!("Grab thread panicked");
            }
        }
        info!(
            "Capture stopped ({} frames replaced before being displayed)",
            self.mailbox.skipped()
        );
    }
}

/// Body of the grab thread: owns the device and stream for their whole lifetime
fn grab_loop(
    video: &VideoConfig,
    mailbox: &Mailbox,
    stop: &AtomicBool,
    ready: mpsc::SyncSender<Result<(u32, u32), String>>,
) {
    let (dev, format) = match open_device(video) {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready.send(Err(format!("{:#}", e)));
            return;
        }
    };

    let mut stream = match Stream::with_buffers(&dev, Type::VideoCapture, STREAM_BUFFERS) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(format!("Failed to create capture stream: {}", e)));
            return;
        }
    };
    stream.set_timeout(video.grab_timeout());

    let layout = InputLayout::from_fourcc(&format.fourcc.repr);
    let (width, height) = (format.width, format.height);
    info!("Input layout: {:?} at {}x{}", layout, width, height);
    let _ = ready.send(Ok((width, height)));

    let rgb_size = width as usize * height as usize * 3;
    let mut frame_count = 0u64;

    while !stop.load(Ordering::SeqCst) {
        let buf = match stream.next() {
            Ok((buf, _meta)) => buf,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                debug!("Grab timed out after {:?}", video.grab_timeout());
                continue;
            }
            Err(e) => {
                warn!("Capture stream failed: {}", e);
                mailbox.fail(e.to_string());
                return;
            }
        };

        let mut rgb = vec![0u8; rgb_size];
        if !convert_to_rgb(layout, buf, &mut rgb, width as usize, height as usize) {
            if frame_count % 100 == 0 {
                warn!("Failed to decode {:?} frame", layout);
            }
            mailbox.mark_unavailable();
            continue;
        }

        match rgb_from_raw(width, height, rgb) {
            Some(frame) => mailbox.put(frame),
            None => mailbox.mark_unavailable(),
        }
        frame_count += 1;
    }

    debug!("Grab thread stopping after {} frames", frame_count);
}

/// Open the device and negotiate format and frame rate
fn open_device(video: &VideoConfig) -> Result<(Device, v4l::Format)> {
    let dev = Device::with_path(&video.device)
        .with_context(|| format!("Failed to open input device: {}", video.device))?;

    let caps = dev.query_caps()
        .context("Failed to query device capabilities")?;
    info!("Camera: {} (driver: {})", caps.card, caps.driver);

    let format = configure_capture_format(&dev, video.width, video.height)?;
    info!(
        "Capture format: {}x{} {:?}",
        format.width, format.height,
        String::from_utf8_lossy(&format.fourcc.repr)
    );

    if let Err(e) = set_frame_rate(&dev, video.fps) {
        warn!("Could not set frame rate to {} fps: {}", video.fps, e);
    }

    Ok((dev, format))
}

/// Configure the capture format, trying preferred formats in order
fn configure_capture_format(dev: &Device, width: u32, height: u32) -> Result<v4l::Format> {
    let formats = dev.enum_formats()
        .context("Failed to enumerate formats")?;

    for fmt in &formats {
        debug!("  {:?}: {}", String::from_utf8_lossy(&fmt.fourcc.repr), fmt.description);
    }

    for preferred in PREFERRED_FORMATS {
        let fourcc = FourCC::new(preferred);
        if !formats.iter().any(|f| f.fourcc == fourcc) {
            continue;
        }

        let mut format = dev.format()
            .context("Failed to get current format")?;
        format.width = width;
        format.height = height;
        format.fourcc = fourcc;

        match dev.set_format(&format) {
            Ok(actual) => return Ok(actual),
            Err(e) => {
                warn!("Could not set format {:?} at {}x{}: {}",
                    String::from_utf8_lossy(*preferred), width, height, e);
            }
        }
    }

    // Fall back to whatever the device gives us
    let current = dev.format().context("Failed to get device format")?;
    info!("Using device's current format: {}x{} {:?}",
        current.width, current.height,
        String::from_utf8_lossy(&current.fourcc.repr));
    Ok(current)
}

/// Set the frame rate on the capture device
fn set_frame_rate(dev: &Device, fps: u32) -> Result<()> {
    let mut params = dev.params()
        .context("Failed to get parameters")?;

    params.interval = v4l::Fraction::new(1, fps.max(1));

    dev.set_params(&params)
        .context("Failed to set parameters")?;

    let actual = dev.params().context("Failed to read back parameters")?;
    info!("Frame interval: {}/{} ({:.1} fps, requested {})",
        actual.interval.numerator,
        actual.interval.denominator,
        actual.interval.denominator as f64 / actual.interval.numerator.max(1) as f64,
        fps);

    Ok(())
}

/// Convert one raw buffer to packed RGB. Returns false if the frame is unusable.
fn convert_to_rgb(
    layout: InputLayout,
    raw: &[u8],
    rgb: &mut [u8],
    width: usize,
    height: usize,
) -> bool {
    match layout {
        InputLayout::Mjpeg => decode_mjpeg(raw, rgb, width, height),
        InputLayout::Yuyv => {
            if raw.len() < width * height * 2 {
                return false;
            }
            yuyv_to_rgb(raw, rgb, width, height);
            true
        }
        InputLayout::Bgr => {
            if raw.len() < rgb.len() {
                return false;
            }
            bgr_to_rgb(raw, rgb);
            true
        }
        InputLayout::Rgb => {
            if raw.len() < rgb.len() {
                return false;
            }
            let len = rgb.len();
            rgb.copy_from_slice(&raw[..len]);
            true
        }
    }
}

/// Decode an MJPEG frame with turbojpeg, falling back to jpeg-decoder
fn decode_mjpeg(jpeg: &[u8], rgb: &mut [u8], width: usize, height: usize) -> bool {
    let decoded = JPEG_DECOMPRESSOR.with(|cell| {
        let mut cell = cell.borrow_mut();
        let Some(decompressor) = cell.as_mut() else {
            return false;
        };
        let Ok(header) = decompressor.read_header(jpeg) else {
            return false;
        };
        if header.width != width || header.height != height {
            return false;
        }
        let image = turbojpeg::Image {
            pixels: &mut rgb[..],
            width,
            pitch: width * 3,
            height,
            format: turbojpeg::PixelFormat::RGB,
        };
        decompressor.decompress(jpeg, image).is_ok()
    });

    decoded || decode_mjpeg_software(jpeg, rgb, width, height)
}

/// Software fallback MJPEG decoder using jpeg-decoder crate
fn decode_mjpeg_software(jpeg: &[u8], rgb: &mut [u8], width: usize, height: usize) -> bool {
    let mut decoder = jpeg_decoder::Decoder::new(std::io::Cursor::new(jpeg));
    let Ok(pixels) = decoder.decode() else {
        return false;
    };
    let Some(info) = decoder.info() else {
        return false;
    };
    if info.width as usize != width || info.height as usize != height {
        return false;
    }

    match info.pixel_format {
        jpeg_decoder::PixelFormat::RGB24 if pixels.len() >= rgb.len() => {
            let len = rgb.len();
            rgb.copy_from_slice(&pixels[..len]);
            true
        }
        jpeg_decoder::PixelFormat::L8 => {
            for (dst, &gray) in rgb.chunks_exact_mut(3).zip(pixels.iter()) {
                dst.fill(gray);
            }
            true
        }
        _ => false,
    }
}

/// Convert YUYV to RGB using fixed-point BT.601 (8-bit shift)
#[inline]
pub fn yuyv_to_rgb(yuyv: &[u8], rgb: &mut [u8], width: usize, height: usize) {
    let pairs = (width * height) / 2;

    for (src, dst) in yuyv.chunks_exact(4).zip(rgb.chunks_exact_mut(6)).take(pairs) {
        let y0 = src[0] as i32;
        let u = src[1] as i32 - 128;
        let y1 = src[2] as i32;
        let v = src[3] as i32 - 128;

        // R = Y + 1.402 V, G = Y - 0.344 U - 0.714 V, B = Y + 1.772 U
        let v_r = (359 * v) >> 8;
        let uv_g = (88 * u + 183 * v) >> 8;
        let u_b = (454 * u) >> 8;

        for (i, y) in [y0, y1].into_iter().enumerate() {
            dst[i * 3] = (y + v_r).clamp(0, 255) as u8;
            dst[i * 3 + 1] = (y - uv_g).clamp(0, 255) as u8;
            dst[i * 3 + 2] = (y + u_b).clamp(0, 255) as u8;
        }
    }
}

/// Convert BGR to RGB (swap R and B channels)
#[inline]
pub fn bgr_to_rgb(bgr: &[u8], rgb: &mut [u8]) {
    for (src, dst) in bgr.chunks_exact(3).zip(rgb.chunks_exact_mut(3)) {
        dst[0] = src[2];
        dst[1] = src[1];
        dst[2] = src[0];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_yuyv_gray_stays_gray() {
        // U = V = 128 means no chroma
        let yuyv = [50u8, 128, 200, 128];
        let mut rgb = [0u8; 6];
        yuyv_to_rgb(&yuyv, &mut rgb, 2, 1);
        assert_eq!(rgb, [50, 50, 50, 200, 200, 200]);
    }

    #[test]
    fn test_bgr_to_rgb() {
        let bgr = [0u8, 128, 255];
        let mut rgb = [0u8; 3];
        bgr_to_rgb(&bgr, &mut rgb);
        assert_eq!(rgb, [255, 128, 0]);
    }

    #[test]
    fn test_short_buffers_are_rejected() {
        let mut rgb = vec![0u8; 4 * 2 * 3];
        assert!(!convert_to_rgb(InputLayout::Yuyv, &[0u8; 4], &mut rgb, 4, 2));
        assert!(!convert_to_rgb(InputLayout::Rgb, &[0u8; 3], &mut rgb, 4, 2));
        assert!(!convert_to_rgb(InputLayout::Mjpeg, &[0u8; 16], &mut rgb, 4, 2));
    }

    #[test]
    fn test_layout_from_fourcc() {
        assert_eq!(InputLayout::from_fourcc(b"MJPG"), InputLayout::Mjpeg);
        assert_eq!(InputLayout::from_fourcc(b"YUYV"), InputLayout::Yuyv);
        assert_eq!(InputLayout::from_fourcc(b"BGR3"), InputLayout::Bgr);
        assert_eq!(InputLayout::from_fourcc(b"RGB3"), InputLayout::Rgb);
    }

    #[test]
    fn test_mailbox_keeps_latest_only() {
        let mailbox = Mailbox::default();
        mailbox.put(RgbImage::from_pixel(1, 1, Rgb([1, 1, 1])));
        mailbox.put(RgbImage::from_pixel(1, 1, Rgb([2, 2, 2])));

        let frame = mailbox.take(Duration::from_millis(1)).unwrap();
        assert_eq!(*frame.get_pixel(0, 0), Rgb([2, 2, 2]));
        assert_eq!(mailbox.skipped(), 1);
    }

    #[test]
    fn test_mailbox_timeout() {
        let mailbox = Mailbox::default();
        let timeout = Duration::from_millis(5);
        assert_eq!(mailbox.take(timeout), Err(CaptureError::Timeout(timeout)));
    }

    #[test]
    fn test_mailbox_unavailable_then_frame() {
        let mailbox = Mailbox::default();
        mailbox.mark_unavailable();
        assert_eq!(mailbox.take(Duration::from_millis(1)), Err(CaptureError::Unavailable));

        mailbox.put(RgbImage::new(2, 2));
        assert!(mailbox.take(Duration::from_millis(1)).is_ok());
    }

    #[test]
    fn test_mailbox_failure_is_sticky() {
        let mailbox = Mailbox::default();
        mailbox.fail("unplugged".to_string());
        for _ in 0..2 {
            assert_eq!(
                mailbox.take(Duration::from_millis(1)),
                Err(CaptureError::Disconnected("unplugged".to_string()))
            );
        }
    }

    #[test]
    fn test_mailbox_wakes_waiting_consumer() {
        let mailbox = Arc::new(Mailbox::default());
        let producer = {
            let mailbox = mailbox.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                mailbox.put(RgbImage::new(3, 3));
            })
        };

        let frame = mailbox.take(Duration::from_secs(5)).unwrap();
        assert_eq!(frame.dimensions(), (3, 3));
        producer.join().unwrap();
    }
}
