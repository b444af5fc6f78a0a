//! Video recording of the live feed
//!
//! [`RecordingController`] is the bookkeeping half: it decides whether a start
//! or stop request does anything and produces the requests for the sink. The
//! sink itself sits behind [`VideoSink`]; [`Y4mSink`] writes YUV4MPEG2 files.

use image::RgbImage;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::info;

use crate::config::{RecordingConfig, Size};

#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("recording sink is not open")]
    NotOpen,
    #[error("recording sink is already open")]
    AlreadyOpen,
    #[error("frame size {got:?} does not match recording size {expected:?}")]
    SizeChanged { expected: Size, got: Size },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("y4m error: {0}")]
    Y4m(#[from] y4m::Error),
}

/// Output video sink
pub trait VideoSink {
    fn open(&mut self, path: &Path, fps: u32, size: Size) -> Result<(), RecordingError>;
    fn write_frame(&mut self, frame: &RgbImage) -> Result<(), RecordingError>;
    fn close(&mut self) -> Result<(), RecordingError>;
    fn is_open(&self) -> bool;
}

/// Request to open the sink for a new recording
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub path: PathBuf,
    pub fps: u32,
    pub size: Size,
}

/// Tracks whether a recording is running
#[derive(Debug)]
pub struct RecordingController {
    directory: PathBuf,
    fps: u32,
    active: Option<OpenRequest>,
    started: u32,
}

impl RecordingController {
    pub fn new(config: &RecordingConfig) -> Self {
        Self {
            directory: config.directory.clone(),
            fps: config.fps.max(1),
            active: None,
            started: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn current(&self) -> Option<&OpenRequest> {
        self.active.as_ref()
    }

    /// Begin recording sized to `current`.
    /// No-op when already recording or when there is no frame yet.
    pub fn start(&mut self, current: Option<&RgbImage>) -> Option<OpenRequest> {
        if self.active.is_some() {
            return None;
        }
        let frame = current?;

        self.started += 1;
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let request = OpenRequest {
            path: self
                .directory
                .join(format!("recording-{}-{}.y4m", stamp, self.started)),
            fps: self.fps,
            size: Size::new(frame.width(), frame.height()),
        };
        self.active = Some(request.clone());
        Some(request)
    }

    /// End the current recording; returns whether there was one
    pub fn stop(&mut self) -> bool {
        self.active.take().is_some()
    }
}

/// YUV4MPEG2 writer, 4:4:4 full range
pub struct Y4mSink {
    encoder: Option<y4m::Encoder<BufWriter<File>>>,
    size: Size,
    frames: u64,
    path: PathBuf,
}

impl Y4mSink {
    pub fn new() -> Self {
        Self {
            encoder: None,
            size: Size::new(0, 0),
            frames: 0,
            path: PathBuf::new(),
        }
    }
}

impl Default for Y4mSink {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoSink for Y4mSink {
    fn open(&mut self, path: &Path, fps: u32, size: Size) -> Result<(), RecordingError> {
        if self.encoder.is_some() {
            return Err(RecordingError::AlreadyOpen);
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = BufWriter::new(File::create(path)?);
        let encoder = y4m::EncoderBuilder::new(
            size.width as usize,
            size.height as usize,
            y4m::Ratio::new(fps.max(1) as usize, 1),
        )
        .with_colorspace(y4m::Colorspace::C444)
        .append_vendor_extension(y4m::VendorExtensionString::new(b"COLORRANGE=FULL".to_vec())?)
        .write_header(file)?;

        self.encoder = Some(encoder);
        self.size = size;
        self.frames = 0;
        self.path = path.to_path_buf();
        info!("Recording to {:?} ({}x{} @ {} fps)", path, size.width, size.height, fps);
        Ok(())
    }

    fn write_frame(&mut self, frame: &RgbImage) -> Result<(), RecordingError> {
        let encoder = self.encoder.as_mut().ok_or(RecordingError::NotOpen)?;
        let got = Size::new(frame.width(), frame.height());
        if got != self.size {
            return Err(RecordingError::SizeChanged {
                expected: self.size,
                got,
            });
        }

        let (y, u, v) = rgb_to_yuv444(frame);
        encoder.write_frame(&y4m::Frame::new([&y[..], &u[..], &v[..]], None))?;
        self.frames += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), RecordingError> {
        let encoder = self.encoder.take().ok_or(RecordingError::NotOpen)?;
        // dropping the encoder drops the buffered writer, which flushes
        drop(encoder);
        info!("Recording {:?} closed after {} frames", self.path, self.frames);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.encoder.is_some()
    }
}

/// Full-range BT.601 planar conversion
fn rgb_to_yuv444(frame: &RgbImage) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
    let n = frame.width() as usize * frame.height() as usize;
    let mut y = Vec::with_capacity(n);
    let mut u = Vec::with_capacity(n);
    let mut v = Vec::with_capacity(n);

    for px in frame.pixels() {
        let [r, g, b] = px.0.map(|c| c as f32);
        y.push((0.299 * r + 0.587 * g + 0.114 * b).round().clamp(0.0, 255.0) as u8);
        u.push((128.0 - 0.168_736 * r - 0.331_264 * g + 0.5 * b).round().clamp(0.0, 255.0) as u8);
        v.push((128.0 + 0.5 * r - 0.418_688 * g - 0.081_312 * b).round().clamp(0.0, 255.0) as u8);
    }

    (y, u, v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn config(dir: &Path) -> RecordingConfig {
        RecordingConfig {
            directory: dir.to_path_buf(),
            fps: 25,
        }
    }

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("beammon-test-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_start_without_frame_is_noop() {
        let mut rec = RecordingController::new(&RecordingConfig::default());
        assert!(rec.start(None).is_none());
        assert!(!rec.is_active());
    }

    #[test]
    fn test_start_twice_opens_once() {
        let mut rec = RecordingController::new(&config(Path::new("out")));
        let frame = RgbImage::new(64, 48);

        let first = rec.start(Some(&frame)).unwrap();
        assert_eq!(first.size, Size::new(64, 48));
        assert_eq!(first.fps, 25);
        assert!(first.path.starts_with("out"));
        assert!(rec.start(Some(&frame)).is_none());
        assert_eq!(rec.current(), Some(&first));
    }

    #[test]
    fn test_stop_without_start_is_noop() {
        let mut rec = RecordingController::new(&RecordingConfig::default());
        assert!(!rec.stop());
        assert!(!rec.is_active());
    }

    #[test]
    fn test_restart_gets_new_file() {
        let mut rec = RecordingController::new(&RecordingConfig::default());
        let frame = RgbImage::new(4, 4);
        let a = rec.start(Some(&frame)).unwrap();
        assert!(rec.stop());
        let b = rec.start(Some(&frame)).unwrap();
        assert_ne!(a.path, b.path);
    }

    #[test]
    fn test_yuv_conversion_extremes() {
        let frame = RgbImage::from_fn(2, 1, |x, _| {
            if x == 0 {
                Rgb([0, 0, 0])
            } else {
                Rgb([255, 255, 255])
            }
        });
        let (y, u, v) = rgb_to_yuv444(&frame);
        assert_eq!(y, vec![0, 255]);
        assert_eq!(u, vec![128, 128]);
        assert_eq!(v, vec![128, 128]);
    }

    #[test]
    fn test_y4m_sink_writes_header_and_frames() {
        let dir = temp_dir("y4m");
        let path = dir.join("clip.y4m");
        let mut sink = Y4mSink::new();

        sink.open(&path, 30, Size::new(4, 2)).unwrap();
        assert!(sink.is_open());
        assert!(matches!(sink.open(&path, 30, Size::new(4, 2)), Err(RecordingError::AlreadyOpen)));

        sink.write_frame(&RgbImage::new(4, 2)).unwrap();
        sink.write_frame(&RgbImage::new(4, 2)).unwrap();
        assert!(matches!(
            sink.write_frame(&RgbImage::new(8, 2)),
            Err(RecordingError::SizeChanged { .. })
        ));
        sink.close().unwrap();
        assert!(!sink.is_open());

        let bytes = std::fs::read(&path).unwrap();
        assert!(bytes.starts_with(b"YUV4MPEG2 W4 H2 F30:1"));
        let frames = bytes.windows(6).filter(|w| w == b"FRAME\n").count();
        assert_eq!(frames, 2);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_y4m_sink_requires_open() {
        let mut sink = Y4mSink::new();
        assert!(matches!(sink.write_frame(&RgbImage::new(1, 1)), Err(RecordingError::NotOpen)));
        assert!(matches!(sink.close(), Err(RecordingError::NotOpen)));
    }
}
