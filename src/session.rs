//! Operator session state and command dispatch
//!
//! All mutable state of a monitoring session lives in [`Session`]. Inputs
//! (frames from the camera, operator commands) arrive as [`Event`]s; handling
//! one mutates the session and returns the side effects the event loop must
//! carry out. The session itself never touches hardware, files or the UI.

use image::RgbImage;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{Config, DisplayConfig, Size};
use crate::display::{annotate, resize_keep_aspect, DisplayRegion, Letterbox};
use crate::points::{Point, PointSelector};
use crate::recording::{OpenRequest, RecordingController};
use crate::transform::Rectifier;

/// Inputs to the session
#[derive(Debug, Clone)]
pub enum Event {
    /// A new frame from the acquisition adapter
    Frame(RgbImage),
    /// Pointer click in raw display region coordinates
    Click { x: i32, y: i32 },
    /// Freeze the current rectified image into the captured region
    Capture,
    StartRecording,
    StopRecording,
    ToggleRecording,
    /// Operator asked for a new gain
    SetGain(i64),
    /// Gain value read back from the camera
    GainApplied(i64),
    /// The recording sink could not be opened
    RecordingFailed,
    /// Pause or resume acquisition
    ToggleUpdate,
    Shutdown,
}

/// Side effects requested by the session
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Show(DisplayRegion, RgbImage),
    OpenRecording(OpenRequest),
    AppendRecording(RgbImage),
    CloseRecording,
    ApplyGain(i64),
    SetPolling(bool),
}

/// Snapshot of the session for the operator UI
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub points: Vec<Point>,
    pub quad_complete: bool,
    pub recording: bool,
    pub recording_path: Option<String>,
    pub polling: bool,
    pub gain: Option<i64>,
    pub gain_min: i64,
    pub gain_max: i64,
    pub frame_size: Option<Size>,
    pub rectified_size: Size,
    pub raw_area: Size,
    pub rectified_area: Size,
    pub captured_area: Size,
    pub has_capture: bool,
}

pub struct Session {
    selector: PointSelector,
    rectifier: Rectifier,
    recording: RecordingController,
    display: DisplayConfig,
    current: Option<RgbImage>,
    rectified: Option<RgbImage>,
    has_capture: bool,
    polling: bool,
    gain: Option<i64>,
    gain_range: (i64, i64),
}

impl Session {
    pub fn new(config: &Config, gain_range: (i64, i64), gain: Option<i64>) -> Self {
        Self {
            selector: PointSelector::new(),
            rectifier: Rectifier::new(config.rectify.size()),
            recording: RecordingController::new(&config.recording),
            display: config.display.clone(),
            current: None,
            rectified: None,
            has_capture: false,
            polling: true,
            gain,
            gain_range,
        }
    }

    pub fn polling(&self) -> bool {
        self.polling
    }

    pub fn recording(&self) -> bool {
        self.recording.is_active()
    }

    pub fn points(&self) -> &[Point] {
        self.selector.points()
    }

    pub fn handle(&mut self, event: Event) -> Vec<Effect> {
        match event {
            Event::Frame(frame) => self.on_frame(frame),
            Event::Click { x, y } => self.on_click(x, y),
            Event::Capture => self.capture().into_iter().collect(),
            Event::StartRecording => self.start_recording().into_iter().collect(),
            Event::StopRecording => self.stop_recording().into_iter().collect(),
            Event::ToggleRecording => {
                if self.recording.is_active() {
                    self.stop_recording().into_iter().collect()
                } else {
                    self.start_recording().into_iter().collect()
                }
            }
            Event::SetGain(value) => vec![Effect::ApplyGain(value)],
            Event::GainApplied(value) => {
                self.gain = Some(value);
                Vec::new()
            }
            Event::RecordingFailed => {
                self.recording.stop();
                Vec::new()
            }
            Event::ToggleUpdate => {
                self.polling = !self.polling;
                info!("Acquisition {}", if self.polling { "resumed" } else { "paused" });
                vec![Effect::SetPolling(self.polling)]
            }
            Event::Shutdown => {
                self.polling = false;
                self.stop_recording().into_iter().collect()
            }
        }
    }

    fn on_frame(&mut self, frame: RgbImage) -> Vec<Effect> {
        let append = self
            .recording
            .is_active()
            .then(|| Effect::AppendRecording(frame.clone()));
        self.current = Some(frame);

        let mut effects = self.render();
        effects.extend(append);
        effects
    }

    fn on_click(&mut self, x: i32, y: i32) -> Vec<Effect> {
        let Some(frame) = &self.current else {
            if self.selector.is_complete() {
                self.selector.clear();
            }
            debug!("Click ignored, no frame yet");
            return Vec::new();
        };

        let dims = frame.dimensions();
        let layout = Letterbox::fit(dims, self.display.raw);
        self.selector.select_at(x, y, &layout, dims);

        // the timer is not running, so redraw now to show the new outline
        if self.polling {
            Vec::new()
        } else {
            self.render()
        }
    }

    /// Annotate, rectify and fit the current frame into its display regions
    fn render(&mut self) -> Vec<Effect> {
        let Some(frame) = &self.current else {
            return Vec::new();
        };

        let annotated = annotate(frame, self.selector.points());
        let mut effects = vec![Effect::Show(
            DisplayRegion::Raw,
            resize_keep_aspect(&annotated, self.display.raw),
        )];

        if let Some(quad) = self.selector.quad() {
            let rectified = self.rectifier.rectify(frame, &quad);
            effects.push(Effect::Show(
                DisplayRegion::Rectified,
                resize_keep_aspect(&rectified, self.display.rectified),
            ));
            self.rectified = Some(rectified);
        }

        effects
    }

    /// Freeze the last rectified image, which outlives a selection reset
    fn capture(&mut self) -> Option<Effect> {
        let rectified = self.rectified.as_ref()?;
        self.has_capture = true;
        info!("Captured rectified frame");
        Some(Effect::Show(
            DisplayRegion::Captured,
            resize_keep_aspect(rectified, self.display.captured),
        ))
    }

    fn start_recording(&mut self) -> Option<Effect> {
        self.recording
            .start(self.current.as_ref())
            .map(Effect::OpenRecording)
    }

    fn stop_recording(&mut self) -> Option<Effect> {
        self.recording.stop().then_some(Effect::CloseRecording)
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            points: self.points().to_vec(),
            quad_complete: self.selector.is_complete(),
            recording: self.recording(),
            recording_path: self
                .recording
                .current()
                .map(|r| r.path.display().to_string()),
            polling: self.polling,
            gain: self.gain,
            gain_min: self.gain_range.0,
            gain_max: self.gain_range.1,
            frame_size: self
                .current
                .as_ref()
                .map(|f| Size::new(f.width(), f.height())),
            rectified_size: self.rectifier.size(),
            raw_area: self.display.raw,
            rectified_area: self.display.rectified,
            captured_area: self.display.captured,
            has_capture: self.has_capture,
        }
    }
}
