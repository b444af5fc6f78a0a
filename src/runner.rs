//! The single-threaded event loop
//!
//! One thread owns the [`Session`] and every adapter. It sleeps on the command
//! channel until either an operator command arrives or the next acquisition
//! tick is due, so ticks and commands are strictly serialized and no session
//! state is ever shared.

use anyhow::{anyhow, Context, Result};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::capture::{Camera, CaptureError};
use crate::config::Config;
use crate::display::DisplaySink;
use crate::recording::VideoSink;
use crate::session::{Effect, Event, Session, SessionStatus};

/// A request for the event loop, optionally answered with a fresh status
pub struct Command {
    pub event: Option<Event>,
    pub reply: Option<oneshot::Sender<SessionStatus>>,
}

/// Cloneable handle used by the web server to talk to the event loop
#[derive(Clone)]
pub struct SessionHandle {
    commands: Sender<Command>,
}

impl SessionHandle {
    /// Dispatch an event and wait for the resulting status
    pub async fn send(&self, event: Event) -> Result<SessionStatus> {
        self.request(Some(event)).await
    }

    pub async fn status(&self) -> Result<SessionStatus> {
        self.request(None).await
    }

    /// Fire-and-forget dispatch; returns false once the loop has exited
    pub fn notify(&self, event: Event) -> bool {
        self.commands
            .send(Command {
                event: Some(event),
                reply: None,
            })
            .is_ok()
    }

    async fn request(&self, event: Option<Event>) -> Result<SessionStatus> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command {
                event,
                reply: Some(tx),
            })
            .map_err(|_| anyhow!("event loop has stopped"))?;
        rx.await.context("event loop dropped the request")
    }
}

/// Create the command channel shared by the UI and the event loop
pub fn command_channel() -> (SessionHandle, Receiver<Command>) {
    let (tx, rx) = mpsc::channel();
    (SessionHandle { commands: tx }, rx)
}

pub struct EventLoop {
    session: Session,
    camera: Box<dyn Camera>,
    display: Box<dyn DisplaySink + Send>,
    video: Box<dyn VideoSink + Send>,
    commands: Receiver<Command>,
    poll_interval: Duration,
    grab_timeout: Duration,
    next_tick: Instant,
    frame_count: u64,
    write_failures: u64,
}

impl EventLoop {
    pub fn new(
        config: &Config,
        camera: Box<dyn Camera>,
        display: Box<dyn DisplaySink + Send>,
        video: Box<dyn VideoSink + Send>,
        commands: Receiver<Command>,
    ) -> Self {
        let gain_range = camera.gain_range();
        let gain = camera.gain().ok();
        info!("Gain range [{}, {}], current {:?}", gain_range.0, gain_range.1, gain);

        let mut this = Self {
            session: Session::new(config, gain_range, gain),
            camera,
            display,
            video,
            commands,
            poll_interval: config.video.poll_interval(),
            grab_timeout: config.video.grab_timeout(),
            next_tick: Instant::now(),
            frame_count: 0,
            write_failures: 0,
        };

        if let Some(initial) = config.camera.gain {
            this.dispatch(Event::SetGain(initial));
        }
        this
    }

    /// Run until shutdown is requested or every command sender is gone
    pub fn run(mut self) -> Result<()> {
        info!("Event loop started, ticking every {:?}", self.poll_interval);

        loop {
            let received = if self.session.polling() {
                let wait = self.next_tick.saturating_duration_since(Instant::now());
                self.commands.recv_timeout(wait)
            } else {
                self.commands
                    .recv()
                    .map_err(|_| RecvTimeoutError::Disconnected)
            };

            match received {
                Ok(Command { event, reply }) => {
                    let shutdown = matches!(event, Some(Event::Shutdown));
                    if let Some(event) = event {
                        self.dispatch(event);
                    }
                    if let Some(reply) = reply {
                        let _ = reply.send(self.session.status());
                    }
                    if shutdown {
                        info!("Event loop stopped after {} frames", self.frame_count);
                        return Ok(());
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.tick()?;
                    self.schedule_next_tick();
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.dispatch(Event::Shutdown);
                    info!("All command senders dropped, event loop stopped");
                    return Ok(());
                }
            }
        }
    }

    fn schedule_next_tick(&mut self) {
        self.next_tick += self.poll_interval;
        let now = Instant::now();
        // a slow tick must not cause a burst of catch-up ticks
        if self.next_tick < now {
            self.next_tick = now + self.poll_interval;
        }
    }

    /// Acquire one frame and feed it to the session
    fn tick(&mut self) -> Result<()> {
        match self.camera.poll_frame(self.grab_timeout) {
            Ok(frame) => {
                self.frame_count += 1;
                self.dispatch(Event::Frame(frame));
                Ok(())
            }
            Err(CaptureError::Unavailable) => {
                debug!("No frame available, skipping tick");
                Ok(())
            }
            Err(e @ CaptureError::Timeout(_)) => {
                warn!("{}, skipping tick", e);
                Ok(())
            }
            Err(e @ CaptureError::Disconnected(_)) => {
                self.dispatch(Event::Shutdown);
                Err(anyhow!(e)).context("Frame acquisition failed")
            }
        }
    }

    fn dispatch(&mut self, event: Event) {
        for effect in self.session.handle(event) {
            self.apply(effect);
        }
    }

    fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::Show(region, image) => self.display.show(region, &image),
            Effect::OpenRecording(request) => {
                if let Err(e) = self.video.open(&request.path, request.fps, request.size) {
                    warn!("Failed to start recording {:?}: {}", request.path, e);
                    self.dispatch(Event::RecordingFailed);
                }
            }
            Effect::AppendRecording(frame) => {
                if let Err(e) = self.video.write_frame(&frame) {
                    if self.write_failures % 100 == 0 {
                        warn!("Failed to write recording frame: {}", e);
                    }
                    self.write_failures += 1;
                }
            }
            Effect::CloseRecording => {
                if self.video.is_open() {
                    if let Err(e) = self.video.close() {
                        warn!("Failed to close recording: {}", e);
                    }
                }
            }
            Effect::ApplyGain(value) => match self.camera.set_gain(value) {
                Ok(()) => match self.camera.gain() {
                    Ok(actual) => {
                        info!("Gain set to {}", actual);
                        self.dispatch(Event::GainApplied(actual));
                    }
                    Err(e) => warn!("Could not read back gain: {}", e),
                },
                Err(e) => warn!("Rejected gain {}: {}", value, e),
            },
            Effect::SetPolling(true) => self.next_tick = Instant::now(),
            Effect::SetPolling(false) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera_controls::{check_range, GainControl, GainError};
    use crate::capture::FrameSource;
    use crate::config::Size;
    use crate::display::DisplayRegion;
    use crate::recording::RecordingError;
    use image::RgbImage;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::Arc;

    struct FakeCamera {
        queue: VecDeque<Result<RgbImage, CaptureError>>,
        gain: i64,
    }

    impl FrameSource for FakeCamera {
        fn poll_frame(&mut self, _timeout: Duration) -> Result<RgbImage, CaptureError> {
            self.queue
                .pop_front()
                .unwrap_or_else(|| Ok(RgbImage::new(64, 48)))
        }
    }

    impl GainControl for FakeCamera {
        fn gain_range(&self) -> (i64, i64) {
            (16, 240)
        }

        fn set_gain(&mut self, value: i64) -> Result<(), GainError> {
            check_range(value, self.gain_range())?;
            self.gain = value;
            Ok(())
        }

        fn gain(&self) -> Result<i64, GainError> {
            Ok(self.gain)
        }
    }

    #[derive(Default)]
    struct SinkLog {
        opens: usize,
        writes: usize,
        closes: usize,
        open: bool,
    }

    struct FakeSink(Arc<Mutex<SinkLog>>);

    impl VideoSink for FakeSink {
        fn open(&mut self, _path: &Path, _fps: u32, _size: Size) -> Result<(), RecordingError> {
            let mut log = self.0.lock();
            log.opens += 1;
            log.open = true;
            Ok(())
        }

        fn write_frame(&mut self, _frame: &RgbImage) -> Result<(), RecordingError> {
            self.0.lock().writes += 1;
            Ok(())
        }

        fn close(&mut self) -> Result<(), RecordingError> {
            let mut log = self.0.lock();
            log.closes += 1;
            log.open = false;
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.0.lock().open
        }
    }

    struct FakeDisplay(Arc<Mutex<Vec<DisplayRegion>>>);

    impl DisplaySink for FakeDisplay {
        fn show(&mut self, region: DisplayRegion, _image: &RgbImage) {
            self.0.lock().push(region);
        }
    }

    struct Harness {
        event_loop: EventLoop,
        handle: SessionHandle,
        sink: Arc<Mutex<SinkLog>>,
        shown: Arc<Mutex<Vec<DisplayRegion>>>,
    }

    fn harness(config: Config, queue: Vec<Result<RgbImage, CaptureError>>) -> Harness {
        let (handle, rx) = command_channel();
        let sink = Arc::new(Mutex::new(SinkLog::default()));
        let shown = Arc::new(Mutex::new(Vec::new()));
        let camera = FakeCamera {
            queue: queue.into(),
            gain: 16,
        };
        let event_loop = EventLoop::new(
            &config,
            Box::new(camera),
            Box::new(FakeDisplay(shown.clone())),
            Box::new(FakeSink(sink.clone())),
            rx,
        );
        Harness {
            event_loop,
            handle,
            sink,
            shown,
        }
    }

    #[test]
    fn test_stop_without_start_leaves_sink_unopened() {
        let mut h = harness(Config::default(), Vec::new());
        h.event_loop.dispatch(Event::StopRecording);
        h.event_loop.tick().unwrap();
        h.event_loop.dispatch(Event::StopRecording);

        let log = h.sink.lock();
        assert_eq!((log.opens, log.closes), (0, 0));
    }

    #[test]
    fn test_start_twice_opens_one_sink() {
        let mut h = harness(Config::default(), Vec::new());
        h.event_loop.dispatch(Event::StartRecording);
        assert_eq!(h.sink.lock().opens, 0, "no frame yet");

        h.event_loop.tick().unwrap();
        h.event_loop.dispatch(Event::StartRecording);
        h.event_loop.dispatch(Event::StartRecording);
        h.event_loop.tick().unwrap();
        h.event_loop.tick().unwrap();
        h.event_loop.dispatch(Event::StopRecording);

        let log = h.sink.lock();
        assert_eq!(log.opens, 1);
        assert_eq!(log.writes, 2);
        assert_eq!(log.closes, 1);
    }

    #[test]
    fn test_gain_bounds_round_trip() {
        let mut h = harness(Config::default(), Vec::new());
        let status = h.event_loop.session.status();
        let (min, max) = (status.gain_min, status.gain_max);

        h.event_loop.dispatch(Event::SetGain(min));
        assert_eq!(h.event_loop.session.status().gain, Some(min));
        h.event_loop.dispatch(Event::SetGain(max));
        assert_eq!(h.event_loop.session.status().gain, Some(max));

        h.event_loop.dispatch(Event::SetGain(max + 1));
        assert_eq!(h.event_loop.session.status().gain, Some(max));
    }

    #[test]
    fn test_initial_gain_from_config() {
        let mut config = Config::default();
        config.camera.gain = Some(100);
        let h = harness(config, Vec::new());
        assert_eq!(h.event_loop.session.status().gain, Some(100));
    }

    #[test]
    fn test_transient_failures_skip_tick() {
        let mut h = harness(
            Config::default(),
            vec![
                Err(CaptureError::Unavailable),
                Err(CaptureError::Timeout(Duration::from_millis(5))),
            ],
        );
        h.event_loop.tick().unwrap();
        h.event_loop.tick().unwrap();
        assert!(h.shown.lock().is_empty());

        h.event_loop.tick().unwrap();
        assert_eq!(*h.shown.lock(), vec![DisplayRegion::Raw]);
    }

    #[test]
    fn test_disconnect_closes_recording_and_fails() {
        let mut h = harness(
            Config::default(),
            vec![
                Ok(RgbImage::new(64, 48)),
                Err(CaptureError::Disconnected("unplugged".to_string())),
            ],
        );
        h.event_loop.tick().unwrap();
        h.event_loop.dispatch(Event::StartRecording);
        assert!(h.event_loop.tick().is_err());

        let log = h.sink.lock();
        assert_eq!((log.opens, log.closes), (1, 1));
    }

    #[test]
    fn test_run_serves_commands_until_senders_drop() {
        let mut config = Config::default();
        config.video.poll_interval_ms = 5;
        let h = harness(config, Vec::new());
        let handle = h.handle.clone();
        drop(h.handle);

        let worker = std::thread::spawn(move || h.event_loop.run());

        let (tx, rx) = oneshot::channel();
        handle
            .commands
            .send(Command {
                event: Some(Event::ToggleUpdate),
                reply: Some(tx),
            })
            .unwrap();
        let status = rx.blocking_recv().unwrap();
        assert!(!status.polling);

        drop(handle);
        worker.join().unwrap().unwrap();
    }

    #[test]
    fn test_shutdown_command_stops_loop() {
        let h = harness(Config::default(), Vec::new());
        let handle = h.handle.clone();
        let sink = h.sink.clone();
        let worker = std::thread::spawn(move || h.event_loop.run());

        assert!(handle.notify(Event::Shutdown));
        worker.join().unwrap().unwrap();
        assert!(!handle.notify(Event::Capture));
        assert_eq!(sink.lock().opens, 0);
    }
}
