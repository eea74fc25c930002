//! Capture loop: device -> transform -> publisher on a dedicated thread

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, info_span, warn, Span};

use crate::capture::CaptureDevice;
use crate::error::StreamError;
use crate::metadata;
use crate::pipeline::status::{StreamState, StreamStatus};
use crate::pipeline::transform::{FrameTransform, Transformed};
use crate::publish::Publisher;
use crate::{Config, StreamConfig};

/// Achieved-rate log period
const RATE_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Settings the capture loop needs beyond the transform's own
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub publish_fps: u32,
    pub stream: StreamConfig,
    /// Pause between discarded warm-up frames
    pub warmup_interval: Duration,
    /// Longest `stop` waits for the capture thread
    pub join_timeout: Duration,
}

impl StreamSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            publish_fps: config.publish_fps(),
            stream: config.stream.clone(),
            warmup_interval: Duration::from_millis(100),
            join_timeout: Duration::from_secs(5),
        }
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.publish_fps.max(1) as f64)
    }
}

/// Lifecycle owner of the capture thread.
///
/// `Idle -> Running -> Stopping -> Idle`. A device error inside the loop
/// moves it to `Stopping` on its own; [`Streamer::stop`] reaps it.
pub struct Streamer<D, T, P>
where
    D: CaptureDevice + 'static,
    T: FrameTransform + 'static,
    P: Publisher + 'static,
{
    device: Arc<Mutex<D>>,
    transform: Arc<Mutex<T>>,
    publisher: Arc<P>,
    settings: StreamSettings,
    status: Arc<StreamStatus>,
    span: Span,
    worker: Option<Worker>,
}

struct Worker {
    stop_tx: flume::Sender<()>,
    done_rx: flume::Receiver<()>,
    handle: JoinHandle<()>,
}

/// Everything the capture thread owns a handle to
struct CaptureLoop<D, T, P> {
    device: Arc<Mutex<D>>,
    transform: Arc<Mutex<T>>,
    publisher: Arc<P>,
    settings: StreamSettings,
    status: Arc<StreamStatus>,
    stop_rx: flume::Receiver<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<D, T, P> Streamer<D, T, P>
where
    D: CaptureDevice + 'static,
    T: FrameTransform + 'static,
    P: Publisher + 'static,
{
    pub fn new(device: D, transform: T, publisher: Arc<P>, settings: StreamSettings) -> Self {
        let span = info_span!("capture", fps = settings.publish_fps);
        Self {
            device: Arc::new(Mutex::new(device)),
            transform: Arc::new(Mutex::new(transform)),
            publisher,
            settings,
            status: Arc::new(StreamStatus::new()),
            span,
            worker: None,
        }
    }

    /// Run the capture thread's diagnostics under `span` instead of the default.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn status(&self) -> &Arc<StreamStatus> {
        &self.status
    }

    pub fn state(&self) -> StreamState {
        self.status.state()
    }

    pub fn publisher(&self) -> &Arc<P> {
        &self.publisher
    }

    /// Borrow the device, e.g. to close it after streaming stops.
    pub fn with_device<R>(&self, f: impl FnOnce(&mut D) -> R) -> R {
        f(&mut lock(&self.device))
    }

    /// Open the device if needed, publish metadata, preload the snapshot and
    /// spawn the capture thread.
    pub fn start(&mut self) -> Result<(), StreamError> {
        let span = self.span.clone();
        let _enter = span.enter();

        if self.status.state() == StreamState::Running {
            warn!("Streaming is already active");
            return Ok(());
        }
        self.reap()?;

        {
            let mut device = lock(&self.device);
            if !device.is_running() {
                info!("Starting camera for streaming");
                device.open()?;
            }
        }

        self.publish_camera_info();
        if self.settings.stream.preload {
            self.preload();
        }

        let (stop_tx, stop_rx) = flume::bounded(1);
        let (done_tx, done_rx) = flume::bounded(1);
        let capture = CaptureLoop {
            device: Arc::clone(&self.device),
            transform: Arc::clone(&self.transform),
            publisher: Arc::clone(&self.publisher),
            settings: self.settings.clone(),
            status: Arc::clone(&self.status),
            stop_rx,
        };
        let thread_span = self.span.clone();

        self.status.set_state(StreamState::Running);
        let spawned = thread::Builder::new()
            .name("camcast-capture".into())
            .spawn(move || {
                let _enter = thread_span.enter();
                capture.run();
                let _ = done_tx.send(());
            });

        match spawned {
            Ok(handle) => {
                self.worker = Some(Worker {
                    stop_tx,
                    done_rx,
                    handle,
                });
                Ok(())
            }
            Err(e) => {
                self.status.set_state(StreamState::Idle);
                Err(StreamError::Spawn(e))
            }
        }
    }

    /// Signal the capture thread and wait (bounded) for it to exit. The
    /// device stays open.
    pub fn stop(&mut self) {
        let span = self.span.clone();
        let _enter = span.enter();

        let Some(worker) = self.worker.take() else {
            warn!("Streaming is not active");
            return;
        };

        info!("Stopping camera streamer");
        self.status.set_state(StreamState::Stopping);
        // Full or disconnected both mean the loop is already on its way out
        let _ = worker.stop_tx.try_send(());

        match worker.done_rx.recv_timeout(self.settings.join_timeout) {
            Err(flume::RecvTimeoutError::Timeout) => {
                warn!(
                    "Capture thread did not exit within {:?}",
                    self.settings.join_timeout
                );
                // Keep the handle so a later start can tell it is still alive
                self.worker = Some(worker);
                return;
            }
            Ok(()) | Err(flume::RecvTimeoutError::Disconnected) => {
                if worker.handle.join().is_err() {
                    error!("Capture thread panicked");
                }
            }
        }

        self.status.set_state(StreamState::Idle);
        info!("Camera streamer stopped");
    }

    /// Release the device. Stops streaming first if needed.
    pub fn close_device(&mut self) {
        if self.worker.is_some() {
            self.stop();
        }
        lock(&self.device).close();
    }

    /// Join a capture thread that already ended by itself.
    fn reap(&mut self) -> Result<(), StreamError> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        if !worker.handle.is_finished() {
            self.worker = Some(worker);
            return Err(StreamError::Busy);
        }
        if worker.handle.join().is_err() {
            error!("Capture thread panicked");
        }
        self.status.set_state(StreamState::Idle);
        Ok(())
    }

    fn publish_camera_info(&self) {
        match lock(&self.device).info() {
            Ok(info) => {
                let record =
                    metadata::camera_info(info, self.settings.publish_fps, &self.settings.stream);
                self.publisher.publish_metadata(record);
            }
            Err(e) => error!("Failed to get camera info: {}", e),
        }
    }

    fn preload(&self) {
        info!("Preloading initial frame...");
        if let Err(e) = self.try_preload() {
            error!("Error preloading initial frame: {}", e);
        }
    }

    fn try_preload(&self) -> Result<(), StreamError> {
        let frame = {
            let mut device = lock(&self.device);
            // Let auto-exposure settle
            for _ in 0..self.settings.stream.warmup_frames {
                device.read()?;
                thread::sleep(self.settings.warmup_interval);
            }
            device.read()?
        };

        let Some(frame) = frame else {
            warn!("Failed to capture initial frame");
            return Ok(());
        };

        match lock(&self.transform).apply(frame)? {
            Transformed::Publish(frame) => {
                self.publisher
                    .publish(&frame, self.settings.stream.quality)?;
                info!("Initial frame preloaded successfully");
            }
            Transformed::Skip => warn!("Failed to process initial frame"),
        }
        Ok(())
    }
}

impl<D, T, P> Drop for Streamer<D, T, P>
where
    D: CaptureDevice + 'static,
    T: FrameTransform + 'static,
    P: Publisher + 'static,
{
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop();
        }
    }
}

/// Publish-rate bookkeeping for the periodic log line
struct RateLog {
    frames: u32,
    since: Instant,
}

impl<D, T, P> CaptureLoop<D, T, P>
where
    D: CaptureDevice,
    T: FrameTransform,
    P: Publisher,
{
    fn run(self) {
        info!("Frame streaming started");

        let interval = self.settings.frame_interval();
        let mut rate = RateLog {
            frames: 0,
            since: Instant::now(),
        };

        loop {
            let started = Instant::now();

            if let Err(e) = self.step(&mut rate) {
                error!("Capture loop stopping: {}", e);
                self.status
                    .transition(StreamState::Running, StreamState::Stopping);
                break;
            }

            // Doubles as the cadence sleep; a stop request cuts it short
            let remaining = interval.saturating_sub(started.elapsed());
            match self.stop_rx.recv_timeout(remaining) {
                Err(flume::RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(flume::RecvTimeoutError::Disconnected) => break,
            }
        }

        info!("Frame streaming stopped");
    }

    fn step(&self, rate: &mut RateLog) -> Result<(), StreamError> {
        let started = Instant::now();

        let Some(frame) = lock(&self.device).read()? else {
            return Ok(());
        };
        self.status.record_captured();
        metrics::counter!("frames_captured_total").increment(1);

        let outcome = {
            let mut transform = lock(&self.transform);
            let outcome = transform.apply(frame)?;
            self.status
                .record_motion(transform.last_change_ratio(), transform.skip_count());
            outcome
        };

        match outcome {
            Transformed::Skip => {
                self.status.record_skipped();
                metrics::counter!("frames_skipped_total").increment(1);
            }
            Transformed::Publish(frame) => {
                self.publisher
                    .publish(&frame, self.settings.stream.quality)?;
                self.status.record_published();
                metrics::counter!("frames_published_total").increment(1);
                rate.frames += 1;
            }
        }

        metrics::histogram!("frame_process_time_us").record(started.elapsed().as_micros() as f64);
        self.log_rate(rate);
        Ok(())
    }

    fn log_rate(&self, rate: &mut RateLog) {
        let elapsed = rate.since.elapsed();
        if elapsed < RATE_LOG_INTERVAL {
            return;
        }

        let fps = rate.frames as f64 / elapsed.as_secs_f64();
        metrics::gauge!("stream_fps").set(fps);
        if self.settings.stream.motion_detection {
            let report = self.status.report();
            info!(
                "Streaming at {:.1} FPS, motion_ratio: {:.6}, skipped: {}",
                fps, report.last_change_ratio, report.skip_streak
            );
        } else {
            info!("Streaming at {:.1} FPS", fps);
        }
        debug!("Rate window covered {} published frames", rate.frames);

        rate.frames = 0;
        rate.since = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::capture::{Frame, PixelFormat};
    use crate::error::DeviceError;
    use crate::metadata::{MetadataRecord, Scalar};
    use crate::pipeline::transform::{DefaultTransform, TransformConfig};
    use crate::publish::MemoryPublisher;

    /// Plays back a fixed list of reads, then either idles or fails
    struct ScriptedDevice {
        script: VecDeque<Option<Frame>>,
        fail_when_done: bool,
        fail_open: bool,
        running: bool,
        read_delay: Duration,
        reads: Arc<AtomicUsize>,
    }

    impl ScriptedDevice {
        fn new(script: Vec<Option<Frame>>) -> Self {
            Self {
                script: script.into(),
                fail_when_done: true,
                fail_open: false,
                running: false,
                read_delay: Duration::ZERO,
                reads: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn endless(mut self) -> Self {
            self.fail_when_done = false;
            self
        }

        fn broken(mut self) -> Self {
            self.fail_open = true;
            self
        }

        /// Every read blocks this long, like a stalled USB camera
        fn sluggish(mut self, delay: Duration) -> Self {
            self.read_delay = delay;
            self
        }
    }

    impl CaptureDevice for ScriptedDevice {
        fn open(&mut self) -> Result<(), DeviceError> {
            if self.fail_open {
                return Err(DeviceError::Open {
                    device: crate::DeviceId::Index(7),
                    source: io::Error::new(io::ErrorKind::NotFound, "no such device"),
                });
            }
            self.running = true;
            Ok(())
        }

        fn is_running(&self) -> bool {
            self.running
        }

        fn read(&mut self) -> Result<Option<Frame>, DeviceError> {
            if !self.running {
                return Err(DeviceError::NotRunning);
            }
            self.reads.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.read_delay);
            match self.script.pop_front() {
                Some(next) => Ok(next),
                None if self.fail_when_done => Err(DeviceError::Read(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "unplugged",
                ))),
                None => Ok(None),
            }
        }

        fn info(&self) -> Result<MetadataRecord, DeviceError> {
            if !self.running {
                return Err(DeviceError::NotRunning);
            }
            let mut info = MetadataRecord::new();
            info.insert("width".into(), Scalar::Int(16));
            info.insert("height".into(), Scalar::Int(16));
            info.insert("fps".into(), Scalar::Float(30.0));
            info.insert("device_id".into(), Scalar::Int(7));
            Ok(info)
        }

        fn close(&mut self) {
            self.running = false;
        }
    }

    fn frame(sequence: u64, value: u8) -> Frame {
        Frame::new(vec![value; 16 * 16 * 3], 16, 16, PixelFormat::Rgb24, sequence).unwrap()
    }

    fn settings(stream: StreamConfig) -> StreamSettings {
        settings_at(500, stream)
    }

    fn settings_at(publish_fps: u32, stream: StreamConfig) -> StreamSettings {
        StreamSettings {
            publish_fps,
            stream,
            warmup_interval: Duration::ZERO,
            join_timeout: Duration::from_secs(5),
        }
    }

    fn no_preload() -> StreamConfig {
        StreamConfig {
            preload: false,
            ..StreamConfig::default()
        }
    }

    fn streamer(
        device: ScriptedDevice,
        stream: StreamConfig,
    ) -> Streamer<ScriptedDevice, DefaultTransform, MemoryPublisher> {
        let transform = DefaultTransform::new(TransformConfig::from(&stream));
        Streamer::new(
            device,
            transform,
            Arc::new(MemoryPublisher::new()),
            settings(stream),
        )
    }

    fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn open_failure_spawns_nothing() {
        let mut streamer = streamer(ScriptedDevice::new(vec![]).broken(), no_preload());

        let err = streamer.start().unwrap_err();
        assert!(matches!(err, StreamError::Device(DeviceError::Open { .. })));
        assert_eq!(streamer.state(), StreamState::Idle);
        assert!(streamer.worker.is_none());
        assert!(!streamer.with_device(|d| d.is_running()));
        assert!(streamer.publisher().calls().is_empty());
    }

    #[test]
    fn every_frame_is_published_without_motion_detection() {
        let script = (1..=5).map(|i| Some(frame(i, 100))).collect();
        let mut streamer = streamer(ScriptedDevice::new(script), no_preload());
        streamer.start().unwrap();

        wait_until("loop to fail", || streamer.state() == StreamState::Stopping);
        let sequences: Vec<u64> = streamer
            .publisher()
            .frames()
            .iter()
            .map(|f| f.meta.sequence)
            .collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
        assert_eq!(streamer.publisher().qualities(), vec![70; 5]);
        assert_eq!(streamer.status().report().frames_skipped, 0);

        streamer.stop();
        assert_eq!(streamer.state(), StreamState::Idle);
    }

    #[test]
    fn metadata_precedes_frames_and_merges_config() {
        let stream = StreamConfig {
            motion_detection: true,
            ..no_preload()
        };
        let mut streamer = streamer(ScriptedDevice::new(vec![Some(frame(1, 1))]), stream);
        streamer.start().unwrap();
        wait_until("loop to fail", || streamer.state() == StreamState::Stopping);

        let publisher = streamer.publisher();
        assert_eq!(publisher.calls(), vec!["camera_info", "frame"]);

        let record = &publisher.metadata()[0];
        assert_eq!(record["width"], Scalar::Int(16));
        assert_eq!(record["device_id"], Scalar::Int(7));
        assert_eq!(record["stream_fps"], Scalar::Int(500));
        assert_eq!(record["stream_quality"], Scalar::Int(70));
        assert_eq!(record["stream_motion_detection"], Scalar::Bool(true));
        assert_eq!(record["stream_motion_threshold"], Scalar::Float(0.005));
    }

    #[test]
    fn still_scene_is_gated_until_max_skip() {
        let stream = StreamConfig {
            motion_detection: true,
            motion_threshold: 0.01,
            motion_max_skip: 2,
            ..no_preload()
        };
        let script = (1..=6).map(|i| Some(frame(i, 42))).collect();
        let mut streamer = streamer(ScriptedDevice::new(script), stream);
        streamer.start().unwrap();
        wait_until("loop to fail", || streamer.state() == StreamState::Stopping);

        // 1 publishes, 2-3 skip, 4 is forced, 5-6 skip
        let sequences: Vec<u64> = streamer
            .publisher()
            .frames()
            .iter()
            .map(|f| f.meta.sequence)
            .collect();
        assert_eq!(sequences, vec![1, 4]);

        let report = streamer.status().report();
        assert_eq!(report.frames_captured, 6);
        assert_eq!(report.frames_skipped, 4);
        assert_eq!(report.skip_streak, 2);
    }

    #[test]
    fn empty_reads_are_not_errors() {
        let script = vec![None, Some(frame(1, 9)), None, None, Some(frame(2, 9))];
        let mut streamer = streamer(ScriptedDevice::new(script), no_preload());
        streamer.start().unwrap();
        wait_until("loop to fail", || streamer.state() == StreamState::Stopping);

        assert_eq!(streamer.publisher().frames().len(), 2);
        assert_eq!(streamer.status().report().frames_captured, 2);
    }

    #[test]
    fn preload_discards_warmup_and_caches_a_frame() {
        let stream = StreamConfig {
            preload: true,
            warmup_frames: 2,
            ..StreamConfig::default()
        };
        let script = vec![Some(frame(1, 0)), Some(frame(2, 0)), Some(frame(3, 0))];
        let device = ScriptedDevice::new(script).endless();
        let reads = Arc::clone(&device.reads);
        let mut streamer = streamer(device, stream);

        streamer.start().unwrap();
        let snapshot = streamer.publisher().snapshot();
        assert!(snapshot.metadata.is_some());
        assert_eq!(snapshot.frame.as_deref(), Some("3"));
        assert!(reads.load(Ordering::SeqCst) >= 3);

        streamer.stop();
        assert_eq!(streamer.publisher().calls()[..2], ["camera_info", "frame"]);
    }

    #[test]
    fn start_twice_is_a_no_op() {
        let mut streamer = streamer(ScriptedDevice::new(vec![]).endless(), no_preload());
        streamer.start().unwrap();
        streamer.start().unwrap();
        assert_eq!(streamer.state(), StreamState::Running);
        assert_eq!(streamer.publisher().metadata().len(), 1);
        streamer.stop();
    }

    #[test]
    fn stop_keeps_device_open_and_allows_restart() {
        let mut streamer = streamer(ScriptedDevice::new(vec![]).endless(), no_preload());

        streamer.stop(); // not running: warning only
        assert_eq!(streamer.state(), StreamState::Idle);

        streamer.start().unwrap();
        assert!(streamer.status().is_healthy());
        streamer.stop();
        assert_eq!(streamer.state(), StreamState::Idle);
        assert!(streamer.with_device(|d| d.is_running()));

        streamer.start().unwrap();
        assert_eq!(streamer.state(), StreamState::Running);
        streamer.close_device();
        assert_eq!(streamer.state(), StreamState::Idle);
        assert!(!streamer.with_device(|d| d.is_running()));
    }

    #[test]
    fn restart_after_device_failure_reaps_old_loop() {
        let mut streamer = streamer(ScriptedDevice::new(vec![]), no_preload());
        streamer.start().unwrap();
        wait_until("loop to fail", || streamer.state() == StreamState::Stopping);
        assert!(!streamer.status().is_healthy());

        wait_until("thread exit", || {
            streamer
                .worker
                .as_ref()
                .map_or(true, |w| w.handle.is_finished())
        });
        // The scripted device keeps failing, but start itself succeeds
        streamer.start().unwrap();
        streamer.stop();
        assert_eq!(streamer.state(), StreamState::Idle);
    }

    #[test]
    fn loop_holds_the_publish_cadence() {
        let script = (1..=200).map(|i| Some(frame(i, 60))).collect();
        let stream = no_preload();
        let transform = DefaultTransform::new(TransformConfig::from(&stream));
        let mut streamer = Streamer::new(
            ScriptedDevice::new(script).endless(),
            transform,
            Arc::new(MemoryPublisher::new()),
            settings_at(20, stream),
        );

        streamer.start().unwrap();
        thread::sleep(Duration::from_secs(1));
        streamer.stop();

        // 20 fps for one second, with slack for scheduler jitter
        let published = streamer.publisher().frames().len();
        assert!((15..=25).contains(&published), "published {published} frames");
    }

    #[test]
    fn stalled_loop_stays_stopping_and_blocks_restart() {
        let device = ScriptedDevice::new(vec![])
            .endless()
            .sluggish(Duration::from_millis(400));
        let reads = Arc::clone(&device.reads);
        let mut streamer = streamer(device, no_preload());
        streamer.settings.join_timeout = Duration::from_millis(50);

        streamer.start().unwrap();
        wait_until("first read", || reads.load(Ordering::SeqCst) >= 1);

        // The thread is stuck in read for longer than the join timeout
        streamer.stop();
        assert_eq!(streamer.state(), StreamState::Stopping);
        assert!(matches!(streamer.start(), Err(StreamError::Busy)));
        assert_eq!(streamer.state(), StreamState::Stopping);

        wait_until("thread exit", || {
            streamer
                .worker
                .as_ref()
                .map_or(true, |w| w.handle.is_finished())
        });
        streamer.start().unwrap();
        assert_eq!(streamer.state(), StreamState::Running);

        streamer.settings.join_timeout = Duration::from_secs(5);
        streamer.stop();
        assert_eq!(streamer.state(), StreamState::Idle);
    }

    /// Records the span names enclosing every event
    struct SpanNames(Arc<Mutex<Vec<String>>>);

    impl<S> tracing_subscriber::Layer<S> for SpanNames
    where
        S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    {
        fn on_event(&self, event: &tracing::Event<'_>, ctx: tracing_subscriber::layer::Context<'_, S>) {
            let names: Vec<_> = ctx
                .event_scope(event)
                .map(|scope| scope.from_root().map(|span| span.name()).collect())
                .unwrap_or_default();
            self.0.lock().unwrap().push(names.join("/"));
        }
    }

    #[test]
    fn injected_span_wraps_lifecycle_diagnostics() {
        use tracing_subscriber::layer::SubscriberExt;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::registry().with(SpanNames(Arc::clone(&seen)));

        tracing::subscriber::with_default(subscriber, || {
            let mut streamer = streamer(ScriptedDevice::new(vec![]).endless(), no_preload())
                .with_span(info_span!("front_door"));
            streamer.start().unwrap();
            streamer.stop();
        });

        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        assert!(seen.iter().all(|scope| *scope == "front_door"), "{seen:?}");
    }
}
