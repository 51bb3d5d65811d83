//! Effect executor: the only place where device and pipeline I/O happens.
//!
//! Effect batches are consumed in the order the store produced them and the
//! effects of a batch run one after another, so an unwind sequence
//! (stop recording, stop capture, close device) executes exactly in the
//! order the reducer emitted it. Every executed effect is answered with
//! exactly one `Action`; a failed effect always becomes `DeviceError`.
//!
//! After a failure the remaining effects of the batch are skipped, except
//! unwind effects which always run. A skipped status reply is turned into an
//! error reply so the command that asked for it still gets its answer.

use crate::config::RecorderConfig;
use crate::controller::{Action, AssignmentId, Effect, EffectKind, StoreHandle, WriterSpec};
use crate::core::{Capture, DeviceRef, Metrics, Sample, Settings};
use crate::device::{DeviceDriver, DeviceHandle};
use crate::error::{AppResult, RecorderError};
use crate::pipeline::{
    EventLog, Mailbox, PipelineOptions, PreparedRecording, RecordingPipeline, RecordingReport,
    StoppedRecording, TimingLog,
};
use crate::protocol::{StatusMessage, StatusSender};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const SETTINGS_ACK_TIMEOUT: Duration = Duration::from_secs(2);

type EventRoute = Arc<Mutex<Option<Arc<EventLog>>>>;
type SettingsRequest = (Settings, oneshot::Sender<AppResult<()>>);

#[derive(Debug, Default)]
struct CaptureStats {
    frames: AtomicU64,
    previewed: AtomicU64,
    events: AtomicU64,
}

/// Thins frames down to the preview sub-rate. Without one every frame is
/// previewed.
#[derive(Debug)]
struct PreviewThrottle {
    interval: Option<Duration>,
    next_due: Option<Instant>,
}

impl PreviewThrottle {
    fn new(settings: &Settings) -> Self {
        Self {
            interval: settings
                .preview_rate_hz
                .and_then(|rate| Duration::try_from_secs_f64(1.0 / rate).ok()),
            next_due: None,
        }
    }

    fn admit(&mut self, now: Instant) -> bool {
        let Some(interval) = self.interval else {
            return true;
        };
        match self.next_due {
            Some(due) if now < due => false,
            due => {
                let next = due.unwrap_or(now) + interval;
                self.next_due = Some(next.max(now));
                true
            }
        }
    }
}

struct CaptureThread {
    stop: Arc<AtomicBool>,
    settings_tx: std_mpsc::Sender<SettingsRequest>,
    join: std::thread::JoinHandle<Box<dyn DeviceHandle>>,
}

struct CaptureLoop {
    device: DeviceRef,
    assignment: Option<AssignmentId>,
    handle: Box<dyn DeviceHandle>,
    mailbox: Arc<Mailbox<Sample>>,
    events: EventRoute,
    stats: Arc<CaptureStats>,
    preview: PreviewThrottle,
    stop: Arc<AtomicBool>,
    settings_rx: std_mpsc::Receiver<SettingsRequest>,
    store: StoreHandle,
}

impl CaptureLoop {
    fn run(mut self) -> Box<dyn DeviceHandle> {
        debug!(device = %self.device, "Capture thread started");

        while !self.stop.load(Ordering::Acquire) {
            while let Ok((settings, ack)) = self.settings_rx.try_recv() {
                let result = self.handle.apply_settings(&settings);
                if result.is_ok() {
                    self.preview = PreviewThrottle::new(&settings);
                }
                let _ = ack.send(result);
            }

            match self.handle.read_sample() {
                Ok(Some(Capture::Frame(sample))) => {
                    self.stats.frames.fetch_add(1, Ordering::Relaxed);
                    if self.preview.admit(Instant::now()) {
                        self.stats.previewed.fetch_add(1, Ordering::Relaxed);
                    }
                    self.mailbox.put(sample);
                }
                Ok(Some(Capture::Event(record))) => {
                    self.stats.events.fetch_add(1, Ordering::Relaxed);
                    let route = self.events.lock().unwrap_or_else(PoisonError::into_inner);
                    if let Some(log) = route.as_ref() {
                        log.push(record);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    if !self.stop.load(Ordering::Acquire) {
                        error!(device = %self.device, error = %e, "Device lost during capture");
                        let lost = Action::DeviceError {
                            message: RecorderError::DeviceLost(e.to_string()).to_string(),
                            assignment: self.assignment,
                        };
                        if self.store.blocking_dispatch(lost).is_err() {
                            warn!("Controller gone, device loss not reported");
                        }
                    }
                    break;
                }
            }
        }

        debug!(device = %self.device, "Capture thread stopped");
        self.handle
    }
}

/// Settings the executor needs from the full configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutorConfig {
    /// Pipeline tunables
    pub pipeline: crate::config::PipelineConfig,
    /// How often `UpdateMetrics` is published while capturing
    pub metrics_interval: Duration,
}

impl ExecutorConfig {
    /// Extract from the recorder configuration.
    pub fn from_recorder_config(config: &RecorderConfig) -> Self {
        Self {
            pipeline: config.pipeline.clone(),
            metrics_interval: config.module.metrics_interval,
        }
    }
}

#[derive(Debug)]
struct MetricsBaseline {
    at: Instant,
    captured: u64,
    recorded: u64,
}

/// Performs effects and feeds their results back to the store.
pub struct EffectExecutor {
    driver: Arc<dyn DeviceDriver>,
    store: StoreHandle,
    status: StatusSender,
    config: ExecutorConfig,
    device: Option<DeviceRef>,
    assignment: Option<AssignmentId>,
    settings: Settings,
    handle: Option<Box<dyn DeviceHandle>>,
    capture: Option<CaptureThread>,
    mailbox: Arc<Mailbox<Sample>>,
    capture_stats: Arc<CaptureStats>,
    event_route: EventRoute,
    prepared: Option<PreparedRecording>,
    pipeline: Option<RecordingPipeline>,
    stopped: Option<StoppedRecording>,
    baseline: Option<MetricsBaseline>,
    shutdown: bool,
}

impl EffectExecutor {
    /// Executor driving devices through `driver`.
    pub fn new(
        driver: Arc<dyn DeviceDriver>,
        store: StoreHandle,
        status: StatusSender,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            driver,
            store,
            status,
            config,
            device: None,
            assignment: None,
            settings: Settings::default(),
            handle: None,
            capture: None,
            mailbox: Arc::new(Mailbox::new()),
            capture_stats: Arc::new(CaptureStats::default()),
            event_route: Arc::new(Mutex::new(None)),
            prepared: None,
            pipeline: None,
            stopped: None,
            baseline: None,
            shutdown: false,
        }
    }

    /// Run on the async runtime until `CleanupResources` has executed or the
    /// store goes away.
    pub fn spawn(self, effects: mpsc::UnboundedReceiver<Vec<Effect>>) -> JoinHandle<()> {
        tokio::spawn(self.run(effects))
    }

    async fn run(mut self, mut effects: mpsc::UnboundedReceiver<Vec<Effect>>) {
        info!("Effect executor started");
        let mut metrics_tick = tokio::time::interval(self.config.metrics_interval);
        metrics_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                batch = effects.recv() => match batch {
                    Some(batch) => {
                        self.run_batch(batch).await;
                        if self.shutdown {
                            break;
                        }
                    }
                    None => break,
                },
                _ = metrics_tick.tick(), if self.capture.is_some() => {
                    let metrics = self.metrics_snapshot();
                    if self.store.dispatch(Action::UpdateMetrics(metrics)).await.is_err() {
                        break;
                    }
                }
            }
        }

        self.release_all().await;
        info!("Effect executor stopped");
    }

    /// Execute one batch in order.
    pub async fn run_batch(&mut self, batch: Vec<Effect>) {
        let mut failure: Option<String> = None;

        for effect in batch {
            let kind = effect.kind();
            let assignment = match &effect {
                Effect::ProbeDevice { assignment, .. } | Effect::OpenDevice { assignment, .. } => {
                    Some(*assignment)
                }
                _ => self.assignment,
            };

            if let Some(reason) = &failure {
                if !effect.is_unwind() {
                    if let Effect::SendStatus(status) = &effect {
                        if status.is_reply() {
                            self.emit(StatusMessage::error(
                                status.in_reply_to.clone(),
                                format!("aborted: {}", reason),
                            ));
                        }
                    }
                    debug!(effect = ?kind, "Skipped after earlier failure in batch");
                    continue;
                }
            }

            let action = match self.execute(effect).await {
                Ok(action) => action,
                Err(e) => {
                    error!(effect = ?kind, error = %e, "Effect failed");
                    if failure.is_none() {
                        failure = Some(e.to_string());
                    }
                    Action::DeviceError {
                        message: e.to_string(),
                        assignment,
                    }
                }
            };

            if self.store.dispatch(action).await.is_err() {
                debug!(effect = ?kind, "Store closed, result not delivered");
            }
        }
    }

    async fn execute(&mut self, effect: Effect) -> AppResult<Action> {
        match effect {
            Effect::ProbeDevice { device, assignment } => {
                info!(device = %device, assignment, "Probing device");
                let capabilities = self.driver.probe(device).await?;
                Ok(Action::DeviceAssigned {
                    assignment,
                    capabilities,
                })
            }
            Effect::OpenDevice {
                device,
                assignment,
                settings,
            } => {
                self.stop_capture().await;
                self.close_device();
                let handle = self.driver.open(device, &settings).await?;
                self.handle = Some(handle);
                self.device = Some(device);
                self.assignment = Some(assignment);
                self.settings = settings;
                Ok(Action::EffectCompleted(EffectKind::OpenDevice))
            }
            Effect::CloseDevice => {
                self.stop_capture().await;
                self.close_device();
                Ok(Action::EffectCompleted(EffectKind::CloseDevice))
            }
            Effect::StartCapture => {
                self.start_capture()?;
                Ok(Action::EffectCompleted(EffectKind::StartCapture))
            }
            Effect::StopCapture => {
                self.stop_capture().await;
                Ok(Action::EffectCompleted(EffectKind::StopCapture))
            }
            Effect::StartWriter(spec) => {
                self.prepare_writer(spec)?;
                Ok(Action::EffectCompleted(EffectKind::StartWriter))
            }
            Effect::StartTimingLog(path) => {
                self.start_pipeline(path)?;
                Ok(Action::RecordingStarted)
            }
            Effect::StopWriter => {
                self.stop_writer().await;
                Ok(Action::EffectCompleted(EffectKind::StopWriter))
            }
            Effect::StopTimingLog => {
                let report = self.stop_timing_log().await;
                Ok(Action::RecordingStopped { report })
            }
            Effect::ApplyDeviceSettings(settings) => {
                self.apply_settings(&settings).await?;
                self.settings = settings.clone();
                Ok(Action::SettingsApplied { settings })
            }
            Effect::SendStatus(status) => {
                self.status.send(status)?;
                Ok(Action::EffectCompleted(EffectKind::SendStatus))
            }
            Effect::CleanupResources => {
                self.release_all().await;
                self.shutdown = true;
                Ok(Action::EffectCompleted(EffectKind::CleanupResources))
            }
        }
    }

    fn emit(&self, status: StatusMessage) {
        if let Err(e) = self.status.send(status) {
            warn!(error = %e, "Dropping status line");
        }
    }

    fn start_capture(&mut self) -> AppResult<()> {
        if self.capture.is_some() {
            return Ok(());
        }
        let handle = self.handle.take().ok_or(RecorderError::DeviceNotOpen)?;
        let device = self.device.ok_or(RecorderError::DeviceNotOpen)?;

        self.mailbox = Arc::new(Mailbox::new());
        self.capture_stats = Arc::new(CaptureStats::default());
        self.baseline = None;

        let stop = Arc::new(AtomicBool::new(false));
        let (settings_tx, settings_rx) = std_mpsc::channel();
        let capture = CaptureLoop {
            device,
            assignment: self.assignment,
            handle,
            mailbox: self.mailbox.clone(),
            events: self.event_route.clone(),
            stats: self.capture_stats.clone(),
            preview: PreviewThrottle::new(&self.settings),
            stop: stop.clone(),
            settings_rx,
            store: self.store.clone(),
        };

        let join = std::thread::Builder::new()
            .name(format!("capture-{}", device))
            .spawn(move || capture.run())?;
        self.capture = Some(CaptureThread {
            stop,
            settings_tx,
            join,
        });
        info!(device = %device, "Capture started");
        Ok(())
    }

    async fn stop_capture(&mut self) {
        let Some(capture) = self.capture.take() else {
            return;
        };
        capture.stop.store(true, Ordering::Release);
        drop(capture.settings_tx);

        match tokio::task::spawn_blocking(move || capture.join.join()).await {
            Ok(Ok(handle)) => {
                self.handle = Some(handle);
                info!(device = ?self.device, "Capture stopped");
            }
            Ok(Err(_)) => error!("Capture thread panicked, device handle lost"),
            Err(e) => error!(error = %e, "Failed to join capture thread"),
        }
    }

    fn close_device(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            if let Err(e) = handle.close() {
                warn!(device = ?self.device, error = %e, "Device did not close cleanly");
            }
            info!(device = ?self.device, "Device closed");
        }
    }

    fn prepare_writer(&mut self, spec: WriterSpec) -> AppResult<()> {
        if self.pipeline.is_some() {
            return Err(RecorderError::Pipeline("a recording is already running".into()));
        }
        let options = PipelineOptions::from_config(&self.config.pipeline, spec.rate_hz);
        let prepared = PreparedRecording::open(spec.output, spec.events, spec.paced, options)?;
        debug!(?prepared, "Writer prepared");
        self.prepared = Some(prepared);
        self.stopped = None;
        Ok(())
    }

    fn start_pipeline(&mut self, timing_path: PathBuf) -> AppResult<()> {
        let prepared = self
            .prepared
            .take()
            .ok_or_else(|| RecorderError::Pipeline("writer was not started".into()))?;
        let timing = Arc::new(TimingLog::create(&timing_path)?);

        let store = self.store.clone();
        let on_fault = Box::new(move |message: String| {
            if store
                .blocking_dispatch(Action::RecordingFault { message })
                .is_err()
            {
                warn!("Controller gone, recording fault not reported");
            }
        });

        let pipeline = RecordingPipeline::start(prepared, timing, self.mailbox.clone(), on_fault)?;
        *self
            .event_route
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = pipeline.event_log();
        self.pipeline = Some(pipeline);
        Ok(())
    }

    async fn stop_writer(&mut self) {
        self.prepared = None;
        let Some(pipeline) = self.pipeline.take() else {
            return;
        };
        self.event_route
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let stopped = pipeline.stop(self.config.pipeline.drain_timeout).await;
        self.stopped = Some(stopped);
    }

    async fn stop_timing_log(&mut self) -> RecordingReport {
        if self.pipeline.is_some() {
            self.stop_writer().await;
        }
        let Some(StoppedRecording { mut report, timing }) = self.stopped.take() else {
            return RecordingReport::default();
        };

        match tokio::task::spawn_blocking(move || timing.close()).await {
            Ok(Ok(rows)) => report.timing_rows = rows,
            Ok(Err(e)) => warn!(error = %e, "Timing log did not close cleanly"),
            Err(e) => warn!(error = %e, "Timing log close task failed"),
        }
        info!(
            written = report.written,
            timing_rows = report.timing_rows,
            "Timing log closed"
        );
        report
    }

    async fn apply_settings(&mut self, settings: &Settings) -> AppResult<()> {
        if let Some(capture) = &self.capture {
            let (ack_tx, ack_rx) = oneshot::channel();
            capture
                .settings_tx
                .send((settings.clone(), ack_tx))
                .map_err(|_| RecorderError::DeviceLost("capture thread is gone".into()))?;
            return match tokio::time::timeout(SETTINGS_ACK_TIMEOUT, ack_rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(RecorderError::DeviceLost("capture thread is gone".into())),
                Err(_) => Err(RecorderError::DeviceLost(
                    "device did not acknowledge settings".into(),
                )),
            };
        }

        match self.handle.as_mut() {
            Some(handle) => handle.apply_settings(settings),
            None => Err(RecorderError::DeviceNotOpen),
        }
    }

    fn metrics_snapshot(&mut self) -> Metrics {
        let captured = self.capture_stats.frames.load(Ordering::Relaxed);
        let events = self.capture_stats.events.load(Ordering::Relaxed);
        let (recorded, duplicated, dropped) = match &self.pipeline {
            Some(pipeline) => {
                let counters = pipeline.counters();
                (
                    counters.written.load(Ordering::Relaxed),
                    counters.written_duplicates.load(Ordering::Relaxed),
                    pipeline.dropped(),
                )
            }
            None => (0, 0, 0),
        };

        let now = Instant::now();
        let (capture_rate_hz, record_rate_hz) = match &self.baseline {
            Some(base) => {
                let secs = now.duration_since(base.at).as_secs_f64().max(1e-6);
                (
                    captured.saturating_sub(base.captured) as f64 / secs,
                    recorded.saturating_sub(base.recorded) as f64 / secs,
                )
            }
            None => (0.0, 0.0),
        };
        self.baseline = Some(MetricsBaseline {
            at: now,
            captured,
            recorded,
        });

        Metrics {
            captured,
            recorded,
            duplicated,
            dropped,
            previewed: self.capture_stats.previewed.load(Ordering::Relaxed),
            overwritten: self.mailbox.overwritten(),
            events,
            capture_rate_hz,
            record_rate_hz,
        }
    }

    /// Stop whatever is still running, in unwind order. Idempotent.
    async fn release_all(&mut self) {
        if self.pipeline.is_some() || self.stopped.is_some() {
            let report = self.stop_timing_log().await;
            debug!(written = report.written, "Released recording during cleanup");
        }
        self.prepared = None;
        self.stop_capture().await;
        self.close_device();
    }
}
