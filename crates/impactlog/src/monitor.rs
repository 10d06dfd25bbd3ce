//! Impact monitoring.
//!
//! [`AlertMonitor`] samples a [`Sensor`] on its own OS thread and appends every
//! reading above the impact threshold to the shared [`EventLog`]. It is the
//! only writer of the log; the HTTP server only reads.
//!
//! The hardware driver is not part of this crate. [`SimulatedSensor`] stands
//! in for it, and an [`Indicator`] stands in for the LED and buzzer.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::config::{MonitorConfig, TimestampStyle};
use crate::error::{Error, Result};
use crate::event_log::{EventLog, Record};

/// Longest uninterrupted sleep, so a stop request is noticed promptly.
const STOP_POLL: Duration = Duration::from_millis(50);

/// Name of the sampling thread.
const THREAD_NAME: &str = "impact-monitor";

/// Errors raised while reading the sensor.
#[derive(Debug, Error)]
pub enum SensorError {
    /// The sensor could not be reached.
    #[error("sensor unavailable: {0}")]
    Unavailable(String),

    /// A read was attempted and failed.
    #[error("sensor read failed: {0}")]
    Read(String),

    /// The sensor produced a value that is not a magnitude.
    #[error("invalid sensor reading: {0}")]
    InvalidReading(f64),
}

/// Source of total-acceleration readings, in g.
pub trait Sensor: Send {
    /// Take one reading.
    ///
    /// # Errors
    ///
    /// Returns an error if the sensor cannot be read.
    fn read_magnitude(&mut self) -> std::result::Result<f64, SensorError>;
}

/// Alert outputs driven by the monitor.
pub trait Indicator: Send {
    /// An impact was detected; the alert stays on until [`Indicator::end_alert`].
    fn start_alert(&mut self, severity: Severity, magnitude: f64);

    /// The alert period is over.
    fn end_alert(&mut self);

    /// Periodic liveness signal.
    fn heartbeat(&mut self) {}
}

/// Indicator that reports through `tracing`.
#[derive(Debug, Default)]
pub struct TracingIndicator {
    heartbeats: u64,
}

impl Indicator for TracingIndicator {
    fn start_alert(&mut self, severity: Severity, magnitude: f64) {
        warn!("{severity} detected! Magnitude: {}", format_magnitude(magnitude));
    }

    fn end_alert(&mut self) {
        debug!("Alert cleared");
    }

    fn heartbeat(&mut self) {
        self.heartbeats += 1;
        trace!(count = self.heartbeats, "Heartbeat");
    }
}

/// Classification of one reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    /// At or below the impact threshold.
    Normal,
    /// Above the impact threshold, at or below the crash threshold.
    Impact,
    /// Above the crash threshold.
    Crash,
}

impl Severity {
    /// Classify `magnitude` against the two thresholds.
    #[must_use]
    pub fn classify(magnitude: f64, impact_threshold: f64, crash_threshold: f64) -> Self {
        if magnitude > crash_threshold {
            Self::Crash
        } else if magnitude > impact_threshold {
            Self::Impact
        } else {
            Self::Normal
        }
    }

    /// Whether this reading gets recorded.
    #[must_use]
    pub fn is_recorded(self) -> bool {
        self != Self::Normal
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Impact => write!(f, "impact"),
            Self::Crash => write!(f, "crash"),
        }
    }
}

/// Strength of a simulated impact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImpactStrength {
    /// 1.5 to 2.0 g; below the default impact threshold.
    Light,
    /// 2.5 to 3.2 g.
    Moderate,
    /// 3.5 to 5.0 g.
    Severe,
}

impl ImpactStrength {
    const ALL: [Self; 3] = [Self::Light, Self::Moderate, Self::Severe];

    fn range(self) -> (f64, f64) {
        match self {
            Self::Light => (1.5, 2.0),
            Self::Moderate => (2.5, 3.2),
            Self::Severe => (3.5, 5.0),
        }
    }
}

/// Random accelerometer for running without hardware.
///
/// At rest it reports about 1 g with a little noise. With the configured
/// probability a reading is replaced by an impact of random strength.
#[derive(Debug)]
pub struct SimulatedSensor {
    rng: StdRng,
    impact_probability: f64,
}

impl SimulatedSensor {
    /// Sensor seeded from the thread RNG.
    #[must_use]
    pub fn new(impact_probability: f64) -> Self {
        Self::seeded(impact_probability, rand::random())
    }

    /// Deterministic sensor for tests and demos.
    #[must_use]
    pub fn seeded(impact_probability: f64, seed: u64) -> Self {
        let impact_probability = if impact_probability.is_nan() {
            0.0
        } else {
            impact_probability.clamp(0.0, 1.0)
        };
        Self {
            rng: StdRng::seed_from_u64(seed),
            impact_probability,
        }
    }

    /// A reading from a device lying still.
    pub fn at_rest(&mut self) -> f64 {
        let noise: f64 = self.rng.random_range(-0.1..0.1);
        let ax: f64 = self.rng.random_range(-0.2..0.2) + noise;
        let ay: f64 = self.rng.random_range(-0.2..0.2) + noise;
        let az: f64 = 1.0 + noise;
        (ax * ax + ay * ay + az * az).sqrt()
    }

    /// A reading during an impact of the given strength.
    pub fn impact(&mut self, strength: ImpactStrength) -> f64 {
        let (low, high) = strength.range();
        self.rng.random_range(low..=high)
    }
}

impl Sensor for SimulatedSensor {
    fn read_magnitude(&mut self) -> std::result::Result<f64, SensorError> {
        if self.rng.random_bool(self.impact_probability) {
            let strength = ImpactStrength::ALL[self.rng.random_range(0..ImpactStrength::ALL.len())];
            Ok(self.impact(strength))
        } else {
            Ok(self.at_rest())
        }
    }
}

/// Format a magnitude the way it is stored, e.g. `2.70g`.
#[must_use]
pub fn format_magnitude(magnitude: f64) -> String {
    format!("{magnitude:.2}g")
}

/// Format time since start as `mm:ss:mmm`. Minutes keep counting past 99.
#[must_use]
pub fn format_uptime(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!(
        "{:02}:{:02}:{:03}",
        secs / 60,
        secs % 60,
        elapsed.subsec_millis()
    )
}

/// Produces record timestamps in the configured style.
#[derive(Debug, Clone, Copy)]
struct Clock {
    style: TimestampStyle,
    started: Instant,
}

impl Clock {
    fn new(style: TimestampStyle) -> Self {
        Self {
            style,
            started: Instant::now(),
        }
    }

    fn timestamp(&self) -> String {
        match self.style {
            TimestampStyle::Uptime => format_uptime(self.started.elapsed()),
            TimestampStyle::WallClock => chrono::Local::now().format("%H:%M:%S%.3f").to_string(),
        }
    }
}

/// Status of the sampling loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorStatus {
    /// Whether the loop is currently running.
    pub is_running: bool,
    /// Readings classified as impacts since startup.
    pub impact_count: u64,
    /// Readings classified as crashes since startup.
    pub crash_count: u64,
    /// Readings that could not be written to the log.
    pub dropped_count: u64,
    /// Human-readable status message.
    pub message: String,
}

/// Cloneable handle for stopping and observing a monitor.
#[derive(Debug, Clone, Default)]
pub struct MonitorHandle {
    stop_signal: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    impacts: Arc<AtomicU64>,
    crashes: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl MonitorHandle {
    /// Create a new handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal the monitor to stop.
    pub fn stop(&self) {
        self.stop_signal.store(true, Ordering::SeqCst);
    }

    /// Check if the stop signal has been sent.
    #[must_use]
    pub fn should_stop(&self) -> bool {
        self.stop_signal.load(Ordering::SeqCst)
    }

    /// Whether the loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Impacts plus crashes seen so far.
    #[must_use]
    pub fn event_count(&self) -> u64 {
        self.impacts.load(Ordering::Relaxed) + self.crashes.load(Ordering::Relaxed)
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn status(&self) -> MonitorStatus {
        let is_running = self.is_running();
        let message = match (is_running, self.should_stop()) {
            (true, false) => "Monitoring for impacts",
            (true, true) => "Stopping",
            (false, _) => "Monitor stopped",
        };
        MonitorStatus {
            is_running,
            impact_count: self.impacts.load(Ordering::Relaxed),
            crash_count: self.crashes.load(Ordering::Relaxed),
            dropped_count: self.dropped.load(Ordering::Relaxed),
            message: message.to_string(),
        }
    }

    fn count(&self, severity: Severity) {
        let counter = match severity {
            Severity::Normal => return,
            Severity::Impact => &self.impacts,
            Severity::Crash => &self.crashes,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }
}

/// The sampling loop.
#[derive(Debug)]
pub struct AlertMonitor<S, I> {
    sensor: S,
    indicator: I,
    log: Arc<EventLog>,
    handle: MonitorHandle,
    clock: Clock,
    impact_threshold: f64,
    crash_threshold: f64,
    sample_interval: Duration,
    alert_duration: Duration,
    heartbeat: Duration,
}

impl AlertMonitor<SimulatedSensor, TracingIndicator> {
    /// Monitor backed by the simulated sensor.
    #[must_use]
    pub fn simulated(config: &MonitorConfig, log: Arc<EventLog>) -> Self {
        Self::new(
            config,
            SimulatedSensor::new(config.simulated_impact_probability),
            TracingIndicator::default(),
            log,
        )
    }
}

impl<S: Sensor, I: Indicator> AlertMonitor<S, I> {
    /// Build a monitor from its collaborators.
    #[must_use]
    pub fn new(config: &MonitorConfig, sensor: S, indicator: I, log: Arc<EventLog>) -> Self {
        Self {
            sensor,
            indicator,
            log,
            handle: MonitorHandle::new(),
            clock: Clock::new(config.timestamp_style),
            impact_threshold: config.impact_threshold,
            crash_threshold: config.crash_threshold,
            sample_interval: config.sample_interval(),
            alert_duration: config.alert_duration(),
            heartbeat: config.heartbeat(),
        }
    }

    /// Handle sharing this monitor's stop flag and counters.
    #[must_use]
    pub fn handle(&self) -> MonitorHandle {
        self.handle.clone()
    }

    /// Take and act on one reading.
    ///
    /// Returns `None` if the sensor could not be read. A recorded reading
    /// raises the alert, which blocks for the configured alert duration.
    pub fn check(&mut self) -> Option<Severity> {
        let magnitude = match self.sensor.read_magnitude() {
            Ok(m) if m.is_finite() => m,
            Ok(m) => {
                warn!("Error reading sensor: {}", SensorError::InvalidReading(m));
                return None;
            }
            Err(err) => {
                warn!("Error reading sensor: {err}");
                return None;
            }
        };

        let severity = Severity::classify(magnitude, self.impact_threshold, self.crash_threshold);
        if !severity.is_recorded() {
            trace!("Normal: {}", format_magnitude(magnitude));
            return Some(severity);
        }

        self.handle.count(severity);
        let record = Record::new(self.clock.timestamp(), format_magnitude(magnitude));
        match self.log.append_record(&record) {
            Ok(()) => info!(
                timestamp = record.timestamp(),
                magnitude = record.magnitude(),
                "Recorded {severity}"
            ),
            Err(err) => {
                self.handle.dropped.fetch_add(1, Ordering::Relaxed);
                error!("Failed to record {severity}: {err}");
            }
        }

        self.indicator.start_alert(severity, magnitude);
        self.pause(self.alert_duration);
        self.indicator.end_alert();
        Some(severity)
    }

    /// Sample until the handle is stopped.
    pub fn run(mut self) {
        self.handle.set_running(true);
        info!(
            impact_threshold = self.impact_threshold,
            crash_threshold = self.crash_threshold,
            sample_ms = self.sample_interval.as_millis(),
            "Monitoring for impacts"
        );

        let mut since_heartbeat = Duration::ZERO;
        while !self.handle.should_stop() {
            self.check();
            self.pause(self.sample_interval);

            since_heartbeat += self.sample_interval;
            if since_heartbeat >= self.heartbeat {
                since_heartbeat = Duration::ZERO;
                self.indicator.heartbeat();
            }
        }

        self.handle.set_running(false);
        info!("Monitor stopped");
    }

    /// Sleep for `duration`, waking early if a stop is requested.
    fn pause(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.handle.should_stop() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            thread::sleep(remaining.min(STOP_POLL));
        }
    }
}

impl<S, I> AlertMonitor<S, I>
where
    S: Sensor + 'static,
    I: Indicator + 'static,
{
    /// Run the loop on a dedicated thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn(self) -> Result<RunningMonitor> {
        let handle = self.handle();
        handle.set_running(true);
        let thread = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || self.run())
            .map_err(|err| {
                handle.set_running(false);
                Error::MonitorStart(err.to_string())
            })?;
        Ok(RunningMonitor { handle, thread })
    }
}

/// A monitor running on its own thread.
#[derive(Debug)]
pub struct RunningMonitor {
    handle: MonitorHandle,
    thread: JoinHandle<()>,
}

impl RunningMonitor {
    /// Handle for the running loop.
    #[must_use]
    pub fn handle(&self) -> &MonitorHandle {
        &self.handle
    }

    /// Stop the loop, wait for the thread, and report final counters.
    pub fn shutdown(self) -> MonitorStatus {
        self.handle.stop();
        if self.thread.join().is_err() {
            error!("Monitor thread panicked");
            self.handle.set_running(false);
        }
        self.handle.status()
    }
}
