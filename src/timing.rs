//! Frame timing model
//!
//! Frames sit on a grid anchored at a base frame: frame `n` starts
//! `(n - base_index) * interval` after `base_time`. Everything else a frame
//! needs (warp point, scanout times, eye windows) is derived from that grid
//! and the panel's scanout characteristics.
//!
//! The scheduler is shared between the render thread, which drives
//! `begin_frame`/`end_frame`, and any thread that wants predictions.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::RuntimeConfig;
use crate::hmd::{HmdRenderInfo, ShutterInfo, ShutterType};

/// Scanout delay assumed when presenting without vsync
pub const NO_VSYNC_LATENCY: f64 = 0.003;
/// Longest the render thread will block waiting for the warp point
pub const MAX_WARP_WAIT: f64 = 0.1;
pub const MAX_FRAME_DELTA: f32 = 0.1;
/// Margin kept between the JIT warp point and the next vsync
pub const JIT_PREEMPT_BUFFER: f64 = 0.004;

const HISTORY_LEN: usize = 8;
const DISTORTION_SAMPLES: usize = 12;
const MIN_VALID_INTERVAL: f64 = 0.001;
const MAX_VALID_INTERVAL: f64 = 0.050;
const MEASUREMENT_LIFETIME: f64 = 10.0;
const MIN_TIMEWARP_FRACTION: f32 = 0.05;
const MAX_TIMEWARP_FRACTION: f32 = 0.95;

/// Source of absolute time in seconds
pub trait Clock: Send + Sync {
    fn now_seconds(&self) -> f64;
}

/// Wall clock backed by `Instant`, counting from construction
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { epoch: Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_seconds(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }
}

/// Clock that only moves when told to, for tests and replay
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn set(&self, t: f64) {
        *self.now.lock() = t;
    }

    pub fn advance(&self, dt: f64) {
        *self.now.lock() += dt;
    }
}

impl Clock for ManualClock {
    fn now_seconds(&self) -> f64 {
        *self.now.lock()
    }
}

/// How the render thread waits for the warp point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WaitMode {
    Sleep,
    #[default]
    Spin,
}

/// Blocks until `clock` reaches `deadline` and returns the seconds waited.
///
/// Never blocks longer than `MAX_WARP_WAIT` of real time, even if `clock`
/// does not advance.
pub fn wait_until(clock: &dyn Clock, deadline: f64, mode: WaitMode) -> f64 {
    let started = clock.now_seconds();
    let real_start = Instant::now();
    let limit = Duration::from_secs_f64(MAX_WARP_WAIT);
    loop {
        let now = clock.now_seconds();
        let real_elapsed = real_start.elapsed();
        if now >= deadline || real_elapsed >= limit {
            return (now - started).max(0.0);
        }
        match mode {
            WaitMode::Sleep => {
                let remaining = Duration::from_secs_f64((deadline - now).min(MAX_WARP_WAIT));
                std::thread::sleep(remaining.min(limit - real_elapsed));
            }
            WaitMode::Spin => std::hint::spin_loop(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedulerState {
    Idle,
    TimingActive,
    RenderWindowOpen,
    WaitingForWarpPoint,
    WarpAndPresent,
}

/// Timestamps of one frame, all absolute seconds
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FrameTiming {
    pub frame_index: u64,
    pub this_frame_time: f64,
    /// When the warp pass samples the head pose
    pub timewarp_sample_time: f64,
    pub next_frame_time: f64,
    /// Midpoint of the panel scanout, where eye poses are predicted
    pub scanout_midpoint_time: f64,
    pub eye_scanout_time: [f64; 2],
    /// Start and end of the scanout of each eye's region
    pub eye_warp_window: [[f64; 2]; 2],
    pub delta_seconds: f32,
}

/// Fraction of the scanout at which each eye is lit
fn eye_scanout_fractions(shutter: ShutterType) -> [f64; 2] {
    match shutter {
        ShutterType::Global | ShutterType::RollingTopToBottom => [0.5, 0.5],
        ShutterType::RollingLeftToRight => [0.25, 0.75],
        ShutterType::RollingRightToLeft => [0.75, 0.25],
    }
}

#[derive(Debug, Clone, Copy)]
struct Measurement {
    interval: f64,
    observed_at: f64,
}

#[derive(Debug, Clone)]
struct Inner {
    state: SchedulerState,
    base_index: u64,
    base_time: f64,
    /// Index `0` resolves to this
    next_index: u64,
    open_frame: Option<u64>,
    vsync: bool,
    jit: bool,
    timewarp_fraction: f32,
    measured: Option<Measurement>,
    last_vsync: Option<f64>,
    history: [Option<FrameTiming>; HISTORY_LEN],
    distortion_times: [f64; DISTORTION_SAMPLES],
    distortion_count: usize,
    distortion_next: usize,
}

impl Inner {
    fn resolve(&self, frame_index: u64) -> u64 {
        if frame_index == 0 {
            self.next_index
        } else {
            frame_index
        }
    }

    fn reseed(&mut self, frame_index: u64, base_time: f64) {
        self.base_index = frame_index;
        self.base_time = base_time;
    }

    fn grid_time(&self, frame_index: u64, interval: f64) -> f64 {
        self.grid_time_ahead(frame_index, 0.0, interval)
    }

    /// Grid time `ahead` frames after `frame_index`, without integer overflow
    fn grid_time_ahead(&self, frame_index: u64, ahead: f64, interval: f64) -> f64 {
        // Signed so history before the base still maps correctly.
        let frames = frame_index as f64 - self.base_index as f64 + ahead;
        self.base_time + frames * interval
    }

    fn history_entry(&self, frame_index: u64) -> Option<FrameTiming> {
        self.history[(frame_index % HISTORY_LEN as u64) as usize]
            .filter(|timing| timing.frame_index == frame_index)
    }

    fn latest_history(&self) -> Option<FrameTiming> {
        self.history.iter().flatten().max_by_key(|timing| timing.frame_index).copied()
    }

    fn median_distortion_time(&self) -> Option<f64> {
        if self.distortion_count == 0 {
            return None;
        }
        let mut samples = self.distortion_times[..self.distortion_count].to_vec();
        samples.sort_by(|a, b| a.total_cmp(b));
        let mid = samples.len() / 2;
        Some(if samples.len() % 2 == 0 {
            (samples[mid - 1] + samples[mid]) * 0.5
        } else {
            samples[mid]
        })
    }
}

/// Owns the frame index and derives per-frame timestamps
pub struct FrameScheduler {
    clock: Arc<dyn Clock>,
    nominal_interval: f64,
    shutter: ShutterInfo,
    inner: Mutex<Inner>,
}

impl FrameScheduler {
    pub fn new(render_info: &HmdRenderInfo, config: &RuntimeConfig, clock: Arc<dyn Clock>) -> Self {
        let device_interval = render_info.nominal_refresh_interval();
        let nominal_interval = if device_interval.is_finite() && device_interval > 0.0 {
            device_interval
        } else {
            let hz = if config.fallback_refresh_hz > 0.0 { config.fallback_refresh_hz } else { 90.0 };
            info!("Device reports no refresh rate, assuming {} Hz", hz);
            1.0 / hz as f64
        };

        Self {
            clock,
            nominal_interval,
            shutter: render_info.shutter,
            inner: Mutex::new(Inner {
                state: SchedulerState::Idle,
                base_index: 1,
                base_time: 0.0,
                next_index: 1,
                open_frame: None,
                vsync: config.vsync,
                jit: false,
                timewarp_fraction: config.timewarp_fraction,
                measured: None,
                last_vsync: None,
                history: [None; HISTORY_LEN],
                distortion_times: [0.0; DISTORTION_SAMPLES],
                distortion_count: 0,
                distortion_next: 0,
            }),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now(&self) -> f64 {
        self.clock.now_seconds()
    }

    pub fn state(&self) -> SchedulerState {
        self.inner.lock().state
    }

    pub fn set_jit_enabled(&self, enabled: bool) {
        self.inner.lock().jit = enabled;
    }

    pub fn set_vsync_enabled(&self, enabled: bool) {
        self.inner.lock().vsync = enabled;
    }

    pub fn vsync_enabled(&self) -> bool {
        self.inner.lock().vsync
    }

    pub fn set_timewarp_fraction(&self, fraction: f32) {
        self.inner.lock().timewarp_fraction = fraction;
    }

    /// Restarts the frame grid at `frame_index`, anchored at the current time
    pub fn reset_frame_timing(&self, frame_index: u64, vsync_enabled: bool) {
        let now = self.now();
        self.inner.lock().vsync = vsync_enabled;
        self.reset_frame_timing_at(frame_index, now);
    }

    /// Restarts the frame grid with an explicit base time
    pub fn reset_frame_timing_at(&self, frame_index: u64, base_time: f64) {
        let mut inner = self.inner.lock();
        let frame_index = inner.resolve(frame_index);
        inner.reseed(frame_index, base_time);
        inner.next_index = frame_index;
        inner.open_frame = None;
        inner.history = [None; HISTORY_LEN];
        inner.state = SchedulerState::TimingActive;
        info!("Frame timing reset at frame {} (t = {:.4})", frame_index, base_time);
    }

    /// Interval between vsyncs currently used by the model
    pub fn refresh_interval(&self) -> f64 {
        let now = self.now();
        self.interval_at(&self.inner.lock(), now)
    }

    fn interval_at(&self, inner: &Inner, now: f64) -> f64 {
        match inner.measured {
            Some(m) if now - m.observed_at < MEASUREMENT_LIFETIME => m.interval,
            _ => self.nominal_interval,
        }
    }

    /// Feeds a vsync timestamp from the display
    pub fn observe_vsync(&self, timestamp: f64) {
        let mut inner = self.inner.lock();
        if let Some(last) = inner.last_vsync {
            let interval = timestamp - last;
            if (MIN_VALID_INTERVAL..=MAX_VALID_INTERVAL).contains(&interval) {
                let current = self.interval_at(&inner, timestamp);
                if (interval - current).abs() > 1e-6 {
                    // Continue the grid from the newest frame so later frames
                    // never start before an earlier frame's next.
                    if let Some(latest) = inner.latest_history() {
                        inner.reseed(latest.frame_index.saturating_add(1), latest.next_frame_time);
                    }
                    debug!("Refresh interval now {:.6} s", interval);
                }
                inner.measured = Some(Measurement { interval, observed_at: timestamp });
            }
        }
        inner.last_vsync = Some(timestamp);
    }

    /// Adds one measured warp-and-present cost
    pub fn record_distortion_time(&self, seconds: f64) {
        if !seconds.is_finite() || seconds < 0.0 {
            return;
        }
        let mut inner = self.inner.lock();
        let slot = inner.distortion_next;
        inner.distortion_times[slot] = seconds;
        inner.distortion_next = (slot + 1) % DISTORTION_SAMPLES;
        inner.distortion_count = (inner.distortion_count + 1).min(DISTORTION_SAMPLES);
    }

    pub fn median_distortion_time(&self) -> Option<f64> {
        self.inner.lock().median_distortion_time()
    }

    /// Opens the render window for a frame; `0` means the next frame.
    pub fn begin_frame(&self, frame_index: u64) -> FrameTiming {
        let now = self.now();
        let mut inner = self.inner.lock();
        let frame_index = inner.resolve(frame_index);

        match inner.state {
            SchedulerState::Idle => {
                inner.reseed(frame_index, now);
                inner.state = SchedulerState::TimingActive;
                info!("Frame timing started at frame {}", frame_index);
            }
            SchedulerState::TimingActive => {}
            SchedulerState::RenderWindowOpen => {
                if let Some(open) = inner.open_frame {
                    warn!("begin_frame({}) while frame {} is still open", frame_index, open);
                }
            }
            state => warn!("begin_frame({}) during {:?}", frame_index, state),
        }

        let interval = self.interval_at(&inner, now);
        let this = inner.grid_time(frame_index, interval);
        if now - this > interval {
            let missed = ((now - this) / interval).floor();
            let mut retimed = this + missed * interval;
            if retimed > now {
                retimed -= interval;
            }
            inner.reseed(frame_index, retimed);
            warn!("Frame {} started {:.1} ms late, retiming", frame_index, (now - this) * 1000.0);
        }

        let timing = self.compute(&inner, frame_index, now);
        inner.history[(frame_index % HISTORY_LEN as u64) as usize] = Some(timing);
        inner.open_frame = Some(frame_index);
        inner.state = SchedulerState::RenderWindowOpen;
        timing
    }

    /// Timing of any frame, recorded or predicted. Safe from any thread.
    pub fn frame_timing(&self, frame_index: u64) -> FrameTiming {
        let now = self.now();
        let inner = self.inner.lock();
        let frame_index = inner.resolve(frame_index);
        if let Some(timing) = inner.history_entry(frame_index) {
            return timing;
        }
        if inner.state == SchedulerState::Idle {
            let mut anchored = inner.clone();
            anchored.reseed(frame_index, now);
            return self.compute(&anchored, frame_index, now);
        }
        self.compute(&inner, frame_index, now)
    }

    /// The render thread is about to block until the warp point
    pub fn mark_waiting_for_warp(&self, frame_index: u64) {
        let mut inner = self.inner.lock();
        let frame_index = inner.resolve(frame_index);
        if inner.state != SchedulerState::RenderWindowOpen || inner.open_frame != Some(frame_index) {
            warn!("Warp wait for frame {} during {:?}", frame_index, inner.state);
        }
        inner.state = SchedulerState::WaitingForWarpPoint;
    }

    /// The warp pass has started for this frame
    pub fn mark_warp_and_present(&self, frame_index: u64) {
        let mut inner = self.inner.lock();
        let frame_index = inner.resolve(frame_index);
        match inner.state {
            SchedulerState::WaitingForWarpPoint | SchedulerState::RenderWindowOpen => {}
            state => warn!("Warp for frame {} during {:?}", frame_index, state),
        }
        inner.state = SchedulerState::WarpAndPresent;
    }

    /// Marks a frame as submitted
    pub fn end_frame(&self, frame_index: u64) {
        let mut inner = self.inner.lock();
        let frame_index = inner.resolve(frame_index);
        if inner.open_frame != Some(frame_index) {
            warn!("end_frame({}) without matching begin_frame", frame_index);
        }
        inner.open_frame = None;
        inner.next_index = inner.next_index.max(frame_index.saturating_add(1));
        inner.state = SchedulerState::RenderWindowOpen;
    }

    fn compute(&self, inner: &Inner, frame_index: u64, now: f64) -> FrameTiming {
        let interval = self.interval_at(inner, now);
        let this = inner.grid_time(frame_index, interval);
        let next = inner.grid_time_ahead(frame_index, 1.0, interval);

        let shutter = &self.shutter;
        let scanout_start = if inner.vsync {
            next + shutter.vsync_to_first_scanline as f64
        } else {
            next + NO_VSYNC_LATENCY
        };
        let scanout = shutter.first_scanline_to_last_scanline as f64;
        let switching = shutter.pixel_settle_time as f64 * 0.5 + shutter.pixel_persistence as f64 * 0.5;
        let midpoint = scanout_start + scanout * 0.5 + switching;

        let eye_scanout_time =
            eye_scanout_fractions(shutter.shutter_type).map(|f| scanout_start + f * scanout + switching);
        let window = match shutter.shutter_type {
            ShutterType::Global => [midpoint, midpoint],
            _ => [scanout_start + switching, scanout_start + scanout + switching],
        };

        let previous = frame_index
            .checked_sub(1)
            .and_then(|prev| inner.history_entry(prev))
            .map(|prev| this - prev.this_frame_time)
            .unwrap_or(interval);

        FrameTiming {
            frame_index,
            this_frame_time: this,
            timewarp_sample_time: self.timewarp_sample_time(inner, this, next, interval),
            next_frame_time: next,
            scanout_midpoint_time: midpoint,
            eye_scanout_time,
            eye_warp_window: [window, window],
            delta_seconds: (previous.max(0.0) as f32).min(MAX_FRAME_DELTA),
        }
    }

    fn timewarp_sample_time(&self, inner: &Inner, this: f64, next: f64, interval: f64) -> f64 {
        let fraction = inner.timewarp_fraction.clamp(MIN_TIMEWARP_FRACTION, MAX_TIMEWARP_FRACTION);
        let sample = match inner.median_distortion_time() {
            Some(median) if inner.jit => next - (median + JIT_PREEMPT_BUFFER),
            _ => next - fraction as f64 * interval,
        };
        let margin = interval * MIN_TIMEWARP_FRACTION as f64;
        sample.clamp(this + margin, next - margin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hmd::{HmdDesc, HmdType};

    fn scheduler(hmd_type: HmdType) -> (FrameScheduler, Arc<ManualClock>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let clock = Arc::new(ManualClock::new(0.0));
        let desc = HmdDesc::debug(hmd_type);
        (FrameScheduler::new(&desc.render_info, &RuntimeConfig::default(), clock.clone()), clock)
    }

    fn check_invariants(timing: &FrameTiming) {
        assert!(timing.this_frame_time < timing.timewarp_sample_time, "{:?}", timing);
        assert!(timing.timewarp_sample_time < timing.next_frame_time, "{:?}", timing);
        assert!(timing.next_frame_time <= timing.scanout_midpoint_time, "{:?}", timing);
        let latest_eye = timing.eye_scanout_time[0].max(timing.eye_scanout_time[1]);
        assert!(timing.scanout_midpoint_time <= latest_eye, "{:?}", timing);
    }

    #[test]
    fn reset_anchors_the_base_frame() {
        let (sched, clock) = scheduler(HmdType::Dk2);
        clock.set(3.0);
        sched.begin_frame(7);
        sched.end_frame(7);

        sched.reset_frame_timing_at(100, 5.0);
        assert_eq!(sched.frame_timing(100).this_frame_time, 5.0);
        let interval = sched.refresh_interval();
        assert!((sched.frame_timing(101).this_frame_time - (5.0 + interval)).abs() < 1e-12);
        assert_eq!(sched.state(), SchedulerState::TimingActive);
    }

    #[test]
    fn last_frame_index_does_not_overflow() {
        let (sched, clock) = scheduler(HmdType::Dk2);
        sched.reset_frame_timing_at(u64::MAX, 2.0);
        clock.set(2.001);
        let timing = sched.begin_frame(u64::MAX);
        check_invariants(&timing);
        sched.end_frame(u64::MAX);
        assert_eq!(sched.frame_timing(0).frame_index, u64::MAX);
    }

    #[test]
    fn invariants_hold_for_every_shutter() {
        for hmd_type in [HmdType::Dk1, HmdType::Dk2] {
            let (sched, clock) = scheduler(hmd_type);
            sched.reset_frame_timing_at(1, 0.0);
            for n in 1..40u64 {
                let predicted = sched.frame_timing(n);
                clock.set(predicted.this_frame_time + 0.001);
                let timing = sched.begin_frame(n);
                check_invariants(&timing);
                sched.end_frame(n);
                assert!(sched.frame_timing(n + 1).this_frame_time >= timing.next_frame_time);
            }
        }
    }

    #[test]
    fn global_shutter_uses_midpoint_window() {
        let clock = Arc::new(ManualClock::new(0.0));
        let mut desc = HmdDesc::debug(HmdType::Dk2);
        desc.render_info.shutter.shutter_type = ShutterType::Global;
        let sched = FrameScheduler::new(&desc.render_info, &RuntimeConfig::default(), clock);
        sched.reset_frame_timing_at(1, 0.0);
        let timing = sched.begin_frame(1);
        check_invariants(&timing);
        for window in timing.eye_warp_window {
            assert_eq!(window, [timing.scanout_midpoint_time; 2]);
        }
    }

    #[test]
    fn right_to_left_panel_lights_right_eye_first() {
        let (sched, _clock) = scheduler(HmdType::Dk2);
        sched.reset_frame_timing_at(1, 0.0);
        let timing = sched.begin_frame(1);
        assert!(timing.eye_scanout_time[1] < timing.eye_scanout_time[0]);
    }

    #[test]
    fn default_warp_point_is_a_quarter_frame_early() {
        let (sched, _clock) = scheduler(HmdType::Dk2);
        sched.reset_frame_timing_at(1, 0.0);
        let timing = sched.begin_frame(1);
        let interval = sched.refresh_interval();
        let expected = timing.next_frame_time - 0.25 * interval;
        assert!((timing.timewarp_sample_time - expected).abs() < 1e-12);
    }

    #[test]
    fn fraction_is_clamped() {
        let (sched, _clock) = scheduler(HmdType::Dk2);
        sched.set_timewarp_fraction(3.0);
        sched.reset_frame_timing_at(1, 0.0);
        check_invariants(&sched.begin_frame(1));
    }

    #[test]
    fn jit_uses_median_distortion_cost() {
        let (sched, _clock) = scheduler(HmdType::Dk2);
        sched.set_jit_enabled(true);
        for cost in [0.002, 0.003, 0.0025] {
            sched.record_distortion_time(cost);
        }
        assert_eq!(sched.median_distortion_time(), Some(0.0025));
        sched.reset_frame_timing_at(1, 0.0);
        let timing = sched.begin_frame(1);
        let expected = timing.next_frame_time - (0.0025 + JIT_PREEMPT_BUFFER);
        assert!((timing.timewarp_sample_time - expected).abs() < 1e-12);
    }

    #[test]
    fn stall_retimes_and_clamps_delta() {
        let (sched, clock) = scheduler(HmdType::Dk2);
        sched.reset_frame_timing_at(1, 0.0);
        sched.begin_frame(1);
        sched.end_frame(1);

        clock.set(1.0);
        let timing = sched.begin_frame(2);
        let interval = sched.refresh_interval();
        assert!(timing.this_frame_time <= 1.0);
        assert!(1.0 - timing.this_frame_time <= interval + 1e-9);
        assert_eq!(timing.delta_seconds, MAX_FRAME_DELTA);
        check_invariants(&timing);
    }

    #[test]
    fn zero_index_means_next_frame() {
        let (sched, _clock) = scheduler(HmdType::Dk1);
        sched.reset_frame_timing_at(10, 0.0);
        assert_eq!(sched.begin_frame(0).frame_index, 10);
        sched.end_frame(10);
        assert_eq!(sched.begin_frame(0).frame_index, 11);
    }

    #[test]
    fn measured_vsync_overrides_nominal_until_stale() {
        let (sched, clock) = scheduler(HmdType::Dk2);
        let interval = 1.0 / 90.0;
        for i in 0..5 {
            sched.observe_vsync(i as f64 * interval);
        }
        clock.set(0.1);
        assert!((sched.refresh_interval() - interval).abs() < 1e-9);

        // Out-of-range gaps are ignored.
        sched.observe_vsync(4.0 * interval + 0.2);
        assert!((sched.refresh_interval() - interval).abs() < 1e-9);

        clock.set(20.0);
        assert!((sched.refresh_interval() - 1.0 / 75.0).abs() < 1e-6);
    }

    #[test]
    fn state_machine_walks_a_frame() {
        let (sched, _clock) = scheduler(HmdType::Dk2);
        assert_eq!(sched.state(), SchedulerState::Idle);
        sched.begin_frame(1);
        assert_eq!(sched.state(), SchedulerState::RenderWindowOpen);
        sched.mark_waiting_for_warp(1);
        assert_eq!(sched.state(), SchedulerState::WaitingForWarpPoint);
        sched.mark_warp_and_present(1);
        assert_eq!(sched.state(), SchedulerState::WarpAndPresent);
        sched.end_frame(1);
        assert_eq!(sched.state(), SchedulerState::RenderWindowOpen);
    }

    #[test]
    fn timing_queries_from_other_threads() {
        let (sched, _clock) = scheduler(HmdType::Dk2);
        let sched = Arc::new(sched);
        sched.reset_frame_timing_at(1, 0.0);
        let handles: Vec<_> = (1..5u64)
            .map(|n| {
                let sched = sched.clone();
                std::thread::spawn(move || sched.frame_timing(n))
            })
            .collect();
        for handle in handles {
            check_invariants(&handle.join().unwrap());
        }
    }

    #[test]
    fn waits_do_not_block_past_deadline_or_bound() {
        let clock = ManualClock::new(5.0);
        assert_eq!(wait_until(&clock, 4.0, WaitMode::Spin), 0.0);

        // A clock that never advances still releases the thread.
        let start = Instant::now();
        wait_until(&clock, 100.0, WaitMode::Sleep);
        assert!(start.elapsed() < Duration::from_secs(1));

        let real = MonotonicClock::new();
        let deadline = real.now_seconds() + 0.002;
        let waited = wait_until(&real, deadline, WaitMode::Spin);
        assert!(waited >= 0.0015);
    }
}
