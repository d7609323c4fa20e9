use std::collections::VecDeque;
use std::time::{Duration, Instant};

use sysinfo::{CpuRefreshKind, RefreshKind, System};
use tracing::debug;

/// CPU sampling cadence.
pub const CPU_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);
/// Rolling window of smoothed CPU samples.
const CPU_WINDOW: usize = 5;
/// Target utilization band: scale up below, down above.
const CPU_LOW_WATER: f32 = 92.0;
const CPU_HIGH_WATER: f32 = 98.0;
/// CPU adjustments fire at most every this many sampling ticks.
const CPU_ADJUST_EVERY: u32 = 3;

/// Throughput samples are kept for this long.
const PERF_RETENTION: Duration = Duration::from_secs(120);
/// Throughput comparison windows.
const PERF_WINDOW: Duration = Duration::from_secs(10);
/// Relative change required to react.
const PERF_IMPROVE: f64 = 0.03;
const PERF_DEGRADE: f64 = 0.05;
/// Queue pressure that triggers proactive scale-up.
const QUEUE_PRESSURE: f64 = 1.2;

/// ETA extrapolations averaged for the progress display.
const ETA_WINDOW: usize = 20;

/// One throughput observation, recorded after every completion.
#[derive(Debug, Clone, Copy)]
pub struct PerfSample {
    pub at: Instant,
    pub completed: usize,
    pub workers: usize,
}

/// Requested worker-count change from one of the scaling signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    Up,
    Down,
}

/// Aggregate-CPU sampler with a small rolling window.
///
/// `sysinfo` computes utilization from tick deltas between refreshes, so the
/// 500ms cadence doubles as the delta interval.
pub struct CpuSampler {
    sys: System,
    window: VecDeque<f32>,
}

impl CpuSampler {
    pub fn new() -> Self {
        let sys = System::new_with_specifics(
            RefreshKind::new().with_cpu(CpuRefreshKind::new().with_cpu_usage()),
        );
        Self {
            sys,
            window: VecDeque::with_capacity(CPU_WINDOW),
        }
    }

    /// Take one sample and fold it into the window.
    pub fn sample(&mut self) {
        self.sys.refresh_cpu_usage();
        let usage = self.sys.global_cpu_info().cpu_usage().clamp(0.0, 100.0);
        if self.window.len() == CPU_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(usage);
    }

    /// Mean over the current window; zero before the first sample.
    pub fn mean(&self) -> f32 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f32>() / self.window.len() as f32
    }

    #[cfg(test)]
    fn with_samples(samples: &[f32]) -> Self {
        let mut s = Self::new();
        for &v in samples {
            if s.window.len() == CPU_WINDOW {
                s.window.pop_front();
            }
            s.window.push_back(v);
        }
        s
    }
}

/// The pool's scaling brain: owns the CPU window and the throughput ring,
/// and turns them into worker-count adjustments.
pub struct AdaptiveScaler {
    cpu: CpuSampler,
    ticks_since_adjust: u32,
    perf: VecDeque<PerfSample>,
}

impl AdaptiveScaler {
    pub fn new() -> Self {
        Self {
            cpu: CpuSampler::new(),
            ticks_since_adjust: 0,
            perf: VecDeque::new(),
        }
    }

    pub fn cpu_percent(&self) -> f32 {
        self.cpu.mean()
    }

    /// 500ms tick: sample CPU and emit an adjustment when the smoothed mean
    /// leaves the target band. Adjustments are rate-limited to one per
    /// `CPU_ADJUST_EVERY` ticks.
    pub fn on_tick(&mut self, queue_len: usize, max_workers: usize) -> Option<Adjustment> {
        self.cpu.sample();
        self.ticks_since_adjust += 1;
        if self.ticks_since_adjust < CPU_ADJUST_EVERY {
            return None;
        }

        let mean = self.cpu.mean();
        let adjustment = cpu_decision(mean, queue_len, max_workers);
        if adjustment.is_some() {
            debug!(cpu = mean, ?adjustment, "cpu signal");
            self.ticks_since_adjust = 0;
        }
        adjustment
    }

    /// Record a completion and emit a throughput-driven adjustment:
    /// compare the last 10s of completions to the preceding 10s, and scale
    /// up proactively when the queue outgrows the in-flight work.
    pub fn on_completion(
        &mut self,
        now: Instant,
        completed: usize,
        workers: usize,
        queue_len: usize,
        in_flight: usize,
        at_limit: bool,
    ) -> Option<Adjustment> {
        self.perf.push_back(PerfSample {
            at: now,
            completed,
            workers,
        });
        while let Some(front) = self.perf.front() {
            if now.duration_since(front.at) > PERF_RETENTION {
                self.perf.pop_front();
            } else {
                break;
            }
        }

        if queue_len as f64 > QUEUE_PRESSURE * in_flight as f64 && !at_limit {
            debug!(queue_len, in_flight, "queue pressure signal");
            return Some(Adjustment::Up);
        }

        if completed <= 3 {
            return None;
        }

        let recent = self.completions_between(now - PERF_WINDOW, now);
        let previous = self.completions_between(now - 2 * PERF_WINDOW, now - PERF_WINDOW);
        if previous == 0 {
            return None;
        }

        let change = (recent as f64 - previous as f64) / previous as f64;
        if change > PERF_IMPROVE && queue_len > 0 && !at_limit {
            debug!(recent, previous, change, "throughput improving");
            Some(Adjustment::Up)
        } else if change < -PERF_DEGRADE && workers > 1 {
            let window_start_workers = self.perf.front().map_or(workers, |s| s.workers);
            debug!(recent, previous, change, window_start_workers, "throughput degrading");
            Some(Adjustment::Down)
        } else {
            None
        }
    }

    /// Completions recorded in the half-open interval `(from, to]`.
    fn completions_between(&self, from: Instant, to: Instant) -> usize {
        let at = |t: Instant| {
            self.perf
                .iter()
                .rev()
                .find(|s| s.at <= t)
                .map(|s| s.completed)
                .unwrap_or(0)
        };
        at(to).saturating_sub(at(from))
    }
}

/// The CPU band decision: scale up when under-utilized with work waiting,
/// down when saturated.
fn cpu_decision(mean: f32, queue_len: usize, max_workers: usize) -> Option<Adjustment> {
    if mean < CPU_LOW_WATER && queue_len > 0 {
        Some(Adjustment::Up)
    } else if mean > CPU_HIGH_WATER && max_workers > 1 {
        Some(Adjustment::Down)
    } else {
        None
    }
}

/// Smooths the progress ETA over the last `ETA_WINDOW` per-completion
/// extrapolations.
pub struct EtaSmoother {
    ring: VecDeque<f64>,
}

impl EtaSmoother {
    pub fn new() -> Self {
        Self {
            ring: VecDeque::with_capacity(ETA_WINDOW),
        }
    }

    /// Record one `(total - completed) * (elapsed / completed)`
    /// extrapolation, in seconds.
    pub fn push(&mut self, eta_seconds: f64) {
        if self.ring.len() == ETA_WINDOW {
            self.ring.pop_front();
        }
        self.ring.push_back(eta_seconds);
    }

    pub fn smoothed(&self) -> Option<f64> {
        if self.ring.is_empty() {
            return None;
        }
        Some(self.ring.iter().sum::<f64>() / self.ring.len() as f64)
    }
}
