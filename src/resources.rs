//! Resource monitoring and admission control.
//!
//! The [`ResourceMonitor`] answers one question: *can this task run now?*
//! It keeps a rolling window of host samples (CPU %, memory, process disk
//! I/O, task counts) and a table of per-task allocations, and compares
//!
//! ```text
//! projected = current usage + Σ allocated + requested
//! ```
//!
//! against configured hard limits. Denials are returned as values
//! ([`Availability`] / [`ResourceError`]) rather than panics so callers can
//! poll with backoff.
//!
//! # Soft vs hard limits
//!
//! Crossing a soft limit only logs a warning; crossing a hard limit blocks
//! admission. The monitor never kills running work to reclaim resources;
//! already-admitted tasks may temporarily push real usage past a limit.
//!
//! # Scoped acquisition
//!
//! [`ResourceMonitor::acquire`] returns an [`AllocationGuard`] that releases
//! the allocation when dropped, so a task's resources are returned on every
//! path: success, failure, timeout or panic.

use crate::error::ResourceError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::System;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

const MB: u64 = 1024 * 1024;

/// Allowance for floating-point accumulation in core sums.
const CORE_EPSILON: f64 = 1e-9;

// =============================================================================
// Requirements & limits
// =============================================================================

/// What a stage needs from the host while it runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceRequirements {
    pub cpu_cores: f64,
    pub memory_mb: u64,
    pub gpu_required: bool,
    pub gpu_memory_mb: u64,
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self {
            cpu_cores: 1.0,
            memory_mb: 256,
            gpu_required: false,
            gpu_memory_mb: 0,
        }
    }
}

impl ResourceRequirements {
    pub fn new(cpu_cores: f64, memory_mb: u64) -> Self {
        Self {
            cpu_cores,
            memory_mb,
            ..Self::default()
        }
    }

    /// A request for nothing at all; always admitted.
    pub fn none() -> Self {
        Self::new(0.0, 0)
    }

    pub fn with_gpu(mut self, gpu_memory_mb: u64) -> Self {
        self.gpu_required = true;
        self.gpu_memory_mb = gpu_memory_mb;
        self
    }

    fn needs_gpu(&self) -> bool {
        self.gpu_required || self.gpu_memory_mb > 0
    }

    fn add(&mut self, other: &ResourceRequirements) {
        self.cpu_cores += other.cpu_cores;
        self.memory_mb += other.memory_mb;
        self.gpu_required |= other.gpu_required;
        self.gpu_memory_mb += other.gpu_memory_mb;
    }
}

/// Admission limits. Percentages are of the whole host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Hard CPU ceiling. Default: 80 %.
    pub max_cpu_percent: f64,
    /// CPU level that triggers a warning. Default: 70 %.
    pub soft_cpu_percent: f64,
    /// Hard memory ceiling. Default: 75 %.
    pub max_memory_percent: f64,
    /// Memory level that triggers a warning. Default: 65 %.
    pub soft_memory_percent: f64,
    /// Cap on the sum of allocated cores. Default: the host's core count.
    pub max_cpu_cores: Option<f64>,
    /// GPU memory budget in MB. `0` means no GPU is available.
    pub gpu_memory_mb: u64,
    /// Sampling period. Default: 1 000 ms.
    pub sample_interval_ms: u64,
    /// Length of the rolling sample window. Default: 300 s.
    pub sample_window_secs: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_cpu_percent: 80.0,
            soft_cpu_percent: 70.0,
            max_memory_percent: 75.0,
            soft_memory_percent: 65.0,
            max_cpu_cores: None,
            gpu_memory_mb: 0,
            sample_interval_ms: 1_000,
            sample_window_secs: 300,
        }
    }
}

impl ResourceLimits {
    fn window_capacity(&self) -> usize {
        let interval = self.sample_interval_ms.max(1);
        ((self.sample_window_secs * 1_000) / interval).max(1) as usize
    }
}

// =============================================================================
// Sampling
// =============================================================================

/// Raw host readings produced by a [`UsageSampler`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostUsage {
    pub cpu_percent: f64,
    pub cpu_cores: usize,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub disk_read_bytes: u64,
    pub disk_write_bytes: u64,
}

impl HostUsage {
    /// An idle host with the given shape.
    pub fn idle(cpu_cores: usize, memory_total_mb: u64) -> Self {
        Self {
            cpu_percent: 0.0,
            cpu_cores,
            memory_used_mb: 0,
            memory_total_mb,
            disk_read_bytes: 0,
            disk_write_bytes: 0,
        }
    }
}

/// Source of host usage readings.
pub trait UsageSampler: Send {
    fn sample(&mut self) -> HostUsage;
}

/// Samples the real host through `sysinfo`.
pub struct SystemSampler {
    sys: System,
    pid: Option<sysinfo::Pid>,
}

impl SystemSampler {
    pub fn new() -> Self {
        let mut sys = System::new();
        // CPU usage is a delta between refreshes; prime the first reading.
        sys.refresh_cpu();
        sys.refresh_memory();
        Self {
            sys,
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageSampler for SystemSampler {
    fn sample(&mut self) -> HostUsage {
        self.sys.refresh_cpu();
        self.sys.refresh_memory();

        let (disk_read_bytes, disk_write_bytes) = match self.pid {
            Some(pid) if self.sys.refresh_process(pid) => self
                .sys
                .process(pid)
                .map(|p| {
                    let d = p.disk_usage();
                    (d.read_bytes, d.written_bytes)
                })
                .unwrap_or((0, 0)),
            _ => (0, 0),
        };

        HostUsage {
            cpu_percent: self.sys.global_cpu_info().cpu_usage() as f64,
            cpu_cores: self.sys.cpus().len().max(1),
            memory_used_mb: self.sys.used_memory() / MB,
            memory_total_mb: (self.sys.total_memory() / MB).max(1),
            disk_read_bytes,
            disk_write_bytes,
        }
    }
}

/// A sampler that reports whatever it is told to.
///
/// Cloning shares the underlying reading, so a test (or an embedding
/// application with its own telemetry) can keep a handle and update it
/// while the monitor owns the sampler.
#[derive(Debug, Clone)]
pub struct FixedSampler {
    usage: Arc<Mutex<HostUsage>>,
}

impl FixedSampler {
    pub fn new(usage: HostUsage) -> Self {
        Self {
            usage: Arc::new(Mutex::new(usage)),
        }
    }

    /// Replace the reported usage.
    pub fn set(&self, usage: HostUsage) {
        if let Ok(mut u) = self.usage.lock() {
            *u = usage;
        }
    }
}

impl UsageSampler for FixedSampler {
    fn sample(&mut self) -> HostUsage {
        self.usage
            .lock()
            .map(|u| u.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }
}

/// One entry in the rolling sample window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub timestamp: DateTime<Utc>,
    pub host: HostUsage,
    pub active_tasks: usize,
    pub queued_tasks: usize,
}

impl ResourceSample {
    pub fn memory_percent(&self) -> f64 {
        self.host.memory_used_mb as f64 / self.host.memory_total_mb.max(1) as f64 * 100.0
    }
}

/// Aggregates over the current sample window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub samples: usize,
    pub avg_cpu_percent: f64,
    pub peak_cpu_percent: f64,
    pub avg_memory_percent: f64,
    pub peak_memory_percent: f64,
    pub total_disk_read_bytes: u64,
    pub total_disk_write_bytes: u64,
    pub active_tasks: usize,
    pub queued_tasks: usize,
    pub allocated: Option<ResourceRequirements>,
}

/// Answer to an admission query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Availability {
    pub available: bool,
    /// Why admission would be denied.
    pub reason: Option<String>,
}

// =============================================================================
// Monitor
// =============================================================================

/// Samples host usage, owns the allocation table and gates admissions.
pub struct ResourceMonitor {
    limits: ResourceLimits,
    sampler: Mutex<Box<dyn UsageSampler>>,
    window: Mutex<VecDeque<ResourceSample>>,
    window_capacity: usize,
    allocations: Mutex<HashMap<Uuid, ResourceRequirements>>,
    queued: AtomicUsize,
}

impl std::fmt::Debug for ResourceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceMonitor")
            .field("limits", &self.limits)
            .field("active_allocations", &self.active_allocations())
            .finish()
    }
}

impl ResourceMonitor {
    /// A monitor backed by the real host.
    pub fn new(limits: ResourceLimits) -> Self {
        Self::with_sampler(limits, Box::new(SystemSampler::new()))
    }

    /// A monitor backed by a custom sampler.
    pub fn with_sampler(limits: ResourceLimits, sampler: Box<dyn UsageSampler>) -> Self {
        let window_capacity = limits.window_capacity();
        Self {
            limits,
            sampler: Mutex::new(sampler),
            window: Mutex::new(VecDeque::with_capacity(window_capacity.min(1024))),
            window_capacity,
            allocations: Mutex::new(HashMap::new()),
            queued: AtomicUsize::new(0),
        }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Take a sample now and append it to the window.
    pub fn sample_now(&self) -> ResourceSample {
        let host = match self.sampler.lock() {
            Ok(mut s) => s.sample(),
            Err(poisoned) => poisoned.into_inner().sample(),
        };
        let sample = ResourceSample {
            timestamp: Utc::now(),
            host,
            active_tasks: self.active_allocations(),
            queued_tasks: self.queued.load(Ordering::Relaxed),
        };

        let mut window = lock(&self.window);
        window.push_back(sample.clone());
        while window.len() > self.window_capacity {
            window.pop_front();
        }
        sample
    }

    /// Most recent sample, sampling on demand when the window is empty.
    pub fn latest_sample(&self) -> ResourceSample {
        let latest = lock(&self.window).back().cloned();
        match latest {
            Some(s) => s,
            None => self.sample_now(),
        }
    }

    /// Spawn the background sampling loop. Stops when `shutdown` fires.
    pub fn start_sampling(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        let period = Duration::from_millis(self.limits.sample_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let s = monitor.sample_now();
                        debug!(
                            cpu = s.host.cpu_percent,
                            memory_mb = s.host.memory_used_mb,
                            active = s.active_tasks,
                            "resource sample"
                        );
                    }
                }
            }
        })
    }

    /// Would `requirements` be admitted right now?
    pub fn check_availability(&self, requirements: &ResourceRequirements) -> Availability {
        let sample = self.latest_sample();
        let allocated = self.allocated_total();
        match self.evaluate(requirements, &sample, &allocated) {
            Ok(()) => Availability {
                available: true,
                reason: None,
            },
            Err(e) => Availability {
                available: false,
                reason: Some(e.to_string()),
            },
        }
    }

    /// Check that `requirements` could ever be admitted, even on an idle
    /// host with nothing else allocated.
    pub fn fits_capacity(&self, requirements: &ResourceRequirements) -> Result<(), ResourceError> {
        let shape = self.latest_sample().host;
        let idle = ResourceSample {
            timestamp: Utc::now(),
            host: HostUsage::idle(shape.cpu_cores, shape.memory_total_mb),
            active_tasks: 0,
            queued_tasks: 0,
        };
        let nothing = ResourceRequirements::none();
        self.check_limits(requirements, &idle, &nothing)
            .map_err(|reason| ResourceError::ExceedsCapacity { reason })
    }

    /// Atomically check and record an allocation for `task_id`.
    pub fn try_allocate(
        &self,
        task_id: Uuid,
        requirements: &ResourceRequirements,
    ) -> Result<(), ResourceError> {
        let sample = self.latest_sample();
        let mut allocations = lock(&self.allocations);
        let allocated = sum(allocations.values());
        self.evaluate(requirements, &sample, &allocated)?;
        allocations.insert(task_id, requirements.clone());
        debug!(%task_id, cores = requirements.cpu_cores, memory_mb = requirements.memory_mb, "allocated");
        Ok(())
    }

    /// Admit and return a guard that releases the allocation on drop.
    pub fn acquire(
        self: &Arc<Self>,
        task_id: Uuid,
        requirements: &ResourceRequirements,
    ) -> Result<AllocationGuard, ResourceError> {
        self.try_allocate(task_id, requirements)?;
        Ok(AllocationGuard {
            monitor: Arc::clone(self),
            task_id,
        })
    }

    /// Remove an allocation. Returns what was held, if anything.
    pub fn release(&self, task_id: Uuid) -> Option<ResourceRequirements> {
        let released = lock(&self.allocations).remove(&task_id);
        if released.is_some() {
            debug!(%task_id, "released");
        }
        released
    }

    pub fn allocation(&self, task_id: Uuid) -> Option<ResourceRequirements> {
        lock(&self.allocations).get(&task_id).cloned()
    }

    /// Sum of every active allocation.
    pub fn allocated_total(&self) -> ResourceRequirements {
        sum(lock(&self.allocations).values())
    }

    pub fn active_allocations(&self) -> usize {
        lock(&self.allocations).len()
    }

    /// Queue depth reported by the worker pool, carried into samples.
    pub fn set_queued_tasks(&self, n: usize) {
        self.queued.store(n, Ordering::Relaxed);
    }

    /// Averages and peaks over the current window.
    pub fn usage_summary(&self) -> UsageSummary {
        let window = lock(&self.window).clone();
        let allocated = self.allocated_total();
        let n = window.len();
        let mut summary = UsageSummary {
            samples: n,
            active_tasks: self.active_allocations(),
            queued_tasks: self.queued.load(Ordering::Relaxed),
            allocated: Some(allocated),
            ..UsageSummary::default()
        };
        if n == 0 {
            return summary;
        }
        for s in &window {
            let mem = s.memory_percent();
            summary.avg_cpu_percent += s.host.cpu_percent;
            summary.avg_memory_percent += mem;
            summary.peak_cpu_percent = summary.peak_cpu_percent.max(s.host.cpu_percent);
            summary.peak_memory_percent = summary.peak_memory_percent.max(mem);
            summary.total_disk_read_bytes += s.host.disk_read_bytes;
            summary.total_disk_write_bytes += s.host.disk_write_bytes;
        }
        summary.avg_cpu_percent /= n as f64;
        summary.avg_memory_percent /= n as f64;
        summary
    }

    fn evaluate(
        &self,
        requested: &ResourceRequirements,
        sample: &ResourceSample,
        allocated: &ResourceRequirements,
    ) -> Result<(), ResourceError> {
        self.check_limits(requested, sample, allocated)
            .map_err(|reason| ResourceError::Denied { reason })
    }

    fn check_limits(
        &self,
        requested: &ResourceRequirements,
        sample: &ResourceSample,
        allocated: &ResourceRequirements,
    ) -> Result<(), String> {
        let l = &self.limits;
        let host_cores = sample.host.cpu_cores.max(1) as f64;
        let max_cores = l.max_cpu_cores.unwrap_or(host_cores);

        let projected_cores = allocated.cpu_cores + requested.cpu_cores;
        if projected_cores > max_cores + CORE_EPSILON {
            return Err(format!(
                "cpu cores {projected_cores:.2} would exceed limit {max_cores:.2}"
            ));
        }

        let projected_cpu = sample.host.cpu_percent + projected_cores / host_cores * 100.0;
        if projected_cpu > l.max_cpu_percent {
            return Err(format!(
                "cpu {projected_cpu:.1}% would exceed hard limit {:.1}%",
                l.max_cpu_percent
            ));
        }

        let total_mb = sample.host.memory_total_mb.max(1) as f64;
        let projected_mb = sample.host.memory_used_mb + allocated.memory_mb + requested.memory_mb;
        let projected_mem = projected_mb as f64 / total_mb * 100.0;
        if projected_mem > l.max_memory_percent {
            return Err(format!(
                "memory {projected_mb} MB ({projected_mem:.1}%) would exceed hard limit {:.1}%",
                l.max_memory_percent
            ));
        }

        if requested.needs_gpu() {
            if l.gpu_memory_mb == 0 {
                return Err("GPU requested but no GPU memory is configured".into());
            }
            let projected_gpu = allocated.gpu_memory_mb + requested.gpu_memory_mb;
            if projected_gpu > l.gpu_memory_mb {
                return Err(format!(
                    "GPU memory {projected_gpu} MB would exceed budget {} MB",
                    l.gpu_memory_mb
                ));
            }
        }

        if projected_cpu > l.soft_cpu_percent {
            warn!(
                projected = projected_cpu,
                soft_limit = l.soft_cpu_percent,
                "cpu above soft limit"
            );
        }
        if projected_mem > l.soft_memory_percent {
            warn!(
                projected = projected_mem,
                soft_limit = l.soft_memory_percent,
                "memory above soft limit"
            );
        }
        Ok(())
    }
}

/// Releases a task's allocation when dropped.
pub struct AllocationGuard {
    monitor: Arc<ResourceMonitor>,
    task_id: Uuid,
}

impl AllocationGuard {
    pub fn task_id(&self) -> Uuid {
        self.task_id
    }
}

impl Drop for AllocationGuard {
    fn drop(&mut self) {
        self.monitor.release(self.task_id);
    }
}

impl std::fmt::Debug for AllocationGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationGuard")
            .field("task_id", &self.task_id)
            .finish()
    }
}

fn sum<'a>(reqs: impl Iterator<Item = &'a ResourceRequirements>) -> ResourceRequirements {
    let mut total = ResourceRequirements::none();
    for r in reqs {
        total.add(r);
    }
    total
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
