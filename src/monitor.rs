//! Real-time metrics sampling
//!
//! A dedicated sampler thread walks all running VMs once per second, turns
//! cumulative hypervisor counters into rates, maintains the bounded per-VM
//! windows, probes host-level state from /proc and statvfs, and fans out to
//! registered callbacks. Callbacks run synchronously on the sampler thread
//! and must not block.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;

use crate::manager::VmManager;
use crate::metrics::{HostMetrics, ResourceUsage, VmMetrics, AVG_15MIN_WINDOW, AVG_5MIN_WINDOW};
use crate::vm::{VirtualMachine, VmState};

pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

pub type MetricsCallback = Box<dyn Fn(&VmMetrics) + Send + Sync>;
pub type HostMetricsCallback = Box<dyn Fn(&HostMetrics) + Send + Sync>;

/// Cumulative counters from the previous tick of one VM.
#[derive(Debug, Clone, Copy)]
struct RawCounters {
    cpu_time_ns: u64,
    rd_bytes: u64,
    wr_bytes: u64,
    rx_bytes: u64,
    tx_bytes: u64,
    at: Instant,
}

#[derive(Default)]
struct SamplerState {
    prev: Option<RawCounters>,
    /// Host-side interface name, discovered once from the live XML.
    iface: Option<String>,
}

#[derive(Default)]
struct HostSampler {
    prev_total: u64,
    prev_idle: u64,
    /// Recent instantaneous busy values for the 5/15 min averages.
    busy_history: VecDeque<f64>,
}

struct MonitorShared {
    manager: Arc<VmManager>,
    interval: Duration,
    vm_metrics: Mutex<HashMap<String, VmMetrics>>,
    host_metrics: Mutex<HostMetrics>,
    callbacks: Mutex<Vec<MetricsCallback>>,
    host_callbacks: Mutex<Vec<HostMetricsCallback>>,
    samplers: Mutex<HashMap<String, SamplerState>>,
    host_sampler: Mutex<HostSampler>,
}

/// Periodic sampler for per-VM and host metrics.
pub struct RealTimeMonitor {
    shared: Arc<MonitorShared>,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl RealTimeMonitor {
    pub fn new(manager: Arc<VmManager>) -> Self {
        Self::with_interval(manager, SAMPLE_INTERVAL)
    }

    pub fn with_interval(manager: Arc<VmManager>, interval: Duration) -> Self {
        Self {
            shared: Arc::new(MonitorShared {
                manager,
                interval,
                vm_metrics: Mutex::new(HashMap::new()),
                host_metrics: Mutex::new(HostMetrics::default()),
                callbacks: Mutex::new(Vec::new()),
                host_callbacks: Mutex::new(Vec::new()),
                samplers: Mutex::new(HashMap::new()),
                host_sampler: Mutex::new(HostSampler::default()),
            }),
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }

    /// Spawn the sampler thread. Idempotent.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let running = Arc::clone(&self.running);
        let handle = std::thread::Builder::new()
            .name("monitor-sampler".to_string())
            .spawn(move || {
                tracing::info!("Real-time monitoring started");
                while running.load(Ordering::SeqCst) {
                    let started = Instant::now();
                    sample_tick(&shared);
                    // a slow libvirt response stretches the effective period
                    let elapsed = started.elapsed();
                    if elapsed < shared.interval {
                        std::thread::sleep(shared.interval - elapsed);
                    }
                }
                tracing::info!("Real-time monitoring stopped");
            })
            .expect("failed to spawn monitor thread");
        *self.thread.lock() = Some(handle);
    }

    /// Stop and join the sampler. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn register_metrics_callback(&self, callback: impl Fn(&VmMetrics) + Send + Sync + 'static) {
        self.shared.callbacks.lock().push(Box::new(callback));
    }

    pub fn register_host_callback(&self, callback: impl Fn(&HostMetrics) + Send + Sync + 'static) {
        self.shared.host_callbacks.lock().push(Box::new(callback));
    }

    /// Snapshot of one VM's metric state.
    pub fn vm_metrics(&self, vm_name: &str) -> Option<VmMetrics> {
        self.shared.vm_metrics.lock().get(vm_name).cloned()
    }

    pub fn all_vm_metrics(&self) -> Vec<VmMetrics> {
        self.shared.vm_metrics.lock().values().cloned().collect()
    }

    pub fn host_metrics(&self) -> HostMetrics {
        *self.shared.host_metrics.lock()
    }

    /// The most recent `max_points` samples for a VM, oldest first.
    pub fn history(&self, vm_name: &str, max_points: usize) -> Vec<ResourceUsage> {
        self.shared
            .vm_metrics
            .lock()
            .get(vm_name)
            .map(|m| m.recent_history(max_points))
            .unwrap_or_default()
    }

    /// Drop metric state for a VM that went away.
    pub fn forget_vm(&self, vm_name: &str) {
        self.shared.vm_metrics.lock().remove(vm_name);
        self.shared.samplers.lock().remove(vm_name);
    }
}

impl Drop for RealTimeMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sample_tick(shared: &MonitorShared) {
    let vms = shared.manager.registered_vms();
    let mut io_total = 0u64;
    let mut net_total = 0u64;
    let mut updated: Vec<VmMetrics> = Vec::new();

    for vm in vms {
        if vm.state() != VmState::Running {
            continue;
        }
        match sample_vm(shared, &vm) {
            Ok(usage) => {
                io_total += usage.io_read_bps + usage.io_write_bps;
                net_total += usage.net_rx_bps + usage.net_tx_bps;
                let mut metrics = shared.vm_metrics.lock();
                let entry = metrics
                    .entry(vm.name().to_string())
                    .or_insert_with(|| VmMetrics::new(vm.name()));
                entry.push(usage);
                updated.push(entry.clone());
            }
            Err(e) => {
                tracing::debug!(vm = %vm.name(), error = %e, "Metric sample failed");
            }
        }
    }

    let host = sample_host(shared, io_total, net_total);
    *shared.host_metrics.lock() = host;

    // fan out outside the metric locks; snapshots only
    let callbacks = shared.callbacks.lock();
    for metrics in &updated {
        for callback in callbacks.iter() {
            callback(metrics);
        }
    }
    drop(callbacks);
    for callback in shared.host_callbacks.lock().iter() {
        callback(&host);
    }
}

fn sample_vm(shared: &MonitorShared, vm: &Arc<VirtualMachine>) -> crate::Result<ResourceUsage> {
    let (vcpus, _memory_kib, cpu_time_ns) = vm.domain_info()?;
    let (memory_bytes, memory_max_bytes) = vm.memory_stat_pair().unwrap_or((0, 0));

    let disk_target = vm.primary_disk_target();
    let (rd_bytes, wr_bytes) = disk_target
        .as_deref()
        .and_then(|target| vm.block_counters(target).ok())
        .unwrap_or((0, 0));

    let mut samplers = shared.samplers.lock();
    let state = samplers.entry(vm.name().to_string()).or_default();

    if state.iface.is_none() {
        state.iface = vm
            .xml_desc()
            .ok()
            .and_then(|xml| find_iface_target(&xml));
    }
    let (rx_bytes, tx_bytes) = state
        .iface
        .as_deref()
        .and_then(|iface| vm.iface_counters(iface).ok())
        .unwrap_or((0, 0));

    let now = Instant::now();
    let current = RawCounters {
        cpu_time_ns,
        rd_bytes,
        wr_bytes,
        rx_bytes,
        tx_bytes,
        at: now,
    };

    let usage = match state.prev {
        Some(prev) => {
            let dt = now.duration_since(prev.at).as_secs_f64().max(1e-6);
            ResourceUsage {
                timestamp: Utc::now(),
                cpu_percent: cpu_percent(prev.cpu_time_ns, cpu_time_ns, dt, vcpus),
                memory_bytes,
                memory_max_bytes,
                io_read_bps: rate(prev.rd_bytes, rd_bytes, dt),
                io_write_bps: rate(prev.wr_bytes, wr_bytes, dt),
                net_rx_bps: rate(prev.rx_bytes, rx_bytes, dt),
                net_tx_bps: rate(prev.tx_bytes, tx_bytes, dt),
            }
        }
        // first tick per VM: no prior sample to diff against, rates stay zero
        None => ResourceUsage {
            timestamp: Utc::now(),
            memory_bytes,
            memory_max_bytes,
            ..ResourceUsage::zero(Utc::now())
        },
    };
    state.prev = Some(current);
    Ok(usage)
}

fn sample_host(shared: &MonitorShared, io_total: u64, net_total: u64) -> HostMetrics {
    let mut host = HostMetrics {
        io_throughput: io_total,
        network_throughput: net_total,
        ..HostMetrics::default()
    };

    if let Ok(stat) = std::fs::read_to_string("/proc/stat") {
        if let Some((total, idle)) = parse_proc_stat(&stat) {
            let mut sampler = shared.host_sampler.lock();
            let busy = cpu_busy_percent(sampler.prev_total, sampler.prev_idle, total, idle);
            sampler.prev_total = total;
            sampler.prev_idle = idle;

            if sampler.busy_history.len() == AVG_15MIN_WINDOW {
                sampler.busy_history.pop_front();
            }
            sampler.busy_history.push_back(busy);

            host.cpu_load_1min = busy;
            host.cpu_load_5min = tail_avg(&sampler.busy_history, AVG_5MIN_WINDOW);
            host.cpu_load_15min = tail_avg(&sampler.busy_history, AVG_15MIN_WINDOW);
        }
    }

    if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
        let (total, free, available) = parse_meminfo(&meminfo);
        host.total_memory = total;
        host.free_memory = free;
        host.available_memory = available;
    }

    host.disk_usage_percent = disk_usage_percent("/").unwrap_or(0);
    host
}

fn tail_avg(history: &VecDeque<f64>, window: usize) -> f64 {
    let n = history.len().min(window);
    if n == 0 {
        return 0.0;
    }
    history.iter().rev().take(n).sum::<f64>() / n as f64
}

/// CPU busy percent from two /proc/stat aggregate readings.
fn cpu_busy_percent(prev_total: u64, prev_idle: u64, total: u64, idle: u64) -> f64 {
    let total_diff = total.saturating_sub(prev_total);
    let idle_diff = idle.saturating_sub(prev_idle);
    if total_diff == 0 {
        return 0.0;
    }
    100.0 * (total_diff - idle_diff.min(total_diff)) as f64 / total_diff as f64
}

/// Parse the aggregate "cpu" line: returns (total jiffies, idle jiffies).
fn parse_proc_stat(content: &str) -> Option<(u64, u64)> {
    let line = content.lines().next()?;
    let mut fields = line.split_whitespace();
    if fields.next()? != "cpu" {
        return None;
    }
    let values: Vec<u64> = fields.filter_map(|f| f.parse().ok()).collect();
    if values.len() < 4 {
        return None;
    }
    let total: u64 = values.iter().sum();
    // idle + iowait when present
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Some((total, idle))
}

/// MemTotal, MemFree, MemAvailable in bytes.
fn parse_meminfo(content: &str) -> (u64, u64, u64) {
    let mut total = 0;
    let mut free = 0;
    let mut available = 0;
    for line in content.lines() {
        let mut fields = line.split_whitespace();
        let key = fields.next().unwrap_or("");
        let value: u64 = fields.next().and_then(|v| v.parse().ok()).unwrap_or(0);
        match key {
            "MemTotal:" => total = value * 1024,
            "MemFree:" => free = value * 1024,
            "MemAvailable:" => available = value * 1024,
            _ => {}
        }
    }
    (total, free, available)
}

/// Used percent of the filesystem holding `path`.
fn disk_usage_percent(path: &str) -> Option<u64> {
    let c_path = std::ffi::CString::new(path).ok()?;
    // SAFETY: statvfs is a POSIX call writing into a zeroed out-param;
    // c_path is a valid NUL-terminated string.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    let total = (stat.f_blocks as u64).checked_mul(stat.f_frsize as u64)?;
    let available = (stat.f_bavail as u64) * stat.f_frsize as u64;
    if total == 0 {
        return None;
    }
    Some(100 - (available * 100 / total))
}

/// First `<target dev='...'/>` under an `<interface>` element.
fn find_iface_target(xml: &str) -> Option<String> {
    let iface_start = xml.find("<interface")?;
    let iface_end = xml[iface_start..].find("</interface>")? + iface_start;
    let body = &xml[iface_start..iface_end];
    let needle = "<target dev='";
    let start = body.find(needle)? + needle.len();
    let end = body[start..].find('\'')? + start;
    Some(body[start..end].to_string())
}

/// Bytes-per-second rate from two cumulative counter readings.
fn rate(prev: u64, current: u64, dt_secs: f64) -> u64 {
    let delta = current.saturating_sub(prev) as f64;
    (delta / dt_secs) as u64
}

/// Guest CPU percent normalised by vCPU count, clamped to [0, 100].
fn cpu_percent(prev_ns: u64, current_ns: u64, dt_secs: f64, vcpus: u32) -> f64 {
    let delta = current_ns.saturating_sub(prev_ns) as f64 / 1e9;
    let vcpus = vcpus.max(1) as f64;
    (100.0 * delta / dt_secs / vcpus).clamp(0.0, 100.0)
}
