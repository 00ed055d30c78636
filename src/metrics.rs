//! Metric sample types and bounded moving-average windows

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Samples kept per VM: five minutes at 1 Hz.
pub const HISTORY_CAP: usize = 300;
/// Window sizes for the precomputed averages.
pub const AVG_5MIN_WINDOW: usize = 60;
pub const AVG_15MIN_WINDOW: usize = 180;

/// One point-in-time usage sample for a VM.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub memory_max_bytes: u64,
    pub io_read_bps: u64,
    pub io_write_bps: u64,
    pub net_rx_bps: u64,
    pub net_tx_bps: u64,
}

impl ResourceUsage {
    pub fn zero(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            cpu_percent: 0.0,
            memory_bytes: 0,
            memory_max_bytes: 0,
            io_read_bps: 0,
            io_write_bps: 0,
            net_rx_bps: 0,
            net_tx_bps: 0,
        }
    }
}

/// Per-VM metric state: the latest sample, a bounded history, and moving
/// averages recomputed on every append.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmMetrics {
    pub vm_name: String,
    pub usage: ResourceUsage,
    history: VecDeque<ResourceUsage>,
    pub cpu_avg_5min: f64,
    pub cpu_avg_15min: f64,
    pub memory_avg_5min: f64,
}

impl VmMetrics {
    pub fn new(vm_name: impl Into<String>) -> Self {
        Self {
            vm_name: vm_name.into(),
            usage: ResourceUsage::zero(Utc::now()),
            history: VecDeque::with_capacity(HISTORY_CAP),
            cpu_avg_5min: 0.0,
            cpu_avg_15min: 0.0,
            memory_avg_5min: 0.0,
        }
    }

    /// Append a sample, evicting from the head past the cap, and recompute
    /// the moving averages.
    pub fn push(&mut self, usage: ResourceUsage) {
        self.usage = usage;
        if self.history.len() == HISTORY_CAP {
            self.history.pop_front();
        }
        self.history.push_back(usage);

        self.cpu_avg_5min = self.tail_avg(AVG_5MIN_WINDOW, |u| u.cpu_percent);
        self.cpu_avg_15min = self.tail_avg(AVG_15MIN_WINDOW, |u| u.cpu_percent);
        self.memory_avg_5min = self.tail_avg(AVG_5MIN_WINDOW, |u| u.memory_bytes as f64);
    }

    fn tail_avg(&self, window: usize, f: impl Fn(&ResourceUsage) -> f64) -> f64 {
        let n = self.history.len().min(window);
        if n == 0 {
            return 0.0;
        }
        let sum: f64 = self.history.iter().rev().take(n).map(&f).sum();
        sum / n as f64
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// The most recent `max_points` samples, oldest first.
    pub fn recent_history(&self, max_points: usize) -> Vec<ResourceUsage> {
        let n = self.history.len().min(max_points);
        self.history.iter().skip(self.history.len() - n).copied().collect()
    }

    /// Memory usage percent of the balloon maximum, when known.
    pub fn memory_percent(&self) -> Option<f64> {
        if self.usage.memory_max_bytes == 0 {
            return None;
        }
        Some(100.0 * self.usage.memory_bytes as f64 / self.usage.memory_max_bytes as f64)
    }
}

/// Host-level metrics sampled alongside the per-VM ticks.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct HostMetrics {
    pub total_memory: u64,
    pub free_memory: u64,
    pub available_memory: u64,
    /// Instantaneous CPU busy percent from /proc/stat deltas.
    pub cpu_load_1min: f64,
    /// Moving averages of the instantaneous value.
    pub cpu_load_5min: f64,
    pub cpu_load_15min: f64,
    pub disk_usage_percent: u64,
    /// Aggregate VM IO and network throughput, bytes per second.
    pub io_throughput: u64,
    pub network_throughput: u64,
}
