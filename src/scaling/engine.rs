//! Autoscaling analysis engine
//!
//! Consumes metric events, applies per-resource threshold rules plus a
//! predictive nudge, scores confidence, and emits rate-limited decisions.
//! Memory outranks every other axis; IO and network may override a CPU
//! proposal but never a memory one.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};

use crate::config::{ResourceKind, ResourceLimit};
use crate::metrics::VmMetrics;
use crate::store::MetaStore;

use super::decision::{ScalingAction, ScalingDecision, ScalingThresholds};

/// Bounded per-VM decision history.
pub const DECISION_HISTORY_CAP: usize = 1000;
/// Minimum spacing between decisions for one VM.
pub const RATE_LIMIT_WINDOW_SECS: i64 = 120;
/// Maximum decisions per VM per rolling day.
pub const DAILY_DECISION_CAP: usize = 50;

const GIB: u64 = 1024 * 1024 * 1024;

pub type DecisionCallback = Box<dyn Fn(&ScalingDecision) + Send + Sync>;

#[derive(Default)]
struct RateState {
    last: Option<DateTime<Utc>>,
    fired: VecDeque<DateTime<Utc>>,
}

impl RateState {
    /// Whether a decision may fire at `now`; records it when allowed.
    fn allow(&mut self, now: DateTime<Utc>) -> bool {
        let day_ago = now - ChronoDuration::hours(24);
        while self.fired.front().is_some_and(|t| *t < day_ago) {
            self.fired.pop_front();
        }
        if let Some(last) = self.last {
            if now - last < ChronoDuration::seconds(RATE_LIMIT_WINDOW_SECS) {
                return false;
            }
        }
        if self.fired.len() >= DAILY_DECISION_CAP {
            return false;
        }
        self.last = Some(now);
        self.fired.push_back(now);
        true
    }
}

/// Per-VM registration: the limit table and optional pool id for persistence.
struct VmEntry {
    limits: Vec<ResourceLimit>,
    pool_id: Option<u32>,
}

pub struct AutoScalingEngine {
    thresholds: RwLock<ScalingThresholds>,
    vms: Mutex<HashMap<String, VmEntry>>,
    history: Mutex<HashMap<String, VecDeque<ScalingDecision>>>,
    patterns: Mutex<HashMap<String, Vec<f64>>>,
    limiter: Mutex<HashMap<String, RateState>>,
    callbacks: Mutex<Vec<DecisionCallback>>,
    store: Option<MetaStore>,
}

impl AutoScalingEngine {
    pub fn new() -> Self {
        Self::with_thresholds(ScalingThresholds::default())
    }

    pub fn with_thresholds(thresholds: ScalingThresholds) -> Self {
        Self {
            thresholds: RwLock::new(thresholds),
            vms: Mutex::new(HashMap::new()),
            history: Mutex::new(HashMap::new()),
            patterns: Mutex::new(HashMap::new()),
            limiter: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(Vec::new()),
            store: None,
        }
    }

    /// Persist emitted decisions under `vm/<id>/decision/<ts>`.
    pub fn with_store(mut self, store: MetaStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn set_thresholds(&self, thresholds: ScalingThresholds) {
        *self.thresholds.write() = thresholds;
    }

    /// Register or replace the limit table the rules scale against.
    pub fn set_limits(&self, vm_name: &str, pool_id: Option<u32>, limits: Vec<ResourceLimit>) {
        self.vms.lock().insert(
            vm_name.to_string(),
            VmEntry { limits, pool_id },
        );
    }

    pub fn remove_vm(&self, vm_name: &str) {
        self.vms.lock().remove(vm_name);
        self.history.lock().remove(vm_name);
        self.patterns.lock().remove(vm_name);
        self.limiter.lock().remove(vm_name);
    }

    pub fn register_decision_callback(
        &self,
        callback: impl Fn(&ScalingDecision) + Send + Sync + 'static,
    ) {
        self.callbacks.lock().push(Box::new(callback));
    }

    /// Feed historical usage for the predictive rule.
    pub fn train_pattern(&self, vm_name: &str, usage: Vec<f64>) {
        self.patterns.lock().insert(vm_name.to_string(), usage);
    }

    /// Mean of the trained pattern, the predictive model of the engine.
    pub fn predict_usage(&self, vm_name: &str) -> Option<f64> {
        let patterns = self.patterns.lock();
        let data = patterns.get(vm_name)?;
        if data.is_empty() {
            return None;
        }
        Some(data.iter().sum::<f64>() / data.len() as f64)
    }

    pub fn decision_history(&self, vm_name: &str) -> Vec<ScalingDecision> {
        self.history
            .lock()
            .get(vm_name)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Metric event entry point; wired as a monitor callback.
    pub fn analyze(&self, metrics: &VmMetrics) {
        let decision = self.evaluate(metrics, Utc::now());
        if decision.is_maintain() {
            return;
        }
        tracing::info!(
            vm = %decision.vm_name,
            action = %decision.action,
            resource = %decision.resource,
            amount = decision.amount,
            confidence = decision.confidence,
            reason = %decision.reason,
            "Scaling decision"
        );
        self.record(&decision);
        for callback in self.callbacks.lock().iter() {
            callback(&decision);
        }
    }

    /// Rule evaluation with an explicit clock, so the rate limiter is
    /// drivable from tests.
    pub fn evaluate(&self, metrics: &VmMetrics, now: DateTime<Utc>) -> ScalingDecision {
        let mut decision = ScalingDecision::maintain(&metrics.vm_name);
        decision.timestamp = now;

        let vms = self.vms.lock();
        let Some(entry) = vms.get(&metrics.vm_name) else {
            return decision;
        };
        let thresholds = *self.thresholds.read();

        self.cpu_rule(metrics, &entry.limits, &thresholds, &mut decision);
        self.memory_rule(metrics, &entry.limits, &thresholds, &mut decision);
        self.throughput_rule(
            metrics,
            ResourceKind::Io,
            (metrics.usage.io_read_bps + metrics.usage.io_write_bps) as f64,
            thresholds.io_up,
            thresholds.io_down,
            &entry.limits,
            &mut decision,
        );
        self.throughput_rule(
            metrics,
            ResourceKind::Network,
            (metrics.usage.net_rx_bps + metrics.usage.net_tx_bps) as f64,
            thresholds.net_up,
            thresholds.net_down,
            &entry.limits,
            &mut decision,
        );
        self.predictive_rule(metrics, &entry.limits, &thresholds, &mut decision);
        drop(vms);

        if !decision.is_maintain() {
            let mut limiter = self.limiter.lock();
            let state = limiter.entry(metrics.vm_name.clone()).or_default();
            if !state.allow(now) {
                tracing::debug!(vm = %metrics.vm_name, "Rate limit hit, decision collapsed");
                decision = ScalingDecision::maintain(&metrics.vm_name);
                decision.timestamp = now;
            }
        }
        decision
    }

    fn cpu_rule(
        &self,
        metrics: &VmMetrics,
        limits: &[ResourceLimit],
        thresholds: &ScalingThresholds,
        decision: &mut ScalingDecision,
    ) {
        let Some(limit) = find_limit(limits, ResourceKind::Cpu) else {
            return;
        };
        let cpu = metrics.usage.cpu_percent;
        let avg = metrics.cpu_avg_5min;

        if cpu > thresholds.cpu_up && avg > thresholds.cpu_up - 10.0 {
            let step = unit_step(limit.current);
            decision.action = ScalingAction::ScaleUp;
            decision.resource = ResourceKind::Cpu;
            decision.amount = (limit.current + step).min(limit.max);
            decision.confidence = confidence(cpu, avg);
            decision.reason = format!("High CPU usage: {cpu:.2}% (5min avg: {avg:.2}%)");
        } else if cpu < thresholds.cpu_down && avg < thresholds.cpu_down + 5.0 {
            let step = unit_step(limit.current);
            decision.action = ScalingAction::ScaleDown;
            decision.resource = ResourceKind::Cpu;
            decision.amount = limit.current.saturating_sub(step).max(limit.min);
            decision.confidence = confidence(cpu, avg);
            decision.reason = format!("Low CPU usage: {cpu:.2}% (5min avg: {avg:.2}%)");
        }
    }

    fn memory_rule(
        &self,
        metrics: &VmMetrics,
        limits: &[ResourceLimit],
        thresholds: &ScalingThresholds,
        decision: &mut ScalingDecision,
    ) {
        let Some(limit) = find_limit(limits, ResourceKind::Memory) else {
            return;
        };
        if metrics.usage.memory_max_bytes == 0 {
            return;
        }
        let mem_pct = 100.0 * metrics.usage.memory_bytes as f64 / metrics.usage.memory_max_bytes as f64;
        let avg_pct = 100.0 * metrics.memory_avg_5min / metrics.usage.memory_max_bytes as f64;

        // memory outranks a CPU/IO/network proposal past up + 10
        let takes_priority = decision.is_maintain() || mem_pct > thresholds.mem_up + 10.0;

        if mem_pct > thresholds.mem_up && avg_pct > thresholds.mem_up - 10.0 && takes_priority {
            let step = byte_step(limit.current);
            decision.action = ScalingAction::ScaleUp;
            decision.resource = ResourceKind::Memory;
            decision.amount = (limit.current + step).min(limit.max);
            decision.confidence = confidence(mem_pct, avg_pct);
            decision.reason = format!("High memory usage: {mem_pct:.2}% (5min avg: {avg_pct:.2}%)");
        } else if mem_pct < thresholds.mem_down
            && avg_pct < thresholds.mem_down + 5.0
            && decision.is_maintain()
        {
            let step = byte_step(limit.current);
            decision.action = ScalingAction::ScaleDown;
            decision.resource = ResourceKind::Memory;
            decision.amount = limit.current.saturating_sub(step).max(limit.min);
            decision.confidence = confidence(mem_pct, avg_pct);
            decision.reason = format!("Low memory usage: {mem_pct:.2}% (5min avg: {avg_pct:.2}%)");
        }
    }

    /// Shared shape of the IO and network rules: percent of the limit's
    /// maximum throughput. Overrides a CPU proposal, never a memory one.
    #[allow(clippy::too_many_arguments)]
    fn throughput_rule(
        &self,
        metrics: &VmMetrics,
        kind: ResourceKind,
        current_bps: f64,
        up: f64,
        down: f64,
        limits: &[ResourceLimit],
        decision: &mut ScalingDecision,
    ) {
        let Some(limit) = find_limit(limits, kind) else {
            return;
        };
        if limit.max == 0 {
            return;
        }
        let may_override = decision.is_maintain() || decision.resource == ResourceKind::Cpu;
        if !may_override {
            return;
        }
        let pct = 100.0 * current_bps / limit.max as f64;

        if pct > up {
            let step = unit_step(limit.current);
            decision.action = ScalingAction::ScaleUp;
            decision.resource = kind;
            decision.amount = (limit.current + step).min(limit.max);
            decision.confidence = confidence(pct, up);
            decision.reason = format!("High {kind} throughput: {pct:.2}% of limit");
        } else if pct < down && decision.is_maintain() {
            let step = unit_step(limit.current);
            decision.action = ScalingAction::ScaleDown;
            decision.resource = kind;
            decision.amount = limit.current.saturating_sub(step).max(limit.min);
            decision.confidence = confidence(pct, down);
            decision.reason = format!("Low {kind} throughput: {pct:.2}% of limit");
        }
    }

    fn predictive_rule(
        &self,
        metrics: &VmMetrics,
        limits: &[ResourceLimit],
        thresholds: &ScalingThresholds,
        decision: &mut ScalingDecision,
    ) {
        if !decision.is_maintain() {
            return;
        }
        let Some(predicted) = self.predict_usage(&metrics.vm_name) else {
            return;
        };
        if predicted <= thresholds.cpu_up {
            return;
        }
        let Some(limit) = find_limit(limits, ResourceKind::Cpu) else {
            return;
        };
        let step = ((limit.current as f64 * (predicted / 100.0) * 0.3).ceil() as u64).max(1);
        decision.action = ScalingAction::ScaleUp;
        decision.resource = ResourceKind::Cpu;
        decision.amount = (limit.current + step).min(limit.max);
        decision.confidence = 0.6;
        decision.reason = format!("Predicted high usage: {predicted:.2}%");
    }

    fn record(&self, decision: &ScalingDecision) {
        let mut history = self.history.lock();
        let entries = history.entry(decision.vm_name.clone()).or_default();
        if entries.len() == DECISION_HISTORY_CAP {
            entries.pop_front();
        }
        entries.push_back(decision.clone());
        drop(history);

        if let Some(store) = &self.store {
            let pool_id = self
                .vms
                .lock()
                .get(&decision.vm_name)
                .and_then(|e| e.pool_id);
            if let Some(id) = pool_id {
                let key = format!("vm/{id}/decision/{}", decision.timestamp.timestamp_millis());
                match serde_json::to_string(decision) {
                    Ok(json) => {
                        if let Err(e) = store.put(&key, &json) {
                            tracing::warn!(vm = %decision.vm_name, error = %e, "Failed to persist decision");
                        }
                        let _ = store.truncate_prefix(
                            &format!("vm/{id}/decision/"),
                            DECISION_HISTORY_CAP,
                        );
                    }
                    Err(e) => {
                        tracing::warn!(vm = %decision.vm_name, error = %e, "Failed to encode decision")
                    }
                }
            }
        }
    }
}

impl Default for AutoScalingEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn find_limit(limits: &[ResourceLimit], kind: ResourceKind) -> Option<&ResourceLimit> {
    limits.iter().find(|l| l.kind == kind)
}

/// 25% growth step, at least one unit.
fn unit_step(current: u64) -> u64 {
    ((current + 3) / 4).max(1)
}

/// 25% growth step, at least one GiB.
fn byte_step(current: u64) -> u64 {
    ((current + 3) / 4).max(GIB)
}

/// Confidence from the spread between the sample and its moving average.
fn confidence(sample: f64, average: f64) -> f64 {
    match (sample - average).abs() {
        d if d < 5.0 => 0.9,
        d if d < 10.0 => 0.7,
        d if d < 15.0 => 0.5,
        _ => 0.3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ResourceUsage;

    fn cpu_limits(min: u64, max: u64, current: u64) -> Vec<ResourceLimit> {
        vec![ResourceLimit::new(ResourceKind::Cpu, min, max, current, "vcpus")]
    }

    fn metrics_with_cpu(vm: &str, cpu: f64, samples: usize) -> VmMetrics {
        let mut m = VmMetrics::new(vm);
        for _ in 0..samples {
            m.push(ResourceUsage {
                cpu_percent: cpu,
                memory_bytes: 0,
                memory_max_bytes: 0,
                ..ResourceUsage::zero(Utc::now())
            });
        }
        m
    }

    fn metrics_with_memory(vm: &str, used: u64, max: u64, samples: usize) -> VmMetrics {
        let mut m = VmMetrics::new(vm);
        for _ in 0..samples {
            m.push(ResourceUsage {
                cpu_percent: 0.0,
                memory_bytes: used,
                memory_max_bytes: max,
                ..ResourceUsage::zero(Utc::now())
            });
        }
        m
    }

    #[test]
    fn test_no_limits_means_maintain() {
        let engine = AutoScalingEngine::new();
        let metrics = metrics_with_cpu("vm-a", 95.0, 10);
        let decision = engine.evaluate(&metrics, Utc::now());
        assert!(decision.is_maintain());
    }

    #[test]
    fn test_cpu_scale_up_amount() {
        let engine = AutoScalingEngine::new();
        engine.set_limits("vm-a", None, cpu_limits(1, 8, 2));
        let metrics = metrics_with_cpu("vm-a", 95.0, 10);
        let decision = engine.evaluate(&metrics, Utc::now());
        assert_eq!(decision.action, ScalingAction::ScaleUp);
        assert_eq!(decision.resource, ResourceKind::Cpu);
        // step = max(1, ceil(2 * 0.25)) = 1
        assert_eq!(decision.amount, 3);
        // sample equals the average, so confidence is highest
        assert_eq!(decision.confidence, 0.9);
    }

    #[test]
    fn test_cpu_scale_up_clamped_to_max() {
        let engine = AutoScalingEngine::new();
        engine.set_limits("vm-a", None, cpu_limits(1, 8, 8));
        let metrics = metrics_with_cpu("vm-a", 95.0, 10);
        let decision = engine.evaluate(&metrics, Utc::now());
        assert_eq!(decision.amount, 8);
    }

    #[test]
    fn test_cpu_scale_down_amount() {
        let engine = AutoScalingEngine::new();
        engine.set_limits("vm-a", None, cpu_limits(1, 8, 3));
        let metrics = metrics_with_cpu("vm-a", 10.0, 10);
        let decision = engine.evaluate(&metrics, Utc::now());
        assert_eq!(decision.action, ScalingAction::ScaleDown);
        assert_eq!(decision.amount, 2);
    }

    #[test]
    fn test_cpu_up_needs_sustained_average() {
        let engine = AutoScalingEngine::new();
        engine.set_limits("vm-a", None, cpu_limits(1, 8, 2));
        // single 95% spike over a long idle history: avg stays low
        let mut metrics = metrics_with_cpu("vm-a", 5.0, 59);
        metrics.push(ResourceUsage {
            cpu_percent: 95.0,
            ..ResourceUsage::zero(Utc::now())
        });
        let decision = engine.evaluate(&metrics, Utc::now());
        assert!(decision.is_maintain());
    }

    #[test]
    fn test_memory_priority_over_cpu() {
        let engine = AutoScalingEngine::new();
        let mut limits = cpu_limits(1, 8, 2);
        limits.push(ResourceLimit::new(
            ResourceKind::Memory,
            GIB,
            16 * GIB,
            4 * GIB,
            "bytes",
        ));
        engine.set_limits("vm-a", None, limits);

        // both CPU and memory far over their thresholds; memory is > up + 10
        let mut metrics = metrics_with_memory("vm-a", 970, 1000, 10);
        for _ in 0..10 {
            metrics.push(ResourceUsage {
                cpu_percent: 95.0,
                memory_bytes: 970,
                memory_max_bytes: 1000,
                ..ResourceUsage::zero(Utc::now())
            });
        }
        let decision = engine.evaluate(&metrics, Utc::now());
        assert_eq!(decision.resource, ResourceKind::Memory);
        assert_eq!(decision.action, ScalingAction::ScaleUp);
        // step = max(1 GiB, ceil(4 GiB * 0.25)) = 1 GiB
        assert_eq!(decision.amount, 5 * GIB);
    }

    #[test]
    fn test_memory_scale_down_only_when_idle() {
        let engine = AutoScalingEngine::new();
        let mut limits = cpu_limits(1, 8, 2);
        limits.push(ResourceLimit::new(
            ResourceKind::Memory,
            GIB,
            16 * GIB,
            4 * GIB,
            "bytes",
        ));
        engine.set_limits("vm-a", None, limits);

        // CPU pressure plus low memory: the CPU proposal must survive
        let mut metrics = VmMetrics::new("vm-a");
        for _ in 0..10 {
            metrics.push(ResourceUsage {
                cpu_percent: 95.0,
                memory_bytes: 100,
                memory_max_bytes: 1000,
                ..ResourceUsage::zero(Utc::now())
            });
        }
        let decision = engine.evaluate(&metrics, Utc::now());
        assert_eq!(decision.resource, ResourceKind::Cpu);
        assert_eq!(decision.action, ScalingAction::ScaleUp);
    }

    #[test]
    fn test_io_rule_overrides_cpu_but_not_memory() {
        let engine = AutoScalingEngine::new();
        let mut limits = cpu_limits(1, 8, 2);
        limits.push(ResourceLimit::new(
            ResourceKind::Io,
            1_000_000,
            10_000_000,
            5_000_000,
            "bps",
        ));
        engine.set_limits("vm-a", None, limits.clone());

        // CPU hot and IO at 90% of its 10 MB/s limit
        let mut metrics = VmMetrics::new("vm-a");
        for _ in 0..10 {
            metrics.push(ResourceUsage {
                cpu_percent: 95.0,
                io_read_bps: 5_000_000,
                io_write_bps: 4_000_000,
                ..ResourceUsage::zero(Utc::now())
            });
        }
        let decision = engine.evaluate(&metrics, Utc::now());
        assert_eq!(decision.resource, ResourceKind::Io);

        // now with memory critical as well: memory wins and IO must not override
        limits.push(ResourceLimit::new(
            ResourceKind::Memory,
            GIB,
            16 * GIB,
            4 * GIB,
            "bytes",
        ));
        engine.set_limits("vm-a", None, limits);
        let mut metrics = VmMetrics::new("vm-a");
        for _ in 0..10 {
            metrics.push(ResourceUsage {
                cpu_percent: 95.0,
                memory_bytes: 980,
                memory_max_bytes: 1000,
                io_read_bps: 9_000_000,
                io_write_bps: 0,
                ..ResourceUsage::zero(Utc::now())
            });
        }
        let decision = engine.evaluate(&metrics, Utc::now());
        assert_eq!(decision.resource, ResourceKind::Memory);
    }

    #[test]
    fn test_predictive_nudge_when_idle() {
        let engine = AutoScalingEngine::new();
        engine.set_limits("vm-a", None, cpu_limits(1, 8, 2));
        engine.train_pattern("vm-a", vec![85.0, 90.0, 95.0]);
        assert_eq!(engine.predict_usage("vm-a"), Some(90.0));

        // current usage unremarkable, prediction hot
        let metrics = metrics_with_cpu("vm-a", 50.0, 10);
        let decision = engine.evaluate(&metrics, Utc::now());
        assert_eq!(decision.action, ScalingAction::ScaleUp);
        assert_eq!(decision.confidence, 0.6);
        assert!(decision.reason.starts_with("Predicted"));
    }

    #[test]
    fn test_predictive_does_not_override_reactive() {
        let engine = AutoScalingEngine::new();
        engine.set_limits("vm-a", None, cpu_limits(1, 8, 4));
        engine.train_pattern("vm-a", vec![99.0]);
        let metrics = metrics_with_cpu("vm-a", 10.0, 10);
        let decision = engine.evaluate(&metrics, Utc::now());
        // the reactive scale-down wins; prediction only fills Maintain
        assert_eq!(decision.action, ScalingAction::ScaleDown);
    }

    #[test]
    fn test_confidence_buckets() {
        assert_eq!(confidence(82.0, 80.0), 0.9);
        assert_eq!(confidence(88.0, 80.0), 0.7);
        assert_eq!(confidence(92.0, 80.0), 0.5);
        assert_eq!(confidence(99.0, 80.0), 0.3);
    }

    #[test]
    fn test_rate_limit_two_minutes() {
        let engine = AutoScalingEngine::new();
        engine.set_limits("vm-a", None, cpu_limits(1, 8, 2));
        let metrics = metrics_with_cpu("vm-a", 95.0, 10);

        let t0 = Utc::now();
        let first = engine.evaluate(&metrics, t0);
        assert_eq!(first.action, ScalingAction::ScaleUp);

        // a minute later: collapsed to Maintain
        let second = engine.evaluate(&metrics, t0 + ChronoDuration::seconds(60));
        assert!(second.is_maintain());

        // past the window: allowed again
        let third = engine.evaluate(&metrics, t0 + ChronoDuration::seconds(121));
        assert_eq!(third.action, ScalingAction::ScaleUp);
    }

    #[test]
    fn test_daily_cap_collapses_to_maintain() {
        let engine = AutoScalingEngine::new();
        engine.set_limits("vm-a", None, cpu_limits(1, 8, 2));
        let metrics = metrics_with_cpu("vm-a", 95.0, 10);

        let t0 = Utc::now();
        let mut fired = 0usize;
        for i in 0..60i64 {
            let now = t0 + ChronoDuration::seconds(121 * i);
            if !engine.evaluate(&metrics, now).is_maintain() {
                fired += 1;
            }
        }
        assert_eq!(fired, DAILY_DECISION_CAP);
    }

    #[test]
    fn test_history_bounded_and_persisted() {
        let store = MetaStore::in_memory().unwrap();
        let engine = AutoScalingEngine::new().with_store(store.clone());
        engine.set_limits("vm-a", Some(1), cpu_limits(1, 8, 2));
        let metrics = metrics_with_cpu("vm-a", 95.0, 10);
        engine.analyze(&metrics);

        let history = engine.decision_history("vm-a");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].amount, 3);

        let persisted = store.scan_prefix("vm/1/decision/").unwrap();
        assert_eq!(persisted.len(), 1);
    }

    #[test]
    fn test_callbacks_receive_decisions() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let engine = AutoScalingEngine::new();
        engine.set_limits("vm-a", None, cpu_limits(1, 8, 2));
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        engine.register_decision_callback(move |d| {
            assert_eq!(d.vm_name, "vm-a");
            counter.fetch_add(1, Ordering::SeqCst);
        });
        engine.analyze(&metrics_with_cpu("vm-a", 95.0, 10));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
