//! Scaling decision records and threshold configuration

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ResourceKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
    Maintain,
    Migrate,
    Suspend,
    Resume,
}

impl std::fmt::Display for ScalingAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ScalingAction::ScaleUp => "ScaleUp",
            ScalingAction::ScaleDown => "ScaleDown",
            ScalingAction::Maintain => "Maintain",
            ScalingAction::Migrate => "Migrate",
            ScalingAction::Suspend => "Suspend",
            ScalingAction::Resume => "Resume",
        };
        write!(f, "{s}")
    }
}

/// One recommendation for one VM along one resource axis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingDecision {
    pub vm_name: String,
    pub action: ScalingAction,
    pub resource: ResourceKind,
    /// Target amount in the resource's unit (vcpus or bytes)
    pub amount: u64,
    pub timestamp: DateTime<Utc>,
    /// Confidence in [0, 1]
    pub confidence: f64,
    pub reason: String,
}

impl ScalingDecision {
    pub fn maintain(vm_name: impl Into<String>) -> Self {
        Self {
            vm_name: vm_name.into(),
            action: ScalingAction::Maintain,
            resource: ResourceKind::Cpu,
            amount: 0,
            timestamp: Utc::now(),
            confidence: 0.0,
            reason: String::new(),
        }
    }

    pub fn is_maintain(&self) -> bool {
        self.action == ScalingAction::Maintain
    }
}

/// Per-resource up/down thresholds, in percent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScalingThresholds {
    pub cpu_up: f64,
    pub cpu_down: f64,
    pub mem_up: f64,
    pub mem_down: f64,
    pub io_up: f64,
    pub io_down: f64,
    pub net_up: f64,
    pub net_down: f64,
}

impl Default for ScalingThresholds {
    fn default() -> Self {
        Self {
            cpu_up: 80.0,
            cpu_down: 20.0,
            mem_up: 85.0,
            mem_down: 30.0,
            io_up: 75.0,
            io_down: 15.0,
            net_up: 70.0,
            net_down: 10.0,
        }
    }
}
