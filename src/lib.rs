//! virtkube - single-host KVM/QEMU orchestrator built on libvirt
//!
//! Takes declarative VM specifications, materialises them into libvirt
//! domains, drives their lifecycle, enforces per-VM resource limits through
//! cgroup v2, samples per-domain and host metrics at 1 Hz, and runs an
//! autoscaling loop that grows, shrinks, migrates, suspends or resumes VMs.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use virtkube::{
//!     DiskSpec, EventDispatcher, HypervisorSession, MetaStore, VmConfig, VmManager,
//! };
//!
//! let session = Arc::new(HypervisorSession::new("qemu:///system"));
//! let store = MetaStore::open("/var/lib/virtkube/state.db")?;
//! let dispatcher = Arc::new(EventDispatcher::new(0));
//! let manager = VmManager::new(session, store, dispatcher, "/sys/fs/cgroup");
//!
//! let config = VmConfig::builder("worker-1")
//!     .vcpus(2)
//!     .memory_mib(2048)
//!     .disk(DiskSpec::file("/var/lib/images/worker-1.qcow2", "vda"))
//!     .build();
//! let id = manager.deploy(config)?;
//! println!("deployed VM {id}");
//! # Ok::<(), virtkube::Error>(())
//! ```

pub mod cgroup;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod hypervisor;
pub mod manager;
pub mod metrics;
pub mod monitor;
pub mod pool;
pub mod scaling;
pub mod store;
pub mod vm;
pub mod xml;

pub use cgroup::CgroupController;
pub use config::{DiskSpec, GraphicsSpec, NicSpec, ResourceKind, ResourceLimit, VmConfig};
pub use dispatcher::{EventDispatcher, TimerHandle};
pub use error::{Error, Result};
pub use hypervisor::HypervisorSession;
pub use manager::VmManager;
pub use metrics::{HostMetrics, ResourceUsage, VmMetrics};
pub use monitor::RealTimeMonitor;
pub use pool::VmPool;
pub use scaling::{AutoScalingEngine, DecisionExecutor, ScalingAction, ScalingDecision, ScalingThresholds};
pub use store::MetaStore;
pub use vm::{Snapshot, VirtualMachine, VmState, VmView};
