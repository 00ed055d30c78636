//! Virtual machine: one owned domain handle, its cgroup, and a legal
//! state machine
//!
//! Every operation checks the current state, calls the corresponding libvirt
//! primitive, and updates the in-memory state only on success. The domain
//! handle is exclusively owned here; other components refer to the VM by
//! name and receive [`VmView`] copies.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use virt::domain::Domain;
use virt::sys;

use crate::cgroup::CgroupController;
use crate::config::{ResourceKind, ResourceLimit, VmConfig};
use crate::hypervisor::HypervisorSession;
use crate::xml;
use crate::{Error, Result};

/// Lifecycle state of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmState {
    /// Domain defined but never started (or stopped after undefine-pending)
    Defined,
    /// Transient: domain is being materialised
    Creating,
    Running,
    Paused,
    /// Guest is quiescing after a shutdown request
    ShuttingDown,
    Shutoff,
    /// Transient: live migration in flight
    Migrating,
    /// Terminal error state reported by libvirt
    Crashed,
    Undefined,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VmState::Defined => "Defined",
            VmState::Creating => "Creating",
            VmState::Running => "Running",
            VmState::Paused => "Paused",
            VmState::ShuttingDown => "ShuttingDown",
            VmState::Shutoff => "Shutoff",
            VmState::Migrating => "Migrating",
            VmState::Crashed => "Crashed",
            VmState::Undefined => "Undefined",
        };
        write!(f, "{s}")
    }
}

impl VmState {
    /// Collapse an observed libvirt domain state into ours.
    pub fn from_libvirt(state: u32) -> Self {
        match state {
            sys::VIR_DOMAIN_RUNNING | sys::VIR_DOMAIN_BLOCKED => VmState::Running,
            sys::VIR_DOMAIN_PAUSED | sys::VIR_DOMAIN_PMSUSPENDED => VmState::Paused,
            sys::VIR_DOMAIN_SHUTDOWN => VmState::ShuttingDown,
            sys::VIR_DOMAIN_SHUTOFF => VmState::Shutoff,
            sys::VIR_DOMAIN_CRASHED => VmState::Crashed,
            _ => VmState::Defined,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            VmState::Running | VmState::Paused | VmState::ShuttingDown | VmState::Migrating
        )
    }
}

/// Hypervisor-captured checkpoint, named uniquely per VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub parent: Option<String>,
    pub disk_size: u64,
    pub vm_state: VmState,
}

/// Read-only view handed to external holders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmView {
    pub id: Option<u32>,
    pub name: String,
    pub uuid: Option<String>,
    pub state: VmState,
    pub vcpus: u16,
    pub memory_mib: u64,
    pub reserved_port: Option<u16>,
}

pub struct VirtualMachine {
    session: Arc<HypervisorSession>,
    name: String,
    pool_id: Option<u32>,
    reserved_port: Option<u16>,
    cgroup_root: PathBuf,
    uuid: Mutex<Option<String>>,
    config: Mutex<VmConfig>,
    domain: Mutex<Option<Domain>>,
    cgroup: Mutex<Option<CgroupController>>,
    limits: Mutex<Vec<ResourceLimit>>,
    state: Mutex<VmState>,
    snapshots: Mutex<Vec<Snapshot>>,
}

impl VirtualMachine {
    /// Build a fresh VM in `Creating` state. Cgroup creation failure is
    /// fatal here: a VM we cannot limit is a VM we do not run.
    pub fn new(
        session: Arc<HypervisorSession>,
        config: VmConfig,
        cgroup_root: impl Into<PathBuf>,
        pool_id: Option<u32>,
        reserved_port: Option<u16>,
    ) -> Result<Self> {
        config.validate()?;
        let cgroup_root = cgroup_root.into();
        let cgroup = CgroupController::new(&cgroup_root, format!("vm-{}", config.name))?;
        let limits = config.effective_limits();
        Ok(Self {
            session,
            name: config.name.clone(),
            pool_id,
            reserved_port,
            cgroup_root,
            uuid: Mutex::new(config.uuid.clone()),
            config: Mutex::new(config),
            domain: Mutex::new(None),
            cgroup: Mutex::new(Some(cgroup)),
            limits: Mutex::new(limits),
            state: Mutex::new(VmState::Creating),
            snapshots: Mutex::new(Vec::new()),
        })
    }

    /// Wrap a domain discovered at startup. No cgroup is created; limit
    /// `current` values are taken from the live domain info.
    pub fn from_existing(
        session: Arc<HypervisorSession>,
        domain: Domain,
        config: VmConfig,
        state: VmState,
        cgroup_root: impl Into<PathBuf>,
    ) -> Self {
        let uuid = domain.get_uuid_string().ok();
        let limits = config.effective_limits();
        Self {
            session,
            name: config.name.clone(),
            pool_id: None,
            reserved_port: None,
            cgroup_root: cgroup_root.into(),
            uuid: Mutex::new(uuid),
            config: Mutex::new(config),
            domain: Mutex::new(Some(domain)),
            cgroup: Mutex::new(None),
            limits: Mutex::new(limits),
            state: Mutex::new(state),
            snapshots: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uuid(&self) -> Option<String> {
        self.uuid.lock().clone()
    }

    pub fn state(&self) -> VmState {
        *self.state.lock()
    }

    pub fn config(&self) -> VmConfig {
        self.config.lock().clone()
    }

    pub fn limits(&self) -> Vec<ResourceLimit> {
        self.limits.lock().clone()
    }

    pub fn reserved_port(&self) -> Option<u16> {
        self.reserved_port
    }

    pub fn view(&self) -> VmView {
        let config = self.config.lock();
        VmView {
            id: self.pool_id,
            name: self.name.clone(),
            uuid: self.uuid.lock().clone(),
            state: *self.state.lock(),
            vcpus: config.vcpus,
            memory_mib: config.memory_mib,
            reserved_port: self.reserved_port,
        }
    }

    // ===== Lifecycle =====

    /// Define the domain from the configuration.
    pub fn define(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !matches!(*state, VmState::Creating | VmState::Undefined) {
            return Err(Error::invalid_state(*state, "Creating"));
        }
        let xml = xml::build_domain_xml(&self.config.lock())?;
        let domain = self
            .session
            .with_conn(|conn| {
                Domain::define_xml(conn, &xml)
                    .map_err(|e| Error::DomainNotFound(format!("{}: {}", self.name, e)))
            })?;
        if let Ok(uuid) = domain.get_uuid_string() {
            *self.uuid.lock() = Some(uuid);
        }
        *self.domain.lock() = Some(domain);
        *state = VmState::Defined;
        tracing::info!(vm = %self.name, "Domain defined");
        Ok(())
    }

    /// Start the domain and program the cgroup limits.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !matches!(*state, VmState::Defined | VmState::Shutoff) {
            return Err(Error::invalid_state(*state, "Defined or Shutoff"));
        }
        self.with_domain(|dom| Ok(dom.create()?))?;
        *state = VmState::Running;
        drop(state);
        self.apply_limits();
        tracing::info!(vm = %self.name, "VM started");
        Ok(())
    }

    pub fn pause(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state != VmState::Running {
            return Err(Error::invalid_state(*state, "Running"));
        }
        self.with_domain(|dom| Ok(dom.suspend()?))?;
        *state = VmState::Paused;
        tracing::info!(vm = %self.name, "VM paused");
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state != VmState::Paused {
            return Err(Error::invalid_state(*state, "Paused"));
        }
        self.with_domain(|dom| Ok(dom.resume()?))?;
        *state = VmState::Running;
        tracing::info!(vm = %self.name, "VM resumed");
        Ok(())
    }

    /// Request a guest shutdown. Best-effort: the guest quiesces on its own
    /// schedule; compose with [`wait_until_shutoff`](Self::wait_until_shutoff)
    /// and fall back to [`destroy`](Self::destroy) on expiry.
    pub fn shutdown(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !matches!(*state, VmState::Running | VmState::Paused) {
            return Err(Error::invalid_state(*state, "Running or Paused"));
        }
        self.with_domain(|dom| Ok(dom.shutdown()?))?;
        *state = VmState::ShuttingDown;
        tracing::info!(vm = %self.name, "Shutdown requested");
        Ok(())
    }

    /// Poll until the guest reaches `Shutoff`, or time out with the VM left
    /// in `ShuttingDown`.
    pub fn wait_until_shutoff(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let observed = self.refresh_state()?;
            if observed == VmState::Shutoff {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::OperationTimeout(format!(
                    "{} still {} after {:?}",
                    self.name, observed, timeout
                )));
            }
            std::thread::sleep(Duration::from_millis(500));
        }
    }

    /// Hard-stop the domain. Always attempts, also from `Crashed`.
    pub fn destroy(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !matches!(
            *state,
            VmState::Running | VmState::Paused | VmState::ShuttingDown | VmState::Crashed
        ) {
            return Err(Error::invalid_state(*state, "Running, Paused or Crashed"));
        }
        self.with_domain(|dom| Ok(dom.destroy()?))?;
        *state = VmState::Shutoff;
        tracing::info!(vm = %self.name, "VM destroyed");
        Ok(())
    }

    pub fn reboot(&self) -> Result<()> {
        let state = self.state.lock();
        if *state != VmState::Running {
            return Err(Error::invalid_state(*state, "Running"));
        }
        self.with_domain(|dom| Ok(dom.reboot(0)?))?;
        tracing::info!(vm = %self.name, "VM rebooted");
        Ok(())
    }

    /// Remove the domain definition. Refuses while the guest is running.
    pub fn undefine(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !matches!(*state, VmState::Shutoff | VmState::Defined) {
            return Err(Error::invalid_state(*state, "Shutoff"));
        }
        self.with_domain(|dom| Ok(dom.undefine()?))?;
        *self.domain.lock() = None;
        *state = VmState::Undefined;
        if let Some(cgroup) = self.cgroup.lock().take() {
            cgroup.release();
        }
        tracing::info!(vm = %self.name, "Domain undefined");
        Ok(())
    }

    // ===== Scaling =====

    /// Set the vCPU count. The new value must lie inside the CPU limit;
    /// on success `current` is updated and the cgroup quota reprogrammed.
    pub fn scale_cpu(&self, vcpus: u16) -> Result<()> {
        let state = self.state.lock();
        if !matches!(*state, VmState::Running | VmState::Paused) {
            return Err(Error::invalid_state(*state, "Running or Paused"));
        }
        self.check_limit(ResourceKind::Cpu, vcpus as u64)?;
        self.with_domain(|dom| Ok(dom.set_vcpus(vcpus as u32)?))?;
        self.config.lock().vcpus = vcpus;
        self.update_limit_current(ResourceKind::Cpu, vcpus as u64);
        drop(state);
        if let Err(e) = self.ensure_cgroup(|cg| cg.set_cpu_quota_for_vcpus(vcpus as u64)) {
            tracing::warn!(vm = %self.name, error = %e, "Failed to reprogram cpu quota");
        }
        tracing::info!(vm = %self.name, vcpus, "CPU scaled");
        Ok(())
    }

    /// Set the memory allocation in MiB, bounded by the memory limit (bytes).
    pub fn scale_memory(&self, memory_mib: u64) -> Result<()> {
        let state = self.state.lock();
        if !matches!(*state, VmState::Running | VmState::Paused) {
            return Err(Error::invalid_state(*state, "Running or Paused"));
        }
        let bytes = memory_mib * 1024 * 1024;
        self.check_limit(ResourceKind::Memory, bytes)?;
        self.with_domain(|dom| Ok(dom.set_memory(memory_mib * 1024)?))?;
        self.config.lock().memory_mib = memory_mib;
        self.update_limit_current(ResourceKind::Memory, bytes);
        drop(state);
        if let Err(e) = self.ensure_cgroup(|cg| cg.set_memory_limit(bytes)) {
            tracing::warn!(vm = %self.name, error = %e, "Failed to reprogram memory limit");
        }
        tracing::info!(vm = %self.name, memory_mib, "Memory scaled");
        Ok(())
    }

    // ===== Migration and snapshots =====

    /// Live-migrate to another host. On failure the local state is restored
    /// to `Running`.
    pub fn migrate(&self, dest_uri: &str) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != VmState::Running {
                return Err(Error::invalid_state(*state, "Running"));
            }
            *state = VmState::Migrating;
        }
        tracing::info!(vm = %self.name, dest = %dest_uri, "Migration started");

        let flags = sys::VIR_MIGRATE_LIVE
            | sys::VIR_MIGRATE_UNDEFINE_SOURCE
            | sys::VIR_MIGRATE_PERSIST_DEST;
        let result = (|| -> Result<Domain> {
            let dest = virt::connect::Connect::open(Some(dest_uri))
                .map_err(|e| Error::ConnectionFailed(format!("{dest_uri}: {e}")))?;
            let guard = self.domain.lock();
            let dom = guard
                .as_ref()
                .ok_or_else(|| Error::DomainNotFound(self.name.clone()))?;
            Ok(dom.migrate(&dest, flags as u32, None, None, 0)?)
        })();

        match result {
            Ok(new_domain) => {
                *self.domain.lock() = Some(new_domain);
                *self.state.lock() = VmState::Running;
                tracing::info!(vm = %self.name, dest = %dest_uri, "Migration complete");
                Ok(())
            }
            Err(e) => {
                *self.state.lock() = VmState::Running;
                tracing::error!(vm = %self.name, dest = %dest_uri, error = %e, "Migration failed");
                Err(e)
            }
        }
    }

    /// Capture a named checkpoint. Names are unique per VM.
    pub fn snapshot_create(&self, name: &str, description: &str) -> Result<()> {
        let state = self.state.lock();
        if !matches!(*state, VmState::Running | VmState::Paused) {
            return Err(Error::invalid_state(*state, "Running or Paused"));
        }
        let mut snapshots = self.snapshots.lock();
        if snapshots.iter().any(|s| s.name == name) {
            return Err(Error::Configuration(format!(
                "snapshot '{name}' already exists for {}",
                self.name
            )));
        }
        let parent = snapshots.last().map(|s| s.name.clone());
        let snapshot_xml = format!(
            "<domainsnapshot><name>{}</name><description>{}</description></domainsnapshot>",
            name, description
        );
        self.with_domain(|dom| {
            virt::domain_snapshot::DomainSnapshot::create_xml(dom, &snapshot_xml, 0)?;
            Ok(())
        })?;
        snapshots.push(Snapshot {
            name: name.to_string(),
            description: description.to_string(),
            created_at: Utc::now(),
            parent,
            disk_size: 0,
            vm_state: *state,
        });
        tracing::info!(vm = %self.name, snapshot = %name, "Snapshot created");
        Ok(())
    }

    /// Revert to a named checkpoint and re-read the resulting state.
    pub fn snapshot_revert(&self, name: &str) -> Result<()> {
        if !self.snapshots.lock().iter().any(|s| s.name == name) {
            return Err(Error::DomainNotFound(format!(
                "snapshot '{name}' not found for {}",
                self.name
            )));
        }
        self.with_domain(|dom| {
            let snap = virt::domain_snapshot::DomainSnapshot::lookup_by_name(dom, name, 0)
                .map_err(|e| Error::DomainNotFound(format!("snapshot '{name}': {e}")))?;
            snap.revert(0)?;
            Ok(())
        })?;
        self.refresh_state()?;
        tracing::info!(vm = %self.name, snapshot = %name, "Reverted to snapshot");
        Ok(())
    }

    pub fn snapshot_delete(&self, name: &str) -> Result<()> {
        let mut snapshots = self.snapshots.lock();
        let idx = snapshots
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| {
                Error::DomainNotFound(format!("snapshot '{name}' not found for {}", self.name))
            })?;
        self.with_domain(|dom| {
            let snap = virt::domain_snapshot::DomainSnapshot::lookup_by_name(dom, name, 0)
                .map_err(|e| Error::DomainNotFound(format!("snapshot '{name}': {e}")))?;
            snap.delete(0)?;
            Ok(())
        })?;
        snapshots.remove(idx);
        tracing::info!(vm = %self.name, snapshot = %name, "Snapshot deleted");
        Ok(())
    }

    pub fn snapshots(&self) -> Vec<Snapshot> {
        self.snapshots.lock().clone()
    }

    // ===== Devices =====

    /// Attach a NIC to the live domain and its persistent config.
    pub fn attach_nic(&self, nic: &crate::config::NicSpec) -> Result<()> {
        let fragment = xml::nic_fragment(nic);
        let flags = sys::VIR_DOMAIN_AFFECT_CONFIG | sys::VIR_DOMAIN_AFFECT_LIVE;
        self.with_domain(|dom| Ok(dom.attach_device_flags(&fragment, flags as u32)?))?;
        self.config.lock().nics.push(nic.clone());
        tracing::info!(vm = %self.name, "NIC attached");
        Ok(())
    }

    pub fn detach_nic(&self, nic: &crate::config::NicSpec) -> Result<()> {
        let fragment = xml::nic_fragment(nic);
        let flags = sys::VIR_DOMAIN_AFFECT_CONFIG | sys::VIR_DOMAIN_AFFECT_LIVE;
        self.with_domain(|dom| Ok(dom.detach_device_flags(&fragment, flags as u32)?))?;
        let mac = nic.mac.clone();
        if let Some(mac) = mac {
            self.config.lock().nics.retain(|n| n.mac.as_deref() != Some(mac.as_str()));
        }
        tracing::info!(vm = %self.name, "NIC detached");
        Ok(())
    }

    // ===== Observation =====

    /// Re-query libvirt and collapse our state to the observed one.
    pub fn refresh_state(&self) -> Result<VmState> {
        let observed = self.with_domain(|dom| {
            let (state, _reason) = dom.get_state()?;
            Ok(VmState::from_libvirt(state))
        })?;
        let mut state = self.state.lock();
        // keep transient Migrating until the operation itself resolves it
        if *state != VmState::Migrating {
            *state = observed;
        }
        Ok(observed)
    }

    /// Raw domain info: (vcpus, memory KiB, cpu time ns).
    pub fn domain_info(&self) -> Result<(u32, u64, u64)> {
        self.with_domain(|dom| {
            let info = dom.get_info()?;
            Ok((info.nr_virt_cpu, info.memory, info.cpu_time))
        })
    }

    /// Balloon actual and usable bytes from the memory stats call.
    pub fn memory_stat_pair(&self) -> Result<(u64, u64)> {
        self.with_domain(|dom| {
            let stats = dom.memory_stats(0)?;
            let find = |tag: u32| stats.iter().find(|s| s.tag == tag).map(|s| s.val);
            let actual = find(sys::VIR_DOMAIN_MEMORY_STAT_ACTUAL_BALLOON).unwrap_or(0) * 1024;
            let usable = find(sys::VIR_DOMAIN_MEMORY_STAT_USABLE)
                .or_else(|| find(sys::VIR_DOMAIN_MEMORY_STAT_AVAILABLE))
                .unwrap_or(0)
                * 1024;
            Ok((actual, usable))
        })
    }

    /// Cumulative block IO byte counters for a disk target.
    pub fn block_counters(&self, target: &str) -> Result<(u64, u64)> {
        self.with_domain(|dom| {
            let stats = dom.get_block_stats(target)?;
            Ok((stats.rd_bytes.max(0) as u64, stats.wr_bytes.max(0) as u64))
        })
    }

    /// Cumulative rx/tx byte counters for a host-side interface.
    pub fn iface_counters(&self, iface: &str) -> Result<(u64, u64)> {
        self.with_domain(|dom| {
            let stats = dom.interface_stats(iface)?;
            Ok((stats.rx_bytes.max(0) as u64, stats.tx_bytes.max(0) as u64))
        })
    }

    /// Live domain descriptor.
    pub fn xml_desc(&self) -> Result<String> {
        self.with_domain(|dom| Ok(dom.get_xml_desc(0)?))
    }

    /// First disk target from the configuration, for IO sampling.
    pub fn primary_disk_target(&self) -> Option<String> {
        self.config.lock().disks.first().map(|d| d.target.clone())
    }

    // ===== Internals =====

    fn with_domain<R>(&self, f: impl FnOnce(&Domain) -> Result<R>) -> Result<R> {
        let mut guard = self.domain.lock();
        if guard.is_none() {
            let looked_up = self.session.with_conn(|conn| {
                Domain::lookup_by_name(conn, &self.name)
                    .map_err(|_| Error::DomainNotFound(self.name.clone()))
            })?;
            *guard = Some(looked_up);
        }
        let dom = guard
            .as_ref()
            .ok_or_else(|| Error::DomainNotFound(self.name.clone()))?;
        f(dom)
    }

    fn check_limit(&self, kind: ResourceKind, value: u64) -> Result<()> {
        let limits = self.limits.lock();
        if let Some(limit) = limits.iter().find(|l| l.kind == kind) {
            if !limit.contains(value) {
                return Err(Error::Configuration(format!(
                    "{} value {} out of range [{}, {}] for {}",
                    kind, value, limit.min, limit.max, self.name
                )));
            }
        }
        Ok(())
    }

    fn update_limit_current(&self, kind: ResourceKind, value: u64) {
        let mut limits = self.limits.lock();
        if let Some(limit) = limits.iter_mut().find(|l| l.kind == kind) {
            limit.current = value;
        }
    }

    fn ensure_cgroup(&self, f: impl FnOnce(&CgroupController) -> Result<()>) -> Result<()> {
        let mut guard = self.cgroup.lock();
        if guard.is_none() {
            *guard = Some(CgroupController::new(
                &self.cgroup_root,
                format!("vm-{}", self.name),
            )?);
        }
        f(guard.as_ref().expect("cgroup just created"))
    }

    /// Program the cgroup from the current limit table. Failures are logged:
    /// a running guest is not torn down because a limit write failed.
    pub fn apply_limits(&self) {
        let limits = self.limits.lock().clone();
        for limit in limits {
            let result = match limit.kind {
                ResourceKind::Cpu => {
                    self.ensure_cgroup(|cg| cg.set_cpu_quota_for_vcpus(limit.current))
                }
                ResourceKind::Memory => self.ensure_cgroup(|cg| cg.set_memory_limit(limit.current)),
                // IO and network limits need a device to pin to; they are
                // programmed when a scaling decision names one
                ResourceKind::Io | ResourceKind::Network => Ok(()),
            };
            if let Err(e) = result {
                tracing::warn!(vm = %self.name, kind = %limit.kind, error = %e, "Failed to apply limit");
            }
        }
    }

    /// Drop the domain handle without undefining, e.g. when the manager
    /// forgets a vanished domain.
    pub(crate) fn forget_domain(&self) {
        *self.domain.lock() = None;
    }

    pub(crate) fn set_state(&self, state: VmState) {
        *self.state.lock() = state;
    }
}

impl std::fmt::Debug for VirtualMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualMachine")
            .field("name", &self.name)
            .field("state", &*self.state.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_from_libvirt() {
        assert_eq!(VmState::from_libvirt(sys::VIR_DOMAIN_RUNNING), VmState::Running);
        assert_eq!(VmState::from_libvirt(sys::VIR_DOMAIN_PAUSED), VmState::Paused);
        assert_eq!(VmState::from_libvirt(sys::VIR_DOMAIN_SHUTOFF), VmState::Shutoff);
        assert_eq!(VmState::from_libvirt(sys::VIR_DOMAIN_CRASHED), VmState::Crashed);
        assert_eq!(VmState::from_libvirt(sys::VIR_DOMAIN_SHUTDOWN), VmState::ShuttingDown);
        assert_eq!(VmState::from_libvirt(999), VmState::Defined);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(VmState::Running.to_string(), "Running");
        assert_eq!(VmState::ShuttingDown.to_string(), "ShuttingDown");
        assert_eq!(VmState::Shutoff.to_string(), "Shutoff");
    }

    #[test]
    fn test_state_activity() {
        assert!(VmState::Running.is_active());
        assert!(VmState::Paused.is_active());
        assert!(VmState::Migrating.is_active());
        assert!(!VmState::Shutoff.is_active());
        assert!(!VmState::Defined.is_active());
        assert!(!VmState::Undefined.is_active());
    }

    fn test_vm(root: &std::path::Path) -> VirtualMachine {
        let session = Arc::new(HypervisorSession::new("test:///default"));
        let config = VmConfig::builder("vm-unit")
            .vcpus(2)
            .memory_mib(2048)
            .disk(crate::config::DiskSpec::file("/img/a.qcow2", "vda"))
            .build();
        VirtualMachine::new(session, config, root, Some(1), Some(5901)).unwrap()
    }

    #[test]
    fn test_new_vm_starts_creating_with_cgroup() {
        let root = tempfile::tempdir().unwrap();
        let vm = test_vm(root.path());
        assert_eq!(vm.state(), VmState::Creating);
        assert!(root.path().join("vm-vm-unit").is_dir());
        let limits = vm.limits();
        assert!(limits.iter().any(|l| l.kind == ResourceKind::Cpu && l.current == 2));
    }

    #[test]
    fn test_illegal_transitions_rejected_without_libvirt() {
        let root = tempfile::tempdir().unwrap();
        let vm = test_vm(root.path());
        // Creating: everything except define is illegal, and the check fires
        // before any libvirt call is attempted
        assert!(matches!(vm.start(), Err(Error::InvalidState { .. })));
        assert!(matches!(vm.pause(), Err(Error::InvalidState { .. })));
        assert!(matches!(vm.resume(), Err(Error::InvalidState { .. })));
        assert!(matches!(vm.shutdown(), Err(Error::InvalidState { .. })));
        assert!(matches!(vm.destroy(), Err(Error::InvalidState { .. })));
        assert!(matches!(vm.reboot(), Err(Error::InvalidState { .. })));
        assert!(matches!(vm.undefine(), Err(Error::InvalidState { .. })));
        assert!(matches!(vm.scale_cpu(4), Err(Error::InvalidState { .. })));
        assert!(matches!(vm.scale_memory(4096), Err(Error::InvalidState { .. })));
        assert!(matches!(vm.migrate("qemu+ssh://peer/system"), Err(Error::InvalidState { .. })));
        assert!(matches!(vm.snapshot_create("s1", ""), Err(Error::InvalidState { .. })));
    }

    #[test]
    fn test_scale_bounds_checked_before_libvirt() {
        let root = tempfile::tempdir().unwrap();
        let vm = test_vm(root.path());
        vm.set_state(VmState::Running);
        // cpu limit is [1, 8] with current 2; out-of-range fails as a
        // configuration error before touching the (absent) domain
        assert!(matches!(vm.scale_cpu(0), Err(Error::Configuration(_))));
        assert!(matches!(vm.scale_cpu(9), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_snapshot_revert_unknown_name() {
        let root = tempfile::tempdir().unwrap();
        let vm = test_vm(root.path());
        assert!(matches!(
            vm.snapshot_revert("missing"),
            Err(Error::DomainNotFound(_))
        ));
        assert!(matches!(
            vm.snapshot_delete("missing"),
            Err(Error::DomainNotFound(_))
        ));
    }

    #[test]
    fn test_view_reflects_record() {
        let root = tempfile::tempdir().unwrap();
        let vm = test_vm(root.path());
        let view = vm.view();
        assert_eq!(view.name, "vm-unit");
        assert_eq!(view.id, Some(1));
        assert_eq!(view.reserved_port, Some(5901));
        assert_eq!(view.vcpus, 2);
        assert_eq!(view.state, VmState::Creating);
    }
}
