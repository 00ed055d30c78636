//! VM lifecycle management
//!
//! Keyed registry of [`VirtualMachine`]s. One coarse mutex serialises all
//! mutating operations; enumeration copies lightweight views under a short
//! critical section. `deploy` rolls back in reverse on every failure path so
//! no domain handle, pool entry or cgroup directory leaks.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use virt::domain::Domain;

use crate::config::VmConfig;
use crate::dispatcher::EventDispatcher;
use crate::hypervisor::HypervisorSession;
use crate::pool::VmPool;
use crate::scaling::executor::ScalingBackend;
use crate::store::MetaStore;
use crate::vm::{VirtualMachine, VmState, VmView};
use crate::xml;
use crate::{Error, Result};

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

pub struct VmManager {
    session: Arc<HypervisorSession>,
    store: MetaStore,
    pool: VmPool,
    dispatcher: Arc<EventDispatcher>,
    cgroup_root: PathBuf,
    vms: RwLock<HashMap<String, Arc<VirtualMachine>>>,
    /// Coarse serialisation of mutating operations.
    op_lock: Mutex<()>,
    sweep_cancel: Mutex<Option<Arc<AtomicBool>>>,
}

impl VmManager {
    /// Build the manager and recover in-memory records for every domain
    /// libvirt already knows about. Recovery is best-effort: an unreachable
    /// hypervisor leaves an empty registry, not a failed construction.
    pub fn new(
        session: Arc<HypervisorSession>,
        store: MetaStore,
        dispatcher: Arc<EventDispatcher>,
        cgroup_root: impl Into<PathBuf>,
    ) -> Arc<Self> {
        let pool = VmPool::new(store.clone());
        if let Err(e) = pool.load() {
            tracing::warn!(error = %e, "Failed to load pool records");
        }
        let manager = Arc::new(Self {
            session,
            store,
            pool,
            dispatcher,
            cgroup_root: cgroup_root.into(),
            vms: RwLock::new(HashMap::new()),
            op_lock: Mutex::new(()),
            sweep_cancel: Mutex::new(None),
        });
        match manager.recover() {
            Ok(count) if count > 0 => {
                tracing::info!(count, "Recovered existing domains");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Startup recovery skipped"),
        }
        manager
    }

    pub fn store(&self) -> &MetaStore {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    /// Instantiate records for all active and defined domains.
    pub fn recover(&self) -> Result<usize> {
        self.session.ensure_connected()?;
        let mut recovered = 0;

        let active: Vec<Domain> = self.session.with_conn(|conn| {
            let ids = conn.list_domains()?;
            Ok(ids
                .into_iter()
                .filter_map(|id| Domain::lookup_by_id(conn, id).ok())
                .collect())
        })?;
        let inactive: Vec<Domain> = self.session.with_conn(|conn| {
            let names = conn.list_defined_domains()?;
            Ok(names
                .into_iter()
                .filter_map(|name| Domain::lookup_by_name(conn, &name).ok())
                .collect())
        })?;

        for domain in active.into_iter().chain(inactive) {
            match self.adopt_domain(domain) {
                Ok(true) => recovered += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(error = %e, "Failed to adopt domain"),
            }
        }
        Ok(recovered)
    }

    /// Register a domain discovered outside `deploy`. Returns false when a
    /// record with the same name already exists.
    fn adopt_domain(&self, domain: Domain) -> Result<bool> {
        let name = domain.get_name()?;
        if self.vms.read().contains_key(&name) {
            return Ok(false);
        }
        let desc = domain.get_xml_desc(0)?;
        let mut config = xml::parse_domain_xml(&desc)?;
        let (state, _) = domain.get_state()?;
        let state = VmState::from_libvirt(state);

        // limits start from the live domain info so `current` matches reality
        if let Ok(info) = domain.get_info() {
            config.vcpus = info.nr_virt_cpu as u16;
            config.memory_mib = info.memory / 1024;
        }

        let vm = VirtualMachine::from_existing(
            Arc::clone(&self.session),
            domain,
            config,
            state,
            &self.cgroup_root,
        );
        tracing::info!(vm = %name, state = %state, "Adopted existing domain");
        self.vms.write().insert(name, Arc::new(vm));
        Ok(true)
    }

    // ===== Deployment =====

    /// Deploy a VM: ensure connection, allocate pool entry, define the
    /// domain, start it, register the record. Any failure rolls back in
    /// reverse; an undefine failure during rollback is logged and the
    /// original error is returned.
    pub fn deploy(&self, config: VmConfig) -> Result<u32> {
        let _guard = self.op_lock.lock();
        config.validate()?;

        if self.vms.read().contains_key(&config.name) {
            return Err(Error::Configuration(format!(
                "VM '{}' already exists",
                config.name
            )));
        }
        self.session.ensure_connected()?;

        let name = config.name.clone();
        let id = self.pool.allocate(&config.digest())?;
        let port = self.pool.meta(id).map(|(_, port)| port);

        let vm = match VirtualMachine::new(
            Arc::clone(&self.session),
            config,
            &self.cgroup_root,
            Some(id),
            port,
        ) {
            Ok(vm) => Arc::new(vm),
            Err(e) => {
                self.pool.remove(id);
                return Err(e);
            }
        };

        if let Err(e) = vm.define() {
            self.pool.remove(id);
            return Err(e);
        }

        if let Err(e) = vm.start() {
            tracing::error!(vm = %name, error = %e, "Start failed, rolling back");
            if let Err(undefine_err) = vm.undefine() {
                // preserved behaviour: log and surface the original error
                tracing::error!(vm = %name, error = %undefine_err, "Rollback undefine failed");
            }
            self.pool.remove(id);
            return Err(e);
        }

        self.vms.write().insert(name.clone(), vm);
        tracing::info!(vm = %name, id, "VM deployed");
        Ok(id)
    }

    /// Deploy on a dispatcher worker and hand the outcome to `callback`.
    /// Callback panics are swallowed so they cannot kill the worker.
    pub fn deploy_async(
        self: &Arc<Self>,
        config: VmConfig,
        callback: impl FnOnce(Result<u32>) + Send + 'static,
    ) {
        let manager = Arc::clone(self);
        self.dispatcher.submit(move || {
            let result = manager.deploy(config);
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(result))).is_err()
            {
                tracing::error!("deploy_async callback panicked");
            }
        });
    }

    // ===== Lookup and enumeration =====

    /// Registry handle for a VM, looking the domain up in libvirt when it is
    /// not registered yet.
    pub fn get(&self, name: &str) -> Result<Arc<VirtualMachine>> {
        if let Some(vm) = self.vms.read().get(name) {
            return Ok(Arc::clone(vm));
        }
        let domain = self.session.with_conn(|conn| {
            Domain::lookup_by_name(conn, name).map_err(|_| Error::DomainNotFound(name.to_string()))
        })?;
        self.adopt_domain(domain)?;
        self.vms
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::DomainNotFound(name.to_string()))
    }

    pub fn find_by_name(&self, name: &str) -> Result<VmView> {
        Ok(self.get(name)?.view())
    }

    /// Registered VMs, for the monitor's sampling pass.
    pub fn registered_vms(&self) -> Vec<Arc<VirtualMachine>> {
        self.vms.read().values().cloned().collect()
    }

    /// Merge the active (by id) and defined-but-inactive (by name)
    /// enumerations, deduplicated by name.
    pub fn list_all(&self) -> Result<Vec<VmView>> {
        let _ = self.recover(); // pick up domains created behind our back
        let mut views: Vec<VmView> = self.vms.read().values().map(|vm| vm.view()).collect();
        views.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(views)
    }

    // ===== Lifecycle passthroughs =====

    pub fn start(&self, name: &str) -> Result<()> {
        let _guard = self.op_lock.lock();
        self.get(name)?.start()
    }

    pub fn shutdown(&self, name: &str) -> Result<()> {
        let _guard = self.op_lock.lock();
        self.get(name)?.shutdown()
    }

    pub fn reboot(&self, name: &str) -> Result<()> {
        let _guard = self.op_lock.lock();
        self.get(name)?.reboot()
    }

    pub fn destroy(&self, name: &str) -> Result<()> {
        let _guard = self.op_lock.lock();
        self.get(name)?.destroy()
    }

    pub fn snapshot_create(&self, name: &str, snapshot: &str, description: &str) -> Result<()> {
        let _guard = self.op_lock.lock();
        let vm = self.get(name)?;
        vm.snapshot_create(snapshot, description)?;
        if let Some(id) = vm.view().id {
            if let Some(record) = vm.snapshots().iter().find(|s| s.name == snapshot) {
                let key = format!("vm/{id}/snap/{snapshot}");
                match serde_json::to_string(record) {
                    Ok(json) => {
                        if let Err(e) = self.store.put(&key, &json) {
                            tracing::warn!(vm = %name, snapshot, error = %e, "Failed to persist snapshot record");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(vm = %name, snapshot, error = %e, "Failed to encode snapshot record")
                    }
                }
            }
        }
        Ok(())
    }

    pub fn snapshot_revert(&self, name: &str, snapshot: &str) -> Result<()> {
        let _guard = self.op_lock.lock();
        self.get(name)?.snapshot_revert(snapshot)
    }

    pub fn snapshot_delete(&self, name: &str, snapshot: &str) -> Result<()> {
        let _guard = self.op_lock.lock();
        let vm = self.get(name)?;
        vm.snapshot_delete(snapshot)?;
        if let Some(id) = vm.view().id {
            let _ = self.store.delete(&format!("vm/{id}/snap/{snapshot}"));
        }
        Ok(())
    }

    /// Destroy if active, then undefine. When destroy succeeds but undefine
    /// fails the VM is left in `Shutoff` and the failure surfaces as
    /// `InvalidState` with the driver message.
    pub fn delete(&self, name: &str, delete_storage: bool) -> Result<()> {
        let _guard = self.op_lock.lock();
        let vm = self.get(name)?;

        if vm.state().is_active() {
            vm.destroy()?;
        }
        if let Err(e) = vm.undefine() {
            return Err(Error::InvalidState {
                current: vm.state().to_string(),
                expected: format!("undefine failed for '{name}': {e}"),
            });
        }

        if delete_storage {
            for disk in vm.config().disks {
                if matches!(disk.kind, crate::config::DiskKind::File) {
                    match std::fs::remove_file(&disk.source) {
                        Ok(()) => tracing::info!(vm = %name, path = %disk.source, "Volume removed"),
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => {
                            tracing::warn!(vm = %name, path = %disk.source, error = %e, "Volume removal failed")
                        }
                    }
                }
            }
        }

        self.vms.write().remove(name);
        if let Some(id) = vm.view().id {
            self.pool.remove(id);
            // snapshot and decision records go with the VM
            if let Ok(entries) = self.store.scan_prefix(&format!("vm/{id}/")) {
                for (key, _) in entries {
                    let _ = self.store.delete(&key);
                }
            }
        }
        tracing::info!(vm = %name, "VM deleted");
        Ok(())
    }

    // ===== Periodic work =====

    /// Re-query a VM's state on every tick until the returned flag is set.
    /// At most one extra tick may run after cancellation.
    pub fn schedule_health_check(
        self: &Arc<Self>,
        name: impl Into<String>,
        interval: Duration,
    ) -> Arc<AtomicBool> {
        let cancel = Arc::new(AtomicBool::new(false));
        let manager = Arc::clone(self);
        let name = name.into();
        let flag = Arc::clone(&cancel);
        self.dispatcher.submit(move || {
            health_check_tick(manager, name, interval, flag);
        });
        cancel
    }

    /// Start the background maintenance sweep. Returns its cancel flag.
    pub fn start_maintenance_sweep(self: &Arc<Self>, interval: Duration) -> Arc<AtomicBool> {
        let cancel = Arc::new(AtomicBool::new(false));
        *self.sweep_cancel.lock() = Some(Arc::clone(&cancel));
        let manager = Arc::clone(self);
        let flag = Arc::clone(&cancel);
        self.dispatcher.submit(move || {
            sweep_tick(manager, interval, flag);
        });
        cancel
    }

    /// Reconcile in-memory state with what libvirt reports: collapse to the
    /// observed state, mark crashes, drop vanished domains.
    pub fn reconcile(&self) {
        let vms = self.registered_vms();
        for vm in vms {
            match vm.refresh_state() {
                Ok(VmState::Crashed) => {
                    tracing::error!(vm = %vm.name(), "VM crashed");
                }
                Ok(_) => {}
                Err(Error::DomainNotFound(_)) => {
                    tracing::warn!(vm = %vm.name(), "Domain vanished, dropping record");
                    vm.forget_domain();
                    vm.set_state(VmState::Undefined);
                    self.vms.write().remove(vm.name());
                }
                Err(e) => {
                    tracing::debug!(vm = %vm.name(), error = %e, "State refresh failed");
                }
            }
        }
    }

    /// Stop background work owned by the manager.
    pub fn stop(&self) {
        if let Some(cancel) = self.sweep_cancel.lock().take() {
            cancel.store(true, Ordering::SeqCst);
        }
    }
}

impl Drop for VmManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn health_check_tick(
    manager: Arc<VmManager>,
    name: String,
    interval: Duration,
    cancel: Arc<AtomicBool>,
) {
    if cancel.load(Ordering::SeqCst) {
        return;
    }
    match manager.get(&name).and_then(|vm| vm.refresh_state()) {
        Ok(state) => tracing::info!(vm = %name, state = %state, "Health check"),
        Err(e) => tracing::warn!(vm = %name, error = %e, "Health check failed"),
    }
    if cancel.load(Ordering::SeqCst) {
        return;
    }
    let dispatcher = Arc::clone(manager.dispatcher());
    dispatcher.submit_after(interval, move || {
        health_check_tick(manager, name, interval, cancel);
    });
}

fn sweep_tick(manager: Arc<VmManager>, interval: Duration, cancel: Arc<AtomicBool>) {
    if cancel.load(Ordering::SeqCst) {
        return;
    }
    manager.reconcile();
    if cancel.load(Ordering::SeqCst) {
        return;
    }
    let dispatcher = Arc::clone(manager.dispatcher());
    dispatcher.submit_after(interval, move || {
        sweep_tick(manager, interval, cancel);
    });
}

impl ScalingBackend for VmManager {
    fn scale_cpu(&self, vm_name: &str, vcpus: u16) -> Result<()> {
        let _guard = self.op_lock.lock();
        self.get(vm_name)?.scale_cpu(vcpus)
    }

    fn scale_memory(&self, vm_name: &str, memory_mib: u64) -> Result<()> {
        let _guard = self.op_lock.lock();
        self.get(vm_name)?.scale_memory(memory_mib)
    }

    fn migrate(&self, vm_name: &str, dest_uri: &str) -> Result<()> {
        let _guard = self.op_lock.lock();
        self.get(vm_name)?.migrate(dest_uri)
    }

    fn pause(&self, vm_name: &str) -> Result<()> {
        let _guard = self.op_lock.lock();
        self.get(vm_name)?.pause()
    }

    fn resume(&self, vm_name: &str) -> Result<()> {
        let _guard = self.op_lock.lock();
        self.get(vm_name)?.resume()
    }
}
