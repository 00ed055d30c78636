//! Per-VM cgroup v2 control
//!
//! Each VM owns a directory under the unified hierarchy. Limit changes write
//! the kernel's plain-text file formats; teardown detaches every tracked
//! process back to the parent cgroup and removes the directory when empty.
//! Teardown never surfaces errors so shutdown always completes.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::{Error, Result};

pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// CPU quota period in microseconds: one vCPU maps to one full period of
/// runtime per period.
pub const CPU_PERIOD_US: u64 = 100_000;

/// Scoped handle to one VM's cgroup directory.
pub struct CgroupController {
    path: PathBuf,
    name: String,
    procs: Mutex<Vec<u32>>,
}

impl CgroupController {
    /// Create the controller, creating the directory if needed. A hierarchy
    /// that cannot be created is fatal to VM construction.
    pub fn new(root: impl AsRef<Path>, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let path = root.as_ref().join(&name);
        match fs::create_dir(&path) {
            Ok(()) => {
                tracing::debug!(cgroup = %path.display(), "Created cgroup directory");
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                return Err(Error::PermissionDenied(format!(
                    "cannot create cgroup {}: {}",
                    path.display(),
                    e
                )));
            }
            Err(e) => {
                return Err(Error::Internal(format!(
                    "cannot create cgroup {}: {}",
                    path.display(),
                    e
                )));
            }
        }
        Ok(Self {
            path,
            name,
            procs: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `cpu.max`: "quota period" in microseconds.
    pub fn set_cpu_limit(&self, quota_us: u64, period_us: u64) -> Result<()> {
        self.write_value("cpu.max", &format!("{} {}", quota_us, period_us))
    }

    /// One vCPU maps to a full period of quota.
    pub fn set_cpu_quota_for_vcpus(&self, vcpus: u64) -> Result<()> {
        self.set_cpu_limit(vcpus * CPU_PERIOD_US, CPU_PERIOD_US)
    }

    /// `memory.max` in bytes. Swap is clamped to the same value so the guest
    /// cannot escape its limit by swapping.
    pub fn set_memory_limit(&self, limit_bytes: u64) -> Result<()> {
        self.write_value("memory.max", &limit_bytes.to_string())?;
        self.write_value("memory.swap.max", &limit_bytes.to_string())
    }

    pub fn set_swappiness(&self, swappiness: u64) -> Result<()> {
        self.write_value("memory.swappiness", &swappiness.to_string())
    }

    /// `io.max`: per-device read/write byte-rate limit.
    pub fn set_io_limit(&self, device: &str, read_bps: u64, write_bps: u64) -> Result<()> {
        self.write_value("io.max", &format!("{} rbps={} wbps={}", device, read_bps, write_bps))
    }

    /// Move a process into this cgroup and track it for teardown.
    pub fn attach(&self, pid: u32) -> Result<()> {
        self.write_value("cgroup.procs", &pid.to_string())?;
        self.procs.lock().push(pid);
        Ok(())
    }

    /// Stop tracking a process. The kernel moves exiting processes out on
    /// its own; explicit detach goes back to the parent cgroup.
    pub fn detach(&self, pid: u32) -> Result<()> {
        self.procs.lock().retain(|p| *p != pid);
        self.move_to_parent(pid)
    }

    pub fn tracked_processes(&self) -> Vec<u32> {
        self.procs.lock().clone()
    }

    /// Detach all tracked processes and remove the directory when empty.
    /// Errors are logged and swallowed.
    pub fn release(&self) {
        let pids: Vec<u32> = std::mem::take(&mut *self.procs.lock());
        for pid in pids {
            if let Err(e) = self.move_to_parent(pid) {
                tracing::warn!(cgroup = %self.name, pid, error = %e, "Failed to detach process");
            }
        }
        if self.is_empty() {
            if let Err(e) = fs::remove_dir(&self.path) {
                if e.kind() != ErrorKind::NotFound {
                    tracing::warn!(cgroup = %self.name, error = %e, "Failed to remove cgroup directory");
                }
            } else {
                tracing::debug!(cgroup = %self.name, "Removed cgroup directory");
            }
        } else {
            tracing::warn!(cgroup = %self.name, "Cgroup not empty at release, leaving directory");
        }
    }

    fn move_to_parent(&self, pid: u32) -> Result<()> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| Error::Internal("cgroup has no parent".into()))?;
        write_file(&parent.join("cgroup.procs"), &pid.to_string())
    }

    fn is_empty(&self) -> bool {
        match fs::read_to_string(self.path.join("cgroup.procs")) {
            Ok(content) => content.trim().is_empty(),
            Err(_) => true,
        }
    }

    fn write_value(&self, filename: &str, value: &str) -> Result<()> {
        write_file(&self.path.join(filename), value)
    }
}

fn write_file(path: &Path, value: &str) -> Result<()> {
    fs::write(path, value).map_err(|e| match e.kind() {
        ErrorKind::PermissionDenied => {
            Error::PermissionDenied(format!("write {}: {}", path.display(), e))
        }
        _ => Error::Internal(format!("write {}: {}", path.display(), e)),
    })
}

impl Drop for CgroupController {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(root: &Path) -> CgroupController {
        CgroupController::new(root, "vm-test").unwrap()
    }

    #[test]
    fn test_create_and_recreate() {
        let root = tempfile::tempdir().unwrap();
        let a = controller(root.path());
        assert!(a.path().is_dir());
        // second construction over the same directory is fine
        let b = controller(root.path());
        assert_eq!(a.path(), b.path());
    }

    #[test]
    fn test_cpu_limit_format() {
        let root = tempfile::tempdir().unwrap();
        let cg = controller(root.path());
        cg.set_cpu_quota_for_vcpus(2).unwrap();
        let content = fs::read_to_string(cg.path().join("cpu.max")).unwrap();
        assert_eq!(content, "200000 100000");
    }

    #[test]
    fn test_memory_limit_clamps_swap() {
        let root = tempfile::tempdir().unwrap();
        let cg = controller(root.path());
        cg.set_memory_limit(2_147_483_648).unwrap();
        assert_eq!(
            fs::read_to_string(cg.path().join("memory.max")).unwrap(),
            "2147483648"
        );
        assert_eq!(
            fs::read_to_string(cg.path().join("memory.swap.max")).unwrap(),
            "2147483648"
        );
    }

    #[test]
    fn test_swappiness() {
        let root = tempfile::tempdir().unwrap();
        let cg = controller(root.path());
        cg.set_swappiness(10).unwrap();
        assert_eq!(
            fs::read_to_string(cg.path().join("memory.swappiness")).unwrap(),
            "10"
        );
    }

    #[test]
    fn test_io_limit_format() {
        let root = tempfile::tempdir().unwrap();
        let cg = controller(root.path());
        cg.set_io_limit("8:0", 1_048_576, 524_288).unwrap();
        assert_eq!(
            fs::read_to_string(cg.path().join("io.max")).unwrap(),
            "8:0 rbps=1048576 wbps=524288"
        );
    }

    #[test]
    fn test_attach_tracks_processes() {
        let root = tempfile::tempdir().unwrap();
        let cg = controller(root.path());
        cg.attach(1234).unwrap();
        cg.attach(5678).unwrap();
        assert_eq!(cg.tracked_processes(), vec![1234, 5678]);
        cg.detach(1234).unwrap();
        assert_eq!(cg.tracked_processes(), vec![5678]);
    }

    #[test]
    fn test_release_removes_empty_dir() {
        let root = tempfile::tempdir().unwrap();
        let cg = controller(root.path());
        let path = cg.path().to_path_buf();
        cg.release();
        assert!(!path.exists());
        // release after release must not panic
        cg.release();
    }

    #[test]
    fn test_drop_never_panics_with_tracked_pids() {
        let root = tempfile::tempdir().unwrap();
        let cg = controller(root.path());
        cg.attach(99999).unwrap();
        drop(cg); // detach will fail against tempdir parent; must be swallowed
    }
}
